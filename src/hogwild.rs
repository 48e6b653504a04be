//! Aliasing handle for lock-free shared training state.
//!
//! SGD workers deliberately race on the weight matrix: each clone of the
//! handle hands out unsynchronized `&mut` access to the same buffer. The
//! algorithm tolerates stale reads and lost updates; the only requirement is
//! that a single aligned f32 load or store is never torn, which holds for
//! naturally aligned 32-bit access on all supported targets.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub struct Hogwild<T>(Arc<UnsafeCell<T>>);

impl<T> Hogwild<T> {
    pub fn new(value: T) -> Self {
        Hogwild(Arc::new(UnsafeCell::new(value)))
    }

    /// Reclaim the inner value once every worker clone has been dropped.
    pub fn into_inner(self) -> Option<T> {
        Arc::try_unwrap(self.0).ok().map(UnsafeCell::into_inner)
    }
}

impl<T> Clone for Hogwild<T> {
    fn clone(&self) -> Self {
        Hogwild(self.0.clone())
    }
}

impl<T> Deref for Hogwild<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.0.get() }
    }
}

impl<T> DerefMut for Hogwild<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}

unsafe impl<T: Send> Send for Hogwild<T> {}
unsafe impl<T: Send> Sync for Hogwild<T> {}
