use serde::Serialize;

use crate::error::{Error, Result};

/// All trainer knobs in one record, passed once to [`crate::Trainer::new`].
///
/// Defaults are the production values; tests and experiments override single
/// fields with struct update syntax.
#[derive(Debug, Clone, Serialize)]
pub struct TrainerConfig {
    /// Width of the hashed feature space. Must be a power of two.
    pub num_buckets: usize,

    /// Adam learning rate.
    pub adam_lr: f32,

    /// Adam first-moment decay.
    pub adam_beta1: f32,

    /// Adam second-moment decay.
    pub adam_beta2: f32,

    /// Adam denominator fuzz.
    pub adam_epsilon: f32,

    /// SGD learning rate at the first SGD epoch.
    pub sgd_lr_start: f32,

    /// SGD learning rate at the last SGD epoch; interpolated linearly.
    pub sgd_lr_end: f32,

    /// Decoupled L2 weight decay.
    pub l2_lambda: f32,

    /// Number of leading mini-batch Adam epochs.
    pub adam_epochs: usize,

    /// Total epoch ceiling; epochs past `adam_epochs` run online SGD.
    pub max_epochs: usize,

    /// Samples accumulated per Adam update.
    pub mini_batch_size: usize,

    /// Lines per I/O batch, the unit of worker dispatch.
    pub batch_size: usize,

    /// Lines per chunk, the unit of epoch-level shuffling.
    pub chunk_size: usize,

    /// Lines between dev-subsample checkpoints.
    pub checkpoint_interval: u64,

    /// Checkpoint F1 window length for within-epoch early stopping.
    pub rolling_window: usize,

    /// Stop the epoch when a full window's F1 spread falls below this.
    pub within_epoch_threshold: f64,

    /// Stale epochs tolerated before stopping training.
    pub patience: usize,

    /// Minimum dev-F1 gain for an epoch to count as an improvement.
    pub across_epoch_threshold: f64,

    /// Dev sentences scored at each checkpoint.
    pub dev_subsample_size: usize,

    /// Hogwild workers for SGD epochs.
    pub sgd_threads: usize,

    /// Adam workers. More than one means per-worker moments and step
    /// counters.
    pub adam_threads: usize,

    /// Base seed for every shuffle and subsample.
    pub seed: u64,

    /// Log per-checkpoint detail.
    pub verbose: bool,

    /// Whether training lines are already canonical text. When false the
    /// preprocessor runs on every sample.
    pub preprocessed: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            num_buckets: 8192,
            adam_lr: 1e-3,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            sgd_lr_start: 1e-2,
            sgd_lr_end: 1e-3,
            l2_lambda: 1e-5,
            adam_epochs: 2,
            max_epochs: 6,
            mini_batch_size: 128,
            batch_size: 100_000,
            chunk_size: 500_000,
            checkpoint_interval: 200_000,
            rolling_window: 5,
            within_epoch_threshold: 5e-3,
            patience: 2,
            across_epoch_threshold: 1e-3,
            dev_subsample_size: 10_000,
            sgd_threads: num_cpus::get(),
            adam_threads: 1,
            seed: 42,
            verbose: false,
            preprocessed: true,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 || !self.num_buckets.is_power_of_two() {
            return Err(Error::config(format!(
                "num_buckets must be a power of two, got {}",
                self.num_buckets
            )));
        }
        if self.max_epochs == 0 {
            return Err(Error::config("max_epochs must be at least 1"));
        }
        if self.adam_epochs > self.max_epochs {
            return Err(Error::config(format!(
                "adam_epochs ({}) exceeds max_epochs ({})",
                self.adam_epochs, self.max_epochs
            )));
        }
        if self.mini_batch_size == 0 || self.batch_size == 0 || self.chunk_size == 0 {
            return Err(Error::config("batch and chunk sizes must be nonzero"));
        }
        if self.sgd_threads == 0 || self.adam_threads == 0 {
            return Err(Error::config("thread counts must be nonzero"));
        }
        if self.rolling_window == 0 {
            return Err(Error::config("rolling_window must be nonzero"));
        }
        Ok(())
    }
}
