use std::hash::Hasher;

use fnv::FnvHasher;

/// FNV-1a 64 over raw bytes. Fed explicit byte sequences only, so the result
/// is identical across platforms and process restarts.
pub(crate) fn fnv64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Derive an RNG seed from a base seed plus a role tag and an index.
///
/// All randomness in the crate flows through seeds produced here, which keeps
/// every shuffle, reservoir and interleave reproducible for a given base seed.
pub(crate) fn derive_seed(base: u64, role: u64, index: u64) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(&base.to_le_bytes());
    hasher.write(&role.to_le_bytes());
    hasher.write(&index.to_le_bytes());
    hasher.finish()
}
