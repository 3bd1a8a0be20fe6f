//! Krill store: in-RAM, per-cluster engine state shared by the driver's workers.
//!
//! Nothing here survives a restart; everything is re-derived from the platform on the next
//! cycle. All maps are keyed by [`ClusterKey`]. Lock entries live exactly as long as their guard;
//! fence marks are dropped when a cluster is deleted.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use krill_core::ClusterKey;
use rustc_hash::FxHashMap;
use tracing::debug;

mod lock;
mod retry;

pub use lock::{Acquire, LockGuard, LockRegistry};
pub use retry::{BackoffPolicy, RetryDecision, RetryTracker, MAX_IMMEDIATE_RETRIES};

pub(crate) fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

/// In-process high-water mark of generations whose success has been reported, per cluster.
/// Backs up the persisted `lastSuccessfulGeneration` against reordered writers in this process.
#[derive(Default)]
pub struct GenerationFence {
    marks: Mutex<FxHashMap<ClusterKey, i64>>,
}

impl GenerationFence {
    pub fn new() -> Self { Self::default() }

    pub fn high_water(&self, key: &ClusterKey) -> Option<i64> { guard(&self.marks).get(key).copied() }

    /// Raise the mark to `generation`; returns false (and leaves the mark) when it would regress.
    pub fn advance(&self, key: &ClusterKey, generation: i64) -> bool {
        let mut marks = guard(&self.marks);
        let mark = marks.entry(key.clone()).or_insert(generation);
        if generation < *mark {
            debug!(cluster = %key, generation, high_water = *mark, "generation fenced");
            return false;
        }
        *mark = generation;
        true
    }

    pub fn forget(&self, key: &ClusterKey) { guard(&self.marks).remove(key); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_never_regresses() {
        let f = GenerationFence::new();
        let k = ClusterKey::new("ns", "c");
        assert!(f.advance(&k, 5));
        assert!(!f.advance(&k, 4));
        assert_eq!(f.high_water(&k), Some(5));
        assert!(f.advance(&k, 5));
        assert!(f.advance(&k, 7));
        f.forget(&k);
        assert_eq!(f.high_water(&k), None);
    }
}
