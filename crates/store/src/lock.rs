use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use krill_core::ClusterKey;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::warn;
use uuid::Uuid;

use crate::guard;

struct Holder {
    id: Uuid,
    acquired_at: Instant,
}

/// Outcome of a non-blocking lock attempt.
pub enum Acquire {
    Locked(LockGuard),
    Busy { holder: Uuid, held_for: Duration },
}

/// Mutual exclusion per cluster identity. At most one reconciliation cycle for a cluster runs
/// at a time; cycles for different clusters never contend.
///
/// A lock older than `max_hold` is presumed abandoned and may be taken over. Entries exist only
/// while held, so the map is bounded by the number of in-flight cycles.
#[derive(Clone)]
pub struct LockRegistry {
    held: Arc<Mutex<FxHashMap<ClusterKey, Holder>>>,
    max_hold: Duration,
}

impl LockRegistry {
    pub fn new(max_hold: Duration) -> Self { Self { held: Arc::new(Mutex::new(FxHashMap::default())), max_hold } }

    pub fn acquire(&self, key: &ClusterKey) -> Acquire {
        let mut held = guard(&self.held);
        if let Some(h) = held.get(key) {
            let age = h.acquired_at.elapsed();
            if age < self.max_hold {
                counter!("lock_busy_total", 1u64);
                return Acquire::Busy { holder: h.id, held_for: age };
            }
            warn!(cluster = %key, holder = %h.id, held_secs = age.as_secs(), "taking over expired cluster lock");
        }
        let id = Uuid::new_v4();
        held.insert(key.clone(), Holder { id, acquired_at: Instant::now() });
        Acquire::Locked(LockGuard { held: Arc::clone(&self.held), key: key.clone(), id })
    }

    pub fn held_count(&self) -> usize { guard(&self.held).len() }
}

/// Releases the cluster lock on drop, unless it has been taken over in the meantime.
pub struct LockGuard {
    held: Arc<Mutex<FxHashMap<ClusterKey, Holder>>>,
    key: ClusterKey,
    id: Uuid,
}

impl LockGuard {
    pub fn holder(&self) -> Uuid { self.id }

    /// False once the lock expired and another holder took it over.
    pub fn still_held(&self) -> bool { guard(&self.held).get(&self.key).map_or(false, |h| h.id == self.id) }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = guard(&self.held);
        if held.get(&self.key).map_or(false, |h| h.id == self.id) {
            held.remove(&self.key);
        }
    }
}
