//! Krill API: the reconciliation cycle and everything around it.
//!
//! [`Engine`] runs one cycle for one cluster (build, read, diff, apply, roll, report).
//! [`Driver`] turns watch events and periodic resyncs into cycles, one worker per cluster,
//! serialized by the cluster lock and paced by the retry policy.

#![forbid(unsafe_code)]

use std::time::Duration;

use krill_ops::RollConfig;
use krill_store::BackoffPolicy;
use serde::{Deserialize, Serialize};

mod driver;
mod engine;
mod events;
mod status;

pub use driver::Driver;
pub use engine::{CycleReport, Engine, Outcome, Prepared, SupersededCheck};
pub use events::{EngineEvent, EventSink, EventType, KubeEvents, LogEvents, RecordingEvents};
pub use status::{merge_status, StatusReporter};

/// Runtime knobs of the engine and its driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Watch only this namespace; all namespaces when unset.
    pub namespace: Option<String>,
    /// Every known cluster is re-triggered at this interval.
    pub resync: Duration,
    pub roll: RollConfig,
    pub backoff: BackoffPolicy,
    /// A cluster lock held longer than this is presumed abandoned.
    pub lock_max_hold: Duration,
    /// Status writes retried on revision conflicts before the cycle is reported failed.
    pub status_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync: Duration::from_secs(300),
            roll: RollConfig::default(),
            backoff: BackoffPolicy::default(),
            lock_max_hold: Duration::from_secs(3600),
            status_retries: 3,
        }
    }
}
