use std::sync::Arc;

use krill_core::{now_rfc3339, ClusterKey, Error, Result, StatusRecord, CONDITION_ERROR, CONDITION_PAUSED, CONDITION_READY};
use krill_kubehub::Platform;
use krill_store::GenerationFence;
use metrics::counter;
use tracing::debug;

use crate::engine::{CycleReport, Outcome};

fn clear(s: &mut StatusRecord, type_: &str, now: &str) {
    if s.condition(type_).is_some() {
        s.set_condition(type_, false, None, None, now);
    }
}

/// Fold a cycle outcome into the current status.
///
/// Returns None when nothing should be written: the cycle was superseded, or its generation is
/// older than one already observed (persisted) or reported successful (`high_water`). This keeps
/// `lastSuccessfulGeneration` monotone even when cycles complete out of order.
pub fn merge_status(current: &StatusRecord, report: &CycleReport, high_water: Option<i64>, now: &str) -> Option<StatusRecord> {
    if report.outcome == Outcome::Superseded {
        return None;
    }
    let newest = current.observed_generation.max(current.last_successful_generation).max(high_water);
    if newest.map_or(false, |n| report.generation < n) {
        return None;
    }
    let mut s = current.clone();
    s.observed_generation = Some(report.generation);
    match &report.outcome {
        Outcome::Converged => {
            s.last_successful_generation = Some(report.generation);
            s.last_error = None;
            s.set_condition(CONDITION_READY, true, Some("Reconciled"), None, now);
            clear(&mut s, CONDITION_ERROR, now);
            clear(&mut s, CONDITION_PAUSED, now);
        }
        Outcome::Paused => {
            s.set_condition(CONDITION_PAUSED, true, Some("PauseAnnotation"), Some("reconciliation is paused".into()), now);
        }
        Outcome::Failed(e) => {
            s.last_error = Some(e.to_string());
            s.set_condition(CONDITION_READY, false, Some(e.reason()), Some(e.to_string()), now);
            s.set_condition(CONDITION_ERROR, true, Some(e.reason()), Some(e.to_string()), now);
            clear(&mut s, CONDITION_PAUSED, now);
        }
        Outcome::Superseded => return None,
    }
    Some(s)
}

/// Writes cycle outcomes to the status subresource with optimistic concurrency.
pub struct StatusReporter {
    platform: Arc<dyn Platform>,
    fence: GenerationFence,
    conflict_retries: u32,
}

impl StatusReporter {
    pub fn new(platform: Arc<dyn Platform>, conflict_retries: u32) -> Self {
        Self { platform, fence: GenerationFence::new(), conflict_retries }
    }

    pub fn forget(&self, key: &ClusterKey) { self.fence.forget(key); }

    /// Record `report`. Returns the written status, or None when the write was skipped
    /// (cluster gone, superseded or stale cycle).
    pub async fn report(&self, report: &CycleReport) -> Result<Option<StatusRecord>> {
        let mut conflicts = 0u32;
        loop {
            let Some(current) = self.platform.get_status(&report.key).await? else { return Ok(None) };
            let Some(next) = merge_status(&current.status, report, self.fence.high_water(&report.key), &now_rfc3339()) else {
                if report.outcome != Outcome::Superseded {
                    counter!("status_fenced_total", 1u64);
                    debug!(cluster = %report.key, generation = report.generation, "stale cycle outcome not written");
                }
                return Ok(None);
            };
            if next == current.status {
                return Ok(Some(next));
            }
            match self.platform.write_status(&report.key, &next, &current.revision).await {
                Ok(()) => {
                    if report.outcome == Outcome::Converged {
                        self.fence.advance(&report.key, report.generation);
                    }
                    return Ok(Some(next));
                }
                Err(Error::Conflict(msg)) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    debug!(cluster = %report.key, conflicts, reason = %msg, "status conflict; re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(generation: i64, outcome: Outcome) -> CycleReport {
        CycleReport {
            key: ClusterKey::new("ns", "c"),
            uid: None,
            generation,
            outcome,
            plan: None,
            restarted: 0,
            status_error: None,
        }
    }

    #[test]
    fn success_sets_ready_and_last_successful() {
        let s = merge_status(&StatusRecord::default(), &report(3, Outcome::Converged), None, "t0").unwrap();
        assert_eq!(s.last_successful_generation, Some(3));
        assert_eq!(s.observed_generation, Some(3));
        assert_eq!(s.condition(CONDITION_READY).unwrap().status, "True");
        assert!(s.condition(CONDITION_ERROR).is_none());
    }

    #[test]
    fn older_completion_never_regresses() {
        let newer = merge_status(&StatusRecord::default(), &report(5, Outcome::Converged), None, "t0").unwrap();
        assert!(merge_status(&newer, &report(4, Outcome::Converged), None, "t1").is_none());
        assert!(merge_status(&newer, &report(4, Outcome::Failed(Error::transient("x"))), None, "t1").is_none());
        // in-process high-water guards against a status read that predates our own write
        assert!(merge_status(&StatusRecord::default(), &report(4, Outcome::Converged), Some(5), "t1").is_none());
    }

    #[test]
    fn failure_keeps_last_successful_and_records_reason() {
        let ok = merge_status(&StatusRecord::default(), &report(1, Outcome::Converged), None, "t0").unwrap();
        let stalled = Error::RollingUpdateStalled { role: "kafka".into(), member: 1, reason: "timeout".into() };
        let s = merge_status(&ok, &report(2, Outcome::Failed(stalled)), None, "t1").unwrap();
        assert_eq!(s.last_successful_generation, Some(1));
        assert_eq!(s.observed_generation, Some(2));
        let ready = s.condition(CONDITION_READY).unwrap();
        assert_eq!((ready.status.as_str(), ready.reason.as_deref()), ("False", Some("RollingUpdateStalled")));
        assert_eq!(ready.last_transition_time.as_deref(), Some("t1"));
        assert!(s.last_error.is_some());

        let healed = merge_status(&s, &report(2, Outcome::Converged), None, "t2").unwrap();
        assert_eq!(healed.last_successful_generation, Some(2));
        assert_eq!(healed.condition(CONDITION_ERROR).unwrap().status, "False");
        assert_eq!(healed.last_error, None);
    }

    #[test]
    fn pause_and_supersede() {
        let s = merge_status(&StatusRecord::default(), &report(1, Outcome::Paused), None, "t0").unwrap();
        assert_eq!(s.condition(CONDITION_PAUSED).unwrap().status, "True");
        assert_eq!(s.last_successful_generation, None);
        assert!(merge_status(&s, &report(1, Outcome::Superseded), None, "t1").is_none());
    }
}
