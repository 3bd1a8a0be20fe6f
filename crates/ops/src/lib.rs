//! Krill ops: the rolling-update coordinator.
//!
//! Members of a quorum-bearing role are restarted one at a time, each only after every
//! other member is ready, and the next only after the restarted one is healthy again.
//! Workloads use `OnDelete`, so a member picks up the new template exactly when the
//! coordinator deletes its pod; a member's pod fingerprint therefore records whether it
//! has been rolled, and an interrupted roll resumes where it stopped.

#![forbid(unsafe_code)]

use std::time::Duration;

use krill_core::{ClusterKey, Error, Member, ObjectRef, Result, Role};
use krill_kubehub::Platform;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollConfig {
    /// How long a restarted member may take to become healthy.
    pub health_timeout: Duration,
    pub poll_interval: Duration,
    /// The roll gives up with the probe error once this many consecutive health probes fail.
    pub max_probe_errors: u32,
}

impl Default for RollConfig {
    fn default() -> Self { Self { health_timeout: Duration::from_secs(300), poll_interval: Duration::from_secs(2), max_probe_errors: 5 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollState {
    Idle,
    Planning,
    RestartingMember(u32),
    VerifyingHealth(u32),
    Aborted { member: u32, reason: String },
}

/// Pending workload write that carries the new template.
#[derive(Debug, Clone)]
pub struct WorkloadUpdate {
    pub manifest: Json,
    pub revision: String,
    /// Claim templates changed: the workload must be recreated (pods orphaned, then adopted).
    pub recreate: bool,
}

/// Everything the coordinator needs to roll one role.
#[derive(Debug, Clone)]
pub struct RollingUpdatePlan {
    pub cluster: ClusterKey,
    pub role: Role,
    pub workload: ObjectRef,
    pub pod_fingerprint: String,
    pub update: Option<WorkloadUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollOutcome {
    /// Member indices restarted, in order.
    pub restarted: Vec<u32>,
    /// Stopped early because a newer trigger arrived.
    pub superseded: bool,
    pub states: Vec<RollState>,
}

/// Members still running an older template: ascending index, the leader last.
pub fn restart_order(members: &[Member], pod_fingerprint: &str) -> Vec<Member> {
    let mut stale: Vec<Member> = members.iter().filter(|m| m.pod_fingerprint.as_deref() != Some(pod_fingerprint)).cloned().collect();
    stale.sort_by_key(|m| (m.leader, m.index));
    stale
}

pub struct RollingUpdateCoordinator<'a> {
    platform: &'a dyn Platform,
    config: RollConfig,
}

impl<'a> RollingUpdateCoordinator<'a> {
    pub fn new(platform: &'a dyn Platform, config: RollConfig) -> Self { Self { platform, config } }

    /// Apply the workload update (if any), then restart stale members one at a time.
    /// `superseded` is consulted between members; when it reports true the remaining members
    /// are left for the next cycle.
    pub async fn run(&self, plan: &RollingUpdatePlan, superseded: &(dyn Fn() -> bool + Send + Sync)) -> Result<RollOutcome> {
        let mut out = RollOutcome { states: vec![RollState::Idle, RollState::Planning], ..Default::default() };
        if let Some(u) = &plan.update {
            self.write_workload(plan, u).await?;
        }
        let members = self.platform.list_members(&plan.cluster, plan.role).await?;
        let order = restart_order(&members, &plan.pod_fingerprint);
        if order.is_empty() {
            debug!(cluster = %plan.cluster, role = %plan.role, "all members current");
            out.states.push(RollState::Idle);
            return Ok(out);
        }
        info!(cluster = %plan.cluster, role = %plan.role, members = ?order.iter().map(|m| m.index).collect::<Vec<_>>(), "rolling update planned");

        for target in order {
            if superseded() {
                info!(cluster = %plan.cluster, role = %plan.role, remaining_from = target.index, "rolling update superseded");
                out.superseded = true;
                out.states.push(RollState::Idle);
                return Ok(out);
            }
            let members = self.platform.list_members(&plan.cluster, plan.role).await?;
            let Some(current) = members.iter().find(|m| m.index == target.index) else {
                debug!(role = %plan.role, member = target.index, "member gone; skipping");
                continue;
            };
            if current.pod_fingerprint.as_deref() == Some(plan.pod_fingerprint.as_str()) {
                continue;
            }
            if let Some(down) = members.iter().find(|m| m.index != target.index && !m.ready) {
                let reason = format!("member {} ({}) is not ready", down.index, down.pod);
                out.states.push(RollState::Aborted { member: target.index, reason: reason.clone() });
                warn!(cluster = %plan.cluster, role = %plan.role, member = target.index, %reason, "refusing restart");
                return Err(Error::QuorumRisk { role: plan.role.to_string(), member: target.index, reason });
            }

            out.states.push(RollState::RestartingMember(target.index));
            info!(cluster = %plan.cluster, role = %plan.role, pod = %current.pod, "restarting member");
            self.platform.delete_pod(&plan.cluster.namespace, &current.pod).await?;

            out.states.push(RollState::VerifyingHealth(target.index));
            if let Err(e) = self.await_healthy(plan, current).await {
                out.states.push(RollState::Aborted { member: target.index, reason: e.to_string() });
                if matches!(e, Error::RollingUpdateStalled { .. }) {
                    counter!("rolling_stalled_total", 1u64);
                }
                return Err(e);
            }
            counter!("rolling_restarts_total", 1u64);
            out.restarted.push(target.index);
        }
        out.states.push(RollState::Idle);
        info!(cluster = %plan.cluster, role = %plan.role, restarted = out.restarted.len(), "rolling update complete");
        Ok(out)
    }

    async fn write_workload(&self, plan: &RollingUpdatePlan, u: &WorkloadUpdate) -> Result<()> {
        if u.recreate {
            info!(cluster = %plan.cluster, workload = %plan.workload, "recreating workload with orphaned members");
            self.platform.delete(&plan.workload, true).await?;
            self.platform.create(&plan.workload, &u.manifest).await?;
        } else {
            self.platform.replace(&plan.workload, &u.manifest, &u.revision).await?;
        }
        Ok(())
    }

    /// Healthy: a new pod instance (fresh uid) on the desired template, reporting ready.
    async fn await_healthy(&self, plan: &RollingUpdatePlan, old: &Member) -> Result<()> {
        let deadline = Instant::now() + self.config.health_timeout;
        let mut probe_errors = 0u32;
        loop {
            sleep(self.config.poll_interval).await;
            match self.platform.list_members(&plan.cluster, plan.role).await {
                Ok(members) => {
                    probe_errors = 0;
                    let healthy = members.iter().any(|m| {
                        m.index == old.index && m.uid != old.uid && m.ready && m.pod_fingerprint.as_deref() == Some(plan.pod_fingerprint.as_str())
                    });
                    if healthy {
                        return Ok(());
                    }
                }
                Err(e) => {
                    probe_errors += 1;
                    warn!(role = %plan.role, member = old.index, error = %e, probe_errors, "health probe failed");
                    if probe_errors >= self.config.max_probe_errors {
                        return Err(e);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::RollingUpdateStalled {
                    role: plan.role.to_string(),
                    member: old.index,
                    reason: format!("not healthy within {}s", self.config.health_timeout.as_secs()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(index: u32, fp: &str, leader: bool) -> Member {
        Member { index, pod: format!("c-kafka-{}", index), uid: format!("u{}", index), ready: true, pod_fingerprint: Some(fp.into()), leader }
    }

    #[test]
    fn order_is_ascending_with_leader_last() {
        let members = vec![m(0, "old", true), m(1, "old", false), m(2, "new", false), m(3, "old", false)];
        let order: Vec<u32> = restart_order(&members, "new").iter().map(|m| m.index).collect();
        assert_eq!(order, vec![1, 3, 0]);
    }

    #[test]
    fn nothing_to_do_when_all_current() {
        assert!(restart_order(&[m(0, "new", false), m(1, "new", true)], "new").is_empty());
    }
}
