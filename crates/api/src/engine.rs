use std::sync::Arc;
use std::time::Instant;

use krill_apply::{apply, plan, Action, ChangePlan, PlanSummary};
use krill_core::{ClusterKey, DesiredObject, Error, ObjectKind, ObjectRef, Result, Role, GROUP_STORAGE, ROLE_LABEL, STORAGE_ANNOTATION};
use krill_desired::{build, PlatformDefaults, CA_SECRET_SUFFIX};
use krill_kubehub::{read_live, CredentialProvider, LiveState, Platform};
use krill_ops::{RollingUpdateCoordinator, RollingUpdatePlan, WorkloadUpdate};
use krill_schema::{check_storage_transition, validate, ClusterSpec, Storage};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSink};
use crate::status::StatusReporter;
use crate::EngineConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Converged,
    /// Skipped: the resource carries the pause annotation.
    Paused,
    /// Stopped between steps because a newer generation was declared.
    Superseded,
    Failed(Error),
}

/// What one cycle did for one cluster.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub key: ClusterKey,
    pub uid: Option<String>,
    pub generation: i64,
    pub outcome: Outcome,
    pub plan: Option<PlanSummary>,
    pub restarted: usize,
    /// The outcome could not be recorded on the resource.
    pub status_error: Option<Error>,
}

impl CycleReport {
    /// The error that decides whether and when the cycle is retried.
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => self.status_error.as_ref(),
        }
    }
}

/// Desired objects, live state and the plan between them.
pub struct Prepared {
    pub desired: Vec<DesiredObject>,
    pub live: LiveState,
    pub plan: ChangePlan,
}

fn generation_of(raw: &Json) -> i64 { raw["metadata"]["generation"].as_i64().unwrap_or(0) }

/// Answers, for the generation a cycle works on, whether a newer one has been declared.
pub type SupersededCheck = dyn Fn(i64) -> bool + Send + Sync;

pub struct Engine {
    platform: Arc<dyn Platform>,
    credentials: Arc<dyn CredentialProvider>,
    defaults: PlatformDefaults,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
    status: StatusReporter,
}

impl Engine {
    pub fn new(
        platform: Arc<dyn Platform>,
        credentials: Arc<dyn CredentialProvider>,
        defaults: PlatformDefaults,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let status = StatusReporter::new(platform.clone(), config.status_retries);
        Self { platform, credentials, defaults, config, events, status }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn platform(&self) -> &dyn Platform { self.platform.as_ref() }

    /// Drop per-cluster memory for a deleted cluster.
    pub fn forget(&self, key: &ClusterKey) { self.status.forget(key); }

    /// Current generation of the cluster resource; None when it is gone.
    pub async fn generation(&self, key: &ClusterKey) -> Result<Option<i64>> {
        Ok(self.platform.get_cluster(key).await?.map(|raw| generation_of(&raw)))
    }

    /// Build the desired objects, read live state and diff them, without mutating anything.
    /// Storage transitions that would shrink or retype volumes fail here, before any plan exists.
    pub async fn prepare(&self, spec: &ClusterSpec) -> Result<Prepared> {
        let ca = self.credentials.cluster_ca(&spec.key).await?;
        let live = read_live(self.platform.as_ref(), &spec.key).await?;
        check_credentials(spec, ca.is_some(), &live)?;
        let desired = build(spec, &self.defaults.with_cluster_ca(ca))?;
        check_storage(spec, &live)?;
        let plan = plan(&spec.key, &desired, &live);
        Ok(Prepared { desired, live, plan })
    }

    /// One full cycle, status write included. `Ok(None)` when the cluster resource is gone.
    pub async fn run_cycle(&self, key: &ClusterKey, superseded: &SupersededCheck) -> Result<Option<CycleReport>> {
        let Some(mut report) = self.reconcile(key, superseded).await? else { return Ok(None) };
        match &report.outcome {
            Outcome::Failed(e) => self.events.emit(EngineEvent::warning(key, report.uid.as_deref(), e.reason(), e.to_string())).await,
            Outcome::Superseded => {
                let msg = format!("generation {} superseded before its rollout finished", report.generation);
                self.events.emit(EngineEvent::normal(key, report.uid.as_deref(), "Superseded", msg)).await
            }
            _ => {}
        }
        if let Err(e) = self.status.report(&report).await {
            warn!(cluster = %key, generation = report.generation, error = %e, "status write failed");
            report.status_error = Some(e);
        }
        Ok(Some(report))
    }

    /// Converge one cluster. Failures inside the cycle land in the report; only a failed read
    /// of the cluster resource itself is returned as an error.
    pub async fn reconcile(&self, key: &ClusterKey, superseded: &SupersededCheck) -> Result<Option<CycleReport>> {
        let t0 = Instant::now();
        let Some(raw) = self.platform.get_cluster(key).await? else {
            debug!(cluster = %key, "cluster resource gone");
            return Ok(None);
        };
        let mut report = CycleReport {
            key: key.clone(),
            uid: raw["metadata"]["uid"].as_str().map(|s| s.to_string()),
            generation: generation_of(&raw),
            outcome: Outcome::Converged,
            plan: None,
            restarted: 0,
            status_error: None,
        };
        report.outcome = match self.converge(&raw, superseded, &mut report).await {
            Ok(o) => o,
            Err(e) => {
                warn!(cluster = %key, generation = report.generation, reason = e.reason(), error = %e, "reconciliation failed");
                Outcome::Failed(e)
            }
        };
        counter!("reconcile_cycles_total", 1u64);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(cluster = %key, generation = report.generation, outcome = ?report.outcome, restarted = report.restarted, "cycle finished");
        Ok(Some(report))
    }

    async fn converge(&self, raw: &Json, superseded: &SupersededCheck, report: &mut CycleReport) -> Result<Outcome> {
        let spec = ClusterSpec::from_resource(raw)?;
        validate(&spec)?;
        if spec.paused {
            info!(cluster = %spec.key, "reconciliation paused by annotation");
            return Ok(Outcome::Paused);
        }
        let Prepared { desired, live, plan } = self.prepare(&spec).await?;
        report.plan = Some(plan.summary());
        if plan.is_empty() {
            debug!(cluster = %spec.key, "no object changes");
        }

        let applied = apply(self.platform.as_ref(), &plan).await;
        for change in plan.changes.iter().filter(|c| applied.applied.contains(&c.id)) {
            let reason = match change.action {
                Action::Create => "Created",
                Action::Update => "Updated",
                Action::Delete => "Deleted",
            };
            self.events.emit(EngineEvent::normal(&spec.key, report.uid.as_deref(), reason, format!("{} {}", reason.to_lowercase(), change.id))).await;
        }
        if let Some(e) = applied.error() {
            return Err(e);
        }

        let generation = report.generation;
        let newer_declared = || superseded(generation);
        for role in [Role::ZooKeeper, Role::Kafka] {
            let Some(roll) = rollout(&spec.key, role, &desired, &live, &plan)? else { continue };
            if newer_declared() {
                return Ok(Outcome::Superseded);
            }
            info!(cluster = %spec.key, role = %role, workload_update = roll.update.is_some(), "rolling update required");
            let out = RollingUpdateCoordinator::new(self.platform.as_ref(), self.config.roll).run(&roll, &newer_declared).await?;
            for member in &out.restarted {
                let msg = format!("restarted {} member {}", role, member);
                self.events.emit(EngineEvent::normal(&spec.key, report.uid.as_deref(), "MemberRestarted", msg)).await;
            }
            report.restarted += out.restarted.len();
            if out.superseded {
                return Ok(Outcome::Superseded);
            }
        }
        Ok(Outcome::Converged)
    }
}

/// The rollout a role needs this cycle: a deferred template or storage change, or members
/// left on an older template by an interrupted roll.
fn rollout(key: &ClusterKey, role: Role, desired: &[DesiredObject], live: &LiveState, plan: &ChangePlan) -> Result<Option<RollingUpdatePlan>> {
    let Some(workload) = desired.iter().find(|d| d.role == role && d.id.kind == ObjectKind::StatefulSet) else { return Ok(None) };
    let Some(pod_fingerprint) = workload.pod_fingerprint.clone() else { return Ok(None) };
    let change = plan.disruptive_for(role);
    let stale = live.members(role).iter().any(|m| m.pod_fingerprint.as_deref() != Some(pod_fingerprint.as_str()));
    if change.is_none() && !stale {
        return Ok(None);
    }
    let update = match change {
        None => None,
        Some(c) => Some(WorkloadUpdate {
            manifest: c.manifest.clone().ok_or_else(|| Error::transient(format!("{} has no manifest", c.id)))?,
            revision: c.revision.clone().unwrap_or_default(),
            recreate: c.changed_groups.iter().any(|g| g == GROUP_STORAGE),
        }),
    };
    Ok(Some(RollingUpdatePlan { cluster: key.clone(), role, workload: workload.id.clone(), pod_fingerprint, update }))
}

/// CA material that was published once must stay available: without it the secret would be
/// deleted and every broker rolled onto a template without certificates.
fn check_credentials(spec: &ClusterSpec, issued: bool, live: &LiveState) -> Result<()> {
    if issued {
        return Ok(());
    }
    let published = ObjectRef::new(ObjectKind::Secret, spec.key.namespace.clone(), format!("{}-{}", spec.key.name, CA_SECRET_SUFFIX));
    if live.get(&published).is_some() {
        return Err(Error::transient(format!("cluster CA source for {} is unavailable; keeping {}", spec.key, published)));
    }
    Ok(())
}

/// Compare declared storage against what the live workloads were created with.
fn check_storage(spec: &ClusterSpec, live: &LiveState) -> Result<()> {
    for (role, declared) in [(Role::ZooKeeper, &spec.zookeeper.role.storage), (Role::Kafka, &spec.kafka.role.storage)] {
        let previous = live
            .objects
            .values()
            .find(|o| o.id.kind == ObjectKind::StatefulSet && o.label(ROLE_LABEL) == Some(role.as_str()))
            .and_then(|o| o.annotations.get(STORAGE_ANNOTATION));
        let Some(previous) = previous else { continue };
        match serde_json::from_str::<Storage>(previous) {
            Ok(prev) => check_storage_transition(role.as_str(), &prev, declared)?,
            Err(e) => warn!(cluster = %spec.key, role = %role, error = %e, "unreadable storage annotation; skipping storage check"),
        }
    }
    Ok(())
}
