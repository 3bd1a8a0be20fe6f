//! Krill apply: diff desired against live state into a [`ChangePlan`], then execute it.
//!
//! Objects are compared by per-field-group fingerprints, never by full manifests, so
//! server-populated fields do not show up as drift. Changes to disruptive groups of a
//! workload are not applied here; they are handed to the rolling-update coordinator.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Instant;

use futures::future::join_all;
use krill_core::{ClusterKey, DesiredObject, Error, ObjectKind, ObjectRef, Role};
use krill_kubehub::{LiveState, Platform};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// One object-level step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: ObjectRef,
    pub role: Role,
    pub action: Action,
    /// Field groups whose fingerprint differs from the live object.
    pub changed_groups: Vec<String>,
    /// Requires restarting members; handled by the coordinator.
    pub disruptive: bool,
    /// Live revision an update is conditioned on. Deletes are unconditional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip)]
    pub manifest: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub disruptive: usize,
}

/// Ordered, minimal set of changes that moves live state to desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlan {
    pub cluster: ClusterKey,
    pub changes: Vec<Change>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool { self.changes.is_empty() }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for c in &self.changes {
            match c.action {
                Action::Create => s.creates += 1,
                Action::Update => s.updates += 1,
                Action::Delete => s.deletes += 1,
            }
            if c.disruptive {
                s.disruptive += 1;
            }
        }
        s
    }

    /// The disruptive change for a role's workload, if any.
    pub fn disruptive_for(&self, role: Role) -> Option<&Change> { self.changes.iter().find(|c| c.disruptive && c.role == role) }
}

fn kind_rank(kind: ObjectKind) -> usize { ObjectKind::ALL.iter().position(|k| *k == kind).unwrap_or(usize::MAX) }

/// Compute the change plan. Pure: same inputs, same plan.
pub fn plan(cluster: &ClusterKey, desired: &[DesiredObject], live: &LiveState) -> ChangePlan {
    let mut changes = Vec::new();
    let wanted: BTreeSet<&ObjectRef> = desired.iter().map(|d| &d.id).collect();

    for d in desired {
        match live.get(&d.id) {
            None => changes.push(Change {
                id: d.id.clone(),
                role: d.role,
                action: Action::Create,
                changed_groups: d.field_hashes.keys().cloned().collect(),
                disruptive: false,
                revision: None,
                manifest: Some(d.manifest.clone()),
            }),
            Some(l) => {
                if l.fingerprint.as_deref() == Some(d.fingerprint.as_str()) && l.field_hashes == d.field_hashes {
                    continue;
                }
                // objects never stamped by the engine count as changed in every group
                let changed: Vec<String> =
                    d.field_hashes.iter().filter(|(g, h)| l.field_hashes.get(*g) != Some(*h)).map(|(g, _)| g.clone()).collect();
                let changed = if changed.is_empty() { d.field_hashes.keys().cloned().collect() } else { changed };
                let disruptive = changed.iter().any(|g| d.id.kind.disruptive_groups().contains(&g.as_str()));
                changes.push(Change {
                    id: d.id.clone(),
                    role: d.role,
                    action: Action::Update,
                    changed_groups: changed,
                    disruptive,
                    revision: Some(l.revision.clone()),
                    manifest: Some(d.manifest.clone()),
                });
            }
        }
    }

    for (id, l) in &live.objects {
        if wanted.contains(id) {
            continue;
        }
        if !l.owned_by(cluster) {
            debug!(cluster = %cluster, object = %id, "labelled but not exclusively owned; leaving in place");
            continue;
        }
        let role = l.label(krill_core::ROLE_LABEL).and_then(Role::from_label).unwrap_or(Role::Cluster);
        changes.push(Change {
            id: id.clone(),
            role,
            action: Action::Delete,
            changed_groups: Vec::new(),
            disruptive: false,
            revision: None,
            manifest: None,
        });
    }

    changes.sort_by(|a, b| (kind_rank(a.id.kind), &a.id.name).cmp(&(kind_rank(b.id.kind), &b.id.name)));
    ChangePlan { cluster: cluster.clone(), changes }
}

/// Per-object results of one apply pass.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<ObjectRef>,
    pub failed: Vec<(ObjectRef, Error)>,
    /// Disruptive workload changes left for the coordinator.
    pub deferred: Vec<Change>,
}

impl ApplyReport {
    /// The failure that decides the cycle outcome.
    pub fn error(&self) -> Option<Error> { Error::worst(self.failed.iter().map(|(_, e)| e.clone())) }
}

/// Execute one non-disruptive change.
pub async fn apply_change(platform: &dyn Platform, change: &Change) -> Result<(), Error> {
    let manifest = || change.manifest.as_ref().ok_or_else(|| Error::transient(format!("{} has no manifest", change.id)));
    match change.action {
        Action::Create => platform.create(&change.id, manifest()?).await.map(|_| ()),
        Action::Update => platform.replace(&change.id, manifest()?, change.revision.as_deref().unwrap_or_default()).await.map(|_| ()),
        Action::Delete => platform.delete(&change.id, false).await,
    }
}

/// Apply every non-disruptive change concurrently. A failing object does not stop the others.
pub async fn apply(platform: &dyn Platform, plan: &ChangePlan) -> ApplyReport {
    let t0 = Instant::now();
    let mut report = ApplyReport::default();
    let (deferred, now): (Vec<&Change>, Vec<&Change>) = plan.changes.iter().partition(|c| c.disruptive);
    report.deferred = deferred.into_iter().cloned().collect();

    let results = join_all(now.iter().map(|c| async move { (*c, apply_change(platform, c).await) })).await;
    for (c, res) in results {
        match res {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                info!(cluster = %plan.cluster, object = %c.id, action = ?c.action, groups = ?c.changed_groups, "applied");
                report.applied.push(c.id.clone());
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(cluster = %plan.cluster, object = %c.id, action = ?c.action, error = %e, "apply failed");
                report.failed.push((c.id.clone(), e));
            }
        }
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    report
}
