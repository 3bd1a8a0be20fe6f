//! Krill kubehub: the platform seam.
//!
//! [`Platform`] is everything the engine asks of the container platform. [`KubePlatform`]
//! talks to a real API server through kube-rs; [`MemoryPlatform`] keeps the same contract
//! in process (optimistic revisions, a minimal StatefulSet controller, scripted readiness,
//! failure injection) for tests and offline rendering.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use krill_core::{ClusterKey, CredentialMaterial, Member, ObjectKind, ObjectRef, Result, Role, StatusRecord};
use serde_json::Value as Json;

mod kube_platform;
mod live;
mod memory;
mod watch;

pub use kube_platform::{api_resource, classify, cluster_api_resource, KubePlatform};
pub use live::{read_live, LiveState};
pub use memory::{MemoryPlatform, Op};
pub use watch::{start_watchers, ClusterEvent};

/// Custom resource status plus the revision it was read at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedStatus {
    pub status: StatusRecord,
    pub revision: String,
}

/// Operations the engine performs against the container platform.
///
/// Revisions are opaque optimistic-concurrency tokens. A stale revision yields
/// `Error::Conflict`; a missing object on read yields `Ok(None)`.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Every declared cluster visible to the operator, for periodic resync.
    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<ClusterKey>>;
    /// The declared cluster resource, raw.
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Json>>;
    /// Objects of one kind carrying the cluster ownership labels.
    async fn list_owned(&self, cluster: &ClusterKey, kind: ObjectKind) -> Result<Vec<Json>>;
    /// Create an object; returns the new revision.
    async fn create(&self, id: &ObjectRef, manifest: &Json) -> Result<String>;
    /// Replace an object at a known revision; returns the new revision.
    async fn replace(&self, id: &ObjectRef, manifest: &Json, revision: &str) -> Result<String>;
    /// Delete an object. Absent objects are not an error. With `orphan`, dependents
    /// (a workload's pods) survive the delete.
    async fn delete(&self, id: &ObjectRef, orphan: bool) -> Result<()>;
    /// Current members of a quorum-bearing role, ordered by index.
    async fn list_members(&self, cluster: &ClusterKey, role: Role) -> Result<Vec<Member>>;
    /// Delete one member's pod so its controller recreates it from the current template.
    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()>;
    async fn get_status(&self, key: &ClusterKey) -> Result<Option<VersionedStatus>>;
    /// Write the status subresource at a known revision.
    async fn write_status(&self, key: &ClusterKey, status: &StatusRecord, revision: &str) -> Result<()>;
}

/// Source of opaque credential material the builder copies into cluster secrets.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn cluster_ca(&self, cluster: &ClusterKey) -> Result<Option<CredentialMaterial>>;
}

/// Pod name of a member: `<workload>-<index>`.
pub fn member_pod_name(cluster: &ClusterKey, role: Role, index: u32) -> String {
    format!("{}-{}-{}", cluster.name, role.as_str(), index)
}

/// Ordinal suffix of a StatefulSet pod name.
pub fn pod_index(pod: &str) -> Option<u32> { pod.rsplit_once('-').and_then(|(_, i)| i.parse().ok()) }

/// Remove server-populated metadata that never takes part in comparisons.
pub(crate) fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}
