use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use krill_core::{
    ClusterKey, CredentialMaterial, Error, Member, ObjectKind, ObjectRef, Result, Role, StatusRecord, CLUSTER_LABEL, MANAGED_BY,
    MANAGED_BY_LABEL, POD_FINGERPRINT_ANNOTATION, ROLE_LABEL,
};
use serde_json::{json, Value as Json};
use tracing::debug;
use uuid::Uuid;

use crate::{pod_index, CredentialProvider, Platform, VersionedStatus};

/// Platform operations, for failure injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListClusters,
    GetCluster,
    List,
    Create,
    Replace,
    Delete,
    ListMembers,
    DeletePod,
    GetStatus,
    WriteStatus,
    ReadCredentials,
}

struct Fault {
    op: Op,
    target: Option<String>,
    error: Error,
    remaining: usize,
}

struct PodState {
    cluster: ClusterKey,
    role: Role,
    member: Member,
    /// Polls left before a recreated pod reports ready.
    unready_polls: u32,
    stuck: bool,
}

#[derive(Default)]
struct State {
    rv: u64,
    clusters: BTreeMap<ClusterKey, Json>,
    objects: BTreeMap<ObjectRef, Json>,
    pods: BTreeMap<(String, String), PodState>,
    cas: BTreeMap<ClusterKey, CredentialMaterial>,
    faults: Vec<Fault>,
    calls: Vec<(Op, String)>,
    restart_polls: u32,
    stalled: BTreeSet<String>,
    max_unready: BTreeMap<(ClusterKey, Role), usize>,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn check(&mut self, op: Op, target: &str) -> Result<()> {
        let hit = self.faults.iter().position(|f| f.op == op && f.target.as_deref().map_or(true, |t| t == target));
        let Some(i) = hit else { return Ok(()) };
        let err = self.faults[i].error.clone();
        self.faults[i].remaining = self.faults[i].remaining.saturating_sub(1);
        if self.faults[i].remaining == 0 {
            self.faults.remove(i);
        }
        Err(err)
    }

    fn log(&mut self, op: Op, target: impl Into<String>) { self.calls.push((op, target.into())); }

    /// Minimal StatefulSet controller: create missing ordinals, drop surplus ones.
    /// Existing pods keep their template (OnDelete).
    fn sync_workload(&mut self, id: &ObjectRef) {
        let Some(sts) = self.objects.get(id) else { return };
        let labels = &sts["metadata"]["labels"];
        let (Some(cluster), Some(role)) = (labels[CLUSTER_LABEL].as_str(), labels[ROLE_LABEL].as_str().and_then(Role::from_label)) else {
            return;
        };
        let cluster = ClusterKey::new(id.namespace.clone(), cluster);
        let replicas = sts["spec"]["replicas"].as_u64().unwrap_or(0) as u32;
        let fp = template_fingerprint(sts);
        let prefix = format!("{}-", id.name);
        self.pods.retain(|(ns, pod), _| {
            ns != &id.namespace || !pod.starts_with(&prefix) || pod_index(pod).map_or(true, |i| i < replicas)
        });
        for i in 0..replicas {
            let name = format!("{}{}", prefix, i);
            let key = (id.namespace.clone(), name.clone());
            if !self.pods.contains_key(&key) {
                let member = Member { index: i, pod: name, uid: Uuid::new_v4().to_string(), ready: true, pod_fingerprint: fp.clone(), leader: false };
                self.pods.insert(key, PodState { cluster: cluster.clone(), role, member, unready_polls: 0, stuck: false });
            }
        }
    }

    fn workload_of(&self, namespace: &str, pod: &str) -> Option<ObjectRef> {
        let (name, _) = pod.rsplit_once('-')?;
        let id = ObjectRef::new(ObjectKind::StatefulSet, namespace, name);
        self.objects.contains_key(&id).then_some(id)
    }
}

fn template_fingerprint(sts: &Json) -> Option<String> {
    sts["spec"]["template"]["metadata"]["annotations"][POD_FINGERPRINT_ANNOTATION].as_str().map(|s| s.to_string())
}

fn labels_match(obj: &Json, cluster: &ClusterKey) -> bool {
    let labels = &obj["metadata"]["labels"];
    labels[MANAGED_BY_LABEL] == MANAGED_BY && labels[CLUSTER_LABEL] == cluster.name.as_str()
}

/// In-process platform with the same contract as the API server, as far as the engine can tell.
#[derive(Clone, Default)]
pub struct MemoryPlatform {
    inner: Arc<Mutex<State>>,
    latency: Option<Duration>,
}

impl MemoryPlatform {
    pub fn new() -> Self { Self::default() }

    /// Every call sleeps first; lets tests overlap cycles.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    async fn pause(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Create or update a cluster resource (spec edits keep the stored status).
    pub fn put_cluster(&self, mut raw: Json) -> ClusterKey {
        let mut st = self.state();
        if raw["metadata"]["namespace"].is_null() {
            raw["metadata"]["namespace"] = json!("default");
        }
        let key = ClusterKey::new(
            raw["metadata"]["namespace"].as_str().unwrap_or("default"),
            raw["metadata"]["name"].as_str().unwrap_or_default(),
        );
        if let Some(old) = st.clusters.get(&key) {
            raw["status"] = old["status"].clone();
            if raw["metadata"]["uid"].is_null() {
                raw["metadata"]["uid"] = old["metadata"]["uid"].clone();
            }
        } else if raw["metadata"]["uid"].is_null() {
            raw["metadata"]["uid"] = json!(Uuid::new_v4().to_string());
        }
        raw["metadata"]["resourceVersion"] = json!(st.next_rv());
        st.clusters.insert(key.clone(), raw);
        key
    }

    pub fn remove_cluster(&self, key: &ClusterKey) { self.state().clusters.remove(key); }

    pub fn set_cluster_ca(&self, key: &ClusterKey, material: CredentialMaterial) { self.state().cas.insert(key.clone(), material); }

    /// The issuer's secret disappears; the provider reports no material.
    pub fn revoke_cluster_ca(&self, key: &ClusterKey) { self.state().cas.remove(key); }

    /// Fail the next `times` calls of `op` (optionally only for one object/pod name).
    pub fn fail(&self, op: Op, target: Option<&str>, error: Error, times: usize) {
        self.state().faults.push(Fault { op, target: target.map(|s| s.to_string()), error, remaining: times });
    }

    pub fn clear_faults(&self) { self.state().faults.clear(); }

    /// Recreated pods stay unready for this many member polls.
    pub fn set_restart_polls(&self, polls: u32) { self.state().restart_polls = polls; }

    /// After its next restart, the pod never becomes ready.
    pub fn stall_pod(&self, pod: &str) { self.state().stalled.insert(pod.to_string()); }

    pub fn set_leader(&self, namespace: &str, pod: &str) {
        let mut st = self.state();
        for ((ns, name), p) in st.pods.iter_mut() {
            if ns == namespace {
                p.member.leader = name == pod;
            }
        }
    }

    pub fn set_ready(&self, namespace: &str, pod: &str, ready: bool) {
        if let Some(p) = self.state().pods.get_mut(&(namespace.to_string(), pod.to_string())) {
            p.member.ready = ready;
            p.stuck = !ready;
        }
    }

    /// Simulate a concurrent writer: bump an object's revision.
    pub fn touch(&self, id: &ObjectRef) {
        let mut st = self.state();
        let rv = st.next_rv();
        if let Some(o) = st.objects.get_mut(id) {
            o["metadata"]["resourceVersion"] = json!(rv);
        }
    }

    pub fn object(&self, id: &ObjectRef) -> Option<Json> { self.state().objects.get(id).cloned() }

    pub fn object_ids(&self) -> Vec<ObjectRef> { self.state().objects.keys().cloned().collect() }

    /// Insert an object as if some other writer had created it.
    pub fn seed_object(&self, id: &ObjectRef, mut manifest: Json) {
        let mut st = self.state();
        manifest["metadata"]["resourceVersion"] = json!(st.next_rv());
        st.objects.insert(id.clone(), manifest);
        if id.kind == ObjectKind::StatefulSet {
            st.sync_workload(id);
        }
    }

    /// Pods without advancing scripted readiness.
    pub fn pods(&self, cluster: &ClusterKey, role: Role) -> Vec<Member> {
        self.state().pods.values().filter(|p| &p.cluster == cluster && p.role == role).map(|p| p.member.clone()).collect()
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<Json> { self.state().clusters.get(key).cloned() }

    /// Mutating calls in order, as `(op, target)`.
    pub fn calls(&self) -> Vec<(Op, String)> { self.state().calls.clone() }

    pub fn clear_calls(&self) { self.state().calls.clear(); }

    /// Highest number of simultaneously unready members seen by any poll.
    pub fn max_unready(&self, cluster: &ClusterKey, role: Role) -> usize {
        self.state().max_unready.get(&(cluster.clone(), role)).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<ClusterKey>> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::ListClusters, "")?;
        Ok(st.clusters.keys().filter(|k| namespace.map_or(true, |ns| k.namespace == ns)).cloned().collect())
    }

    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Json>> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::GetCluster, &key.name)?;
        Ok(st.clusters.get(key).cloned())
    }

    async fn list_owned(&self, cluster: &ClusterKey, kind: ObjectKind) -> Result<Vec<Json>> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::List, kind.kind())?;
        Ok(st
            .objects
            .iter()
            .filter(|(id, o)| id.kind == kind && id.namespace == cluster.namespace && labels_match(o, cluster))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, id: &ObjectRef, manifest: &Json) -> Result<String> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::Create, &id.name)?;
        if st.objects.contains_key(id) {
            return Err(Error::conflict(format!("{} already exists", id)));
        }
        let rv = st.next_rv();
        let mut obj = manifest.clone();
        obj["metadata"]["resourceVersion"] = json!(rv);
        obj["metadata"]["uid"] = json!(Uuid::new_v4().to_string());
        st.objects.insert(id.clone(), obj);
        st.log(Op::Create, id.to_string());
        if id.kind == ObjectKind::StatefulSet {
            st.sync_workload(id);
        }
        debug!(object = %id, rv = %rv, "memory create");
        Ok(rv)
    }

    async fn replace(&self, id: &ObjectRef, manifest: &Json, revision: &str) -> Result<String> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::Replace, &id.name)?;
        let (current, uid) = match st.objects.get(id) {
            Some(o) => (o["metadata"]["resourceVersion"].as_str().unwrap_or_default().to_string(), o["metadata"]["uid"].clone()),
            None => return Err(Error::conflict(format!("{} disappeared before update", id))),
        };
        if current != revision {
            return Err(Error::conflict(format!("{} is at revision {}, not {}", id, current, revision)));
        }
        let rv = st.next_rv();
        let mut obj = manifest.clone();
        obj["metadata"]["resourceVersion"] = json!(rv);
        obj["metadata"]["uid"] = uid;
        st.objects.insert(id.clone(), obj);
        st.log(Op::Replace, id.to_string());
        if id.kind == ObjectKind::StatefulSet {
            st.sync_workload(id);
        }
        Ok(rv)
    }

    async fn delete(&self, id: &ObjectRef, orphan: bool) -> Result<()> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::Delete, &id.name)?;
        if st.objects.remove(id).is_some() {
            st.log(Op::Delete, id.to_string());
            if id.kind == ObjectKind::StatefulSet && !orphan {
                let prefix = format!("{}-", id.name);
                st.pods.retain(|(ns, pod), _| !(ns == &id.namespace && pod.starts_with(&prefix) && pod_index(pod).is_some()));
            }
        }
        Ok(())
    }

    async fn list_members(&self, cluster: &ClusterKey, role: Role) -> Result<Vec<Member>> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::ListMembers, role.as_str())?;
        let mut out = Vec::new();
        for p in st.pods.values_mut().filter(|p| &p.cluster == cluster && p.role == role) {
            if !p.member.ready && !p.stuck {
                if p.unready_polls == 0 {
                    p.member.ready = true;
                } else {
                    p.unready_polls -= 1;
                }
            }
            out.push(p.member.clone());
        }
        out.sort_by_key(|m| m.index);
        let unready = out.iter().filter(|m| !m.ready).count();
        let seen = st.max_unready.entry((cluster.clone(), role)).or_insert(0);
        *seen = (*seen).max(unready);
        Ok(out)
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::DeletePod, pod)?;
        let key = (namespace.to_string(), pod.to_string());
        let Some(mut p) = st.pods.remove(&key) else { return Ok(()) };
        st.log(Op::DeletePod, pod);
        if let Some(workload) = st.workload_of(namespace, pod) {
            let fp = st.objects.get(&workload).and_then(template_fingerprint);
            p.member.uid = Uuid::new_v4().to_string();
            p.member.pod_fingerprint = fp;
            p.member.leader = false;
            p.stuck = st.stalled.contains(pod);
            p.unready_polls = st.restart_polls;
            p.member.ready = !p.stuck && st.restart_polls == 0;
            st.pods.insert(key, p);
        }
        Ok(())
    }

    async fn get_status(&self, key: &ClusterKey) -> Result<Option<VersionedStatus>> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::GetStatus, &key.name)?;
        Ok(st.clusters.get(key).map(|raw| VersionedStatus {
            status: serde_json::from_value::<StatusRecord>(raw["status"].clone()).unwrap_or_default(),
            revision: raw["metadata"]["resourceVersion"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn write_status(&self, key: &ClusterKey, status: &StatusRecord, revision: &str) -> Result<()> {
        self.pause().await;
        let mut st = self.state();
        st.check(Op::WriteStatus, &key.name)?;
        let rv = st.next_rv();
        let Some(raw) = st.clusters.get_mut(key) else {
            return Err(Error::conflict(format!("{} no longer exists", key)));
        };
        if raw["metadata"]["resourceVersion"].as_str() != Some(revision) {
            return Err(Error::conflict(format!("status of {} changed since revision {}", key, revision)));
        }
        raw["status"] = serde_json::to_value(status).map_err(|e| Error::transient(e.to_string()))?;
        raw["metadata"]["resourceVersion"] = json!(rv);
        st.log(Op::WriteStatus, key.to_string());
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for MemoryPlatform {
    async fn cluster_ca(&self, cluster: &ClusterKey) -> Result<Option<CredentialMaterial>> {
        let mut st = self.state();
        st.check(Op::ReadCredentials, &cluster.name)?;
        Ok(st.cas.get(cluster).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sts(replicas: u32, fp: &str) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": {"name": "c-kafka", "namespace": "ns", "labels": {
                MANAGED_BY_LABEL: MANAGED_BY, CLUSTER_LABEL: "c", ROLE_LABEL: "kafka"}},
            "spec": {"replicas": replicas, "template": {"metadata": {"annotations": {POD_FINGERPRINT_ANNOTATION: fp}}}}
        })
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let p = MemoryPlatform::new();
        let id = ObjectRef::new(ObjectKind::StatefulSet, "ns", "c-kafka");
        let rv = p.create(&id, &sts(1, "a")).await.unwrap();
        p.touch(&id);
        let e = p.replace(&id, &sts(1, "b"), &rv).await.unwrap_err();
        assert!(matches!(e, Error::Conflict(_)), "e={}", e);
    }

    #[tokio::test]
    async fn on_delete_pods_pick_up_template_only_when_recreated() {
        let p = MemoryPlatform::new();
        let key = ClusterKey::new("ns", "c");
        let id = ObjectRef::new(ObjectKind::StatefulSet, "ns", "c-kafka");
        let rv = p.create(&id, &sts(3, "a")).await.unwrap();
        p.replace(&id, &sts(3, "b"), &rv).await.unwrap();
        let members = p.list_members(&key, Role::Kafka).await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|m| m.pod_fingerprint.as_deref() == Some("a")));
        let old_uid = members[1].uid.clone();
        p.delete_pod("ns", "c-kafka-1").await.unwrap();
        let members = p.list_members(&key, Role::Kafka).await.unwrap();
        assert_eq!(members[1].pod_fingerprint.as_deref(), Some("b"));
        assert_ne!(members[1].uid, old_uid);
    }

    #[tokio::test]
    async fn scripted_readiness_and_faults() {
        let p = MemoryPlatform::new();
        let key = ClusterKey::new("ns", "c");
        let id = ObjectRef::new(ObjectKind::StatefulSet, "ns", "c-kafka");
        p.create(&id, &sts(2, "a")).await.unwrap();
        p.set_restart_polls(1);
        p.delete_pod("ns", "c-kafka-0").await.unwrap();
        assert!(!p.list_members(&key, Role::Kafka).await.unwrap()[0].ready);
        assert!(p.list_members(&key, Role::Kafka).await.unwrap()[0].ready);
        assert_eq!(p.max_unready(&key, Role::Kafka), 1);

        p.fail(Op::DeletePod, Some("c-kafka-1"), Error::transient("boom"), 1);
        assert!(p.delete_pod("ns", "c-kafka-1").await.is_err());
        assert!(p.delete_pod("ns", "c-kafka-1").await.is_ok());
    }

    #[tokio::test]
    async fn orphan_delete_keeps_pods() {
        let p = MemoryPlatform::new();
        let key = ClusterKey::new("ns", "c");
        let id = ObjectRef::new(ObjectKind::StatefulSet, "ns", "c-kafka");
        p.create(&id, &sts(2, "a")).await.unwrap();
        p.delete(&id, true).await.unwrap();
        assert_eq!(p.pods(&key, Role::Kafka).len(), 2);
        p.create(&id, &sts(2, "a")).await.unwrap();
        p.delete(&id, false).await.unwrap();
        assert!(p.pods(&key, Role::Kafka).is_empty());
    }

    #[tokio::test]
    async fn status_writes_are_revision_checked() {
        let p = MemoryPlatform::new();
        let key = p.put_cluster(json!({"metadata": {"name": "c", "namespace": "ns", "generation": 1}, "spec": {}}));
        let v = p.get_status(&key).await.unwrap().unwrap();
        let mut s = StatusRecord::default();
        s.observed_generation = Some(1);
        p.write_status(&key, &s, &v.revision).await.unwrap();
        assert!(matches!(p.write_status(&key, &s, &v.revision).await, Err(Error::Conflict(_))));
        let again = p.get_status(&key).await.unwrap().unwrap();
        assert_eq!(again.status.observed_generation, Some(1));
    }
}
