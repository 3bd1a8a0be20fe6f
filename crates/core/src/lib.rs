//! Krill core types: object identities, desired/live object shapes, fingerprints and status.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

pub mod error;
pub mod quantity;

pub use error::{Error, Result, RetryClass};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "krill";
pub const CLUSTER_LABEL: &str = "krill.io/cluster";
pub const ROLE_LABEL: &str = "krill.io/role";
/// Pod label a broker/ensemble agent sets on the member currently acting as controller/leader.
pub const LEADER_LABEL: &str = "krill.io/leader";

pub const FINGERPRINT_ANNOTATION: &str = "krill.io/fingerprint";
pub const FIELD_HASHES_ANNOTATION: &str = "krill.io/field-hashes";
pub const POD_FINGERPRINT_ANNOTATION: &str = "krill.io/pod-fingerprint";
pub const PAUSE_ANNOTATION: &str = "krill.io/pause-reconciliation";
/// Storage declaration a workload was last applied with; guards shrink/class changes.
pub const STORAGE_ANNOTATION: &str = "krill.io/storage";

pub const CRD_GROUP: &str = "kafka.krill.io";
pub const CRD_VERSION: &str = "v1beta1";
pub const CRD_KIND: &str = "Kafka";
pub const CRD_PLURAL: &str = "kafkas";

/// Identity of one declared cluster (one `Kafka` resource).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Label selector matching every object the engine owns for this cluster.
    pub fn selector(&self) -> String {
        format!("{}={},{}={}", MANAGED_BY_LABEL, MANAGED_BY, CLUSTER_LABEL, self.name)
    }

    /// Name prefix shared by all owned-and-exclusive objects.
    pub fn object_prefix(&self) -> String { format!("{}-", self.name) }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Kinds of platform objects the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    StatefulSet,
    Service,
    ConfigMap,
    Secret,
    PodDisruptionBudget,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
        ObjectKind::Service,
        ObjectKind::PodDisruptionBudget,
        ObjectKind::StatefulSet,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            ObjectKind::StatefulSet => "apps",
            ObjectKind::PodDisruptionBudget => "policy",
            _ => "",
        }
    }

    pub fn version(&self) -> &'static str { "v1" }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::Service => "Service",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::PodDisruptionBudget => "PodDisruptionBudget",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ObjectKind::StatefulSet => "statefulsets",
            ObjectKind::Service => "services",
            ObjectKind::ConfigMap => "configmaps",
            ObjectKind::Secret => "secrets",
            ObjectKind::PodDisruptionBudget => "poddisruptionbudgets",
        }
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.kind() == kind)
    }

    /// Field groups whose change requires restarting the members running this object.
    pub fn disruptive_groups(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::StatefulSet => &[GROUP_POD_TEMPLATE, GROUP_STORAGE],
            _ => &[],
        }
    }
}

pub const GROUP_POD_TEMPLATE: &str = "pod-template";
pub const GROUP_STORAGE: &str = "storage";
pub const GROUP_REPLICAS: &str = "replicas";
pub const GROUP_METADATA: &str = "metadata";
pub const GROUP_SPEC: &str = "spec";
pub const GROUP_DATA: &str = "data";

/// Member role of the managed system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    ZooKeeper,
    Kafka,
    /// Cluster-wide artifacts not tied to a member role (credentials).
    Cluster,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ZooKeeper => "zookeeper",
            Role::Kafka => "kafka",
            Role::Cluster => "cluster",
        }
    }

    pub fn quorum_bearing(&self) -> bool { matches!(self, Role::ZooKeeper | Role::Kafka) }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "zookeeper" => Some(Role::ZooKeeper),
            "kafka" => Some(Role::Kafka),
            "cluster" => Some(Role::Cluster),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Stable identity of a platform object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.kind(), self.namespace, self.name)
    }
}

/// Field-group name -> fingerprint.
pub type FieldHashes = BTreeMap<String, String>;

/// One managed artifact as the engine wants it to exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredObject {
    pub id: ObjectRef,
    pub role: Role,
    /// Full manifest, fingerprint annotations included.
    pub manifest: Json,
    pub fingerprint: String,
    pub field_hashes: FieldHashes,
    /// Hash of the pod template for workloads; members whose pod carries another value are stale.
    pub pod_fingerprint: Option<String>,
}

impl DesiredObject {
    /// Seal a manifest: hash every field group, derive the overall fingerprint and
    /// stamp both into `metadata.annotations`.
    pub fn seal(id: ObjectRef, role: Role, mut manifest: Json, groups: Vec<(&str, &Json)>, pod_fingerprint: Option<String>) -> Self {
        let field_hashes: FieldHashes = groups.into_iter().map(|(g, v)| (g.to_string(), fingerprint(v))).collect();
        let overall = fingerprint(&serde_json::to_value(&field_hashes).unwrap_or(Json::Null));
        let encoded = serde_json::to_string(&field_hashes).unwrap_or_default();
        if let Some(meta) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            let annos = meta.entry("annotations").or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(a) = annos.as_object_mut() {
                a.insert(FINGERPRINT_ANNOTATION.into(), Json::String(overall.clone()));
                a.insert(FIELD_HASHES_ANNOTATION.into(), Json::String(encoded));
            }
        }
        Self { id, role, manifest, fingerprint: overall, field_hashes, pod_fingerprint }
    }
}

/// Mirror of a platform object as read back from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveObject {
    pub id: ObjectRef,
    /// Optimistic concurrency token (`metadata.resourceVersion`).
    pub revision: String,
    pub labels: SmallVec<[(String, String); 8]>,
    /// Fingerprint written at last apply; absent for objects the engine never stamped.
    pub fingerprint: Option<String>,
    pub field_hashes: FieldHashes,
    /// Engine annotations (`krill.io/*`) only.
    pub annotations: BTreeMap<String, String>,
}

impl LiveObject {
    /// Project a raw platform object. Returns None when it lacks a name.
    pub fn from_manifest(kind: ObjectKind, raw: &Json) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name")?.as_str()?.to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let revision = meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let labels = meta
            .get("labels")
            .and_then(|l| l.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        let annos = meta.get("annotations").and_then(|a| a.as_object());
        let fingerprint = annos.and_then(|a| a.get(FINGERPRINT_ANNOTATION)).and_then(|v| v.as_str()).map(|s| s.to_string());
        let field_hashes = annos
            .and_then(|a| a.get(FIELD_HASHES_ANNOTATION))
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str::<FieldHashes>(s).ok())
            .unwrap_or_default();
        let annotations = annos
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.starts_with("krill.io/"))
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { id: ObjectRef { kind, namespace, name }, revision, labels, fingerprint, field_hashes, annotations })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Owned and exclusive: carries the cluster ownership labels and the cluster name prefix.
    pub fn owned_by(&self, cluster: &ClusterKey) -> bool {
        self.id.namespace == cluster.namespace
            && self.label(MANAGED_BY_LABEL) == Some(MANAGED_BY)
            && self.label(CLUSTER_LABEL) == Some(cluster.name.as_str())
            && self.id.name.starts_with(&cluster.object_prefix())
    }
}

/// One pod of a quorum-bearing role as observed on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub index: u32,
    pub pod: String,
    /// Platform uid of the current pod instance; changes when the pod is recreated.
    pub uid: String,
    pub ready: bool,
    pub pod_fingerprint: Option<String>,
    pub leader: bool,
}

/// Opaque secret material handed out by the credential provider (Secret `data`, base64 values).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMaterial {
    pub data: BTreeMap<String, String>,
}

impl CredentialMaterial {
    /// Change-detection hash; contents are never interpreted.
    pub fn fingerprint(&self) -> String {
        let mut buf = Vec::new();
        for (k, v) in &self.data {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        fingerprint_bytes(&buf)
    }
}

/// Content fingerprint: 64-bit FNV-1a over a canonical (key-sorted) walk of the JSON value.
pub fn fingerprint(v: &Json) -> String {
    let mut h = Fnv64::new();
    feed(&mut h, v);
    format!("{:016x}", h.finish())
}

/// Fingerprint of opaque bytes (credential material).
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut h = Fnv64::new();
    h.write(bytes);
    format!("{:016x}", h.finish())
}

struct Fnv64(u64);

impl Fnv64 {
    fn new() -> Self { Self(0xcbf29ce484222325) }
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes { self.0 ^= *b as u64; self.0 = self.0.wrapping_mul(0x100000001b3); }
    }
    fn finish(&self) -> u64 { self.0 }
}

fn feed(h: &mut Fnv64, v: &Json) {
    match v {
        Json::Null => h.write(b"n"),
        Json::Bool(b) => h.write(if *b { b"t" } else { b"f" }),
        Json::Number(n) => { h.write(b"#"); h.write(n.to_string().as_bytes()); }
        Json::String(s) => { h.write(b"s"); h.write(&(s.len() as u64).to_le_bytes()); h.write(s.as_bytes()); }
        Json::Array(arr) => {
            h.write(b"[");
            for item in arr { feed(h, item); }
            h.write(b"]");
        }
        Json::Object(map) => {
            h.write(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                h.write(&(k.len() as u64).to_le_bytes());
                h.write(k.as_bytes());
                if let Some(val) = map.get(k) { feed(h, val); }
            }
            h.write(b"}");
        }
    }
}

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PAUSED: &str = "ReconciliationPaused";
pub const CONDITION_ERROR: &str = "Error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Engine-owned status written back onto the custom resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StatusRecord {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition; the transition time only moves when the status flips.
    pub fn set_condition(&mut self, type_: &str, status: bool, reason: Option<&str>, message: Option<String>, now: &str) {
        let status_s = if status { "True" } else { "False" }.to_string();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                if c.status != status_s { c.last_transition_time = Some(now.to_string()); }
                c.status = status_s;
                c.reason = reason.map(|s| s.to_string());
                c.message = message;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status_s,
                reason: reason.map(|s| s.to_string()),
                message,
                last_transition_time: Some(now.to_string()),
            }),
        }
    }
}

/// Current time in RFC 3339, second precision (Kubernetes `metav1.Time` shape).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
