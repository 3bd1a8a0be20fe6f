//! Krill desired-state builder.
//!
//! Pure function of a validated [`ClusterSpec`] and the operator's [`PlatformDefaults`]:
//! the same inputs always produce byte-identical manifests and fingerprints, so an
//! unchanged spec never shows up as drift. Each member role contributes its objects
//! through a [`RoleBuilder`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use krill_core::{
    fingerprint, ClusterKey, CredentialMaterial, DesiredObject, Error, ObjectKind, ObjectRef, Result, Role, CLUSTER_LABEL, CRD_GROUP, CRD_KIND,
    CRD_VERSION, GROUP_METADATA, GROUP_POD_TEMPLATE, GROUP_REPLICAS, GROUP_SPEC, GROUP_STORAGE, MANAGED_BY, MANAGED_BY_LABEL,
    POD_FINGERPRINT_ANNOTATION, ROLE_LABEL, STORAGE_ANNOTATION,
};
use krill_schema::{ClusterSpec, ImagePullPolicy, RoleSpec, Storage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

mod credentials;
pub mod jvm;
mod kafka;
mod zookeeper;

pub use credentials::{CredentialsBuilder, CA_SECRET_SUFFIX};
pub use jvm::HeapPolicy;
pub use kafka::KafkaBuilder;
pub use zookeeper::ZookeeperBuilder;

/// Pod-template annotation carrying the hash of the role's rendered configuration.
pub const CONFIG_HASH_ANNOTATION: &str = "krill.io/config-hash";
/// Pod-template annotation carrying the hash of the cluster CA material mounted into brokers.
pub const CA_HASH_ANNOTATION: &str = "krill.io/ca-hash";

/// Operator-wide defaults that are not part of any one cluster declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformDefaults {
    pub kafka_image: String,
    pub zookeeper_image: String,
    pub kafka_heap: HeapPolicy,
    pub zookeeper_heap: HeapPolicy,
    /// Initial heap used when a role declares neither heap bounds nor a memory limit.
    pub default_xms: String,
    /// Cluster CA material fetched from the credential provider for this cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ca: Option<CredentialMaterial>,
}

impl Default for PlatformDefaults {
    fn default() -> Self {
        Self {
            kafka_image: "quay.io/krill/kafka:3.6.0".into(),
            zookeeper_image: "quay.io/krill/kafka:3.6.0".into(),
            kafka_heap: HeapPolicy { fraction: 0.5, max_bytes: 5_000_000_000 },
            zookeeper_heap: HeapPolicy { fraction: 0.75, max_bytes: 2_000_000_000 },
            default_xms: "128M".into(),
            cluster_ca: None,
        }
    }
}

impl PlatformDefaults {
    pub fn with_cluster_ca(&self, ca: Option<CredentialMaterial>) -> Self {
        Self { cluster_ca: ca, ..self.clone() }
    }
}

/// Inputs shared by every role builder.
pub struct BuildContext<'a> {
    pub spec: &'a ClusterSpec,
    pub defaults: &'a PlatformDefaults,
}

impl BuildContext<'_> {
    pub fn key(&self) -> &ClusterKey { &self.spec.key }

    pub fn name(&self, suffix: &str) -> String { format!("{}-{}", self.spec.key.name, suffix) }

    pub fn object_ref(&self, kind: ObjectKind, suffix: &str) -> ObjectRef {
        ObjectRef::new(kind, self.spec.key.namespace.clone(), self.name(suffix))
    }

    /// Ownership labels; the role label is omitted for cluster-wide artifacts.
    pub fn labels(&self, role: Role) -> Json {
        let mut m = Map::new();
        m.insert(MANAGED_BY_LABEL.into(), json!(MANAGED_BY));
        m.insert(CLUSTER_LABEL.into(), json!(self.spec.key.name));
        if role != Role::Cluster {
            m.insert(ROLE_LABEL.into(), json!(role.as_str()));
        }
        Json::Object(m)
    }

    /// Pod selector for a role's workload.
    pub fn selector(&self, role: Role) -> Json {
        json!({ CLUSTER_LABEL: self.spec.key.name, ROLE_LABEL: role.as_str() })
    }

    /// `metadata` block with labels and, when the resource uid is known, the owner reference.
    pub fn metadata(&self, name: &str, role: Role) -> Json {
        let mut meta = json!({
            "name": name,
            "namespace": self.spec.key.namespace,
            "labels": self.labels(role),
        });
        if let Some(uid) = &self.spec.uid {
            meta["ownerReferences"] = json!([{
                "apiVersion": format!("{}/{}", CRD_GROUP, CRD_VERSION),
                "kind": CRD_KIND,
                "name": self.spec.key.name,
                "uid": uid,
                "controller": true,
                "blockOwnerDeletion": false,
            }]);
        }
        meta
    }
}

/// Contributes the objects of one member role.
pub trait RoleBuilder {
    fn role(&self) -> Role;
    fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>>;
}

/// Build the complete desired object set of a cluster, ordered by identity.
pub fn build(spec: &ClusterSpec, defaults: &PlatformDefaults) -> Result<Vec<DesiredObject>> {
    let ctx = BuildContext { spec, defaults };
    let builders: [&dyn RoleBuilder; 3] = [&CredentialsBuilder, &ZookeeperBuilder, &KafkaBuilder];
    let mut out = Vec::new();
    for b in builders {
        let objs = b.build(&ctx)?;
        debug!(cluster = %spec.key, role = %b.role(), objects = objs.len(), "role built");
        out.extend(objs);
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(w) = out.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(Error::invalid_spec(format!("two desired objects share identity {}", w[0].id)));
    }
    Ok(out)
}

/// Render `key=value` lines in key order.
pub(crate) fn render_properties(props: &BTreeMap<String, String>) -> String {
    let mut s = String::new();
    for (k, v) in props {
        s.push_str(k);
        s.push('=');
        s.push_str(v);
        s.push('\n');
    }
    s
}

/// User config values are scalars; render them the way they would appear in a properties file.
pub(crate) fn property_value(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn env(name: &str, value: impl Into<String>) -> Json {
    json!({ "name": name, "value": value.into() })
}

pub(crate) fn resources_json(role: &RoleSpec) -> Json {
    match &role.resources {
        Some(r) => {
            let mut out = Map::new();
            if !r.requests.is_empty() {
                out.insert("requests".into(), serde_json::to_value(&r.requests).unwrap_or(Json::Null));
            }
            if !r.limits.is_empty() {
                out.insert("limits".into(), serde_json::to_value(&r.limits).unwrap_or(Json::Null));
            }
            Json::Object(out)
        }
        None => json!({}),
    }
}

pub(crate) fn pull_policy(role: &RoleSpec, image: &str) -> &'static str {
    ImagePullPolicy::resolve(role.image_pull_policy, image).as_str()
}

/// Data volume for ephemeral storage; persistent storage is provided by a claim template instead.
pub(crate) fn data_volume(storage: &Storage) -> Option<Json> {
    match storage {
        Storage::Ephemeral { size_limit } => {
            let mut empty_dir = Map::new();
            if let Some(limit) = size_limit.as_deref().filter(|l| !l.is_empty()) {
                empty_dir.insert("sizeLimit".into(), json!(limit));
            }
            Some(json!({ "name": "data", "emptyDir": Json::Object(empty_dir) }))
        }
        Storage::PersistentClaim { .. } => None,
    }
}

pub(crate) fn claim_templates(ctx: &BuildContext<'_>, role: Role, storage: &Storage) -> Json {
    match storage {
        Storage::PersistentClaim { size, class, .. } => {
            let mut spec = json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": size } },
            });
            if let Some(c) = class {
                spec["storageClassName"] = json!(c);
            }
            json!([{ "metadata": { "name": "data", "labels": ctx.labels(role) }, "spec": spec }])
        }
        Storage::Ephemeral { .. } => json!([]),
    }
}

/// Workload shape shared by both quorum-bearing roles.
pub(crate) struct Workload<'a> {
    pub role: Role,
    pub suffix: &'a str,
    pub service_name: String,
    pub replicas: i32,
    pub storage: &'a Storage,
    /// Pod template without the pod fingerprint annotation.
    pub template: Json,
}

/// Seal a StatefulSet: stamp the pod fingerprint into the template and hash each field group.
pub(crate) fn stateful_set(ctx: &BuildContext<'_>, w: Workload<'_>) -> Result<DesiredObject> {
    if w.replicas < 1 {
        return Err(Error::invalid_spec(format!("{} replicas must be at least 1", w.role)));
    }
    let mut template = w.template;
    let pod_fp = fingerprint(&template);
    template["metadata"]["annotations"][POD_FINGERPRINT_ANNOTATION] = json!(pod_fp);

    let name = ctx.name(w.suffix);
    let mut metadata = ctx.metadata(&name, w.role);
    let storage_decl = serde_json::to_string(w.storage).map_err(|e| Error::invalid_spec(format!("encoding storage: {}", e)))?;
    metadata["annotations"] = json!({ STORAGE_ANNOTATION: storage_decl });

    let claims = claim_templates(ctx, w.role, w.storage);
    let spec_core = json!({
        "serviceName": w.service_name,
        "selector": { "matchLabels": ctx.selector(w.role) },
        "podManagementPolicy": "Parallel",
        "updateStrategy": { "type": "OnDelete" },
    });
    let mut spec = spec_core.clone();
    spec["replicas"] = json!(w.replicas);
    spec["template"] = template.clone();
    spec["volumeClaimTemplates"] = claims.clone();

    let manifest = json!({
        "apiVersion": ObjectKind::StatefulSet.api_version(),
        "kind": ObjectKind::StatefulSet.kind(),
        "metadata": metadata,
        "spec": spec,
    });
    // the storage annotation rides with metadata: toggling deleteClaim rewrites it in place
    let meta_group = json!({ "labels": ctx.labels(w.role), "storage": storage_decl });
    let replicas = json!(w.replicas);
    let storage_group = json!({ "claims": claims });
    Ok(DesiredObject::seal(
        ctx.object_ref(ObjectKind::StatefulSet, w.suffix),
        w.role,
        manifest,
        vec![
            (GROUP_METADATA, &meta_group),
            (GROUP_SPEC, &spec_core),
            (GROUP_REPLICAS, &replicas),
            (GROUP_POD_TEMPLATE, &template),
            (GROUP_STORAGE, &storage_group),
        ],
        Some(pod_fp),
    ))
}

/// Seal a Service with the given spec body.
pub(crate) fn service(ctx: &BuildContext<'_>, role: Role, suffix: &str, spec: Json) -> DesiredObject {
    let name = ctx.name(suffix);
    let manifest = json!({
        "apiVersion": ObjectKind::Service.api_version(),
        "kind": ObjectKind::Service.kind(),
        "metadata": ctx.metadata(&name, role),
        "spec": spec,
    });
    let labels = ctx.labels(role);
    DesiredObject::seal(ctx.object_ref(ObjectKind::Service, suffix), role, manifest, vec![(GROUP_METADATA, &labels), (GROUP_SPEC, &spec)], None)
}

pub(crate) fn config_map(ctx: &BuildContext<'_>, role: Role, suffix: &str, data: Json) -> DesiredObject {
    let name = ctx.name(suffix);
    let manifest = json!({
        "apiVersion": ObjectKind::ConfigMap.api_version(),
        "kind": ObjectKind::ConfigMap.kind(),
        "metadata": ctx.metadata(&name, role),
        "data": data,
    });
    let labels = ctx.labels(role);
    DesiredObject::seal(
        ctx.object_ref(ObjectKind::ConfigMap, suffix),
        role,
        manifest,
        vec![(GROUP_METADATA, &labels), (krill_core::GROUP_DATA, &data)],
        None,
    )
}

/// At most one member of a role may be voluntarily disrupted at a time.
pub(crate) fn disruption_budget(ctx: &BuildContext<'_>, role: Role, suffix: &str) -> DesiredObject {
    let name = ctx.name(suffix);
    let spec = json!({ "maxUnavailable": 1, "selector": { "matchLabels": ctx.selector(role) } });
    let manifest = json!({
        "apiVersion": ObjectKind::PodDisruptionBudget.api_version(),
        "kind": ObjectKind::PodDisruptionBudget.kind(),
        "metadata": ctx.metadata(&name, role),
        "spec": spec,
    });
    let labels = ctx.labels(role);
    DesiredObject::seal(
        ctx.object_ref(ObjectKind::PodDisruptionBudget, suffix),
        role,
        manifest,
        vec![(GROUP_METADATA, &labels), (GROUP_SPEC, &spec)],
        None,
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use krill_core::GROUP_DATA;

    fn names(objs: &[DesiredObject]) -> Vec<String> { objs.iter().map(|o| o.id.to_string()).collect() }

    #[test]
    fn build_is_deterministic() {
        let spec = fixtures::spec();
        let a = build(&spec, &PlatformDefaults::default()).unwrap();
        let b = build(&spec, &PlatformDefaults::default()).unwrap();
        assert_eq!(names(&a), names(&b));
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.fingerprint, y.fingerprint, "{}", x.id);
            assert_eq!(serde_json::to_string(&x.manifest).unwrap(), serde_json::to_string(&y.manifest).unwrap());
        }
    }

    #[test]
    fn builds_expected_object_set() {
        let objs = build(&fixtures::spec(), &PlatformDefaults::default()).unwrap();
        let got = names(&objs);
        for want in [
            "StatefulSet/kafka/my-cluster-kafka",
            "StatefulSet/kafka/my-cluster-zookeeper",
            "Service/kafka/my-cluster-kafka-bootstrap",
            "Service/kafka/my-cluster-kafka-brokers",
            "Service/kafka/my-cluster-kafka-external-bootstrap",
            "Service/kafka/my-cluster-zookeeper-client",
            "Service/kafka/my-cluster-zookeeper-nodes",
            "ConfigMap/kafka/my-cluster-kafka-config",
            "ConfigMap/kafka/my-cluster-zookeeper-config",
            "PodDisruptionBudget/kafka/my-cluster-kafka",
            "PodDisruptionBudget/kafka/my-cluster-zookeeper",
        ] {
            assert!(got.iter().any(|g| g == want), "missing {} in {:?}", want, got);
        }
        // no CA material yet: no secret
        assert!(!got.iter().any(|g| g.starts_with("Secret/")));
        for o in &objs {
            assert_eq!(o.manifest["metadata"]["ownerReferences"][0]["uid"], "u-1");
            assert!(o.id.name.starts_with("my-cluster-"));
        }
    }

    #[test]
    fn workloads_use_on_delete_and_carry_pod_fingerprint() {
        let objs = build(&fixtures::spec(), &PlatformDefaults::default()).unwrap();
        let sts: Vec<_> = objs.iter().filter(|o| o.id.kind == ObjectKind::StatefulSet).collect();
        assert_eq!(sts.len(), 2);
        for s in sts {
            assert_eq!(s.manifest["spec"]["updateStrategy"]["type"], "OnDelete");
            let annotated = s.manifest["spec"]["template"]["metadata"]["annotations"][POD_FINGERPRINT_ANNOTATION].as_str().unwrap();
            assert_eq!(Some(annotated), s.pod_fingerprint.as_deref());
            assert!(s.manifest["metadata"]["annotations"][STORAGE_ANNOTATION].is_string());
            assert!(s.field_hashes.contains_key(GROUP_POD_TEMPLATE));
        }
    }

    #[test]
    fn replica_change_only_touches_replicas_group() {
        let spec = fixtures::spec();
        let mut scaled = spec.clone();
        scaled.kafka.role.replicas = 5;
        let find = |objs: &[DesiredObject]| objs.iter().find(|o| o.id.name == "my-cluster-kafka" && o.id.kind == ObjectKind::StatefulSet).cloned().unwrap();
        let a = find(&build(&spec, &PlatformDefaults::default()).unwrap());
        let b = find(&build(&scaled, &PlatformDefaults::default()).unwrap());
        assert_ne!(a.field_hashes[GROUP_REPLICAS], b.field_hashes[GROUP_REPLICAS]);
        assert_eq!(a.field_hashes[GROUP_POD_TEMPLATE], b.field_hashes[GROUP_POD_TEMPLATE]);
        assert_eq!(a.pod_fingerprint, b.pod_fingerprint);
    }

    #[test]
    fn delete_claim_toggle_is_a_metadata_change() {
        let spec = fixtures::spec();
        let mut toggled = spec.clone();
        if let Storage::PersistentClaim { delete_claim, .. } = &mut toggled.kafka.role.storage {
            *delete_claim = !*delete_claim;
        }
        let find = |objs: &[DesiredObject]| objs.iter().find(|o| o.id.name == "my-cluster-kafka" && o.id.kind == ObjectKind::StatefulSet).cloned().unwrap();
        let a = find(&build(&spec, &PlatformDefaults::default()).unwrap());
        let b = find(&build(&toggled, &PlatformDefaults::default()).unwrap());
        assert_ne!(a.field_hashes[GROUP_METADATA], b.field_hashes[GROUP_METADATA]);
        assert_eq!(a.field_hashes[GROUP_STORAGE], b.field_hashes[GROUP_STORAGE]);
        assert_eq!(a.pod_fingerprint, b.pod_fingerprint);
        assert!(ObjectKind::StatefulSet.disruptive_groups().iter().all(|g| a.field_hashes[*g] == b.field_hashes[*g]));
    }

    #[test]
    fn config_change_rolls_pods_through_config_hash() {
        let spec = fixtures::spec();
        let mut changed = spec.clone();
        changed.kafka.role.config.insert("num.partitions".into(), json!(6));
        let a = build(&spec, &PlatformDefaults::default()).unwrap();
        let b = build(&changed, &PlatformDefaults::default()).unwrap();
        let get = |objs: &[DesiredObject], kind, name: &str| objs.iter().find(|o| o.id.kind == kind && o.id.name == name).cloned().unwrap();
        assert_ne!(
            get(&a, ObjectKind::ConfigMap, "my-cluster-kafka-config").field_hashes[GROUP_DATA],
            get(&b, ObjectKind::ConfigMap, "my-cluster-kafka-config").field_hashes[GROUP_DATA]
        );
        assert_ne!(
            get(&a, ObjectKind::StatefulSet, "my-cluster-kafka").pod_fingerprint,
            get(&b, ObjectKind::StatefulSet, "my-cluster-kafka").pod_fingerprint
        );
        assert_eq!(
            get(&a, ObjectKind::StatefulSet, "my-cluster-zookeeper").pod_fingerprint,
            get(&b, ObjectKind::StatefulSet, "my-cluster-zookeeper").pod_fingerprint
        );
    }

    #[test]
    fn ca_material_adds_secret_and_rolls_brokers() {
        let spec = fixtures::spec();
        let mut ca = CredentialMaterial::default();
        ca.data.insert("ca.crt".into(), "Zm9v".into());
        let with = build(&spec, &PlatformDefaults::default().with_cluster_ca(Some(ca))).unwrap();
        let without = build(&spec, &PlatformDefaults::default()).unwrap();
        let secret = with.iter().find(|o| o.id.kind == ObjectKind::Secret).unwrap();
        assert_eq!(secret.id.name, "my-cluster-cluster-ca-cert");
        assert_eq!(secret.role, Role::Cluster);
        assert_eq!(secret.manifest["data"]["ca.crt"], "Zm9v");
        let pod = |objs: &[DesiredObject]| objs.iter().find(|o| o.id.name == "my-cluster-kafka" && o.id.kind == ObjectKind::StatefulSet).unwrap().pod_fingerprint.clone();
        assert_ne!(pod(&with), pod(&without));
    }

    #[test]
    fn ephemeral_size_limit_empty_means_unbounded() {
        assert_eq!(data_volume(&Storage::Ephemeral { size_limit: Some(String::new()) }).unwrap()["emptyDir"], json!({}));
        assert_eq!(data_volume(&Storage::Ephemeral { size_limit: None }).unwrap()["emptyDir"], json!({}));
        assert_eq!(data_volume(&Storage::Ephemeral { size_limit: Some("1Gi".into()) }).unwrap()["emptyDir"]["sizeLimit"], "1Gi");
    }

    #[test]
    fn rejects_zero_replicas_without_validation() {
        let mut spec = fixtures::spec();
        spec.zookeeper.role.replicas = 0;
        assert!(matches!(build(&spec, &PlatformDefaults::default()), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn owner_reference_omitted_without_uid() {
        let mut spec = fixtures::spec();
        spec.uid = None;
        let objs = build(&spec, &PlatformDefaults::default()).unwrap();
        assert!(objs.iter().all(|o| o.manifest["metadata"].get("ownerReferences").is_none()));
    }
}
