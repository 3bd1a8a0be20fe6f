use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use krill_core::{
    ClusterKey, CredentialMaterial, Error, Member, ObjectKind, ObjectRef, Result, Role, StatusRecord, CRD_GROUP, CRD_KIND, CRD_PLURAL,
    CRD_VERSION, LEADER_LABEL, POD_FINGERPRINT_ANNOTATION, ROLE_LABEL,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::{pod_index, strip_managed_fields, CredentialProvider, Platform, VersionedStatus};

const FIELD_MANAGER: &str = "krill";
/// Secret an external issuer maintains; only its public certificate is republished.
const CA_SOURCE_SUFFIX: &str = "cluster-ca";
const CA_CERT_KEY: &str = "ca.crt";

pub fn api_resource(kind: ObjectKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind()), kind.plural())
}

pub fn cluster_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(CRD_GROUP, CRD_VERSION, CRD_KIND), CRD_PLURAL)
}

/// Map a client error onto the engine taxonomy.
pub fn classify(e: kube::Error) -> Error {
    counter!("platform_errors_total", 1u64);
    match e {
        kube::Error::Api(ae) => match ae.code {
            409 => Error::conflict(ae.message),
            401 | 403 => Error::permission(ae.message),
            400 | 422 => Error::invalid_spec(format!("rejected by platform: {}", ae.message)),
            _ => Error::transient(format!("{} ({})", ae.message, ae.code)),
        },
        other => Error::transient(other.to_string()),
    }
}

fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == 404) }

/// kube-rs backed platform. One client is shared by every cluster worker.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    pub fn client(&self) -> Client { self.client.clone() }

    fn api(&self, kind: ObjectKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    fn clusters(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &cluster_api_resource())
    }
}

fn to_dynamic(manifest: &Json) -> Result<DynamicObject> {
    serde_json::from_value(manifest.clone()).map_err(|e| Error::invalid_spec(format!("manifest is not a valid object: {}", e)))
}

fn post_params() -> PostParams { PostParams { field_manager: Some(FIELD_MANAGER.into()), ..Default::default() } }

pub(crate) fn member_from_pod(pod: &Pod) -> Option<Member> {
    let meta = &pod.metadata;
    let name = meta.name.clone()?;
    let index = pod_index(&name)?;
    let terminating = meta.deletion_timestamp.is_some();
    let ready = !terminating
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
    Some(Member {
        index,
        pod: name,
        uid: meta.uid.clone().unwrap_or_default(),
        ready,
        pod_fingerprint: meta.annotations.as_ref().and_then(|a| a.get(POD_FINGERPRINT_ANNOTATION)).cloned(),
        leader: meta.labels.as_ref().and_then(|l| l.get(LEADER_LABEL)).map(|v| v == "true").unwrap_or(false),
    })
}

#[async_trait]
impl Platform for KubePlatform {
    async fn list_clusters(&self, namespace: Option<&str>) -> Result<Vec<ClusterKey>> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => self.clusters(ns),
            None => Api::all_with(self.client.clone(), &cluster_api_resource()),
        };
        let list = api.list(&ListParams::default()).await.map_err(classify)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|o| Some(ClusterKey::new(o.metadata.namespace?, o.metadata.name?)))
            .collect())
    }

    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Json>> {
        let obj = self.clusters(&key.namespace).get_opt(&key.name).await.map_err(classify)?;
        obj.map(|o| serde_json::to_value(o).map_err(|e| Error::transient(format!("encoding {}: {}", key, e)))).transpose()
    }

    async fn list_owned(&self, cluster: &ClusterKey, kind: ObjectKind) -> Result<Vec<Json>> {
        let lp = ListParams::default().labels(&cluster.selector());
        let list = self.api(kind, &cluster.namespace).list(&lp).await.map_err(classify)?;
        let mut out = Vec::with_capacity(list.items.len());
        for o in list.items {
            let mut raw = serde_json::to_value(&o).map_err(|e| Error::transient(e.to_string()))?;
            strip_managed_fields(&mut raw);
            out.push(raw);
        }
        debug!(cluster = %cluster, kind = kind.kind(), count = out.len(), "listed owned objects");
        Ok(out)
    }

    async fn create(&self, id: &ObjectRef, manifest: &Json) -> Result<String> {
        let obj = to_dynamic(manifest)?;
        let created = self.api(id.kind, &id.namespace).create(&post_params(), &obj).await.map_err(classify)?;
        Ok(created.metadata.resource_version.unwrap_or_default())
    }

    async fn replace(&self, id: &ObjectRef, manifest: &Json, revision: &str) -> Result<String> {
        let mut obj = to_dynamic(manifest)?;
        obj.metadata.resource_version = Some(revision.to_string());
        match self.api(id.kind, &id.namespace).replace(&id.name, &post_params(), &obj).await {
            Ok(o) => Ok(o.metadata.resource_version.unwrap_or_default()),
            // vanished since the read: re-read and re-plan
            Err(e) if is_not_found(&e) => Err(Error::conflict(format!("{} disappeared before update", id))),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete(&self, id: &ObjectRef, orphan: bool) -> Result<()> {
        let dp = DeleteParams {
            propagation_policy: Some(if orphan { PropagationPolicy::Orphan } else { PropagationPolicy::Background }),
            ..Default::default()
        };
        match self.api(id.kind, &id.namespace).delete(&id.name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_members(&self, cluster: &ClusterKey, role: Role) -> Result<Vec<Member>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let lp = ListParams::default().labels(&format!("{},{}={}", cluster.selector(), ROLE_LABEL, role.as_str()));
        let pods = api.list(&lp).await.map_err(classify)?;
        let mut members: Vec<Member> = pods.items.iter().filter_map(member_from_pod).collect();
        members.sort_by_key(|m| m.index);
        Ok(members)
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(pod, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn get_status(&self, key: &ClusterKey) -> Result<Option<VersionedStatus>> {
        let Some(obj) = self.clusters(&key.namespace).get_opt(&key.name).await.map_err(classify)? else { return Ok(None) };
        let revision = obj.metadata.resource_version.clone().unwrap_or_default();
        let status = match obj.data.get("status") {
            Some(s) if !s.is_null() => serde_json::from_value(s.clone()).unwrap_or_else(|e| {
                warn!(cluster = %key, error = %e, "unreadable status; starting from empty");
                StatusRecord::default()
            }),
            _ => StatusRecord::default(),
        };
        Ok(Some(VersionedStatus { status, revision }))
    }

    async fn write_status(&self, key: &ClusterKey, status: &StatusRecord, revision: &str) -> Result<()> {
        let body = json!({
            "apiVersion": format!("{}/{}", CRD_GROUP, CRD_VERSION),
            "kind": CRD_KIND,
            "metadata": { "name": key.name, "namespace": key.namespace, "resourceVersion": revision },
            "status": status,
        });
        let data = serde_json::to_vec(&body).map_err(|e| Error::transient(e.to_string()))?;
        self.clusters(&key.namespace).replace_status(&key.name, &post_params(), data).await.map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for KubePlatform {
    async fn cluster_ca(&self, cluster: &ClusterKey) -> Result<Option<CredentialMaterial>> {
        let name = format!("{}-{}", cluster.name, CA_SOURCE_SUFFIX);
        let Some(secret) = self.api(ObjectKind::Secret, &cluster.namespace).get_opt(&name).await.map_err(classify)? else {
            return Ok(None);
        };
        let cert = secret.data.get("data").and_then(|d| d.get(CA_CERT_KEY)).and_then(|v| v.as_str());
        Ok(cert.map(|c| CredentialMaterial { data: [(CA_CERT_KEY.to_string(), c.to_string())].into_iter().collect() }))
    }
}
