//! Krill schema: the declared cluster model read from a `Kafka` custom resource.
//!
//! The admission layer is expected to have checked the document shape; this crate
//! turns it into an immutable [`ClusterSpec`] and enforces the invariants the engine
//! relies on (see [`validate`]).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use krill_core::{ClusterKey, Error, Result, PAUSE_ANNOTATION};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod validate;

pub use validate::{check_storage_transition, validate};

/// Immutable, validated view of one `Kafka` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub key: ClusterKey,
    pub uid: Option<String>,
    pub generation: i64,
    pub paused: bool,
    pub kafka: KafkaSpec,
    pub zookeeper: ZookeeperSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpec {
    kafka: KafkaSpec,
    zookeeper: ZookeeperSpec,
}

/// Settings shared by every member role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,
    pub storage: Storage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_options: Option<JvmOptions>,
    /// Free-form broker/ensemble configuration rendered into the role's ConfigMap.
    #[serde(default)]
    pub config: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSpec {
    #[serde(flatten)]
    pub role: RoleSpec,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperSpec {
    #[serde(flatten)]
    pub role: RoleSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }

    /// Explicit policy wins; otherwise floating `:latest` images are always pulled.
    pub fn resolve(explicit: Option<ImagePullPolicy>, image: &str) -> ImagePullPolicy {
        match explicit {
            Some(p) => p,
            None if image.ends_with(":latest") => ImagePullPolicy::Always,
            None => ImagePullPolicy::IfNotPresent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Storage {
    Ephemeral {
        #[serde(rename = "sizeLimit", default, skip_serializing_if = "Option::is_none")]
        size_limit: Option<String>,
    },
    PersistentClaim {
        size: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        #[serde(rename = "deleteClaim", default)]
        delete_claim: bool,
    },
}

/// Requests/limits as declared; values may be YAML strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub requests: BTreeMap<String, Json>,
    #[serde(default)]
    pub limits: BTreeMap<String, Json>,
}

impl Resources {
    pub fn limit(&self, key: &str) -> Option<String> { self.limits.get(key).and_then(scalar_string) }
    pub fn request(&self, key: &str) -> Option<String> { self.requests.get(key).and_then(scalar_string) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JvmOptions {
    #[serde(rename = "-Xmx", default, skip_serializing_if = "Option::is_none")]
    pub xmx: Option<String>,
    #[serde(rename = "-Xms", default, skip_serializing_if = "Option::is_none")]
    pub xms: Option<String>,
    #[serde(rename = "-server", default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Json>,
    #[serde(rename = "-XX", default)]
    pub xx: BTreeMap<String, Json>,
}

impl JvmOptions {
    /// `-server` accepts a boolean or the string `"true"`.
    pub fn server_enabled(&self) -> bool {
        match &self.server {
            Some(Json::Bool(b)) => *b,
            Some(Json::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(rename = "type", default)]
    pub exposure: Exposure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<ListenerAuth>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Internal,
    Nodeport,
    Loadbalancer,
}

impl Exposure {
    pub fn external(&self) -> bool { !matches!(self, Exposure::Internal) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ListenerAuth {
    Tls,
    ScramSha512,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Authorization {
    Simple {
        #[serde(rename = "superUsers", default)]
        super_users: Vec<String>,
    },
}

impl ClusterSpec {
    /// Read a `Kafka` resource (as JSON) into the cluster model. Shape errors are `InvalidSpec`.
    pub fn from_resource(raw: &Json) -> Result<Self> {
        let meta = raw.get("metadata").ok_or_else(|| Error::invalid_spec("resource missing metadata"))?;
        let name = meta.get("name").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid_spec("resource missing metadata.name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("default");
        let uid = meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string());
        let generation = meta.get("generation").and_then(|v| v.as_i64()).unwrap_or(0);
        let paused = meta
            .get("annotations")
            .and_then(|a| a.get(PAUSE_ANNOTATION))
            .and_then(|v| v.as_str())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let spec = raw.get("spec").ok_or_else(|| Error::invalid_spec("resource missing spec"))?;
        let parsed: ResourceSpec = serde_json::from_value(spec.clone()).map_err(|e| Error::invalid_spec(format!("spec: {}", e)))?;
        Ok(Self {
            key: ClusterKey::new(namespace, name),
            uid,
            generation,
            paused,
            kafka: parsed.kafka,
            zookeeper: parsed.zookeeper,
        })
    }

    /// Parse a YAML manifest (CLI input) and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| Error::invalid_spec(format!("parsing YAML: {}", e)))?;
        let json = serde_json::to_value(val).map_err(|e| Error::invalid_spec(format!("converting YAML to JSON: {}", e)))?;
        let spec = Self::from_resource(&json)?;
        validate(&spec)?;
        Ok(spec)
    }
}

fn scalar_string(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    pub fn kafka_resource() -> serde_json::Value {
        json!({
            "apiVersion": "kafka.krill.io/v1beta1",
            "kind": "Kafka",
            "metadata": {"name": "my-cluster", "namespace": "kafka", "uid": "u-1", "generation": 3},
            "spec": {
                "kafka": {
                    "replicas": 3,
                    "storage": {"type": "persistent-claim", "size": "100Gi", "class": "fast"},
                    "resources": {"limits": {"memory": "16G"}},
                    "listeners": [
                        {"name": "plain", "port": 9092},
                        {"name": "external", "port": 9094, "tls": true, "type": "loadbalancer",
                         "authentication": {"type": "scram-sha-512"}}
                    ],
                    "authorization": {"type": "simple", "superUsers": ["admin"]},
                    "config": {"offsets.topic.replication.factor": 3}
                },
                "zookeeper": {
                    "replicas": 3,
                    "storage": {"type": "ephemeral"}
                }
            }
        })
    }
}
