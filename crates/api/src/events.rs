use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use krill_core::{ClusterKey, CRD_GROUP, CRD_KIND, CRD_VERSION, MANAGED_BY};
use kube::api::{Api, PostParams};
use kube::Client;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// A user-visible occurrence on a cluster: object applied, member restarted, cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineEvent {
    pub cluster: ClusterKey,
    pub uid: Option<String>,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl EngineEvent {
    pub fn normal(cluster: &ClusterKey, uid: Option<&str>, reason: &str, message: impl Into<String>) -> Self {
        Self { cluster: cluster.clone(), uid: uid.map(|s| s.to_string()), type_: EventType::Normal, reason: reason.into(), message: message.into() }
    }

    pub fn warning(cluster: &ClusterKey, uid: Option<&str>, reason: &str, message: impl Into<String>) -> Self {
        Self { type_: EventType::Warning, ..Self::normal(cluster, uid, reason, message) }
    }
}

/// Where engine events go. Delivery is best effort and never fails a cycle.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: EngineEvent);
}

/// Events as log lines only.
pub struct LogEvents;

#[async_trait]
impl EventSink for LogEvents {
    async fn emit(&self, e: EngineEvent) {
        match e.type_ {
            EventType::Normal => info!(cluster = %e.cluster, reason = %e.reason, "{}", e.message),
            EventType::Warning => warn!(cluster = %e.cluster, reason = %e.reason, "{}", e.message),
        }
    }
}

/// Kubernetes `Event`s attached to the `Kafka` resource, plus the log line.
pub struct KubeEvents {
    client: Client,
}

impl KubeEvents {
    pub fn new(client: Client) -> Self { Self { client } }
}

fn kube_event(e: &EngineEvent) -> Event {
    let now = Time(chrono::Utc::now());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", e.cluster.name)),
            namespace: Some(e.cluster.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(format!("{}/{}", CRD_GROUP, CRD_VERSION)),
            kind: Some(CRD_KIND.into()),
            name: Some(e.cluster.name.clone()),
            namespace: Some(e.cluster.namespace.clone()),
            uid: e.uid.clone(),
            ..Default::default()
        },
        reason: Some(e.reason.clone()),
        message: Some(e.message.clone()),
        type_: Some(e.type_.as_str().into()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        source: Some(EventSource { component: Some(MANAGED_BY.into()), ..Default::default() }),
        reporting_component: Some(MANAGED_BY.into()),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn emit(&self, e: EngineEvent) {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &e.cluster.namespace);
        if let Err(err) = api.create(&PostParams::default(), &kube_event(&e)).await {
            warn!(cluster = %e.cluster, reason = %e.reason, error = %err, "failed to record event");
        }
        LogEvents.emit(e).await;
    }
}

/// Keeps every event in memory; used by offline commands and tests.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl RecordingEvents {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<EngineEvent> { self.events.lock().unwrap_or_else(|e| e.into_inner()).clone() }

    pub fn reasons(&self) -> Vec<String> { self.events().into_iter().map(|e| e.reason).collect() }

    pub fn clear(&self) { self.events.lock().unwrap_or_else(|e| e.into_inner()).clear(); }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, event: EngineEvent) { self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event); }
}
