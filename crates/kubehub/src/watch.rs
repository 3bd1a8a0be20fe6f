use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use krill_core::{ClusterKey, ObjectKind, CLUSTER_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{api_resource, cluster_api_resource};

/// Something happened that may require reconciling a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// The cluster resource was written. Only a higher `generation` than the one a cycle
    /// works on interrupts that cycle; status writes and metadata edits keep the generation.
    Declared { key: ClusterKey, generation: i64 },
    /// An owned object or member pod changed. Worth a cycle, never interrupts one: the engine's
    /// own writes and restarts show up here.
    Changed(ClusterKey),
    /// The declared cluster resource is gone; owned objects are collected by the platform.
    Removed(ClusterKey),
}

impl ClusterEvent {
    pub fn key(&self) -> &ClusterKey {
        match self {
            ClusterEvent::Declared { key, .. } | ClusterEvent::Changed(key) | ClusterEvent::Removed(key) => key,
        }
    }
}

fn cluster_event<K: Resource>(obj: &K, deleted: bool) -> Option<ClusterEvent> {
    let key = ClusterKey::new(obj.namespace()?, obj.name_any());
    Some(if deleted {
        ClusterEvent::Removed(key)
    } else {
        ClusterEvent::Declared { key, generation: obj.meta().generation.unwrap_or(0) }
    })
}

/// Owned objects and member pods map back to their cluster through the cluster label;
/// their deletion is a change (the object must be recreated).
fn owned_event<K: Resource>(obj: &K, _deleted: bool) -> Option<ClusterEvent> {
    let cluster = obj.labels().get(CLUSTER_LABEL)?.clone();
    Some(ClusterEvent::Changed(ClusterKey::new(obj.namespace()?, cluster)))
}

/// Watch cluster resources, every owned kind and member pods; forward events to the driver.
pub fn start_watchers(client: Client, namespace: Option<String>, tx: mpsc::Sender<ClusterEvent>) -> Vec<JoinHandle<()>> {
    let owned = watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY));
    let ns = namespace.as_deref();
    let clusters: Api<DynamicObject> = dynamic_api(client.clone(), ns, &cluster_api_resource());
    let mut tasks = vec![tokio::spawn(pump("clusters", clusters, watcher::Config::default(), cluster_event::<DynamicObject>, tx.clone()))];
    for kind in ObjectKind::ALL {
        let api = dynamic_api(client.clone(), ns, &api_resource(kind));
        tasks.push(tokio::spawn(pump(kind.plural(), api, owned.clone(), owned_event::<DynamicObject>, tx.clone())));
    }
    let pods: Api<Pod> = match ns {
        Some(n) => Api::namespaced(client, n),
        None => Api::all(client),
    };
    tasks.push(tokio::spawn(pump("pods", pods, owned, owned_event::<Pod>, tx)));
    tasks
}

fn dynamic_api(client: Client, ns: Option<&str>, ar: &kube::core::ApiResource) -> Api<DynamicObject> {
    match ns {
        Some(n) => Api::namespaced_with(client, n, ar),
        None => Api::all_with(client, ar),
    }
}

async fn pump<K>(
    what: &'static str,
    api: Api<K>,
    cfg: watcher::Config,
    map: fn(&K, bool) -> Option<ClusterEvent>,
    tx: mpsc::Sender<ClusterEvent>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(source = what, "watcher started");
    while let Some(ev) = stream.next().await {
        let events: Vec<ClusterEvent> = match ev {
            Ok(Event::Applied(o)) => map(&o, false).into_iter().collect(),
            Ok(Event::Deleted(o)) => map(&o, true).into_iter().collect(),
            Ok(Event::Restarted(list)) => {
                debug!(source = what, count = list.len(), "watch restart");
                list.iter().filter_map(|o| map(o, false)).collect()
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64);
                warn!(source = what, error = %e, "watch error; backing off");
                continue;
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                info!(source = what, "driver gone; watcher stopping");
                return;
            }
        }
    }
    warn!(source = what, "watcher stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>()),
            ..Default::default()
        }
    }

    #[test]
    fn owned_objects_map_to_their_cluster() {
        let pod = Pod { metadata: meta("c-kafka-0", &[(CLUSTER_LABEL, "c")]), ..Default::default() };
        assert_eq!(owned_event(&pod, true), Some(ClusterEvent::Changed(ClusterKey::new("ns", "c"))));
        let stray = ConfigMap { metadata: meta("x", &[]), ..Default::default() };
        assert_eq!(owned_event(&stray, false), None);
    }

    #[test]
    fn cluster_deletion_is_removal() {
        let cm = ConfigMap { metadata: meta("c", &[]), ..Default::default() };
        assert_eq!(cluster_event(&cm, true), Some(ClusterEvent::Removed(ClusterKey::new("ns", "c"))));
        assert_eq!(cluster_event(&cm, false).unwrap().key(), &ClusterKey::new("ns", "c"));
    }

    #[test]
    fn cluster_writes_carry_their_generation() {
        let mut m = meta("c", &[]);
        m.generation = Some(7);
        let cm = ConfigMap { metadata: m, ..Default::default() };
        assert_eq!(cluster_event(&cm, false), Some(ClusterEvent::Declared { key: ClusterKey::new("ns", "c"), generation: 7 }));
    }

    #[test]
    fn owned_object_changes_are_wakeups_only() {
        let svc = ConfigMap { metadata: meta("c-kafka-bootstrap", &[(CLUSTER_LABEL, "c")]), ..Default::default() };
        assert!(matches!(owned_event(&svc, false), Some(ClusterEvent::Changed(_))));
    }
}
