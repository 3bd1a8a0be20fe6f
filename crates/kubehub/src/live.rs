use std::collections::BTreeMap;

use futures::future::try_join_all;
use krill_core::{ClusterKey, LiveObject, Member, ObjectKind, ObjectRef, Result, Role};
use tracing::{debug, warn};

use crate::Platform;

/// Snapshot of what exists on the platform for one cluster.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    /// Every object carrying the cluster's ownership labels, owned-and-exclusive or not.
    pub objects: BTreeMap<ObjectRef, LiveObject>,
    pub members: BTreeMap<Role, Vec<Member>>,
}

impl LiveState {
    pub fn get(&self, id: &ObjectRef) -> Option<&LiveObject> { self.objects.get(id) }

    pub fn members(&self, role: Role) -> &[Member] { self.members.get(&role).map(|v| v.as_slice()).unwrap_or(&[]) }
}

/// Read the live state of a cluster. Any read failure fails the whole snapshot: a partial view
/// could make missing objects look deletable or absent.
pub async fn read_live(platform: &dyn Platform, cluster: &ClusterKey) -> Result<LiveState> {
    let lists = try_join_all(ObjectKind::ALL.iter().map(|k| async move { platform.list_owned(cluster, *k).await.map(|v| (*k, v)) })).await?;
    let mut state = LiveState::default();
    for (kind, raws) in lists {
        for raw in raws {
            match LiveObject::from_manifest(kind, &raw) {
                Some(obj) => {
                    state.objects.insert(obj.id.clone(), obj);
                }
                None => warn!(cluster = %cluster, kind = kind.kind(), "skipping unnamed object"),
            }
        }
    }
    for role in [Role::ZooKeeper, Role::Kafka] {
        state.members.insert(role, platform.list_members(cluster, role).await?);
    }
    debug!(cluster = %cluster, objects = state.objects.len(), "live state read");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryPlatform, Op};
    use krill_core::{Error, CLUSTER_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
    use serde_json::json;

    #[tokio::test]
    async fn reads_only_labelled_objects() {
        let p = MemoryPlatform::new();
        let key = ClusterKey::new("ns", "c");
        let mine = ObjectRef::new(ObjectKind::ConfigMap, "ns", "c-kafka-config");
        let foreign = ObjectRef::new(ObjectKind::ConfigMap, "ns", "c-user-config");
        p.seed_object(&mine, json!({"metadata": {"name": "c-kafka-config", "namespace": "ns",
            "labels": {MANAGED_BY_LABEL: MANAGED_BY, CLUSTER_LABEL: "c"}}}));
        p.seed_object(&foreign, json!({"metadata": {"name": "c-user-config", "namespace": "ns"}}));
        let live = read_live(&p, &key).await.unwrap();
        assert!(live.get(&mine).is_some());
        assert!(live.get(&foreign).is_none());
        assert!(live.members(Role::Kafka).is_empty());
    }

    #[tokio::test]
    async fn any_failed_list_fails_the_read() {
        let p = MemoryPlatform::new();
        p.fail(Op::List, Some("Secret"), Error::permission("secrets forbidden"), 1);
        let e = read_live(&p, &ClusterKey::new("ns", "c")).await.unwrap_err();
        assert!(matches!(e, Error::Permission(_)));
    }
}
