use std::collections::BTreeMap;

use krill_core::{fingerprint, DesiredObject, Result, Role};
use serde_json::json;

use crate::{
    config_map, data_volume, disruption_budget, env, jvm, property_value, pull_policy, render_properties, resources_json, service,
    stateful_set, BuildContext, RoleBuilder, Workload, CONFIG_HASH_ANNOTATION,
};

pub const CLIENT_PORT: u16 = 2181;
pub const CLUSTERING_PORT: u16 = 2888;
pub const ELECTION_PORT: u16 = 3888;

/// Keys the engine derives itself; user overrides are dropped.
const RESERVED_KEYS: [&str; 4] = ["dataDir", "clientPort", "server.", "4lw.commands.whitelist"];

/// Ensemble members: one StatefulSet plus its services, config and disruption budget.
pub struct ZookeeperBuilder;

impl RoleBuilder for ZookeeperBuilder {
    fn role(&self) -> Role { Role::ZooKeeper }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
        let zk = &ctx.spec.zookeeper.role;
        let nodes = ctx.name("zookeeper-nodes");

        let properties = render_properties(&ensemble_config(ctx, &nodes));
        let config = json!({ "zookeeper.properties": properties });
        let config_hash = fingerprint(&config);

        let image = zk.image.clone().unwrap_or_else(|| ctx.defaults.zookeeper_image.clone());
        let mut container_env = vec![env("ZOOKEEPER_NODE_COUNT", zk.replicas.to_string())];
        for (k, v) in jvm::jvm_env(zk, &ctx.defaults.zookeeper_heap, &ctx.defaults.default_xms)? {
            container_env.push(env(&k, v));
        }

        let mut volumes = vec![json!({ "name": "config", "configMap": { "name": ctx.name("zookeeper-config") } })];
        if let Some(v) = data_volume(&zk.storage) {
            volumes.push(v);
        }
        let template = json!({
            "metadata": {
                "labels": ctx.labels(Role::ZooKeeper),
                "annotations": { CONFIG_HASH_ANNOTATION: config_hash },
            },
            "spec": {
                "containers": [{
                    "name": "zookeeper",
                    "image": image,
                    "imagePullPolicy": pull_policy(zk, &image),
                    "command": ["/opt/kafka/zookeeper_run.sh"],
                    "env": container_env,
                    "ports": [
                        { "name": "clients", "containerPort": CLIENT_PORT },
                        { "name": "clustering", "containerPort": CLUSTERING_PORT },
                        { "name": "election", "containerPort": ELECTION_PORT },
                    ],
                    "readinessProbe": { "tcpSocket": { "port": CLIENT_PORT }, "initialDelaySeconds": 15, "timeoutSeconds": 5 },
                    "livenessProbe": { "tcpSocket": { "port": CLIENT_PORT }, "initialDelaySeconds": 15, "timeoutSeconds": 5 },
                    "resources": resources_json(zk),
                    "volumeMounts": [
                        { "name": "data", "mountPath": "/var/lib/zookeeper" },
                        { "name": "config", "mountPath": "/opt/kafka/custom-config" },
                    ],
                }],
                "volumes": volumes,
            },
        });

        let ports = json!([
            { "name": "tcp-clients", "port": CLIENT_PORT, "targetPort": CLIENT_PORT },
            { "name": "tcp-clustering", "port": CLUSTERING_PORT, "targetPort": CLUSTERING_PORT },
            { "name": "tcp-election", "port": ELECTION_PORT, "targetPort": ELECTION_PORT },
        ]);
        Ok(vec![
            config_map(ctx, Role::ZooKeeper, "zookeeper-config", config),
            service(
                ctx,
                Role::ZooKeeper,
                "zookeeper-nodes",
                json!({ "clusterIP": "None", "publishNotReadyAddresses": true, "selector": ctx.selector(Role::ZooKeeper), "ports": ports }),
            ),
            service(
                ctx,
                Role::ZooKeeper,
                "zookeeper-client",
                json!({
                    "type": "ClusterIP",
                    "selector": ctx.selector(Role::ZooKeeper),
                    "ports": [{ "name": "tcp-clients", "port": CLIENT_PORT, "targetPort": CLIENT_PORT }],
                }),
            ),
            disruption_budget(ctx, Role::ZooKeeper, "zookeeper"),
            stateful_set(
                ctx,
                Workload { role: Role::ZooKeeper, suffix: "zookeeper", service_name: nodes, replicas: zk.replicas, storage: &zk.storage, template },
            )?,
        ])
    }
}

/// Engine defaults, then user keys (minus reserved ones), then the derived membership list.
/// The server list follows the replica count, so scaling the ensemble restarts its members.
fn ensemble_config(ctx: &BuildContext<'_>, nodes: &str) -> BTreeMap<String, String> {
    let zk = &ctx.spec.zookeeper.role;
    let mut props: BTreeMap<String, String> = [
        ("tickTime", "2000"),
        ("initLimit", "5"),
        ("syncLimit", "2"),
        ("autopurge.purgeInterval", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in &zk.config {
        if RESERVED_KEYS.iter().any(|r| k == r || (r.ends_with('.') && k.starts_with(r))) {
            continue;
        }
        props.insert(k.clone(), property_value(v));
    }
    props.insert("dataDir".into(), "/var/lib/zookeeper/data".into());
    props.insert("clientPort".into(), CLIENT_PORT.to_string());
    props.insert("4lw.commands.whitelist".into(), "ruok,stat,mntr".into());
    for i in 0..zk.replicas.max(0) {
        props.insert(
            format!("server.{}", i + 1),
            format!(
                "{}-{}.{}.{}.svc:{}:{}:participant;0.0.0.0:{}",
                ctx.name("zookeeper"),
                i,
                nodes,
                ctx.key().namespace,
                CLUSTERING_PORT,
                ELECTION_PORT,
                CLIENT_PORT
            ),
        );
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, PlatformDefaults};
    use krill_core::ObjectKind;

    #[test]
    fn ensemble_lists_every_member() {
        let spec = fixtures::spec();
        let defaults = PlatformDefaults::default();
        let objs = ZookeeperBuilder.build(&BuildContext { spec: &spec, defaults: &defaults }).unwrap();
        let cm = objs.iter().find(|o| o.id.kind == ObjectKind::ConfigMap).unwrap();
        let props = cm.manifest["data"]["zookeeper.properties"].as_str().unwrap();
        assert!(props.contains("server.1=my-cluster-zookeeper-0.my-cluster-zookeeper-nodes.kafka.svc:2888:3888"));
        assert!(props.contains("server.3=my-cluster-zookeeper-2."));
        assert!(!props.contains("server.4="));
    }

    #[test]
    fn reserved_keys_cannot_be_overridden() {
        let mut spec = fixtures::spec();
        spec.zookeeper.role.config.insert("dataDir".into(), json!("/tmp"));
        spec.zookeeper.role.config.insert("server.9".into(), json!("evil:1:2"));
        spec.zookeeper.role.config.insert("maxClientCnxns".into(), json!(60));
        let defaults = PlatformDefaults::default();
        let ctx = BuildContext { spec: &spec, defaults: &defaults };
        let props = ensemble_config(&ctx, "my-cluster-zookeeper-nodes");
        assert_eq!(props["dataDir"], "/var/lib/zookeeper/data");
        assert!(!props.contains_key("server.9"));
        assert_eq!(props["maxClientCnxns"], "60");
    }

    #[test]
    fn ephemeral_storage_mounts_empty_dir() {
        let spec = fixtures::spec();
        let defaults = PlatformDefaults::default();
        let objs = ZookeeperBuilder.build(&BuildContext { spec: &spec, defaults: &defaults }).unwrap();
        let sts = objs.iter().find(|o| o.id.kind == ObjectKind::StatefulSet).unwrap();
        let volumes = sts.manifest["spec"]["template"]["spec"]["volumes"].as_array().unwrap();
        assert!(volumes.iter().any(|v| v["name"] == "data" && v.get("emptyDir").is_some()));
        assert_eq!(sts.manifest["spec"]["volumeClaimTemplates"], json!([]));
        assert_eq!(sts.manifest["spec"]["serviceName"], "my-cluster-zookeeper-nodes");
    }
}
