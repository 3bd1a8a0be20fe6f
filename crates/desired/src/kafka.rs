use std::collections::BTreeMap;

use krill_core::{fingerprint, DesiredObject, Result, Role};
use krill_schema::{Authorization, Exposure, Listener, ListenerAuth};
use serde_json::{json, Value as Json};

use crate::{
    config_map, credentials, data_volume, disruption_budget, env, jvm, property_value, pull_policy, render_properties, resources_json,
    service, stateful_set, zookeeper, BuildContext, RoleBuilder, Workload, CA_HASH_ANNOTATION, CONFIG_HASH_ANNOTATION,
};

/// Inter-broker replication listener; always present, never user-declared.
pub const REPLICATION_PORT: u16 = 9091;
const REPLICATION_LISTENER: &str = "REPLICATION-9091";

/// Broker settings the engine derives; user config cannot override them.
const FORBIDDEN_PREFIXES: [&str; 8] = [
    "listeners",
    "advertised.",
    "broker.",
    "listener.",
    "host.name",
    "port",
    "inter.broker.listener.name",
    "zookeeper.connect",
];

/// Brokers: StatefulSet, bootstrap/headless/external services, config and disruption budget.
pub struct KafkaBuilder;

impl RoleBuilder for KafkaBuilder {
    fn role(&self) -> Role { Role::Kafka }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
        let kafka = &ctx.spec.kafka;
        let role = &kafka.role;
        let brokers = ctx.name("kafka-brokers");

        let config = json!({ "server.properties": render_properties(&broker_config(ctx)) });
        let config_hash = fingerprint(&config);

        let image = role.image.clone().unwrap_or_else(|| ctx.defaults.kafka_image.clone());
        let mut container_env = vec![env("KAFKA_LISTENERS", listener_names(&kafka.listeners))];
        for (k, v) in jvm::jvm_env(role, &ctx.defaults.kafka_heap, &ctx.defaults.default_xms)? {
            container_env.push(env(&k, v));
        }

        let mut ports = vec![json!({ "name": "tcp-replication", "containerPort": REPLICATION_PORT })];
        for l in &kafka.listeners {
            ports.push(json!({ "name": format!("tcp-{}", l.name), "containerPort": l.port }));
        }

        let mut annotations = json!({ CONFIG_HASH_ANNOTATION: config_hash });
        let mut volumes = vec![json!({ "name": "config", "configMap": { "name": ctx.name("kafka-config") } })];
        let mut mounts = vec![
            json!({ "name": "data", "mountPath": "/var/lib/kafka/data" }),
            json!({ "name": "config", "mountPath": "/opt/kafka/custom-config" }),
        ];
        if let Some(v) = data_volume(&role.storage) {
            volumes.push(v);
        }
        if let Some(ca) = &ctx.defaults.cluster_ca {
            annotations[CA_HASH_ANNOTATION] = json!(ca.fingerprint());
            volumes.push(json!({ "name": "cluster-ca", "secret": { "secretName": ctx.name(credentials::CA_SECRET_SUFFIX) } }));
            mounts.push(json!({ "name": "cluster-ca", "mountPath": "/opt/kafka/cluster-ca-certs", "readOnly": true }));
        }

        let template = json!({
            "metadata": { "labels": ctx.labels(Role::Kafka), "annotations": annotations },
            "spec": {
                "containers": [{
                    "name": "kafka",
                    "image": image,
                    "imagePullPolicy": pull_policy(role, &image),
                    "command": ["/opt/kafka/kafka_run.sh"],
                    "env": container_env,
                    "ports": ports,
                    "readinessProbe": { "tcpSocket": { "port": REPLICATION_PORT }, "initialDelaySeconds": 15, "timeoutSeconds": 5 },
                    "livenessProbe": { "tcpSocket": { "port": REPLICATION_PORT }, "initialDelaySeconds": 15, "timeoutSeconds": 5 },
                    "resources": resources_json(role),
                    "volumeMounts": mounts,
                }],
                "volumes": volumes,
            },
        });

        let mut objs = vec![
            config_map(ctx, Role::Kafka, "kafka-config", config),
            service(ctx, Role::Kafka, "kafka-bootstrap", bootstrap_spec(ctx, &kafka.listeners)),
            service(ctx, Role::Kafka, "kafka-brokers", headless_spec(ctx, &kafka.listeners)),
            disruption_budget(ctx, Role::Kafka, "kafka"),
        ];
        for l in kafka.listeners.iter().filter(|l| l.exposure.external()) {
            let suffix = format!("kafka-{}-bootstrap", l.name);
            objs.push(service(ctx, Role::Kafka, &suffix, external_spec(ctx, l)));
        }
        objs.push(stateful_set(
            ctx,
            Workload { role: Role::Kafka, suffix: "kafka", service_name: brokers, replicas: role.replicas, storage: &role.storage, template },
        )?);
        Ok(objs)
    }
}

fn listener_names(listeners: &[Listener]) -> String {
    listeners.iter().map(|l| l.name.as_str()).collect::<Vec<_>>().join(" ")
}

pub(crate) fn listener_id(l: &Listener) -> String { format!("{}-{}", l.name.to_uppercase(), l.port) }

fn security_protocol(l: &Listener) -> &'static str {
    match (l.tls, l.authentication) {
        (true, Some(ListenerAuth::ScramSha512)) => "SASL_SSL",
        (false, Some(ListenerAuth::ScramSha512)) => "SASL_PLAINTEXT",
        (true, _) | (false, Some(ListenerAuth::Tls)) => "SSL",
        (false, None) => "PLAINTEXT",
    }
}

/// Derived broker settings override anything the user declared under the same key.
fn broker_config(ctx: &BuildContext<'_>) -> BTreeMap<String, String> {
    let kafka = &ctx.spec.kafka;
    let mut props: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in &kafka.role.config {
        if FORBIDDEN_PREFIXES.iter().any(|p| k.starts_with(p)) {
            continue;
        }
        props.insert(k.clone(), property_value(v));
    }

    let mut listeners = vec![format!("{}://0.0.0.0:{}", REPLICATION_LISTENER, REPLICATION_PORT)];
    let mut protocols = vec![format!("{}:SSL", REPLICATION_LISTENER)];
    for l in &kafka.listeners {
        let id = listener_id(l);
        listeners.push(format!("{}://0.0.0.0:{}", id, l.port));
        protocols.push(format!("{}:{}", id, security_protocol(l)));
        let prefix = format!("listener.name.{}", id.to_lowercase());
        match l.authentication {
            Some(ListenerAuth::Tls) => {
                props.insert(format!("{}.ssl.client.auth", prefix), "required".into());
            }
            Some(ListenerAuth::ScramSha512) => {
                props.insert(format!("{}.sasl.enabled.mechanisms", prefix), "SCRAM-SHA-512".into());
            }
            None => {}
        }
    }
    props.insert("listeners".into(), listeners.join(","));
    props.insert("listener.security.protocol.map".into(), protocols.join(","));
    props.insert("inter.broker.listener.name".into(), REPLICATION_LISTENER.into());
    props.insert("zookeeper.connect".into(), format!("{}:{}", ctx.name("zookeeper-client"), zookeeper::CLIENT_PORT));

    if let Some(Authorization::Simple { super_users }) = &kafka.authorization {
        props.insert("authorizer.class.name".into(), "kafka.security.authorizer.AclAuthorizer".into());
        let mut users = vec![format!("User:CN={}-kafka", ctx.key().name)];
        users.extend(super_users.iter().map(|u| format!("User:{}", u)));
        props.insert("super.users".into(), users.join(";"));
    }
    props
}

fn service_port(name: &str, port: u16) -> Json {
    json!({ "name": name, "port": port, "targetPort": port, "protocol": "TCP" })
}

fn bootstrap_spec(ctx: &BuildContext<'_>, listeners: &[Listener]) -> Json {
    let mut ports = vec![service_port("tcp-replication", REPLICATION_PORT)];
    ports.extend(listeners.iter().filter(|l| !l.exposure.external()).map(|l| service_port(&format!("tcp-{}", l.name), l.port)));
    json!({ "type": "ClusterIP", "selector": ctx.selector(Role::Kafka), "ports": ports })
}

fn headless_spec(ctx: &BuildContext<'_>, listeners: &[Listener]) -> Json {
    let mut ports = vec![service_port("tcp-replication", REPLICATION_PORT)];
    ports.extend(listeners.iter().map(|l| service_port(&format!("tcp-{}", l.name), l.port)));
    json!({ "clusterIP": "None", "publishNotReadyAddresses": true, "selector": ctx.selector(Role::Kafka), "ports": ports })
}

fn external_spec(ctx: &BuildContext<'_>, l: &Listener) -> Json {
    let kind = match l.exposure {
        Exposure::Nodeport => "NodePort",
        Exposure::Loadbalancer => "LoadBalancer",
        Exposure::Internal => "ClusterIP",
    };
    json!({ "type": kind, "selector": ctx.selector(Role::Kafka), "ports": [service_port(&format!("tcp-{}", l.name), l.port)] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fixtures, PlatformDefaults};
    use krill_core::ObjectKind;

    fn props() -> BTreeMap<String, String> {
        let spec = fixtures::spec();
        let defaults = PlatformDefaults::default();
        broker_config(&BuildContext { spec: &spec, defaults: &defaults })
    }

    #[test]
    fn listeners_and_protocols_are_derived() {
        let p = props();
        assert_eq!(
            p["listeners"],
            "REPLICATION-9091://0.0.0.0:9091,PLAIN-9092://0.0.0.0:9092,TLS-9093://0.0.0.0:9093,EXTERNAL-9094://0.0.0.0:9094"
        );
        assert_eq!(
            p["listener.security.protocol.map"],
            "REPLICATION-9091:SSL,PLAIN-9092:PLAINTEXT,TLS-9093:SSL,EXTERNAL-9094:SASL_SSL"
        );
        assert_eq!(p["listener.name.tls-9093.ssl.client.auth"], "required");
        assert_eq!(p["listener.name.external-9094.sasl.enabled.mechanisms"], "SCRAM-SHA-512");
    }

    #[test]
    fn user_config_cannot_redirect_zookeeper() {
        let p = props();
        assert_eq!(p["zookeeper.connect"], "my-cluster-zookeeper-client:2181");
        assert_eq!(p["offsets.topic.replication.factor"], "3");
    }

    #[test]
    fn simple_authorization_sets_super_users() {
        let p = props();
        assert_eq!(p["authorizer.class.name"], "kafka.security.authorizer.AclAuthorizer");
        assert_eq!(p["super.users"], "User:CN=my-cluster-kafka;User:admin");
    }

    #[test]
    fn external_listener_gets_its_own_service() {
        let spec = fixtures::spec();
        let defaults = PlatformDefaults::default();
        let objs = KafkaBuilder.build(&BuildContext { spec: &spec, defaults: &defaults }).unwrap();
        let ext = objs.iter().find(|o| o.id.name == "my-cluster-kafka-external-bootstrap").unwrap();
        assert_eq!(ext.manifest["spec"]["type"], "LoadBalancer");
        assert_eq!(ext.manifest["spec"]["ports"][0]["port"], 9094);
        let bootstrap = objs.iter().find(|o| o.id.name == "my-cluster-kafka-bootstrap").unwrap();
        let ports: Vec<_> = bootstrap.manifest["spec"]["ports"].as_array().unwrap().iter().map(|p| p["port"].as_u64().unwrap()).collect();
        assert_eq!(ports, vec![9091, 9092, 9093]);
    }

    #[test]
    fn broker_heap_follows_memory_limit() {
        let spec = fixtures::spec();
        let defaults = PlatformDefaults::default();
        let objs = KafkaBuilder.build(&BuildContext { spec: &spec, defaults: &defaults }).unwrap();
        let sts = objs.iter().find(|o| o.id.kind == ObjectKind::StatefulSet).unwrap();
        let env = sts.manifest["spec"]["template"]["spec"]["containers"][0]["env"].as_array().unwrap();
        let get = |name: &str| env.iter().find(|e| e["name"] == name).map(|e| e["value"].as_str().unwrap().to_string());
        assert_eq!(get("DYNAMIC_HEAP_FRACTION").as_deref(), Some("0.5"));
        assert_eq!(get("DYNAMIC_HEAP_MAX").as_deref(), Some("5000000000"));
        assert!(get("KAFKA_HEAP_OPTS").map_or(true, |v| !v.contains("-Xmx")));
        let claim = &sts.manifest["spec"]["volumeClaimTemplates"][0]["spec"];
        assert_eq!(claim["resources"]["requests"]["storage"], "100Gi");
        assert_eq!(claim["storageClassName"], "fast");
    }
}
