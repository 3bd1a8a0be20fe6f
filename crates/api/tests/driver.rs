#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use krill_api::{Driver, Engine, EngineConfig, EventSink, LogEvents, RecordingEvents};
use krill_core::{ClusterKey, Error, Role, StatusRecord};
use krill_desired::PlatformDefaults;
use krill_kubehub::{ClusterEvent, MemoryPlatform, Op, Platform};
use krill_ops::RollConfig;
use krill_store::BackoffPolicy;
use serde_json::{json, Value as Json};
use tokio::sync::{mpsc, oneshot};

fn resource(generation: i64, replicas: i32) -> Json { configured(generation, replicas, json!({})) }

fn configured(generation: i64, replicas: i32, kafka_config: Json) -> Json {
    json!({
        "metadata": {"name": "c", "namespace": "ns", "generation": generation},
        "spec": {
            "kafka": {"replicas": replicas, "storage": {"type": "ephemeral"}, "listeners": [{"name": "plain", "port": 9092}], "config": kafka_config},
            "zookeeper": {"replicas": 1, "storage": {"type": "ephemeral"}}
        }
    })
}

fn engine(p: &Arc<MemoryPlatform>) -> Arc<Engine> { engine_with(p, Arc::new(LogEvents), Duration::from_millis(200)) }

fn engine_with(p: &Arc<MemoryPlatform>, events: Arc<dyn EventSink>, health_timeout: Duration) -> Arc<Engine> {
    let config = EngineConfig {
        resync: Duration::from_secs(3600),
        roll: RollConfig { health_timeout, poll_interval: Duration::from_millis(1), max_probe_errors: 3 },
        backoff: BackoffPolicy { initial: Duration::from_millis(5), factor: 2, max: Duration::from_millis(50) },
        ..Default::default()
    };
    Arc::new(Engine::new(p.clone(), p.clone(), PlatformDefaults::default(), config, events))
}

fn declared(key: &ClusterKey, generation: i64) -> ClusterEvent { ClusterEvent::Declared { key: key.clone(), generation } }

fn pod_deletes(p: &MemoryPlatform) -> Vec<String> {
    p.calls().into_iter().filter(|(op, _)| *op == Op::DeletePod).map(|(_, t)| t).collect()
}

async fn wait_until(what: &str, done: impl Fn() -> bool) {
    for _ in 0..2000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for(p: &MemoryPlatform, key: &ClusterKey, done: impl Fn(&StatusRecord) -> bool) -> StatusRecord {
    for _ in 0..400 {
        if let Some(v) = p.get_status(key).await.unwrap() {
            if done(&v.status) {
                return v.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("status of {} never reached the expected state", key);
}

#[tokio::test]
async fn events_drive_cycles_to_convergence() {
    let p = Arc::new(MemoryPlatform::new());
    let key = p.put_cluster(resource(1, 3));
    let (tx, rx) = mpsc::channel(16);
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(Driver::new(engine(&p)).run(rx, async move {
        let _ = stopped.await;
    }));

    tx.send(ClusterEvent::Changed(key.clone())).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;

    p.put_cluster(resource(2, 4));
    tx.send(declared(&key, 2)).await.unwrap();
    for _ in 0..5 {
        tx.send(ClusterEvent::Changed(key.clone())).await.unwrap();
    }
    wait_for(&p, &key, |s| s.last_successful_generation == Some(2)).await;
    assert_eq!(p.pods(&key, krill_core::Role::Kafka).len(), 4);

    let _ = stop.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn fatal_failure_recovers_once_the_declaration_changes() {
    let p = Arc::new(MemoryPlatform::new());
    let key = p.put_cluster(resource(1, 0));
    let (tx, rx) = mpsc::channel(16);
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(Driver::new(engine(&p)).run(rx, async move {
        let _ = stopped.await;
    }));

    tx.send(ClusterEvent::Changed(key.clone())).await.unwrap();
    let failed = wait_for(&p, &key, |s| s.last_error.is_some()).await;
    assert_eq!(failed.last_successful_generation, None);

    p.put_cluster(resource(2, 1));
    tx.send(declared(&key, 2)).await.unwrap();
    let ok = wait_for(&p, &key, |s| s.last_successful_generation == Some(2)).await;
    assert_eq!(ok.last_error, None);

    let _ = stop.send(());
    task.await.unwrap();
}

#[tokio::test]
async fn removal_stops_the_worker_and_later_events_restart_it() {
    let p = Arc::new(MemoryPlatform::new());
    let key = p.put_cluster(resource(1, 1));
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(Driver::new(engine(&p)).run(rx, std::future::pending()));

    tx.send(ClusterEvent::Changed(key.clone())).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;

    p.remove_cluster(&key);
    tx.send(ClusterEvent::Removed(key.clone())).await.unwrap();

    let key = p.put_cluster(resource(1, 2));
    tx.send(ClusterEvent::Changed(key.clone())).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;

    // closing the event channel ends the driver
    drop(tx);
    task.await.unwrap();
}

#[tokio::test]
async fn owned_object_events_during_a_rollout_do_not_interrupt_it() {
    let p = Arc::new(MemoryPlatform::new());
    p.set_restart_polls(5);
    let key = p.put_cluster(resource(1, 3));
    let events = RecordingEvents::new();
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(Driver::new(engine_with(&p, Arc::new(events.clone()), Duration::from_secs(5))).run(rx, std::future::pending()));
    tx.send(declared(&key, 1)).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;

    p.put_cluster(configured(2, 3, json!({"num.partitions": 12})));
    tx.send(declared(&key, 2)).await.unwrap();
    // the workload replace and every restarted pod keep reporting changes
    let noise = {
        let (tx, key) = (tx.clone(), key.clone());
        tokio::spawn(async move {
            while tx.send(ClusterEvent::Changed(key.clone())).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };
    wait_for(&p, &key, |s| s.last_successful_generation == Some(2)).await;
    noise.abort();

    assert_eq!(pod_deletes(&p), vec!["c-kafka-0", "c-kafka-1", "c-kafka-2"]);
    let reasons = events.reasons();
    assert!(!reasons.iter().any(|r| r == "Superseded"), "{:?}", reasons);
    assert_eq!(reasons.iter().filter(|r| *r == "MemberRestarted").count(), 3);

    drop(tx);
    task.await.unwrap();
}

#[tokio::test]
async fn removal_stops_an_in_flight_rollout_before_the_name_is_reused() {
    let p = Arc::new(MemoryPlatform::new());
    let key = p.put_cluster(resource(1, 3));
    let driver = Driver::new(engine_with(&p, Arc::new(LogEvents), Duration::from_secs(30)));
    let locks = driver.locks().clone();
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(driver.run(rx, std::future::pending()));
    tx.send(declared(&key, 1)).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;

    p.stall_pod("c-kafka-1");
    p.put_cluster(configured(2, 3, json!({"num.partitions": 12})));
    tx.send(declared(&key, 2)).await.unwrap();
    wait_until("the stalled restart", || pod_deletes(&p).contains(&"c-kafka-1".to_string())).await;
    assert_eq!(locks.held_count(), 1);

    p.remove_cluster(&key);
    tx.send(ClusterEvent::Removed(key.clone())).await.unwrap();
    wait_until("the lock to be released", || locks.held_count() == 0).await;
    // a worker still waiting on the stalled member would swallow this injected failure
    p.fail(Op::ListMembers, Some("kafka"), Error::transient("injected"), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(p.list_members(&key, Role::Kafka).await.is_err(), "the removed cluster's worker is still polling");

    p.set_ready("ns", "c-kafka-1", true);
    p.clear_calls();
    let key = p.put_cluster(configured(1, 3, json!({"num.partitions": 12})));
    tx.send(declared(&key, 1)).await.unwrap();
    wait_for(&p, &key, |s| s.last_successful_generation == Some(1)).await;
    assert_eq!(pod_deletes(&p), vec!["c-kafka-2"]);

    drop(tx);
    task.await.unwrap();
}
