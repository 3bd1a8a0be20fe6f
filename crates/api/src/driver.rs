use std::future::Future;
use std::sync::Arc;

use krill_core::ClusterKey;
use krill_kubehub::ClusterEvent;
use krill_store::{Acquire, LockRegistry, RetryDecision, RetryTracker};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::Engine;

struct Worker {
    /// Highest generation declared so far; every send wakes the worker.
    trigger: watch::Sender<i64>,
    handle: JoinHandle<()>,
}

/// Dispatches cluster events to one worker task per cluster.
///
/// Each worker is woken through a `watch` channel, so any number of events arriving during a
/// cycle collapse into one follow-up cycle. The channel value is the highest declared
/// generation: a running rollout is superseded only when it rises above the generation the
/// cycle works on, never by events the cycle's own writes cause.
pub struct Driver {
    engine: Arc<Engine>,
    locks: LockRegistry,
    workers: FxHashMap<ClusterKey, Worker>,
}

impl Driver {
    pub fn new(engine: Arc<Engine>) -> Self {
        let locks = LockRegistry::new(engine.config().lock_max_hold);
        Self { engine, locks, workers: FxHashMap::default() }
    }

    pub fn locks(&self) -> &LockRegistry { &self.locks }

    /// Run until `shutdown` resolves or the event channel closes. Workers finish their current
    /// step, then stop.
    pub async fn run<F>(mut self, mut events: mpsc::Receiver<ClusterEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut resync = tokio::time::interval(self.engine.config().resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resync_secs = self.engine.config().resync.as_secs(), "driver started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                ev = events.recv() => match ev {
                    Some(ClusterEvent::Declared { key, generation }) => self.trigger(key, Some(generation)),
                    Some(ClusterEvent::Changed(key)) => self.trigger(key, None),
                    Some(ClusterEvent::Removed(key)) => self.remove(&key).await,
                    None => {
                        info!("event channel closed");
                        break;
                    }
                },
                _ = resync.tick() => self.resync().await,
            }
        }
        for (key, w) in self.workers.drain() {
            drop(w.trigger);
            if let Err(e) = w.handle.await {
                warn!(cluster = %key, error = %e, "worker ended abnormally");
            }
        }
        info!("driver stopped");
    }

    async fn resync(&mut self) {
        match self.engine.platform().list_clusters(self.engine.config().namespace.as_deref()).await {
            Ok(keys) => {
                debug!(clusters = keys.len(), "resync");
                for key in keys {
                    self.trigger(key, None);
                }
            }
            Err(e) => warn!(error = %e, "resync listing failed"),
        }
    }

    fn trigger(&mut self, key: ClusterKey, generation: Option<i64>) {
        if let Some(w) = self.workers.get(&key) {
            if !w.trigger.is_closed() {
                w.trigger.send_modify(|declared| {
                    if let Some(g) = generation {
                        *declared = (*declared).max(g);
                    }
                });
                return;
            }
        }
        debug!(cluster = %key, "starting worker");
        let (tx, rx) = watch::channel(generation.unwrap_or(0));
        let handle = tokio::spawn(worker(key.clone(), self.engine.clone(), self.locks.clone(), rx));
        self.workers.insert(key, Worker { trigger: tx, handle });
    }

    /// Stop the cluster's worker and wait until it is gone, so its lock guard is released
    /// before a cluster of the same name can start a new one.
    async fn remove(&mut self, key: &ClusterKey) {
        info!(cluster = %key, "cluster removed");
        if let Some(w) = self.workers.remove(key) {
            w.handle.abort();
            match w.handle.await {
                Err(e) if !e.is_cancelled() => warn!(cluster = %key, error = %e, "worker ended abnormally"),
                _ => {}
            }
        }
        self.engine.forget(key);
    }
}

async fn worker(key: ClusterKey, engine: Arc<Engine>, locks: LockRegistry, mut rx: watch::Receiver<i64>) {
    let config = engine.config().clone();
    let mut tracker = RetryTracker::default();
    let mut last_generation = 0i64;
    let mut pending = true;
    loop {
        if !pending && rx.changed().await.is_err() {
            break;
        }
        pending = false;
        rx.borrow_and_update();

        if tracker.fatal() {
            match engine.generation(&key).await {
                Ok(Some(g)) if tracker.blocked(g) => {
                    debug!(cluster = %key, generation = g, "waiting for a new generation after fatal failure");
                    continue;
                }
                Ok(None) => break,
                _ => {}
            }
        }

        let guard = match locks.acquire(&key) {
            Acquire::Locked(g) => g,
            Acquire::Busy { holder, held_for } => {
                debug!(cluster = %key, %holder, held_ms = held_for.as_millis() as u64, "cluster busy");
                sleep(config.roll.poll_interval).await;
                pending = true;
                continue;
            }
        };
        let declared = rx.clone();
        let superseded = move |generation: i64| *declared.borrow() > generation;
        let result = engine.run_cycle(&key, &superseded).await;
        drop(guard);

        let decision = match result {
            Ok(None) => {
                info!(cluster = %key, "cluster gone; worker exiting");
                break;
            }
            Ok(Some(report)) => {
                last_generation = report.generation;
                match report.error() {
                    None => {
                        tracker.record_success();
                        continue;
                    }
                    Some(e) => tracker.record_failure(&config.backoff, report.generation, e),
                }
            }
            Err(e) => {
                warn!(cluster = %key, error = %e, "reading cluster failed");
                tracker.record_failure(&config.backoff, last_generation, &e)
            }
        };
        match decision {
            RetryDecision::Immediate => pending = true,
            RetryDecision::After(delay) => {
                debug!(cluster = %key, delay_ms = delay.as_millis() as u64, failures = tracker.failures(), "backing off");
                let deadline = Instant::now() + delay;
                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => break,
                        changed = rx.changed() => if changed.is_err() { return },
                    }
                }
                pending = true;
            }
            RetryDecision::Stop => warn!(cluster = %key, generation = last_generation, "fatal failure; waiting for the declaration to change"),
        }
    }
    debug!(cluster = %key, "worker stopped");
}
