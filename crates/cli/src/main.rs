use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use krill_api::{Driver, Engine, EngineConfig, KubeEvents, LogEvents};
use krill_apply::ChangePlan;
use krill_core::DesiredObject;
use krill_desired::PlatformDefaults;
use krill_kubehub::{start_watchers, KubePlatform};
use krill_ops::RollConfig;
use krill_schema::ClusterSpec;
use krill_store::BackoffPolicy;
use serde_json::Value as Json;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "krillctl", version, about = "Kafka/ZooKeeper reconciliation engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch, or to place manifests without one
    #[arg(long = "namespace", visible_alias = "ns", global = true, env = "KRILL_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator loop against the current kube context
    Run {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Render the objects a Kafka manifest declares, without a cluster
    Render {
        /// Kafka manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Diff a Kafka manifest against the live cluster and print the plan
    Plan {
        /// Kafka manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Seconds between full resyncs of every cluster
    #[arg(long, env = "KRILL_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,
    /// Seconds a restarted member may take to become ready
    #[arg(long, env = "KRILL_HEALTH_TIMEOUT_SECS", default_value_t = 300)]
    health_timeout_secs: u64,
    #[arg(long, env = "KRILL_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,
    #[arg(long, env = "KRILL_MAX_PROBE_ERRORS", default_value_t = 5)]
    max_probe_errors: u32,
    /// Ceiling of the retry backoff
    #[arg(long, env = "KRILL_MAX_BACKOFF_SECS", default_value_t = 300)]
    max_backoff_secs: u64,
    /// A cluster lock older than this may be taken over
    #[arg(long, env = "KRILL_LOCK_MAX_HOLD_SECS", default_value_t = 3600)]
    lock_max_hold_secs: u64,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[arg(long, env = "KRILL_KAFKA_IMAGE")]
    kafka_image: Option<String>,
    #[arg(long, env = "KRILL_ZOOKEEPER_IMAGE")]
    zookeeper_image: Option<String>,
    /// Share of the container memory limit given to the broker heap
    #[arg(long, env = "KRILL_KAFKA_HEAP_FRACTION")]
    kafka_heap_fraction: Option<f64>,
    #[arg(long, env = "KRILL_ZOOKEEPER_HEAP_FRACTION")]
    zookeeper_heap_fraction: Option<f64>,
}

impl BuildArgs {
    fn defaults(&self) -> PlatformDefaults {
        let mut d = PlatformDefaults::default();
        if let Some(i) = &self.kafka_image {
            d.kafka_image = i.clone();
        }
        if let Some(i) = &self.zookeeper_image {
            d.zookeeper_image = i.clone();
        }
        if let Some(f) = self.kafka_heap_fraction {
            d.kafka_heap.fraction = f;
        }
        if let Some(f) = self.zookeeper_heap_fraction {
            d.zookeeper_heap.fraction = f;
        }
        d
    }
}

impl RunArgs {
    fn config(&self, namespace: Option<String>) -> EngineConfig {
        EngineConfig {
            namespace,
            resync: Duration::from_secs(self.resync_secs.max(1)),
            roll: RollConfig {
                health_timeout: Duration::from_secs(self.health_timeout_secs),
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                max_probe_errors: self.max_probe_errors,
            },
            backoff: BackoffPolicy { max: Duration::from_secs(self.max_backoff_secs), ..BackoffPolicy::default() },
            lock_max_hold: Duration::from_secs(self.lock_max_hold_secs),
            ..EngineConfig::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KRILL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KRILL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KRILL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Read a Kafka manifest, filling in the namespace when the manifest has none.
fn load_spec(path: &Path, namespace: Option<&str>) -> Result<ClusterSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut raw: Json = serde_json::to_value(yaml).context("converting manifest to JSON")?;
    if let (Some(ns), true) = (namespace, raw["metadata"]["namespace"].is_null()) {
        raw["metadata"]["namespace"] = Json::String(ns.to_string());
    }
    let spec = ClusterSpec::from_resource(&raw)?;
    krill_schema::validate(&spec)?;
    Ok(spec)
}

fn print_objects(objects: &[DesiredObject], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<12} {:<52} {}", "ROLE", "OBJECT", "FINGERPRINT");
            for o in objects {
                println!("{:<12} {:<52} {}", o.role.as_str(), o.id.to_string(), o.fingerprint);
            }
        }
        Output::Json => {
            let manifests: Vec<&Json> = objects.iter().map(|o| &o.manifest).collect();
            println!("{}", serde_json::to_string_pretty(&manifests)?);
        }
    }
    Ok(())
}

fn print_plan(plan: &ChangePlan, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            if plan.is_empty() {
                println!("{}: no changes", plan.cluster);
                return Ok(());
            }
            println!("{:<8} {:<52} {:<10} {}", "ACTION", "OBJECT", "ROLLING", "GROUPS");
            for c in &plan.changes {
                let rolling = if c.disruptive { "yes" } else { "-" };
                println!("{:<8} {:<52} {:<10} {}", format!("{:?}", c.action).to_lowercase(), c.id.to_string(), rolling, c.changed_groups.join(","));
            }
            let s = plan.summary();
            println!("{} create, {} update, {} delete, {} rolling", s.creates, s.updates, s.deletes, s.disruptive);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(plan)?),
    }
    Ok(())
}

async fn run(namespace: Option<String>, args: RunArgs, build: BuildArgs) -> Result<()> {
    let platform = Arc::new(KubePlatform::try_default().await.context("connecting to Kubernetes")?);
    let config = args.config(namespace);
    info!(namespace = ?config.namespace, resync_secs = config.resync.as_secs(), "starting operator");
    let events = Arc::new(KubeEvents::new(platform.client()));
    let engine = Arc::new(Engine::new(platform.clone(), platform.clone(), build.defaults(), config.clone(), events));

    let (tx, rx) = mpsc::channel(1024);
    let watchers = start_watchers(platform.client(), config.namespace.clone(), tx);
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    Driver::new(engine).run(rx, shutdown).await;
    for w in watchers {
        w.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { run: args, build } => run(cli.namespace, args, build).await?,
        Commands::Render { file, build } => {
            let spec = load_spec(&file, cli.namespace.as_deref())?;
            info!(cluster = %spec.key, "render invoked");
            let objects = krill_desired::build(&spec, &build.defaults())?;
            print_objects(&objects, cli.output)?;
        }
        Commands::Plan { file, build } => {
            let spec = load_spec(&file, cli.namespace.as_deref())?;
            info!(cluster = %spec.key, "plan invoked");
            let platform = Arc::new(KubePlatform::try_default().await.context("connecting to Kubernetes")?);
            let engine = Engine::new(platform.clone(), platform, build.defaults(), EngineConfig::default(), Arc::new(LogEvents));
            let prepared = engine.prepare(&spec).await?;
            print_plan(&prepared.plan, cli.output)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn run_flags_feed_the_engine_config() {
        let cli = Cli::parse_from(["krillctl", "--ns", "kafka", "run", "--resync-secs", "60", "--poll-interval-ms", "500", "--kafka-heap-fraction", "0.4"]);
        let Commands::Run { run, build } = cli.command else { panic!("expected run") };
        let config = run.config(cli.namespace);
        assert_eq!(config.namespace.as_deref(), Some("kafka"));
        assert_eq!(config.resync, Duration::from_secs(60));
        assert_eq!(config.roll.poll_interval, Duration::from_millis(500));
        assert_eq!(build.defaults().kafka_heap.fraction, 0.4);
    }

    #[test]
    fn manifest_without_namespace_takes_the_flag() {
        let path = std::env::temp_dir().join(format!("krill-render-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "metadata: {name: c}\nspec:\n  kafka: {replicas: 1, storage: {type: ephemeral}, listeners: [{name: plain, port: 9092}]}\n  zookeeper: {replicas: 1, storage: {type: ephemeral}}\n",
        )
        .unwrap();
        let spec = load_spec(&path, Some("team-a")).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(spec.key.namespace, "team-a");
        assert!(!krill_desired::build(&spec, &PlatformDefaults::default()).unwrap().is_empty());
    }
}
