use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DynamicObject};
use kube::Client;
use steward_converge::Reconciler;
use steward_core::{ReconcileConfig, ResourceKey, SystemClock};
use steward_kubehub::{
    application_resource, get_kube_client, knative_service_resource, watch, KubeApplications, KubeEvents,
    KubeSynthesizer, KubeWorkloads,
};
use steward_ops::{KubeOps, OperationController};
use steward_queue::{spawn_workers, ConfigHandle, WorkQueue};
use steward_schema::crd::{GROUP, STORAGE_VERSION};
use steward_schema::Operation;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Reconciles Applications and one-shot Operations")]
struct Cli {
    /// Reconcile config file (YAML)
    #[arg(long, env = "STEWARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the steady-state resync interval
    #[arg(long = "steady-interval-secs", global = true)]
    steady_interval_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers until interrupted
    Run {
        /// Watch a single namespace (default: all)
        #[arg(long)]
        namespace: Option<String>,
        /// Application workers
        #[arg(long, env = "STEWARD_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Operation workers
        #[arg(long = "operation-workers", default_value_t = 2)]
        operation_workers: usize,
    },
    /// Print the CRDs as YAML
    Crd,
    /// Print the effective reconcile config as YAML
    Config,
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&Path>, steady_override: Option<u64>) -> Result<ReconcileConfig> {
    let mut cfg = match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_yaml::from_str::<ReconcileConfig>(&raw).with_context(|| format!("parsing {}", p.display()))?
        }
        None => ReconcileConfig::default(),
    };
    if let Some(secs) = steady_override {
        cfg.steady_interval = Duration::from_secs(secs);
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(unix)]
fn spawn_reload(handle: ConfigHandle, path: Option<PathBuf>, steady_override: Option<u64>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            match load_config(path.as_deref(), steady_override) {
                Ok(cfg) => {
                    info!(?cfg, "reloaded reconcile config");
                    handle.store(cfg);
                }
                Err(e) => warn!(error = %e, "config reload rejected; keeping previous"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload(_handle: ConfigHandle, _path: Option<PathBuf>, _steady_override: Option<u64>) -> Result<()> { Ok(()) }

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn spawn_watch<F>(what: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(kind = what, error = %e, "watcher failed");
        }
    });
}

async fn run(
    config: ConfigHandle,
    namespace: Option<String>,
    workers: usize,
    operation_workers: usize,
) -> Result<()> {
    let client = get_kube_client().await?;
    let ns = namespace.as_deref();
    // Every Application is read at the storage version, which carries the older fields too.
    let app_resource = application_resource(STORAGE_VERSION);

    let apps: WorkQueue<ResourceKey> = WorkQueue::new("applications");
    let ops: WorkQueue<ResourceKey> = WorkQueue::new("operations");

    let app_api: Api<DynamicObject> = match ns {
        Some(n) => Api::namespaced_with(client.clone(), n, &app_resource),
        None => Api::all_with(client.clone(), &app_resource),
    };
    spawn_watch("Application", watch::watch_primary(app_api, apps.clone(), "Application"));
    spawn_watch("Deployment", watch::watch_owned(scoped::<Deployment>(client.clone(), ns), apps.clone(), "Deployment"));
    if kube::discovery::group(&client, "serving.knative.dev").await.is_ok() {
        let kn = knative_service_resource();
        let kn_api: Api<DynamicObject> = match ns {
            Some(n) => Api::namespaced_with(client.clone(), n, &kn),
            None => Api::all_with(client.clone(), &kn),
        };
        spawn_watch("KnativeService", watch::watch_owned(kn_api, apps.clone(), "KnativeService"));
    } else {
        info!("serving.knative.dev not served; serverless workloads will not be watched");
    }
    spawn_watch("Operation", watch::watch_primary(scoped::<Operation>(client.clone(), ns), ops.clone(), "Operation"));

    let reconciler = Arc::new(Reconciler {
        store: Arc::new(KubeApplications::new(client.clone())),
        synthesizer: Arc::new(KubeSynthesizer::new(client.clone(), app_resource.clone())),
        observer: Arc::new(KubeWorkloads::new(client.clone())),
        events: Arc::new(KubeEvents::new(client.clone(), app_resource.api_version.clone(), "Application")),
        clock: Arc::new(SystemClock),
    });
    let kube_ops = Arc::new(KubeOps::new(client.clone()));
    let controller = Arc::new(OperationController {
        store: kube_ops.clone(),
        probe: kube_ops.clone(),
        exec: kube_ops,
        events: Arc::new(KubeEvents::new(client.clone(), format!("{GROUP}/v1alpha1"), "Operation")),
        clock: Arc::new(SystemClock),
    });

    let mut tasks = {
        let config = config.clone();
        spawn_workers(apps, workers, move |key: ResourceKey| {
            let reconciler = reconciler.clone();
            let cfg = config.snapshot();
            async move { reconciler.reconcile(&key, &cfg).await }
        })
    };
    tasks.extend(spawn_workers(ops, operation_workers, move |key: ResourceKey| {
        let controller = controller.clone();
        let cfg = config.snapshot();
        async move { controller.reconcile(&key, &cfg).await }
    }));
    info!(workers, operation_workers, namespace = ?namespace, "steward running");

    signal::ctrl_c().await?;
    info!("shutting down");
    for t in tasks {
        t.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            let yaml = steward_schema::crd::crds_yaml().map_err(anyhow::Error::msg)?;
            print!("{yaml}");
        }
        Commands::Config => {
            let cfg = load_config(cli.config.as_deref(), cli.steady_interval_secs)?;
            print!("{}", serde_yaml::to_string(&cfg)?);
        }
        Commands::Run { namespace, workers, operation_workers } => {
            init_metrics();
            let cfg = load_config(cli.config.as_deref(), cli.steady_interval_secs)?;
            let handle = ConfigHandle::new(cfg);
            spawn_reload(handle.clone(), cli.config.clone(), cli.steady_interval_secs)?;
            run(handle, namespace, workers, operation_workers).await?;
        }
    }
    Ok(())
}
