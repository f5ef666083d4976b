use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::{api::Api, core::DynamicObject};
use pcl_commit::Committer;
use pcl_controller::{install_indexers, Controller, ControllerConfig, PermissionClaimLabelReconciler, CONTROLLER_NAME};
use pcl_core::{ApiBinding, ApiExport, Delta, ObjectKey, Resource, TenantId};
use pcl_kubehub::{
    api_binding_resource, api_export_resource, start_watcher, KubeClaimLabeler, KubePatcher, Tenancy, TenantClients,
};
use pcl_store::{spawn_ingest, CrossScopeResolver, Informer};
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pclctl", version, about = "Permission-claim label controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run(RunArgs),
    /// Encode or decode queue keys
    Key {
        #[command(subcommand)]
        op: KeyOp,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Worker count (overrides PCL_WORKERS)
    #[arg(long = "workers")]
    workers: Option<usize>,
    /// Tenant for objects without the tenancy annotation
    #[arg(long = "default-tenant", env = "PCL_DEFAULT_TENANT", default_value = "root")]
    default_tenant: String,
    /// Annotation carrying an object's tenant
    #[arg(long = "tenancy-annotation", env = "PCL_TENANCY_ANNOTATION", default_value = "kcp.io/cluster")]
    tenancy_annotation: String,
    /// Address tenants through /clusters/<tenant> URL prefixes
    #[arg(long = "cluster-paths", env = "PCL_CLUSTER_PATHS", action = ArgAction::SetTrue)]
    cluster_paths: bool,
    /// Kubeconfig context serving the global APIExport cache
    #[arg(long = "global-context", env = "PCL_GLOBAL_CONTEXT")]
    global_context: Option<String>,
}

#[derive(Subcommand, Debug)]
enum KeyOp {
    /// Print the queue token for an object
    Encode {
        #[arg(long = "tenant")]
        tenant: String,
        #[arg(long = "namespace")]
        namespace: Option<String>,
        name: String,
    },
    /// Split a queue token into its parts
    Decode { token: String },
}

fn init_tracing() {
    let env = std::env::var("PCL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PCL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PCL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(args).await?;
        }
        Commands::Key { op } => key(op, cli.output)?,
    }
    Ok(())
}

fn key(op: KeyOp, output: Output) -> Result<()> {
    let key = match op {
        KeyOp::Encode { tenant, namespace, name } => ObjectKey::new(TenantId::new(tenant)?, namespace, name)?,
        KeyOp::Decode { token } => ObjectKey::decode(&token)?,
    };
    match output {
        Output::Human => {
            println!("{}", key.encode());
            println!("tenant={} namespace={} name={}", key.tenant, key.namespace.as_deref().unwrap_or("-"), key.name);
        }
        Output::Json => {
            let out = serde_json::json!({ "token": key.encode(), "key": key });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn spawn_watch<S, T>(api: Api<DynamicObject>, tenancy: Arc<Tenancy>, tx: mpsc::Sender<Delta<Resource<S, T>>>) -> JoinHandle<()>
where
    S: DeserializeOwned + Default + Send + 'static,
    T: DeserializeOwned + Default + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = start_watcher(api, tenancy, tx).await {
            error!(error = ?e, "watcher failed");
        }
    })
}

async fn run(args: RunArgs) -> Result<()> {
    let mut cfg = ControllerConfig::from_env();
    if let Some(w) = args.workers {
        cfg.workers = w.max(1);
    }
    let tenancy = Arc::new(Tenancy {
        annotation: args.tenancy_annotation,
        default_tenant: TenantId::new(args.default_tenant).context("invalid --default-tenant")?,
    });
    let clients = Arc::new(TenantClients::infer(args.cluster_paths).await?);

    let bindings = Arc::new(Informer::<ApiBinding>::new("apibindings"));
    let exports = Arc::new(Informer::<ApiExport>::new("apiexports"));
    let global_exports = Arc::new(Informer::<ApiExport>::new("apiexports-global"));
    install_indexers(bindings.cache(), &[exports.cache().as_ref(), global_exports.cache().as_ref()])
        .context("installing indexers")?;

    let resolver = CrossScopeResolver::new(Arc::clone(exports.cache()), Arc::clone(global_exports.cache()));
    let labeler = Arc::new(KubeClaimLabeler::new(Arc::clone(&clients), CONTROLLER_NAME));
    let reconciler = Arc::new(PermissionClaimLabelReconciler::new(resolver, labeler));
    let patcher = Arc::new(KubePatcher::new(Arc::clone(&clients), api_binding_resource(), CONTROLLER_NAME));
    let ctl = Arc::new(Controller::new(&cfg.rate_limit, Arc::clone(bindings.cache()), reconciler, Committer::new(patcher)));
    ctl.watch_bindings(&bindings);
    ctl.watch_exports(&exports);
    ctl.watch_exports(&global_exports);

    let mut tasks = Vec::new();
    let wildcard = clients.wildcard()?;
    let (binding_tx, ingest) = spawn_ingest(Arc::clone(&bindings), cfg.event_cap);
    tasks.push(ingest);
    tasks.push(spawn_watch(Api::all_with(wildcard.clone(), &api_binding_resource()), Arc::clone(&tenancy), binding_tx));
    let (export_tx, ingest) = spawn_ingest(Arc::clone(&exports), cfg.event_cap);
    tasks.push(ingest);
    tasks.push(spawn_watch(Api::all_with(wildcard, &api_export_resource()), Arc::clone(&tenancy), export_tx));

    match args.global_context.as_deref() {
        Some(context) => {
            let global = TenantClients::from_context(context, args.cluster_paths).await?;
            let (tx, ingest) = spawn_ingest(Arc::clone(&global_exports), cfg.event_cap);
            tasks.push(ingest);
            tasks.push(spawn_watch(Api::all_with(global.wildcard()?, &api_export_resource()), Arc::clone(&tenancy), tx));
            info!(context, "global export cache enabled");
        }
        None => info!("no --global-context; global export lookups will miss"),
    }

    let cancel = CancellationToken::new();
    let controller = tokio::spawn(Arc::clone(&ctl).start(cancel.clone(), cfg.workers));

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    controller.await.context("joining controller")?;
    for t in &tasks {
        t.abort();
    }
    Ok(())
}
