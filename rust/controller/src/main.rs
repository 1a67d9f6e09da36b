mod cloud;
mod daemon;
mod env_config;
mod ip_pool;
mod logging;
mod nodegroup_spec;
mod noderef;
mod provider;
mod reconcile;

use clap::{crate_description, crate_version, ArgGroup, Parser, Subcommand};
use cloud::{CloudManager, HttpFleetClient};
use ip_pool::{ConfigMapStore, IpPoolManager};
use provider::{CloudProviderFacade, GroupSource};
use reconcile::backend::{LbBackend, MemoryBackend};
use reconcile::service_lookup::KubeServiceResolver;
use reconcile::ReconcileEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const APP_NAME: &str = "fleetlb";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the cloud-provider core: cluster watchers, the dedup queue
    /// and the chosen backend.
    Run(RunArgs),
    /// Runs the periodic backend daemon: programs a local front-end and
    /// a VIP set from the flat configuration map the `run` backend
    /// publishes.
    RunDaemon(RunDaemonArgs),
}

#[derive(clap::Args)]
#[command(group(
    ArgGroup::new("group_source")
        .args(["nodes", "node_group_auto_discovery"])
        .required(true)
))]
struct RunArgs {
    /// Cloud provider selector. Currently the only supported value is
    /// "http", a generic reqwest-backed fleet API client.
    #[arg(long)]
    cloud_provider: String,

    /// A `min:max:name[:cost]` node-group spec; repeatable. Mutually
    /// exclusive with `--node-group-auto-discovery`.
    #[arg(long)]
    nodes: Vec<String>,

    /// A `<kind>:<param>=<value>` auto-discovery selector. Mutually
    /// exclusive with `--nodes`.
    #[arg(long)]
    node_group_auto_discovery: Option<String>,

    /// Backend selector: "configmap" publishes into the flat
    /// configuration map the daemon reads; "memory" is a no-op
    /// in-process backend for dry runs.
    #[arg(long)]
    backend: String,

    /// Namespace to watch for load-balancer configuration objects and
    /// nodes. "all" watches every namespace.
    #[arg(long, default_value = "all")]
    watch_namespace: String,

    /// Path to a YAML file with the cloud API's `base_url` and
    /// `bearer_token`.
    #[arg(long)]
    cloud_config: PathBuf,

    /// Name of the `ConfigMap` the IP pool persists its allocation map
    /// into.
    #[arg(long, default_value = "fleetlb-ip-pool")]
    ip_pool_config_map: String,

    /// Name of the `ConfigMap` the `configmap` backend publishes the
    /// backend-daemon's configuration into.
    #[arg(long, default_value = "fleetlb-backend")]
    backend_config_map: String,

    /// Number of concurrent reconcile workers.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Auto-discovery reconciliation period, in seconds.
    #[arg(long, default_value_t = 60)]
    discovery_period_secs: u64,

    /// Cloud group-size cache refresh period, in seconds.
    #[arg(long, default_value_t = 30)]
    cache_period_secs: u64,
}

#[derive(serde::Deserialize)]
struct CloudConfig {
    base_url: String,
    bearer_token: String,
}

#[derive(clap::Args)]
struct RunDaemonArgs {
    /// Namespace the backend configuration map lives in.
    #[arg(long)]
    namespace: String,

    /// Name of the backend configuration map to poll.
    #[arg(long, default_value = "fleetlb-backend")]
    config_map_name: String,

    /// Network interface to manage virtual IPs on.
    #[arg(long, default_value = "eth0")]
    vip_interface: String,

    /// Path the rendered front-end configuration is written to.
    #[arg(long)]
    frontend_config_path: PathBuf,

    /// Reload command run after every write, e.g. "nginx -s reload".
    /// Empty skips the reload step.
    #[arg(long, default_value = "")]
    frontend_reload_command: String,

    /// Pid file of the front-end process the watchdog monitors.
    #[arg(long)]
    pid_file: PathBuf,

    /// How often to poll the configuration map, in seconds.
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    /// How often the watchdog checks the front-end pid, in seconds.
    #[arg(long, default_value_t = 5)]
    watchdog_interval_secs: u64,
}

fn print_startup_banner() {
    tracing::info!(
        version = crate_version!(),
        git_version = built_info::GIT_VERSION.unwrap_or("unknown"),
        target = built_info::TARGET,
        built_time = built_info::BUILT_TIME_UTC,
        rustc_version = built_info::RUSTC_VERSION,
        "{}",
        crate_description!(),
    );
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    logging::initialize_logging(APP_NAME);
    print_startup_banner();

    let client = kube::Client::try_default().await?;

    let raw_config = std::fs::read_to_string(&args.cloud_config)
        .map_err(|source| anyhow::anyhow!("failed to read {}: {source}", args.cloud_config.display()))?;
    let cloud_config: CloudConfig = serde_yaml::from_str(&raw_config)
        .map_err(|source| anyhow::anyhow!("failed to parse {}: {source}", args.cloud_config.display()))?;

    let fleet_client = match args.cloud_provider.as_str() {
        "http" => Arc::new(HttpFleetClient::new(cloud_config.base_url, cloud_config.bearer_token)),
        other => anyhow::bail!("unsupported cloud provider {other:?}"),
    };

    let manager = Arc::new(CloudManager::new(fleet_client.clone(), fleet_client.clone()));
    manager.clone().spawn_cache_ticker(Duration::from_secs(args.cache_period_secs));

    let source = GroupSource::from_cli(&args.nodes, args.node_group_auto_discovery.as_deref())?;
    let discovery_backend = matches!(source, GroupSource::AutoDiscovery(_)).then(|| fleet_client as Arc<dyn provider::GroupDiscovery>);
    let facade = Arc::new(CloudProviderFacade::new(args.cloud_provider.clone(), manager, source, discovery_backend).await?);
    facade.clone().spawn_discovery_ticker(Duration::from_secs(args.discovery_period_secs));

    let vip_range = env_config::vip_range_from_env()?;
    let ip_store = ConfigMapStore::new(client.clone(), args.watch_namespace.clone(), args.ip_pool_config_map);
    let ip_pool = Arc::new(IpPoolManager::new(vip_range.start, vip_range.end, ip_store)?);

    let backend: Arc<dyn LbBackend> = match args.backend.as_str() {
        "configmap" => Arc::new(daemon::publish::ConfigMapBackend::new(
            client.clone(),
            args.watch_namespace.clone(),
            args.backend_config_map,
        )),
        "memory" => Arc::new(MemoryBackend::new()),
        other => anyhow::bail!("unsupported backend {other:?}"),
    };

    let resolver = Arc::new(KubeServiceResolver::new(client.clone()));

    let watch_namespace = (args.watch_namespace != "all").then_some(args.watch_namespace.as_str());
    tracing::info!(provider = facade.name(), "registered cloud provider");
    let engine = Arc::new(ReconcileEngine::new(client.clone(), backend, resolver, ip_pool));
    engine.run(client, watch_namespace, args.concurrency).await;

    Ok(())
}

async fn run_daemon(args: RunDaemonArgs) -> anyhow::Result<()> {
    logging::initialize_logging(APP_NAME);
    print_startup_banner();

    let client = kube::Client::try_default().await?;
    let reload_command = args
        .frontend_reload_command
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let opts = daemon::DaemonOpts {
        namespace: args.namespace,
        config_map_name: args.config_map_name,
        vip_interface: args.vip_interface,
        frontend_config_path: args.frontend_config_path,
        frontend_reload_command: reload_command,
        pid_file: args.pid_file,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        watchdog_interval: Duration::from_secs(args.watchdog_interval_secs),
    };

    daemon::run(client, opts).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(args) => run(args).await,
        Command::RunDaemon(args) => run_daemon(args).await,
    }
}
