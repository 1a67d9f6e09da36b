//! The periodic backend-daemon variant: a second supervised process
//! that consumes the flat configuration map written by
//! [`publish::ConfigMapBackend`], programs a local front-end, and keeps
//! a VIP set on a network interface in sync with it.
pub mod config;
pub mod frontend;
pub mod publish;
pub mod vip;
pub mod watchdog;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use snafu::{ResultExt, Snafu};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use vip::VipSet;
use watchdog::Watchdog;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read configuration map {namespace}/{name}"))]
    ReadConfig {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("failed to parse configuration map"))]
    ParseConfig { source: config::Error },
    #[snafu(display("failed to program the local front-end"))]
    Frontend { source: frontend::Error },
    #[snafu(display("failed to reconcile the VIP set"))]
    Vip { source: vip::Error },
    #[snafu(display("front-end process watchdog fired, all VIPs released"))]
    WatchdogFired,
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct DaemonOpts {
    pub namespace: String,
    pub config_map_name: String,
    pub vip_interface: String,
    pub frontend_config_path: PathBuf,
    pub frontend_reload_command: Vec<String>,
    pub pid_file: PathBuf,
    pub poll_interval: Duration,
    pub watchdog_interval: Duration,
}

/// Runs the poll→program→reconcile loop until the watchdog reports the
/// front-end process has died, then cleans up every VIP this process
/// claimed and returns an error so the caller exits non-zero.
pub async fn run(client: kube::Client, opts: DaemonOpts) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client, &opts.namespace);
    let mut vips = VipSet::new(&opts.vip_interface);
    let mut exit_rx = Watchdog::new(opts.pid_file.clone(), opts.watchdog_interval).spawn();

    let mut ticker = tokio::time::interval(opts.poll_interval);
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = tick(&api, &opts, &mut vips).await {
                    tracing::warn!(%error, "backend daemon tick failed");
                }
            }
            _ = &mut exit_rx => {
                tracing::error!("front-end process watchdog fired, shutting down");
                break Err(());
            }
        }
    };

    let _ = vips.clear().await;
    match result {
        Ok(()) => Ok(()),
        Err(()) => WatchdogFiredSnafu.fail(),
    }
}

async fn tick(api: &Api<ConfigMap>, opts: &DaemonOpts, vips: &mut VipSet) -> Result<()> {
    let object = api.get_opt(&opts.config_map_name).await.context(ReadConfigSnafu {
        namespace: opts.namespace.clone(),
        name: opts.config_map_name.clone(),
    })?;
    let data = object.and_then(|o| o.data).unwrap_or_default();
    let groups = config::parse_groups(&data).context(ParseConfigSnafu)?;

    let desired: HashSet<_> = groups.iter().map(|g| g.bind_ip).collect();
    vips.reconcile(&desired).await.context(VipSnafu)?;

    frontend::write_and_reload(&opts.frontend_config_path, &groups, &opts.frontend_reload_command)
        .await
        .context(FrontendSnafu)?;

    Ok(())
}
