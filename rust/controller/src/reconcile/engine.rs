//! Ties the dedup queue, the backend adapter, the IP pool and the
//! cluster watchers together: configuration sync, configuration
//! delete and node-event handling.
use crate::ip_pool::{AssignmentStore, IpPoolManager};
use crate::reconcile::backend::{LbBackend, ListenerSpec, MonitorSpec, PoolMember, PoolSpec, Protocol, VirtualServerSpec};
use crate::reconcile::lbconfig::{status_patch, ConfigKey, Error as ConfigError, LbConfig};
use crate::reconcile::nodes::{is_ready, primary_ip};
use crate::reconcile::service_lookup::{Error as ServiceLookupError, ServiceResolver};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, Patch, PatchParams};
use snafu::{OptionExt, ResultExt, Snafu};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Snafu)]
pub enum SyncError {
    #[snafu(display("failed to read configuration object"))]
    ReadConfig { source: kube::Error },
    #[snafu(display("failed to parse configuration object"))]
    ParseConfig { source: ConfigError },
    #[snafu(display("failed to resolve target service"))]
    ResolveService { source: ServiceLookupError },
    #[snafu(display("failed to allocate a bind IP"))]
    AllocateIp { source: crate::ip_pool::Error },
    #[snafu(display("failed to program the backend"))]
    Backend {
        source: crate::reconcile::backend::BackendError,
    },
    #[snafu(display("failed to write back configuration status"))]
    WriteStatus { source: kube::Error },
    #[snafu(display("target service has no port matching target-port-name"))]
    NoMatchingServicePort,
}

type Result<T, E = SyncError> = std::result::Result<T, E>;

impl crate::logging::ReconcilerError for SyncError {
    fn category(&self) -> &'static str {
        match self {
            SyncError::ReadConfig { .. } => "read_config",
            SyncError::ParseConfig { .. } => "parse_config",
            SyncError::ResolveService { .. } => "resolve_service",
            SyncError::AllocateIp { .. } => "allocate_ip",
            SyncError::Backend { .. } => "backend",
            SyncError::WriteStatus { .. } => "write_status",
            SyncError::NoMatchingServicePort => "no_matching_service_port",
        }
    }
}

/// What was last successfully programmed for a key, kept so that a
/// later delete (which no longer has the `ConfigMap` to read) knows
/// which backend resources to tear down, and so node events know which
/// pools to update.
#[derive(Debug, Clone)]
struct Programmed {
    bind_ports: Vec<u16>,
    node_port: i32,
}

fn pool_name(key: &ConfigKey, bind_port: u16) -> String {
    format!("{}-{}-{bind_port}", key.namespace, key.name)
}

pub struct ReconcileEngine<S: AssignmentStore> {
    client: kube::Client,
    backend: Arc<dyn LbBackend>,
    resolver: Arc<dyn ServiceResolver>,
    ip_pool: Arc<IpPoolManager<S>>,
    programmed: Mutex<HashMap<ConfigKey, Programmed>>,
    node_ips: Mutex<HashMap<String, String>>,
}

impl<S: AssignmentStore> ReconcileEngine<S> {
    pub fn new(
        client: kube::Client,
        backend: Arc<dyn LbBackend>,
        resolver: Arc<dyn ServiceResolver>,
        ip_pool: Arc<IpPoolManager<S>>,
    ) -> Self {
        Self {
            client,
            backend,
            resolver,
            ip_pool,
            programmed: Mutex::new(HashMap::new()),
            node_ips: Mutex::new(HashMap::new()),
        }
    }

    /// The per-key sync function run by the queue worker.
    pub async fn sync(&self, key: &ConfigKey) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let object = match api.get_opt(&key.name).await.context(ReadConfigSnafu)? {
            Some(object) => object,
            None => {
                self.delete(key).await;
                return Ok(());
            }
        };
        let data = object.data.clone().unwrap_or_default();

        match self.try_program(key, &data).await {
            Ok(bind_ip) => {
                self.write_status(&api, key, "SUCCESS", Some(&bind_ip.to_string())).await?;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%key, %error, "configuration sync failed");
                // Best effort: partial siblings for this key are rolled
                // back before the error is surfaced.
                self.teardown_backend_resources(key).await;
                let _ = self.write_status(&api, key, &format!("ERROR: {error}"), None).await;
                Err(error)
            }
        }
    }

    async fn try_program(&self, key: &ConfigKey, data: &std::collections::BTreeMap<String, String>) -> Result<Ipv4Addr> {
        let config = LbConfig::from_data(&key.namespace, &key.name, data).context(ParseConfigSnafu)?;

        let resolved = self
            .resolver
            .resolve(&key.namespace, &config.target_service_name)
            .await
            .context(ResolveServiceSnafu)?;
        let port = resolved
            .select_port(config.target_port_name.as_deref())
            .context(NoMatchingServicePortSnafu)?
            .clone();
        let node_port = port.node_port.unwrap_or(port.port);

        let bind_ip = self.ip_pool.generate_ip(&key.to_string()).await.context(AllocateIpSnafu)?;
        let protocol = Protocol::for_config(config.is_http());

        let members = self.current_pool_members(node_port as u16).await;

        let mut created_pools = Vec::new();
        let mut created_listeners = Vec::new();
        let mut created_vservers = Vec::new();
        let mut created_monitors = Vec::new();

        let programming_result: Result<()> = async {
            for bind_port in &config.bind_ports {
                let name = pool_name(key, *bind_port);
                self.backend
                    .ensure_pool(&PoolSpec {
                        name: name.clone(),
                        protocol,
                        members: members.clone(),
                    })
                    .await
                    .context(BackendSnafu)?;
                created_pools.push(name.clone());

                self.backend
                    .ensure_monitor(&MonitorSpec {
                        name: name.clone(),
                        protocol,
                    })
                    .await
                    .context(BackendSnafu)?;
                created_monitors.push(name.clone());

                self.backend
                    .ensure_listener(&ListenerSpec {
                        name: name.clone(),
                        bind_ip: bind_ip.to_string(),
                        bind_port: *bind_port,
                        protocol,
                    })
                    .await
                    .context(BackendSnafu)?;
                created_listeners.push(name.clone());

                self.backend
                    .ensure_virtual_server(&VirtualServerSpec {
                        name: name.clone(),
                        listener_name: name.clone(),
                        pool_name: name.clone(),
                        destination_ip: bind_ip.to_string(),
                        destination_port: *bind_port,
                    })
                    .await
                    .context(BackendSnafu)?;
                created_vservers.push(name.clone());

                self.backend.wait_until_active(&name).await.context(BackendSnafu)?;
            }
            Ok(())
        }
        .await;

        if let Err(error) = programming_result {
            for name in created_vservers {
                let _ = self.backend.delete_virtual_server(&name).await;
            }
            for name in created_listeners {
                let _ = self.backend.delete_listener(&name).await;
            }
            for name in created_monitors {
                let _ = self.backend.delete_monitor(&name).await;
            }
            for name in created_pools {
                let _ = self.backend.delete_pool(&name).await;
            }
            return Err(error);
        }

        self.programmed.lock().await.insert(
            key.clone(),
            Programmed {
                bind_ports: config.bind_ports.clone(),
                node_port,
            },
        );

        Ok(bind_ip)
    }

    /// Tears down virtual server, pool, monitor for every bind port this
    /// key last programmed. Idempotent against not-found, since the
    /// backend's `delete_*` calls are.
    async fn teardown_backend_resources(&self, key: &ConfigKey) {
        let Some(programmed) = self.programmed.lock().await.get(key).cloned() else {
            return;
        };
        for bind_port in &programmed.bind_ports {
            let name = pool_name(key, *bind_port);
            let _ = self.backend.delete_virtual_server(&name).await;
            let _ = self.backend.delete_listener(&name).await;
            let _ = self.backend.delete_monitor(&name).await;
            let _ = self.backend.delete_pool(&name).await;
        }
    }

    /// Configuration delete: tear down the backend resources and
    /// release the IP.
    pub async fn delete(&self, key: &ConfigKey) {
        tracing::info!(%key, "tearing down configuration");
        self.teardown_backend_resources(key).await;
        self.programmed.lock().await.remove(key);
        self.ip_pool.delete_ip(&key.to_string()).await;
    }

    async fn write_status(
        &self,
        api: &Api<ConfigMap>,
        key: &ConfigKey,
        status: &str,
        bind_ip: Option<&str>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "data": status_patch(status, bind_ip) });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .context(WriteStatusSnafu)?;
        Ok(())
    }

    /// Current Ready-node members at `node_port`, used both for fresh
    /// programming and — conceptually — for node-event updates.
    async fn current_pool_members(&self, node_port: u16) -> Vec<PoolMember> {
        let node_ips = self.node_ips.lock().await;
        node_ips
            .values()
            .map(|ip| PoolMember {
                address: ip.clone(),
                port: node_port,
            })
            .collect()
    }

    /// **Add (Ready)**: records the node and adds it to every tracked
    /// pool at that pool's node-port.
    pub async fn handle_node_ready(&self, node: &Node) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        let Some(ip) = primary_ip(node) else {
            return;
        };
        self.node_ips.lock().await.insert(name, ip.clone());
        for (key, programmed) in self.snapshot_programmed().await {
            for bind_port in &programmed.bind_ports {
                let pool_name = pool_name(&key, *bind_port);
                let mut members = self.current_pool_members(programmed.node_port as u16).await;
                let member = PoolMember {
                    address: ip.clone(),
                    port: programmed.node_port as u16,
                };
                if !members.contains(&member) {
                    members.push(member);
                }
                self.ensure_pool_logged(&key, pool_name, members).await;
            }
        }
    }

    /// **Delete (Ready)**: removes the corresponding member from every
    /// tracked pool.
    pub async fn handle_node_removed(&self, node_name: &str) {
        let Some(ip) = self.node_ips.lock().await.remove(node_name) else {
            return;
        };
        for (key, programmed) in self.snapshot_programmed().await {
            for bind_port in &programmed.bind_ports {
                let pool_name = pool_name(&key, *bind_port);
                let mut members = self.current_pool_members(programmed.node_port as u16).await;
                members.retain(|m| m.address != ip);
                self.ensure_pool_logged(&key, pool_name, members).await;
            }
        }
    }

    /// **Update**: only acted on when the primary IP changed; treated as
    /// delete-old + add-new while preserving pool membership.
    pub async fn handle_node_updated(&self, node: &Node) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        let Some(new_ip) = primary_ip(node) else {
            return;
        };
        let changed = self.node_ips.lock().await.get(&name).map(|old| old != &new_ip).unwrap_or(true);
        if !changed {
            return;
        }
        if is_ready(node) {
            self.handle_node_removed(&name).await;
            self.handle_node_ready(node).await;
        }
    }

    async fn snapshot_programmed(&self) -> Vec<(ConfigKey, Programmed)> {
        self.programmed
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Logs and continues past a per-pool failure so one unhealthy pool
    /// does not stall node-event handling for the others.
    async fn ensure_pool_logged(&self, key: &ConfigKey, name: String, members: Vec<PoolMember>) {
        let pool = PoolSpec {
            name,
            protocol: Protocol::Tcp,
            members,
        };
        if let Err(error) = self.backend.ensure_pool(&pool).await {
            tracing::warn!(%key, %error, "node-event pool update failed, continuing with other pools");
        }
    }

    /// Runs the watch→queue→reconcile loop until the watchers are
    /// cancelled. Spawns a worker per `concurrency`, a configuration
    /// watcher that enqueues affected keys, and a node watcher that
    /// drives [`Self::handle_node_ready`]/[`Self::handle_node_removed`]/
    /// [`Self::handle_node_updated`] directly (those never go through the
    /// dedup queue, since they act on every tracked pool rather than on
    /// a single configuration key). A watcher that ends — connection
    /// loss, decode error — is re-established after a short backoff.
    pub async fn run(self: Arc<Self>, client: kube::Client, watch_namespace: Option<&str>, concurrency: usize)
    where
        S: 'static,
    {
        let queue: crate::reconcile::queue::DedupQueue<ConfigKey> = crate::reconcile::queue::DedupQueue::new();

        let configs: Api<ConfigMap> = match watch_namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let nodes: Api<Node> = Api::all(client.clone());

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let engine = self.clone();
            let queue = queue.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let key = queue.dequeue().await;
                    if let Err(error) = engine.sync(&key).await {
                        tracing::warn!(%key, %error, "sync failed, requeueing");
                        queue.enqueue(key.clone());
                    }
                    queue.done(&key);
                }
            }));
        }

        let config_watcher = tokio::spawn(watch_configs(configs, queue.clone()));
        let node_watcher = tokio::spawn(watch_nodes(nodes, self.clone()));

        for worker in workers {
            let _ = worker.await;
        }
        let _ = config_watcher.await;
        let _ = node_watcher.await;
    }
}

/// Re-established on every stream termination (connection loss, decode
/// error) after a short backoff, logging the restart as a synthetic
/// crash event.
async fn watch_configs(api: Api<ConfigMap>, queue: crate::reconcile::queue::DedupQueue<ConfigKey>) {
    use futures::StreamExt;
    use kube::runtime::watcher;

    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                    if let Some(key) = config_key(&object) {
                        queue.enqueue(key);
                    }
                }
                Ok(watcher::Event::Delete(object)) => {
                    if let Some(key) = config_key(&object) {
                        queue.enqueue(key);
                    }
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(error) => {
                    tracing::warn!(%error, "configuration watcher crashed, restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn watch_nodes<S: AssignmentStore + 'static>(api: Api<Node>, engine: Arc<ReconcileEngine<S>>) {
    use futures::StreamExt;
    use kube::runtime::watcher;

    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                    if is_ready(&node) {
                        // Handles both a fresh Ready node and a primary
                        // IP change on an already-tracked one.
                        engine.handle_node_updated(&node).await;
                    } else if let Some(name) = node.metadata.name.clone() {
                        engine.handle_node_removed(&name).await;
                    }
                }
                Ok(watcher::Event::Delete(node)) => {
                    if let Some(name) = node.metadata.name {
                        engine.handle_node_removed(&name).await;
                    }
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(error) => {
                    tracing::warn!(%error, "node watcher crashed, restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

fn config_key(object: &ConfigMap) -> Option<ConfigKey> {
    Some(ConfigKey {
        namespace: object.metadata.namespace.clone()?,
        name: object.metadata.name.clone()?,
    })
}
