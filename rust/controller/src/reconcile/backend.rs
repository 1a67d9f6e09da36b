//! The programmable-backend adapter: pool, listener, virtual server and
//! health monitor. Implementations exist for a real programmable LB
//! (talking to its control API) and for publishing the desired state
//! into a flat configuration map consumed by the periodic backend
//! daemon ([`crate::daemon`]).
use async_trait::async_trait;
use snafu::Snafu;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Http,
}

impl Protocol {
    pub fn for_config(is_http: bool) -> Self {
        if is_http {
            Protocol::Http
        } else {
            Protocol::Tcp
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolMember {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSpec {
    pub name: String,
    pub protocol: Protocol,
    pub members: Vec<PoolMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSpec {
    pub name: String,
    pub bind_ip: String,
    pub bind_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualServerSpec {
    pub name: String,
    pub listener_name: String,
    pub pool_name: String,
    pub destination_ip: String,
    pub destination_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSpec {
    pub name: String,
    pub protocol: Protocol,
}

#[derive(Debug, Snafu)]
pub enum BackendError {
    #[snafu(display("backend transport error: {message}"))]
    Transport { message: String },
    #[snafu(display("timed out after {waited:?} waiting for {resource} to become active"))]
    Timeout { resource: String, waited: Duration },
}

type Result<T, E = BackendError> = std::result::Result<T, E>;

/// The backend-dispatch surface the reconcile engine drives. `ensure_*`
/// calls are an idempotent update-or-create, recreating or updating a
/// resource that has drifted; `delete_*` calls are idempotent against
/// not-found.
#[async_trait]
pub trait LbBackend: Send + Sync {
    async fn ensure_pool(&self, spec: &PoolSpec) -> Result<()>;
    async fn ensure_listener(&self, spec: &ListenerSpec) -> Result<()>;
    async fn ensure_virtual_server(&self, spec: &VirtualServerSpec) -> Result<()>;
    async fn ensure_monitor(&self, spec: &MonitorSpec) -> Result<()>;

    async fn delete_pool(&self, name: &str) -> Result<()>;
    async fn delete_listener(&self, name: &str) -> Result<()>;
    async fn delete_virtual_server(&self, name: &str) -> Result<()>;
    async fn delete_monitor(&self, name: &str) -> Result<()>;

    /// Bounded poll for backends whose `ensure_virtual_server` returns
    /// before the resource is actually serving traffic (e.g. a cloud LB
    /// going ACTIVE). Default policy is 5 minutes at a 2-second
    /// interval; backends that program synchronously can just return
    /// `Ok(())` immediately. Default policy elsewhere in this module is
    /// a 5 minute timeout at a 2 second poll interval.
    async fn wait_until_active(&self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }
}

/// Polls `probe` every `interval` until it reports ready or `timeout`
/// elapses. Shared by backend implementations that need a bounded
/// wait for a resource to come up.
pub async fn poll_until_active<F, Fut>(resource: &str, timeout: Duration, interval: Duration, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return TimeoutSnafu {
                resource: resource.to_string(),
                waited: timeout,
            }
            .fail();
        }
        tokio::time::sleep(interval).await;
    }
}

/// In-memory backend used by tests and as a reference implementation of
/// the resource invariants this module enforces: one listener per
/// (bind-IP, bind-port), idempotent monitor destruction.
#[derive(Default)]
pub struct MemoryBackend {
    state: tokio::sync::Mutex<MemoryBackendState>,
}

#[derive(Default)]
struct MemoryBackendState {
    pools: std::collections::HashMap<String, PoolSpec>,
    listeners: std::collections::HashMap<String, ListenerSpec>,
    virtual_servers: std::collections::HashMap<String, VirtualServerSpec>,
    monitors: HashSet<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listener_keys(&self) -> Vec<(String, u16)> {
        self.state
            .lock()
            .await
            .listeners
            .values()
            .map(|l| (l.bind_ip.clone(), l.bind_port))
            .collect()
    }

    pub async fn pool_members(&self, name: &str) -> Option<Vec<PoolMember>> {
        self.state.lock().await.pools.get(name).map(|p| p.members.clone())
    }
}

#[async_trait]
impl LbBackend for MemoryBackend {
    async fn ensure_pool(&self, spec: &PoolSpec) -> Result<()> {
        self.state.lock().await.pools.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn ensure_listener(&self, spec: &ListenerSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        // Invariant: exactly one listener per (bind-IP, bind-port).
        state
            .listeners
            .retain(|name, l| name == &spec.name || (l.bind_ip != spec.bind_ip || l.bind_port != spec.bind_port));
        state.listeners.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn ensure_virtual_server(&self, spec: &VirtualServerSpec) -> Result<()> {
        self.state
            .lock()
            .await
            .virtual_servers
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn ensure_monitor(&self, spec: &MonitorSpec) -> Result<()> {
        self.state.lock().await.monitors.insert(spec.name.clone());
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.state.lock().await.pools.remove(name);
        Ok(())
    }

    async fn delete_listener(&self, name: &str) -> Result<()> {
        self.state.lock().await.listeners.remove(name);
        Ok(())
    }

    async fn delete_virtual_server(&self, name: &str) -> Result<()> {
        self.state.lock().await.virtual_servers.remove(name);
        Ok(())
    }

    async fn delete_monitor(&self, name: &str) -> Result<()> {
        self.state.lock().await.monitors.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensuring_a_listener_on_a_taken_bind_address_replaces_the_old_one() {
        let backend = MemoryBackend::new();
        backend
            .ensure_listener(&ListenerSpec {
                name: "l1".into(),
                bind_ip: "10.0.0.5".into(),
                bind_port: 443,
                protocol: Protocol::Tcp,
            })
            .await
            .unwrap();
        backend
            .ensure_listener(&ListenerSpec {
                name: "l2".into(),
                bind_ip: "10.0.0.5".into(),
                bind_port: 443,
                protocol: Protocol::Http,
            })
            .await
            .unwrap();
        assert_eq!(backend.listener_keys().await, vec![("10.0.0.5".to_string(), 443)]);
    }

    #[tokio::test]
    async fn monitor_deletion_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.delete_monitor("never-created").await.unwrap();
        backend
            .ensure_monitor(&MonitorSpec {
                name: "m1".into(),
                protocol: Protocol::Tcp,
            })
            .await
            .unwrap();
        backend.delete_monitor("m1").await.unwrap();
        backend.delete_monitor("m1").await.unwrap();
    }

    #[tokio::test]
    async fn poll_until_active_times_out() {
        let result = poll_until_active("vserver-1", Duration::from_millis(20), Duration::from_millis(5), || async {
            Ok(false)
        })
        .await;
        assert!(matches!(result, Err(BackendError::Timeout { .. })));
    }
}
