//! Virtual-IP allocation from a configured range, persisted in a
//! key/value store (a Kubernetes `ConfigMap` in the reconcile engine's
//! case) keyed by IP string, valued by configuration name.
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use snafu::{ensure, Snafu};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("no free address in range {start}-{end}"))]
    ExhaustedRange { start: Ipv4Addr, end: Ipv4Addr },
    #[snafu(display("start address {start} is after end address {end}"))]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Persists the IP↔config map; a `ConfigMap`-backed implementation is
/// provided by the reconcile engine. Kept as a trait so the pool's
/// allocation logic is testable without a cluster.
#[async_trait::async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn load(&self) -> BTreeMap<Ipv4Addr, String>;
    async fn save(&self, assignments: &BTreeMap<Ipv4Addr, String>);
}

/// An in-memory store; used directly by tests and as the seed for the
/// persisted implementations.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<BTreeMap<Ipv4Addr, String>>,
}

#[async_trait::async_trait]
impl AssignmentStore for InMemoryStore {
    async fn load(&self) -> BTreeMap<Ipv4Addr, String> {
        self.inner.lock().await.clone()
    }

    async fn save(&self, assignments: &BTreeMap<Ipv4Addr, String>) {
        *self.inner.lock().await = assignments.clone();
    }
}

/// Persists the IP↔config map as a single cluster `ConfigMap`, keyed by
/// IP string and valued by configuration name. Malformed entries (keys
/// that don't parse as an `Ipv4Addr`) are dropped on load and logged,
/// rather than failing the whole pool.
pub struct ConfigMapStore {
    client: kube::Client,
    namespace: String,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl AssignmentStore for ConfigMapStore {
    async fn load(&self) -> BTreeMap<Ipv4Addr, String> {
        let object = match self.api().get_opt(&self.name).await {
            Ok(object) => object,
            Err(error) => {
                tracing::warn!(%error, "failed to read the IP allocation map, treating as empty");
                return BTreeMap::new();
            }
        };
        object
            .and_then(|o| o.data)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(ip, config)| match ip.parse() {
                Ok(ip) => Some((ip, config)),
                Err(_) => {
                    tracing::warn!(ip, "dropping malformed IP key from the allocation map");
                    None
                }
            })
            .collect()
    }

    async fn save(&self, assignments: &BTreeMap<Ipv4Addr, String>) {
        let data: BTreeMap<String, String> =
            assignments.iter().map(|(ip, config)| (ip.to_string(), config.clone())).collect();
        let api = self.api();
        let existing = match api.get_opt(&self.name).await {
            Ok(existing) => existing,
            Err(error) => {
                tracing::warn!(%error, "failed to read the IP allocation map before saving");
                return;
            }
        };
        let result = match existing {
            Some(mut object) => {
                object.data = Some(data);
                api.replace(&self.name, &PostParams::default(), &object).await
            }
            None => {
                let object = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &object).await
            }
        };
        if let Err(error) = result {
            tracing::warn!(%error, "failed to persist the IP allocation map");
        }
    }
}

/// Allocates virtual IPs from `[start, end]`, persisting the assignment
/// map through an [`AssignmentStore`].
///
/// Concurrency: `alloc_lock` serialises allocation decisions (scanning
/// the range and picking the first free address); `persist_lock`
/// serialises the read-modify-write against the backing store. Both are
/// held only across non-yielding sections; the store I/O itself happens
/// with `persist_lock` held, since a persisted-map write must be totally
/// ordered.
pub struct IpPoolManager<S: AssignmentStore> {
    start: Ipv4Addr,
    end: Ipv4Addr,
    store: S,
    alloc_lock: Mutex<()>,
    persist_lock: Mutex<()>,
}

impl<S: AssignmentStore> IpPoolManager<S> {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, store: S) -> Result<Self> {
        ensure!(u32::from(start) <= u32::from(end), InvalidRangeSnafu { start, end });
        Ok(Self {
            start,
            end,
            store,
            alloc_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
        })
    }

    fn range(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (start, end) = (u32::from(self.start), u32::from(self.end));
        (start..=end).map(Ipv4Addr::from)
    }

    /// Drops entries outside the configured range and entries whose
    /// config is no longer live. Call once at startup.
    pub async fn prune(&self, live_configs: &std::collections::HashSet<String>) {
        let _guard = self.persist_lock.lock().await;
        let mut assignments = self.store.load().await;
        let before = assignments.len();
        assignments.retain(|ip, config| {
            let in_range = u32::from(*ip) >= u32::from(self.start) && u32::from(*ip) <= u32::from(self.end);
            in_range && live_configs.contains(config)
        });
        if assignments.len() != before {
            tracing::info!(
                dropped = before - assignments.len(),
                "pruned stale IP assignments"
            );
            self.store.save(&assignments).await;
        }
    }

    /// Idempotent: returns the existing IP for `config` if one is
    /// already assigned, otherwise allocates the first free address in
    /// ascending order.
    pub async fn generate_ip(&self, config: &str) -> Result<Ipv4Addr> {
        let _alloc_guard = self.alloc_lock.lock().await;

        let assignments = self.store.load().await;
        if let Some((ip, _)) = assignments.iter().find(|(_, c)| c.as_str() == config) {
            return Ok(*ip);
        }
        let taken: std::collections::HashSet<Ipv4Addr> = assignments.keys().copied().collect();
        let free = self
            .range()
            .find(|ip| !taken.contains(ip))
            .context_or_exhausted(self.start, self.end)?;

        let _persist_guard = self.persist_lock.lock().await;
        let mut assignments = self.store.load().await;
        assignments.insert(free, config.to_string());
        self.store.save(&assignments).await;
        Ok(free)
    }

    /// Idempotent: removing an entry that isn't there is a no-op.
    pub async fn delete_ip(&self, config: &str) {
        let _persist_guard = self.persist_lock.lock().await;
        let mut assignments = self.store.load().await;
        let before = assignments.len();
        assignments.retain(|_, c| c != config);
        if assignments.len() != before {
            self.store.save(&assignments).await;
        }
    }
}

trait FindExt {
    fn context_or_exhausted(self, start: Ipv4Addr, end: Ipv4Addr) -> Result<Ipv4Addr>;
}

impl FindExt for Option<Ipv4Addr> {
    fn context_or_exhausted(self, start: Ipv4Addr, end: Ipv4Addr) -> Result<Ipv4Addr> {
        self.ok_or(Error::ExhaustedRange { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(start: &str, end: &str) -> IpPoolManager<InMemoryStore> {
        IpPoolManager::new(start.parse().unwrap(), end.parse().unwrap(), InMemoryStore::default()).unwrap()
    }

    #[tokio::test]
    async fn exhaustion_of_a_two_address_range() {
        let pool = pool("10.0.0.1", "10.0.0.2");
        let a = pool.generate_ip("config-a").await.unwrap();
        let b = pool.generate_ip("config-b").await.unwrap();
        assert_ne!(a, b);
        let err = pool.generate_ip("config-c").await.unwrap_err();
        assert_eq!(err, Error::ExhaustedRange {
            start: "10.0.0.1".parse().unwrap(),
            end: "10.0.0.2".parse().unwrap(),
        });

        let assignments = pool.store.load().await;
        assert_eq!(assignments.len(), 2);
        for ip in assignments.keys() {
            assert!(u32::from(*ip) >= u32::from(a.min(b)) && u32::from(*ip) <= u32::from(a.max(b)));
        }
    }

    #[tokio::test]
    async fn generate_ip_is_idempotent() {
        let pool = pool("10.0.0.1", "10.0.0.10");
        let first = pool.generate_ip("config-a").await.unwrap();
        let second = pool.generate_ip("config-a").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn delete_ip_is_idempotent() {
        let pool = pool("10.0.0.1", "10.0.0.10");
        pool.generate_ip("config-a").await.unwrap();
        pool.delete_ip("config-a").await;
        pool.delete_ip("config-a").await;
        assert!(pool.store.load().await.is_empty());
    }

    #[tokio::test]
    async fn prune_drops_out_of_range_and_dead_configs() {
        let pool = pool("10.0.0.1", "10.0.0.2");
        pool.store
            .save(&BTreeMap::from([
                ("10.0.0.1".parse().unwrap(), "live".to_string()),
                ("10.0.0.2".parse().unwrap(), "dead".to_string()),
                ("10.0.0.99".parse().unwrap(), "out-of-range".to_string()),
            ]))
            .await;
        let live: HashSet<String> = ["live".to_string()].into_iter().collect();
        pool.prune(&live).await;
        let remaining = pool.store.load().await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining.values().all(|c| c == "live"));
    }
}
