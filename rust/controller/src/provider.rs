//! The cloud provider facade: the uniform interface the rest of the
//! system sees, wrapping a [`CloudManager`] configured either with a
//! static list of node groups or with auto-discovery.
use crate::cloud::{CloudManager, NodeGroup};
use crate::nodegroup_spec::{self, NodeGroupSpec};
use crate::noderef::NodeRef;
use async_trait::async_trait;
use snafu::{ensure, Snafu};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid node group spec {raw:?}"))]
    InvalidSpec {
        raw: String,
        source: nodegroup_spec::Error,
    },
    #[snafu(display("selector {raw:?} must have the form <kind>:<param>=<value>"))]
    MalformedSelector { raw: String },
    #[snafu(display("selector kind {kind:?} is not supported by this provider"))]
    UnsupportedSelectorKind { kind: String },
    #[snafu(display("exactly one of --nodes or --node-group-auto-discovery is required"))]
    NoGroupSource,
    #[snafu(display("cloud manager error"))]
    Manager { source: crate::cloud::ManagerError },
    #[snafu(display("auto-discovery request failed"))]
    Discovery { source: crate::cloud::ClientError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A `<kind>:<param>=<value>` auto-discovery selector, e.g.
/// `asg:tag=k8s.io/cluster-autoscaler/enabled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySelector {
    pub kind: String,
    pub param: String,
    pub value: String,
}

impl DiscoverySelector {
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || MalformedSelectorSnafu { raw }.build();
        let (kind, rest) = raw.split_once(':').ok_or_else(malformed)?;
        let (param, value) = rest.split_once('=').ok_or_else(malformed)?;
        ensure!(!kind.is_empty() && !param.is_empty(), MalformedSelectorSnafu { raw });
        Ok(Self {
            kind: kind.to_string(),
            param: param.to_string(),
            value: value.to_string(),
        })
    }
}

/// A cloud group lister used for tag-based auto-discovery; a thin
/// adapter over whatever bulk-listing call a provider's fleet API
/// exposes. Kept separate from [`crate::cloud::client`] because
/// discovery lists *groups*, not group members.
#[async_trait]
pub trait GroupDiscovery: Send + Sync {
    async fn discover(&self, selector: &DiscoverySelector) -> Result<Vec<NodeGroup>>;
}

/// How this facade's registered set was established at boot.
pub enum GroupSource {
    Static(Vec<NodeGroupSpec>),
    AutoDiscovery(DiscoverySelector),
}

impl GroupSource {
    /// `--nodes` and `--node-group-auto-discovery` are mutually
    /// exclusive; an empty pair is fatal.
    pub fn from_cli(nodes: &[String], auto_discovery: Option<&str>) -> Result<Self> {
        match (nodes.is_empty(), auto_discovery) {
            (false, None) => {
                let specs = nodes
                    .iter()
                    .map(|raw| NodeGroupSpec::parse(raw).map_err(|source| Error::InvalidSpec {
                        raw: raw.clone(),
                        source,
                    }))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Static(specs))
            }
            (true, Some(selector)) => Ok(Self::AutoDiscovery(DiscoverySelector::parse(selector)?)),
            _ => NoGroupSourceSnafu.fail(),
        }
    }
}

pub struct CloudProviderFacade {
    name: String,
    manager: Arc<CloudManager>,
    discovery: Option<(Arc<dyn GroupDiscovery>, DiscoverySelector)>,
}

impl CloudProviderFacade {
    pub async fn new(
        name: impl Into<String>,
        manager: Arc<CloudManager>,
        source: GroupSource,
        discovery_backend: Option<Arc<dyn GroupDiscovery>>,
    ) -> Result<Self> {
        let name = name.into();
        let discovery = match source {
            GroupSource::Static(specs) => {
                for spec in &specs {
                    manager.register_group(NodeGroup::from_spec(spec)).await;
                }
                None
            }
            GroupSource::AutoDiscovery(selector) => {
                let backend = discovery_backend.expect("auto-discovery selected without a discovery backend");
                let groups = backend.discover(&selector).await?;
                for group in groups {
                    manager.register_group(group).await;
                }
                Some((backend, selector))
            }
        };
        Ok(Self {
            name,
            manager,
            discovery,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn list_node_groups(&self) -> Vec<NodeGroup> {
        self.manager.registered_groups().await
    }

    pub async fn group_for_node(&self, node: &NodeRef) -> Result<Option<NodeGroup>> {
        self.manager.get_group_for(node).await.map_err(|source| Error::Manager { source })
    }

    /// Re-lists the discovery selector and reconciles the registered set
    /// against the cloud: adds groups that newly match, drops groups
    /// that no longer do (DESIGN.md: auto-discovery does remove stale
    /// groups).
    pub async fn reconcile_discovery_once(&self) -> Result<()> {
        let Some((backend, selector)) = &self.discovery else {
            return Ok(());
        };
        let discovered = backend.discover(selector).await?;
        let discovered_ids: HashSet<String> = discovered.iter().map(|g| g.identifier.clone()).collect();
        let registered_ids: HashSet<String> = self
            .manager
            .registered_groups()
            .await
            .into_iter()
            .map(|g| g.identifier)
            .collect();

        for group in discovered {
            if !registered_ids.contains(&group.identifier) {
                tracing::info!(identifier = %group.identifier, "auto-discovery added node group");
                self.manager.register_group(group).await;
            }
        }
        for stale in registered_ids.difference(&discovered_ids) {
            tracing::info!(identifier = %stale, "auto-discovery dropped node group");
            self.manager.unregister_group(stale).await;
        }
        Ok(())
    }

    /// Spawns the periodic auto-discovery reconciliation tick; a no-op
    /// loop for static facades.
    pub fn spawn_discovery_ticker(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if self.discovery.is_none() {
                return;
            }
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = self.reconcile_discovery_once().await {
                    tracing::warn!(%error, "auto-discovery tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("asg:tag=k8s.io/enabled", "asg", "tag", "k8s.io/enabled")]
    #[case("mig:zone=us-central1-a", "mig", "zone", "us-central1-a")]
    fn parses_selector(#[case] raw: &str, #[case] kind: &str, #[case] param: &str, #[case] value: &str) {
        let selector = DiscoverySelector::parse(raw).unwrap();
        assert_eq!(selector.kind, kind);
        assert_eq!(selector.param, param);
        assert_eq!(selector.value, value);
    }

    #[rstest]
    #[case("no-colon-or-equals")]
    #[case("kind-only:")]
    #[case(":param=value")]
    fn rejects_malformed_selector(#[case] raw: &str) {
        assert!(DiscoverySelector::parse(raw).is_err());
    }

    #[test]
    fn group_source_requires_exactly_one_of_nodes_or_discovery() {
        assert!(GroupSource::from_cli(&[], None).is_err());
        assert!(GroupSource::from_cli(&["1:2:a".to_string()], Some("asg:tag=x")).is_err());
        assert!(GroupSource::from_cli(&["1:2:a".to_string()], None).is_ok());
        assert!(GroupSource::from_cli(&[], Some("asg:tag=x")).is_ok());
    }
}
