//! Owns the cloud API clients and the registered set of node groups;
//! maintains the identity→group cache and implements size/delete
//! operations against the fleet.
use crate::cloud::client::{AutoscalingClient, ClientError, ComputeClient};
use crate::cloud::group::{LaunchTemplate, NodeGroup};
use crate::noderef::NodeRef;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("node group {identifier} is not registered"))]
    GroupNotFound { identifier: String },
    #[snafu(display("cloud API call failed"))]
    Client { source: ClientError },
    #[snafu(display(
        "increasing {identifier} by {delta} would bring target above max {max} (current target {target})"
    ))]
    SizeAboveMax {
        identifier: String,
        target: i64,
        delta: i64,
        max: i64,
    },
    #[snafu(display(
        "decreasing {identifier} by {delta} would bring target below its {current} running nodes"
    ))]
    WouldDeleteRunningNode {
        identifier: String,
        delta: i64,
        current: i64,
    },
    #[snafu(display(
        "decreasing {identifier} by {delta} would bring target below min size {min} (would-be target {target})"
    ))]
    SizeBelowMin {
        identifier: String,
        target: i64,
        delta: i64,
        min: i64,
    },
    #[snafu(display("node group {identifier} has reached its min size, refusing delete"))]
    AtMinSize { identifier: String },
    #[snafu(display("refs span more than one node group: {first} and {second}"))]
    MixedOwnership { first: String, second: String },
    #[snafu(display("node ref {node_ref} does not belong to any registered group"))]
    RefNotInAnyGroup { node_ref: NodeRef },
    #[snafu(display("IncreaseSize requires a positive delta, got {delta}"))]
    NonPositiveDelta { delta: i64 },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Default)]
struct ManagerState {
    groups: HashMap<String, NodeGroup>,
    /// Invariant: a subset of the union of registered groups' memberships.
    identity_cache: HashMap<NodeRef, String>,
}

pub struct CloudManager {
    state: RwLock<ManagerState>,
    autoscaling: Arc<dyn AutoscalingClient>,
    compute: Arc<dyn ComputeClient>,
}

impl CloudManager {
    pub fn new(autoscaling: Arc<dyn AutoscalingClient>, compute: Arc<dyn ComputeClient>) -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            autoscaling,
            compute,
        }
    }

    pub async fn register_group(&self, group: NodeGroup) {
        let mut state = self.state.write().await;
        tracing::info!(identifier = %group.identifier, "registering node group");
        state.groups.insert(group.identifier.clone(), group);
    }

    pub async fn unregister_group(&self, identifier: &str) {
        let mut state = self.state.write().await;
        state.groups.remove(identifier);
        state.identity_cache.retain(|_, owner| owner != identifier);
    }

    pub async fn registered_groups(&self) -> Vec<NodeGroup> {
        let state = self.state.read().await;
        state.groups.values().cloned().collect()
    }

    pub async fn get_size(&self, identifier: &str) -> Result<i64> {
        self.require_registered(identifier).await?;
        self.autoscaling
            .target_size(identifier)
            .await
            .context(ClientSnafu)
    }

    /// Unconditional size mutation; `increase_size`/`decrease_target_size`
    /// below add the policy checks callers are expected to go through.
    pub async fn set_size(&self, identifier: &str, new_size: i64) -> Result<()> {
        self.require_registered(identifier).await?;
        self.autoscaling
            .set_target_size(identifier, new_size)
            .await
            .context(ClientSnafu)
    }

    pub async fn list_group_members(&self, identifier: &str) -> Result<Vec<NodeRef>> {
        self.require_registered(identifier).await?;
        self.compute
            .list_group_members(identifier)
            .await
            .context(ClientSnafu)
    }

    /// Looks `node_ref` up in the identity cache; on a miss,
    /// regenerates the whole cache once and checks again.
    pub async fn get_group_for(&self, node_ref: &NodeRef) -> Result<Option<NodeGroup>> {
        {
            let state = self.state.read().await;
            if let Some(owner) = state.identity_cache.get(node_ref) {
                return Ok(state.groups.get(owner).cloned());
            }
        }
        self.regenerate_cache().await?;
        let state = self.state.read().await;
        Ok(state
            .identity_cache
            .get(node_ref)
            .and_then(|owner| state.groups.get(owner))
            .cloned())
    }

    /// Rebuilds the identity→group cache from scratch under the single
    /// writer lock. A partial failure (one group's member list fails to
    /// fetch) aborts the whole rebuild and leaves the previous cache in
    /// place: stale reads beat a cleared cache. Also fetches each
    /// group's launch template the first time its members are listed;
    /// a failed or empty fetch is logged and retried on the next pass
    /// rather than aborting the rebuild.
    pub async fn regenerate_cache(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let groups: Vec<NodeGroup> = state.groups.values().cloned().collect();

        let mut rebuilt = HashMap::new();
        let mut launch_templates: HashMap<String, LaunchTemplate> = HashMap::new();
        for group in &groups {
            let members = self
                .compute
                .list_group_members(&group.identifier)
                .await
                .context(ClientSnafu)?;
            for member in members {
                rebuilt.insert(member, group.identifier.clone());
            }

            if group.launch_template.is_none() {
                match self.compute.launch_template(&group.identifier).await {
                    Ok(Some(template)) => {
                        launch_templates.insert(group.identifier.clone(), template);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(identifier = %group.identifier, %error, "failed to fetch launch template");
                    }
                }
            }
        }

        for (identifier, template) in launch_templates {
            if let Some(group) = state.groups.get_mut(&identifier) {
                group.launch_template = Some(template);
            }
        }

        tracing::debug!(entries = rebuilt.len(), "regenerated identity cache");
        state.identity_cache = rebuilt;
        Ok(())
    }

    /// Spawns the hourly cache-regeneration ticker. Returns a handle;
    /// dropping/aborting it halts the ticker at its next suspension
    /// point.
    pub fn spawn_cache_ticker(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = self.regenerate_cache().await {
                    tracing::warn!(%error, "periodic cache regeneration failed, keeping stale cache");
                }
            }
        })
    }

    /// All refs must belong to the same group; the cloud API call is
    /// issued once per group (here: exactly one, since mixed ownership
    /// is rejected up front).
    pub async fn delete_instances(&self, refs: &[NodeRef]) -> Result<()> {
        let mut owning_group: Option<String> = None;
        for node_ref in refs {
            let group = self
                .get_group_for(node_ref)
                .await?
                .with_context(|| RefNotInAnyGroupSnafu {
                    node_ref: node_ref.clone(),
                })?;
            match &owning_group {
                None => owning_group = Some(group.identifier),
                Some(first) if *first != group.identifier => {
                    return MixedOwnershipSnafu {
                        first: first.clone(),
                        second: group.identifier,
                    }
                    .fail();
                }
                Some(_) => {}
            }
        }
        let Some(identifier) = owning_group else {
            return Ok(());
        };
        let names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        self.autoscaling
            .delete_instances(&identifier, &names)
            .await
            .context(ClientSnafu)
    }

    /// `IncreaseSize(δ>0)`: reject if `target+δ > max`; otherwise fetch
    /// the authoritative target from the cloud, add δ, and set it.
    pub async fn increase_size(&self, identifier: &str, delta: i64) -> Result<()> {
        let group = self.require_registered(identifier).await?;
        ensure!(delta > 0, NonPositiveDeltaSnafu { delta });
        let target = self.get_size(identifier).await?;
        let new_target = target + delta;
        ensure!(
            group.size_in_bounds(new_target),
            SizeAboveMaxSnafu {
                identifier: identifier.to_string(),
                target,
                delta,
                max: group.max_size,
            }
        );
        self.set_size(identifier, new_target).await
    }

    /// `DecreaseTargetSize(δ<0)`: reject if it would reduce target below
    /// the count of existing nodes (never deletes a running node) or
    /// below the group's min size (the `min_size ≤ target_size`
    /// invariant holds at all times, not just after `IncreaseSize`).
    pub async fn decrease_target_size(&self, identifier: &str, delta: i64) -> Result<()> {
        let group = self.require_registered(identifier).await?;
        let target = self.get_size(identifier).await?;
        let current = self.list_group_members(identifier).await?.len() as i64;
        let new_target = target + delta;
        ensure!(
            new_target >= current,
            WouldDeleteRunningNodeSnafu {
                identifier: identifier.to_string(),
                delta,
                current,
            }
        );
        ensure!(
            group.size_in_bounds(new_target),
            SizeBelowMinSnafu {
                identifier: identifier.to_string(),
                target: new_target,
                delta,
                min: group.min_size,
            }
        );
        self.set_size(identifier, new_target).await
    }

    /// `DeleteNodes(nodes[])`: reject if `target ≤ min`; validate
    /// membership; delete via the cloud API. The cloud decrements
    /// target as a side effect.
    pub async fn delete_nodes(&self, identifier: &str, nodes: &[NodeRef]) -> Result<()> {
        let group = self.require_registered(identifier).await?;
        let target = self.get_size(identifier).await?;
        ensure!(
            target > group.min_size,
            AtMinSizeSnafu {
                identifier: identifier.to_string(),
            }
        );
        self.delete_instances(nodes).await
    }

    async fn require_registered(&self, identifier: &str) -> Result<NodeGroup> {
        let state = self.state.read().await;
        state
            .groups
            .get(identifier)
            .cloned()
            .context(GroupNotFoundSnafu {
                identifier: identifier.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::client::fake::FakeFleetClient;
    use rstest::rstest;

    fn manager_with(fake: Arc<FakeFleetClient>) -> CloudManager {
        CloudManager::new(fake.clone(), fake)
    }

    #[tokio::test]
    async fn increase_size_beyond_max_is_rejected() {
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 4, vec![]).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 1, 5)).await;

        let err = manager.increase_size("g1", 2).await.unwrap_err();
        assert!(matches!(err, Error::SizeAboveMax { .. }));
        assert_eq!(manager.get_size("g1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn delete_nodes_at_min_is_rejected() {
        let members = vec![
            NodeRef::new("aws", "us-east-1a", "i-1"),
            NodeRef::new("aws", "us-east-1a", "i-2"),
            NodeRef::new("aws", "us-east-1a", "i-3"),
        ];
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 3, members.clone()).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 3, 10)).await;

        let err = manager
            .delete_nodes("g1", &members[..1])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AtMinSize { .. }));
    }

    #[tokio::test]
    async fn decrease_target_size_below_min_is_rejected() {
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 3, vec![]).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 3, 10)).await;

        let err = manager.decrease_target_size("g1", -1).await.unwrap_err();
        assert!(matches!(err, Error::SizeBelowMin { .. }));
        assert_eq!(manager.get_size("g1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_instances_rejects_mixed_ownership() {
        let a = NodeRef::new("aws", "us-east-1a", "i-a");
        let b = NodeRef::new("aws", "us-east-1a", "i-b");
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 2, vec![a.clone()]).await;
        fake.seed("g2", 2, vec![b.clone()]).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 1, 5)).await;
        manager.register_group(NodeGroup::new("g2", 1, 5)).await;

        let err = manager.delete_instances(&[a, b]).await.unwrap_err();
        assert!(matches!(err, Error::MixedOwnership { .. }));
    }

    #[tokio::test]
    async fn increase_then_decrease_is_a_no_op() {
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 4, vec![]).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 1, 10)).await;

        manager.increase_size("g1", 2).await.unwrap();
        assert_eq!(manager.get_size("g1").await.unwrap(), 6);
        manager.decrease_target_size("g1", -2).await.unwrap();
        assert_eq!(manager.get_size("g1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn regenerate_cache_populates_launch_template_once() {
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 1, vec![]).await;
        fake.seed_launch_template(
            "g1",
            LaunchTemplate {
                instance_type: "m5.large".to_string(),
                availability_zones: vec!["us-east-1a".to_string()],
                spot_price_hint: Some(0.04),
            },
        )
        .await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 1, 5)).await;
        assert!(manager.registered_groups().await[0].launch_template.is_none());

        manager.regenerate_cache().await.unwrap();

        let group = manager.registered_groups().await.into_iter().next().unwrap();
        let template = group.launch_template.expect("launch template should be cached");
        assert_eq!(template.instance_type, "m5.large");
        assert_eq!(template.spot_price_hint, Some(0.04));
    }

    #[rstest]
    #[tokio::test]
    async fn cache_regeneration_survives_miss_then_hit() {
        let node = NodeRef::new("aws", "us-east-1a", "i-1");
        let fake = Arc::new(FakeFleetClient::new());
        fake.seed("g1", 1, vec![node.clone()]).await;
        let manager = manager_with(fake);
        manager.register_group(NodeGroup::new("g1", 1, 5)).await;

        let found = manager.get_group_for(&node).await.unwrap();
        assert_eq!(found.unwrap().identifier, "g1");

        let unknown = NodeRef::new("aws", "us-east-1a", "i-missing");
        assert!(manager.get_group_for(&unknown).await.unwrap().is_none());
    }
}
