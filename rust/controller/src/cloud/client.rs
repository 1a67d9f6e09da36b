//! Long-lived cloud API clients: one for the compute/instance service
//! (listing group members) and one for the autoscaling/scale-set service
//! (reading and mutating target size, deleting instances). Credentials
//! are supplied by the caller; this module does not implement
//! authentication.
use crate::cloud::group::{LaunchTemplate, NodeGroup};
use crate::noderef::NodeRef;
use crate::provider::{DiscoverySelector, GroupDiscovery};
use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("transport error talking to the fleet API"))]
    Transport { source: reqwest::Error },
    #[snafu(display("group {group} not found"))]
    NotFound { group: String },
    #[snafu(display("fleet API returned a malformed node ref {raw:?}"))]
    MalformedNodeRef {
        raw: String,
        source: crate::noderef::Error,
    },
}

type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Autoscaling/scale-set service: authoritative target size and the
/// mutations the manager is allowed to perform.
#[async_trait]
pub trait AutoscalingClient: Send + Sync {
    async fn target_size(&self, group_identifier: &str) -> Result<i64>;
    async fn set_target_size(&self, group_identifier: &str, size: i64) -> Result<()>;
    async fn delete_instances(&self, group_identifier: &str, instance_names: &[String]) -> Result<()>;
}

/// Compute/instance service: current membership of a group.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Lists every member of `group_identifier`, following pagination
    /// internally so callers always see the complete set.
    async fn list_group_members(&self, group_identifier: &str) -> Result<Vec<NodeRef>>;

    /// The group's launch template, if the fleet API has one on record
    /// yet. `None` (not an error) means the group exists but no
    /// template is attached, e.g. while it is still being created.
    async fn launch_template(&self, group_identifier: &str) -> Result<Option<LaunchTemplate>>;
}

/// A paginated page of raw provider ids, as returned by the fleet API.
#[derive(Debug, serde::Deserialize)]
struct InstancePage {
    #[serde(default)]
    provider_ids: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct TargetSizeResponse {
    target_size: i64,
}

#[derive(Debug, serde::Deserialize)]
struct GroupSummary {
    identifier: String,
    min_size: i64,
    max_size: i64,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, serde::Deserialize)]
struct GroupListResponse {
    #[serde(default)]
    groups: Vec<GroupSummary>,
}

#[derive(Debug, serde::Deserialize)]
struct LaunchTemplateResponse {
    instance_type: String,
    #[serde(default)]
    availability_zones: Vec<String>,
    #[serde(default)]
    spot_price_hint: Option<f64>,
}

/// `reqwest`-backed implementation talking to a JSON fleet API. The base
/// URL and bearer token are resolved once at startup from the cloud
/// config file / environment.
pub struct HttpFleetClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl HttpFleetClient {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    fn group_url(&self, group_identifier: &str, path: &str) -> String {
        format!("{}/groups/{}/{}", self.base_url, group_identifier, path)
    }
}

#[async_trait]
impl AutoscalingClient for HttpFleetClient {
    async fn target_size(&self, group_identifier: &str) -> Result<i64> {
        let resp: TargetSizeResponse = self
            .http
            .get(self.group_url(group_identifier, "target-size"))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context(TransportSnafu)?
            .error_for_status()
            .context(TransportSnafu)?
            .json()
            .await
            .context(TransportSnafu)?;
        Ok(resp.target_size)
    }

    async fn set_target_size(&self, group_identifier: &str, size: i64) -> Result<()> {
        self.http
            .put(self.group_url(group_identifier, "target-size"))
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "target_size": size }))
            .send()
            .await
            .context(TransportSnafu)?
            .error_for_status()
            .context(TransportSnafu)?;
        Ok(())
    }

    async fn delete_instances(&self, group_identifier: &str, instance_names: &[String]) -> Result<()> {
        self.http
            .post(self.group_url(group_identifier, "delete-instances"))
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "instances": instance_names }))
            .send()
            .await
            .context(TransportSnafu)?
            .error_for_status()
            .context(TransportSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl ComputeClient for HttpFleetClient {
    async fn list_group_members(&self, group_identifier: &str) -> Result<Vec<NodeRef>> {
        let mut members = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .http
                .get(self.group_url(group_identifier, "members"))
                .bearer_auth(&self.bearer_token);
            if let Some(token) = &page_token {
                req = req.query(&[("page_token", token)]);
            }
            let page: InstancePage = req
                .send()
                .await
                .context(TransportSnafu)?
                .error_for_status()
                .context(TransportSnafu)?
                .json()
                .await
                .context(TransportSnafu)?;
            for raw in &page.provider_ids {
                let node_ref = NodeRef::parse(raw).with_context(|_| MalformedNodeRefSnafu { raw: raw.clone() })?;
                members.push(node_ref);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(members)
    }

    async fn launch_template(&self, group_identifier: &str) -> Result<Option<LaunchTemplate>> {
        let resp = self
            .http
            .get(self.group_url(group_identifier, "launch-template"))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context(TransportSnafu)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp: LaunchTemplateResponse = resp.error_for_status().context(TransportSnafu)?.json().await.context(TransportSnafu)?;
        Ok(Some(LaunchTemplate {
            instance_type: resp.instance_type,
            availability_zones: resp.availability_zones,
            spot_price_hint: resp.spot_price_hint,
        }))
    }
}

/// Tag-based auto-discovery: lists every group the fleet API reports as
/// matching `selector`. A thin wrapper over the same base URL and
/// credentials used for sizing and membership calls.
#[async_trait]
impl GroupDiscovery for HttpFleetClient {
    async fn discover(&self, selector: &DiscoverySelector) -> std::result::Result<Vec<NodeGroup>, crate::provider::Error> {
        let response: GroupListResponse = self
            .http
            .get(format!("{}/groups", self.base_url))
            .bearer_auth(&self.bearer_token)
            .query(&[
                ("selector_kind", selector.kind.as_str()),
                ("selector_param", selector.param.as_str()),
                ("selector_value", selector.value.as_str()),
            ])
            .send()
            .await
            .context(TransportSnafu)
            .map_err(|source| crate::provider::Error::Discovery { source })?
            .error_for_status()
            .context(TransportSnafu)
            .map_err(|source| crate::provider::Error::Discovery { source })?
            .json()
            .await
            .context(TransportSnafu)
            .map_err(|source| crate::provider::Error::Discovery { source })?;
        Ok(response
            .groups
            .into_iter()
            .map(|g| {
                let mut group = NodeGroup::new(g.identifier, g.min_size, g.max_size);
                group.cost = g.cost;
                group
            })
            .collect())
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory fake used by manager/engine tests; never reached by
    //! production code paths.
    use super::*;
    use snafu::OptionExt;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct GroupState {
        target_size: i64,
        members: Vec<NodeRef>,
        launch_template: Option<LaunchTemplate>,
    }

    #[derive(Default)]
    pub struct FakeFleetClient {
        groups: Mutex<HashMap<String, GroupState>>,
    }

    impl FakeFleetClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed(&self, group: &str, target_size: i64, members: Vec<NodeRef>) {
            let mut guard = self.groups.lock().await;
            guard.insert(
                group.to_string(),
                GroupState {
                    target_size,
                    members,
                    launch_template: None,
                },
            );
        }

        pub async fn seed_launch_template(&self, group: &str, template: LaunchTemplate) {
            let mut guard = self.groups.lock().await;
            if let Some(state) = guard.get_mut(group) {
                state.launch_template = Some(template);
            }
        }
    }

    #[async_trait]
    impl AutoscalingClient for FakeFleetClient {
        async fn target_size(&self, group_identifier: &str) -> Result<i64> {
            let guard = self.groups.lock().await;
            guard
                .get(group_identifier)
                .map(|g| g.target_size)
                .context(NotFoundSnafu {
                    group: group_identifier,
                })
        }

        async fn set_target_size(&self, group_identifier: &str, size: i64) -> Result<()> {
            let mut guard = self.groups.lock().await;
            let group = guard.get_mut(group_identifier).context(NotFoundSnafu {
                group: group_identifier,
            })?;
            group.target_size = size;
            Ok(())
        }

        async fn delete_instances(&self, group_identifier: &str, instance_names: &[String]) -> Result<()> {
            let mut guard = self.groups.lock().await;
            let group = guard.get_mut(group_identifier).context(NotFoundSnafu {
                group: group_identifier,
            })?;
            group.members.retain(|m| !instance_names.contains(&m.name));
            group.target_size -= instance_names.len() as i64;
            Ok(())
        }
    }

    #[async_trait]
    impl ComputeClient for FakeFleetClient {
        async fn list_group_members(&self, group_identifier: &str) -> Result<Vec<NodeRef>> {
            let guard = self.groups.lock().await;
            Ok(guard
                .get(group_identifier)
                .map(|g| g.members.clone())
                .unwrap_or_default())
        }

        async fn launch_template(&self, group_identifier: &str) -> Result<Option<LaunchTemplate>> {
            let guard = self.groups.lock().await;
            Ok(guard.get(group_identifier).and_then(|g| g.launch_template.clone()))
        }
    }
}
