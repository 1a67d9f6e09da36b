//! A backend that publishes desired state into the flat
//! `<group>.<field> = value` configuration map instead of calling a
//! programmable LB's control API directly. The separate backend-daemon
//! process reads that map ([`crate::daemon::config`]) and programs a
//! local front-end from it.
use crate::reconcile::backend::{BackendError, ListenerSpec, LbBackend, MonitorSpec, PoolSpec, VirtualServerSpec};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use std::collections::BTreeMap;

type Result<T> = std::result::Result<T, BackendError>;

pub struct ConfigMapBackend {
    client: kube::Client,
    namespace: String,
    name: String,
}

impl ConfigMapBackend {
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

    async fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let api = self.api();
        let transport = |source: kube::Error| BackendError::Transport {
            message: source.to_string(),
        };

        match api.get_opt(&self.name).await.map_err(transport)? {
            Some(mut object) => {
                let mut data = object.data.take().unwrap_or_default();
                f(&mut data);
                object.data = Some(data);
                api.replace(&self.name, &PostParams::default(), &object)
                    .await
                    .map_err(transport)?;
            }
            None => {
                let mut data = BTreeMap::new();
                f(&mut data);
                let object = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &object).await.map_err(transport)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LbBackend for ConfigMapBackend {
    async fn ensure_pool(&self, spec: &PoolSpec) -> Result<()> {
        let protocol = format!("{:?}", spec.protocol).to_lowercase();
        let members = spec
            .members
            .iter()
            .map(|m| format!("{}:{}", m.address, m.port))
            .collect::<Vec<_>>()
            .join(",");
        self.mutate(|data| {
            data.insert(format!("{}.protocol", spec.name), protocol);
            data.insert(format!("{}.members", spec.name), members);
        })
        .await
    }

    async fn ensure_listener(&self, spec: &ListenerSpec) -> Result<()> {
        self.mutate(|data| {
            data.insert(format!("{}.host", spec.name), spec.bind_ip.clone());
            data.insert(format!("{}.bind-ip", spec.name), spec.bind_ip.clone());
            data.insert(format!("{}.bind-port", spec.name), spec.bind_port.to_string());
        })
        .await
    }

    async fn ensure_virtual_server(&self, _spec: &VirtualServerSpec) -> Result<()> {
        // Fully captured by the pool's and listener's fields; the flat
        // schema has no separate virtual-server record.
        Ok(())
    }

    async fn ensure_monitor(&self, _spec: &MonitorSpec) -> Result<()> {
        // The front-end daemon does not run health checks; nothing to
        // publish here.
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        let prefix = format!("{name}.");
        self.mutate(|data| data.retain(|key, _| !key.starts_with(&prefix))).await
    }

    async fn delete_listener(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_virtual_server(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_monitor(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
