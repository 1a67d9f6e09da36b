//! Resolves a load-balancer configuration's `target-service-name` to
//! the service's cluster IP and port list via the cluster API client.
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("target service {namespace}/{name} not found"))]
    NotFound { namespace: String, name: String },
    #[snafu(display("cluster API error resolving service {namespace}/{name}"))]
    Kube {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("service {namespace}/{name} has no cluster IP"))]
    NoClusterIp { namespace: String, name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPort {
    pub name: Option<String>,
    pub port: i32,
    pub node_port: Option<i32>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub cluster_ip: String,
    pub ports: Vec<ResolvedPort>,
}

impl ResolvedService {
    /// Selects a single port by name, or the only port if the
    /// configuration didn't name one (`target-port-name` absent).
    pub fn select_port(&self, name: Option<&str>) -> Option<&ResolvedPort> {
        match name {
            Some(name) => self.ports.iter().find(|p| p.name.as_deref() == Some(name)),
            None => self.ports.first(),
        }
    }
}

#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, service_name: &str) -> Result<ResolvedService>;
}

pub struct KubeServiceResolver {
    client: kube::Client,
}

impl KubeServiceResolver {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceResolver for KubeServiceResolver {
    async fn resolve(&self, namespace: &str, service_name: &str) -> Result<ResolvedService> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get(service_name).await.context(KubeSnafu {
            namespace: namespace.to_string(),
            name: service_name.to_string(),
        })?;
        let spec = svc.spec.context(NotFoundSnafu {
            namespace: namespace.to_string(),
            name: service_name.to_string(),
        })?;
        let cluster_ip = spec
            .cluster_ip
            .filter(|ip| ip != "None")
            .context(NoClusterIpSnafu {
                namespace: namespace.to_string(),
                name: service_name.to_string(),
            })?;
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| ResolvedPort {
                name: p.name,
                port: p.port,
                node_port: p.node_port,
                protocol: p.protocol.unwrap_or_else(|| "TCP".to_string()),
            })
            .collect();
        Ok(ResolvedService { cluster_ip, ports })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeServiceResolver {
        pub services: HashMap<(String, String), ResolvedService>,
    }

    #[async_trait]
    impl ServiceResolver for FakeServiceResolver {
        async fn resolve(&self, namespace: &str, service_name: &str) -> Result<ResolvedService> {
            self.services
                .get(&(namespace.to_string(), service_name.to_string()))
                .cloned()
                .context(NotFoundSnafu {
                    namespace: namespace.to_string(),
                    name: service_name.to_string(),
                })
        }
    }
}
