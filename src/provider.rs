//! Load-balancer provider contract
//!
//! The controller talks to load-balancer implementations only through
//! [`LoadBalancerProvider`]. Implementations are looked up by name in a
//! [`ProviderRegistry`]; each factory receives the parsed configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lb::{load_balancer_name, OneLoadBalancer};
use crate::one::XmlRpcClient;

/// Name of the OpenNebula virtual-router provider
pub const OPENNEBULA: &str = "opennebula";

#[async_trait]
pub trait LoadBalancerProvider: Send + Sync {
    /// Deterministic `<cluster>-<namespace>-<name>`
    fn get_load_balancer_name(&self, cluster: &str, service: &Service) -> String;

    /// Current status, or `None` when the load balancer does not exist
    async fn get_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>>;

    async fn ensure_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus>;

    async fn update_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<()>;

    async fn ensure_load_balancer_deleted(&self, cluster: &str, service: &Service) -> Result<()>;
}

/// Status publishing a single ingress address
pub fn ingress_status(ip: impl Into<String>) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            ip: Some(ip.into()),
            ..Default::default()
        }]),
    }
}

#[async_trait]
impl LoadBalancerProvider for OneLoadBalancer {
    fn get_load_balancer_name(&self, cluster: &str, service: &Service) -> String {
        load_balancer_name(cluster, service)
    }

    async fn get_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>> {
        Ok(self.get(cluster, service).await?.map(ingress_status))
    }

    async fn ensure_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        self.ensure(cluster, service, nodes).await.map(ingress_status)
    }

    async fn update_load_balancer(
        &self,
        cluster: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<()> {
        self.update(cluster, service, nodes).await
    }

    async fn ensure_load_balancer_deleted(&self, cluster: &str, service: &Service) -> Result<()> {
        self.delete(cluster, service).await
    }
}

/// Builds a provider from the parsed configuration
pub type ProviderFactory =
    Box<dyn Fn(&Config) -> Result<Arc<dyn LoadBalancerProvider>> + Send + Sync>;

#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(OPENNEBULA, opennebula);
        registry
    }

    /// Register `factory` under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<dyn LoadBalancerProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn build(&self, name: &str, config: &Config) -> Result<Arc<dyn LoadBalancerProvider>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::ConfigError(format!(
                "unknown load balancer provider {name} (known: {})",
                self.names().join(", ")
            ))
        })?;
        let provider = factory(config)?;
        info!("Built load balancer provider {}", name);
        Ok(provider)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

fn opennebula(config: &Config) -> Result<Arc<dyn LoadBalancerProvider>> {
    let one = &config.opennebula;
    one.validate()?;
    let client = XmlRpcClient::from_endpoint(&one.endpoint)?;
    Ok(Arc::new(OneLoadBalancer::new(Arc::new(client), one)?))
}
