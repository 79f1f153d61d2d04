//! Router appliance lifecycle
//!
//! One virtual router per cluster, named `<cluster>-lb`, runs the reverse
//! proxy for every load balancer of that cluster. It is created on first
//! use and populated with instances exactly once; replica count changes
//! are not reconciled afterwards.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::context::HAPROXY_ENABLED;
use super::reservation::router_reservation_name;
use crate::config::{NetworkConfig, VirtualRouterConfig};
use crate::error::{Error, Result};
use crate::one::{OneApi, Template, Vector, VirtualRouter};

pub fn router_name(cluster: &str) -> String {
    format!("{cluster}-lb")
}

pub struct RouterManager {
    api: Arc<dyn OneApi>,
    router: VirtualRouterConfig,
    public_network: Option<NetworkConfig>,
    private_network: Option<NetworkConfig>,
}

impl RouterManager {
    pub fn new(
        api: Arc<dyn OneApi>,
        router: VirtualRouterConfig,
        public_network: Option<NetworkConfig>,
        private_network: Option<NetworkConfig>,
    ) -> Self {
        Self {
            api,
            router,
            public_network,
            private_network,
        }
    }

    /// Creation template: the router name plus its NICs.
    ///
    /// With a public network the first NIC attaches to the router
    /// reservation. With a private network the next NIC attaches to it as a
    /// floating interface.
    pub fn build_router_template(&self, cluster: &str) -> Template {
        let mut t = Template::new();
        t.add_pair("NAME", router_name(cluster));

        if self.public_network.is_some() {
            let mut nic = Vector::new();
            nic.add("NETWORK", router_reservation_name(cluster));
            t.add_vector("NIC", nic);
        }
        if let Some(private) = &self.private_network {
            let mut nic = Vector::new();
            nic.add("NETWORK", private.name.as_str());
            nic.add("FLOATING_IP", "YES");
            if let Some(ip) = private.valid_floating_ip() {
                nic.add("IP", ip);
            }
            nic.add(
                "FLOATING_ONLY",
                if private.is_floating_only() { "YES" } else { "NO" },
            );
            t.add_vector("NIC", nic);
        }
        t
    }

    /// The cluster's router, or `None` when it does not exist
    #[instrument(skip(self))]
    pub async fn find_router(&self, cluster: &str) -> Result<Option<VirtualRouter>> {
        let name = router_name(cluster);
        match self.api.vrouter_by_name(&name).await {
            Ok(id) => Ok(Some(self.api.vrouter_info(id).await?)),
            Err(e) if e.is_not_found() => {
                debug!("Virtual router {} does not exist", name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure the router exists and has been populated with instances
    #[instrument(skip(self))]
    pub async fn ensure_router(&self, cluster: &str) -> Result<VirtualRouter> {
        let router = match self.find_router(cluster).await? {
            Some(router) => router,
            None => {
                let id = self
                    .api
                    .vrouter_allocate(&self.build_router_template(cluster))
                    .await?;
                info!("Created virtual router {} (id {})", router_name(cluster), id);
                self.api.vrouter_info(id).await?
            }
        };

        let replicas = self.router.replicas();
        if !router.vm_ids.is_empty() || replicas == 0 {
            return Ok(router);
        }

        let template_id = self.api.vm_template_by_name(&self.router.template_name).await?;
        let vm_template = self.api.vm_template_info(template_id).await?;
        let instance = self.build_instance_template(vm_template.template)?;
        self.api
            .vrouter_instantiate(router.id, replicas, template_id, &instance)
            .await?;
        info!(
            "Instantiated {} replica(s) of {} from template {}",
            replicas, router.name, self.router.template_name
        );
        self.api.vrouter_info(router.id).await
    }

    /// Force the proxy sidecar on and apply the configured extra context
    pub fn build_instance_template(&self, mut template: Template) -> Result<Template> {
        let context = template.vector_mut("CONTEXT").ok_or_else(|| {
            Error::TemplateError(format!(
                "VM template {} has no CONTEXT section",
                self.router.template_name
            ))
        })?;
        context.replace(HAPROXY_ENABLED, "YES");
        for (key, value) in &self.router.extra_context {
            context.replace(key.as_str(), value.as_str());
        }
        Ok(template)
    }

    /// Delete the cluster's router; one that is already gone is fine
    #[instrument(skip(self))]
    pub async fn delete_router(&self, cluster: &str) -> Result<()> {
        let name = router_name(cluster);
        match self.api.vrouter_by_name(&name).await {
            Ok(id) => {
                self.api.vrouter_delete(id).await?;
                info!("Deleted virtual router {}", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("Virtual router {} already absent", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
