//! Load-balancer reconciliation
//!
//! `OneLoadBalancer` sequences the reservation, router and context steps
//! for each lifecycle call. Any failing step aborts the call and leaves the
//! steps already completed in place; the next reconciliation picks up from
//! there.
//!
//! Calls for the same cluster must be serialized by the caller: concurrent
//! pushes race on the shared router context and the last writer wins.

use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::context::{reindex, ContextEntry};
use super::reservation::{LbLookup, ReservationManager};
use super::router::RouterManager;
use crate::config::OneConfig;
use crate::error::{Error, Result};
use crate::one::{OneApi, VirtualNetwork, VirtualRouter};

const NODE_INTERNAL_IP: &str = "InternalIP";

pub struct OneLoadBalancer {
    api: Arc<dyn OneApi>,
    reservations: ReservationManager,
    routers: RouterManager,
}

/// `<cluster>-<namespace>-<name>`
pub fn load_balancer_name(cluster: &str, service: &Service) -> String {
    format!(
        "{}-{}-{}",
        cluster,
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

/// First InternalIP of a node, if it parses as an address
fn node_internal_ip(node: &Node) -> Option<IpAddr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == NODE_INTERNAL_IP)?
        .address
        .parse()
        .ok()
}

/// One entry per exposed port, with every node carrying a usable internal
/// address as a backend. A port without a node port is not reachable
/// through the nodes and gets an entry with no backends.
pub fn build_entries(vip: &str, service: &Service, nodes: &[Node]) -> Vec<ContextEntry> {
    let hosts: Vec<String> = nodes
        .iter()
        .filter_map(|node| match node_internal_ip(node) {
            Some(ip) => Some(ip.to_string()),
            None => {
                debug!("Skipping node {} without a usable InternalIP", node.name_any());
                None
            }
        })
        .collect();

    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();

    ports
        .iter()
        .map(|port| {
            let entry = ContextEntry::new(vip, port.port);
            let Some(node_port) = port.node_port else {
                warn!("Port {} of {} has no node port", port.port, service.name_any());
                return entry;
            };
            hosts
                .iter()
                .fold(entry, |entry, host| entry.with_backend(host.as_str(), node_port))
        })
        .collect()
}

impl OneLoadBalancer {
    pub fn new(api: Arc<dyn OneApi>, config: &OneConfig) -> Result<Self> {
        let parent = config
            .primary_network()
            .cloned()
            .ok_or_else(|| Error::ConfigError("no networks defined".to_string()))?;
        let router = config
            .virtual_router
            .clone()
            .ok_or_else(|| Error::ConfigError("virtualRouter section is required".to_string()))?;

        Ok(Self {
            reservations: ReservationManager::new(api.clone(), parent, router.replicas()),
            routers: RouterManager::new(
                api.clone(),
                router,
                config.public_network.clone(),
                config.private_network.clone(),
            ),
            api,
        })
    }

    /// Reindex the CONTEXT of every router instance and push it back.
    /// `vip` is the address whose entries `update` replaces.
    async fn push_context(
        &self,
        router: &VirtualRouter,
        reservation: &VirtualNetwork,
        vip: Option<&str>,
        update: &[ContextEntry],
    ) -> Result<()> {
        let addresses = reservation.addresses();
        for &vm_id in &router.vm_ids {
            let mut vm = self.api.vm_info(vm_id).await?;
            let context = vm.template.vector_mut("CONTEXT").ok_or_else(|| {
                Error::TemplateError(format!("VM {vm_id} of {} has no CONTEXT", router.name))
            })?;
            reindex(context, vip, update, &addresses);
            self.api.vm_update_conf(vm_id, &vm.template).await?;
            debug!("Pushed context to VM {}", vm_id);
        }
        Ok(())
    }

    /// Address of the load balancer, if it has been claimed
    #[instrument(skip(self, service), fields(service = %service.name_any()))]
    pub async fn get(&self, cluster: &str, service: &Service) -> Result<Option<String>> {
        let lb_name = load_balancer_name(cluster, service);
        match self.reservations.find_lb_address(cluster, &lb_name).await? {
            LbLookup::Claimed(address) => Ok(Some(address.ip().to_string())),
            _ => Ok(None),
        }
    }

    /// Claim an address, make sure the router runs, push the entries.
    /// Returns the external address.
    #[instrument(skip(self, service, nodes), fields(service = %service.name_any(), nodes = nodes.len()))]
    pub async fn ensure(&self, cluster: &str, service: &Service, nodes: &[Node]) -> Result<String> {
        let lb_name = load_balancer_name(cluster, service);
        info!("Ensuring load balancer {}", lb_name);

        self.reservations.ensure_router_reservation(cluster).await?;
        let address = match self.reservations.find_lb_address(cluster, &lb_name).await? {
            LbLookup::Claimed(address) => address,
            lookup => {
                let address = self
                    .reservations
                    .claim_lb_address(cluster, &lb_name, lookup.reservation_id())
                    .await?;
                // Mirror the new address before touching the router
                if let Some(router) = self.routers.find_router(cluster).await? {
                    self.push_context(&router, &address.reservation, Some(address.ip()), &[])
                        .await?;
                }
                address
            }
        };
        let router = self.routers.ensure_router(cluster).await?;

        let entries = build_entries(address.ip(), service, nodes);
        self.push_context(&router, &address.reservation, Some(address.ip()), &entries)
            .await?;

        info!("Load balancer {} serving on {}", lb_name, address.ip());
        Ok(address.ip().to_string())
    }

    /// Re-push the entries of an existing load balancer.
    ///
    /// Nothing happens when the load balancer has no address yet. A missing
    /// router with a claimed address is reported as `NotFound`.
    #[instrument(skip(self, service, nodes), fields(service = %service.name_any(), nodes = nodes.len()))]
    pub async fn update(&self, cluster: &str, service: &Service, nodes: &[Node]) -> Result<()> {
        let lb_name = load_balancer_name(cluster, service);
        let LbLookup::Claimed(address) = self.reservations.find_lb_address(cluster, &lb_name).await?
        else {
            debug!("Load balancer {} has no address, nothing to update", lb_name);
            return Ok(());
        };
        let router = self.routers.find_router(cluster).await?.ok_or_else(|| {
            Error::NotFound(format!("virtual router for load balancer {lb_name}"))
        })?;

        info!("Updating load balancer {}", lb_name);
        let entries = build_entries(address.ip(), service, nodes);
        self.push_context(&router, &address.reservation, Some(address.ip()), &entries)
            .await
    }

    /// Release the load balancer's address. Releasing the last address of
    /// the cluster tears down the router and both reservations.
    #[instrument(skip(self, service), fields(service = %service.name_any()))]
    pub async fn delete(&self, cluster: &str, service: &Service) -> Result<()> {
        let lb_name = load_balancer_name(cluster, service);
        let LbLookup::Claimed(address) = self.reservations.find_lb_address(cluster, &lb_name).await?
        else {
            debug!("Load balancer {} has no address, nothing to delete", lb_name);
            return Ok(());
        };

        match address.reservation.address_ranges.len() {
            0 => {
                error!(
                    "{}",
                    Error::InvariantViolation(format!(
                        "load balancer {lb_name} claimed in an empty reservation"
                    ))
                );
                Ok(())
            }
            1 => {
                info!("Deleting last load balancer {} of cluster {}", lb_name, cluster);
                self.routers.delete_router(cluster).await?;
                self.reservations.delete_router_reservation(cluster).await?;
                self.reservations
                    .delete_lb_reservation(&address.reservation)
                    .await
            }
            _ => {
                info!("Deleting load balancer {}", lb_name);
                let reservation = self.reservations.release_lb_address(&address).await?;
                match self.routers.find_router(cluster).await? {
                    Some(router) => self.push_context(&router, &reservation, None, &[]).await,
                    None => {
                        warn!("Virtual router of cluster {} is gone, context not pushed", cluster);
                        Ok(())
                    }
                }
            }
        }
    }
}
