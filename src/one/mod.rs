//! OpenNebula remote API
//!
//! `OneApi` is the seam between the reconciliation engine and the platform.
//! Every component receives the same explicit handle; there is no global
//! client. `XmlRpcClient` is the production implementation.

pub mod template;
pub mod types;
pub mod xml;
pub mod xmlrpc;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;

use crate::error::Result;

pub use template::{Attribute, Template, Vector};
pub use types::{AddressRange, ReserveRequest, VirtualNetwork, VirtualRouter, Vm, VmTemplate};
pub use xmlrpc::XmlRpcClient;

/// Remote calls used by the load-balancer engine.
///
/// Name lookups return `Error::NotFound` when nothing matches; callers decide
/// whether that means "create it". Dropping a returned future aborts the
/// in-flight request without rolling back anything already applied.
#[async_trait]
pub trait OneApi: Send + Sync {
    async fn vnet_by_name(&self, name: &str) -> Result<i64>;
    async fn vnet_info(&self, id: i64) -> Result<VirtualNetwork>;
    /// Reserve addresses from `parent_id`; returns the reservation id
    async fn vnet_reserve(&self, parent_id: i64, request: &ReserveRequest) -> Result<i64>;
    /// Set one custom attribute on an address range
    async fn vnet_tag_address_range(
        &self,
        id: i64,
        ar_id: i64,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn vnet_hold(&self, id: i64, ip: &str) -> Result<()>;
    async fn vnet_release(&self, id: i64, ip: &str) -> Result<()>;
    async fn vnet_remove_address_range(&self, id: i64, ar_id: i64) -> Result<()>;
    async fn vnet_delete(&self, id: i64) -> Result<()>;

    async fn vrouter_by_name(&self, name: &str) -> Result<i64>;
    async fn vrouter_info(&self, id: i64) -> Result<VirtualRouter>;
    async fn vrouter_allocate(&self, template: &Template) -> Result<i64>;
    /// Create `count` router instances from a VM template plus overrides
    async fn vrouter_instantiate(
        &self,
        id: i64,
        count: u32,
        template_id: i64,
        extra: &Template,
    ) -> Result<()>;
    async fn vrouter_delete(&self, id: i64) -> Result<()>;

    async fn vm_template_by_name(&self, name: &str) -> Result<i64>;
    async fn vm_template_info(&self, id: i64) -> Result<VmTemplate>;

    async fn vm_info(&self, id: i64) -> Result<Vm>;
    /// Update a running VM's configuration (CONTEXT included) without reboot
    async fn vm_update_conf(&self, id: i64, template: &Template) -> Result<()>;
}
