//! Address-range reservations
//!
//! Each cluster owns two reservations carved from the primary network:
//!
//! - `<cluster>-vr`: one address per router replica, used by the router NICs.
//! - `<cluster>-lb`: one single-address range per logical load balancer,
//!   each range tagged with the load balancer's name (`LB_NAME`) and held
//!   so the platform never leases it elsewhere.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{NetworkConfig, DEFAULT_LB_AR_ID, DEFAULT_ROUTER_AR_ID};
use crate::error::{Error, Result};
use crate::one::types::LB_NAME_ATTR;
use crate::one::{AddressRange, OneApi, ReserveRequest, VirtualNetwork};

pub fn router_reservation_name(cluster: &str) -> String {
    format!("{cluster}-vr")
}

pub fn lb_reservation_name(cluster: &str) -> String {
    format!("{cluster}-lb")
}

/// Outcome of looking a load balancer up in its cluster's reservation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LbLookup {
    /// The cluster has no load-balancer reservation yet
    NoReservation,
    /// The reservation exists but holds no address for this load balancer
    Unclaimed(VirtualNetwork),
    Claimed(LbAddress),
}

impl LbLookup {
    /// Id of the load-balancer reservation, if the cluster has one
    pub fn reservation_id(&self) -> Option<i64> {
        match self {
            LbLookup::NoReservation => None,
            LbLookup::Unclaimed(reservation) => Some(reservation.id),
            LbLookup::Claimed(address) => Some(address.reservation.id),
        }
    }
}

/// An address claimed by one logical load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LbAddress {
    pub reservation: VirtualNetwork,
    /// Position of the claimed range inside `reservation`
    pub position: usize,
}

impl LbAddress {
    pub fn address_range(&self) -> &AddressRange {
        &self.reservation.address_ranges[self.position]
    }

    pub fn ip(&self) -> &str {
        &self.address_range().ip
    }
}

pub struct ReservationManager {
    api: Arc<dyn OneApi>,
    parent: NetworkConfig,
    replicas: u32,
}

impl ReservationManager {
    pub fn new(api: Arc<dyn OneApi>, parent: NetworkConfig, replicas: u32) -> Self {
        Self {
            api,
            parent,
            replicas,
        }
    }

    /// Resolve a network name, mapping "not found" to `None`
    async fn lookup(&self, name: &str) -> Result<Option<i64>> {
        match self.api.vnet_by_name(name).await {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.is_not_found() => {
                debug!("Virtual network {} does not exist", name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure `<cluster>-vr` exists, reserving one address per replica
    #[instrument(skip(self))]
    pub async fn ensure_router_reservation(&self, cluster: &str) -> Result<VirtualNetwork> {
        let name = router_reservation_name(cluster);
        let id = match self.lookup(&name).await? {
            Some(id) => id,
            None => {
                let parent_id = self.api.vnet_by_name(&self.parent.name).await?;
                let request = ReserveRequest {
                    name: name.clone(),
                    size: self.replicas,
                    ar_id: self.parent.address_range_or(DEFAULT_ROUTER_AR_ID),
                    network_id: None,
                };
                let id = self.api.vnet_reserve(parent_id, &request).await?;
                info!(
                    "Reserved {} address(es) from {} as {} (id {})",
                    self.replicas, self.parent.name, name, id
                );
                id
            }
        };
        self.api.vnet_info(id).await
    }

    /// Locate the address tagged with `lb_name`
    #[instrument(skip(self))]
    pub async fn find_lb_address(&self, cluster: &str, lb_name: &str) -> Result<LbLookup> {
        let Some(id) = self.lookup(&lb_reservation_name(cluster)).await? else {
            return Ok(LbLookup::NoReservation);
        };
        let reservation = self.api.vnet_info(id).await?;
        Ok(match reservation.position_of(lb_name) {
            Some(position) => LbLookup::Claimed(LbAddress {
                reservation,
                position,
            }),
            None => LbLookup::Unclaimed(reservation),
        })
    }

    /// Return the address owned by `lb_name`, claiming a new one if needed
    #[instrument(skip(self))]
    pub async fn ensure_lb_address(&self, cluster: &str, lb_name: &str) -> Result<LbAddress> {
        match self.find_lb_address(cluster, lb_name).await? {
            LbLookup::Claimed(address) => Ok(address),
            lookup => {
                self.claim_lb_address(cluster, lb_name, lookup.reservation_id())
                    .await
            }
        }
    }

    /// Claim a new address for `lb_name`.
    ///
    /// Without an `existing` reservation one is created with a single
    /// address; otherwise the reservation grows by one range. The new range
    /// is tagged with `lb_name` and then held.
    #[instrument(skip(self))]
    pub async fn claim_lb_address(
        &self,
        cluster: &str,
        lb_name: &str,
        existing: Option<i64>,
    ) -> Result<LbAddress> {
        let parent_id = self.api.vnet_by_name(&self.parent.name).await?;
        let request = ReserveRequest {
            name: lb_reservation_name(cluster),
            size: 1,
            ar_id: self.parent.address_range_or(DEFAULT_LB_AR_ID),
            network_id: existing,
        };
        let id = self.api.vnet_reserve(parent_id, &request).await?;

        let reservation = self.api.vnet_info(id).await?;
        let position = reservation.address_ranges.len().checked_sub(1).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "reservation {} has no address range after reserving",
                request.name
            ))
        })?;
        let ar_id = reservation.address_ranges[position].id;
        self.api
            .vnet_tag_address_range(id, ar_id, LB_NAME_ATTR, lb_name)
            .await?;

        let reservation = self.api.vnet_info(id).await?;
        let address = LbAddress {
            position: reservation.address_ranges.len().saturating_sub(1),
            reservation,
        };
        self.api.vnet_hold(id, address.ip()).await?;
        info!(
            "Claimed {} in {} for load balancer {}",
            address.ip(),
            request.name,
            lb_name
        );
        Ok(address)
    }

    /// Release one claimed address and drop its range.
    /// Returns the reservation as it stands afterwards.
    #[instrument(skip(self, address), fields(ip = %address.ip()))]
    pub async fn release_lb_address(&self, address: &LbAddress) -> Result<VirtualNetwork> {
        let id = address.reservation.id;
        let ar = address.address_range();
        self.api.vnet_release(id, &ar.ip).await?;
        self.api.vnet_remove_address_range(id, ar.id).await?;
        info!("Released {} from {}", ar.ip, address.reservation.name);
        self.api.vnet_info(id).await
    }

    /// Release every address and delete the load-balancer reservation
    #[instrument(skip(self, reservation), fields(name = %reservation.name))]
    pub async fn delete_lb_reservation(&self, reservation: &VirtualNetwork) -> Result<()> {
        for ar in &reservation.address_ranges {
            self.api.vnet_release(reservation.id, &ar.ip).await?;
        }
        self.api.vnet_delete(reservation.id).await?;
        info!("Deleted load-balancer reservation {}", reservation.name);
        Ok(())
    }

    /// Delete `<cluster>-vr`; a reservation that is already gone is fine
    #[instrument(skip(self))]
    pub async fn delete_router_reservation(&self, cluster: &str) -> Result<()> {
        let name = router_reservation_name(cluster);
        match self.lookup(&name).await? {
            Some(id) => {
                self.api.vnet_delete(id).await?;
                info!("Deleted router reservation {}", name);
            }
            None => warn!("Router reservation {} already absent", name),
        }
        Ok(())
    }
}
