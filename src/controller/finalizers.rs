//! Finalizer handling for LoadBalancer services
//!
//! The finalizer keeps a Service around until its load balancer has been
//! released on the platform. The kube-rs `finalizer` helper adds it and
//! drives cleanup on deletion; the helpers below cover services that stop
//! being managed while still carrying it.

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::error::Result;

/// Standard finalizer guarding cloud load-balancer resources
pub const LOAD_BALANCER_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

pub fn has_finalizer(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER)
}

/// Finalizer list with ours removed
pub fn without_finalizer(service: &Service) -> Vec<String> {
    service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != LOAD_BALANCER_CLEANUP_FINALIZER)
        .cloned()
        .collect()
}

/// Drop our finalizer once the load balancer is gone
pub async fn remove_finalizer(api: &Api<Service>, service: &Service) -> Result<()> {
    let patch = json!({
        "metadata": {
            "finalizers": without_finalizer(service)
        }
    });
    api.patch(
        &service.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Removed finalizer from Service {}", service.name_any());
    Ok(())
}
