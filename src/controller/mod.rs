//! Kubernetes controller for LoadBalancer services
//!
//! Watches Services and drives the configured load-balancer provider.

mod finalizers;
mod locks;
mod reconciler;

pub use finalizers::LOAD_BALANCER_CLEANUP_FINALIZER;
pub use locks::ClusterLocks;
pub use reconciler::{
    ingress_ip, is_managed, is_published, managed_services, retry_after, run_controller, sync_load_balancer,
    ControllerState,
};
