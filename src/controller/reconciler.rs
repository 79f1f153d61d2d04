//! Service reconciler for LoadBalancer services
//!
//! Implements the controller pattern using kube-rs runtime, calling the
//! configured load-balancer provider for every managed Service.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::finalizers::{has_finalizer, remove_finalizer, LOAD_BALANCER_CLEANUP_FINALIZER};
use super::locks::ClusterLocks;
use crate::error::{Error, Result};
use crate::provider::LoadBalancerProvider;

const LOAD_BALANCER_TYPE: &str = "LoadBalancer";
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub provider: Arc<dyn LoadBalancerProvider>,
    pub cluster_name: String,
    pub locks: ClusterLocks,
}

impl ControllerState {
    pub fn new(
        client: Client,
        provider: Arc<dyn LoadBalancerProvider>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            provider,
            cluster_name: cluster_name.into(),
            locks: ClusterLocks::new(),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let services: Api<Service> = Api::all(state.client.clone());
    let nodes: Api<Node> = Api::all(state.client.clone());

    info!(
        "Starting LoadBalancer controller for cluster {}",
        state.cluster_name
    );

    let controller = Controller::new(services, Config::default());
    let store = controller.store();

    // Backends follow node membership, so any node change touches every
    // managed Service
    controller
        .watches(nodes, Config::default(), move |_node| {
            managed_services(&store.state())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// A Service is ours when it asks for a load balancer without naming
/// another implementation through `loadBalancerClass`.
pub fn is_managed(service: &Service) -> bool {
    service.spec.as_ref().is_some_and(|spec| {
        spec.type_.as_deref() == Some(LOAD_BALANCER_TYPE) && spec.load_balancer_class.is_none()
    })
}

/// References to every managed Service among `services`
pub fn managed_services(services: &[Arc<Service>]) -> Vec<ObjectRef<Service>> {
    services
        .iter()
        .filter(|service| is_managed(service))
        .map(|service| ObjectRef::from_obj(service.as_ref()))
        .collect()
}

/// First ingress IP of a load-balancer status
pub fn ingress_ip(status: &LoadBalancerStatus) -> Option<&str> {
    status.ingress.as_ref()?.first()?.ip.as_deref()
}

/// Status currently published on the Service
pub fn published_status(service: &Service) -> Option<&LoadBalancerStatus> {
    service.status.as_ref()?.load_balancer.as_ref()
}

/// Whether the platform already serves the address the Service publishes
pub fn is_published(service: &Service, existing: &LoadBalancerStatus) -> bool {
    match (published_status(service).and_then(ingress_ip), ingress_ip(existing)) {
        (Some(published), Some(current)) => published == current,
        _ => false,
    }
}

async fn reconcile(service: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_managed(&service) {
        if has_finalizer(&service) {
            info!(
                "Service {}/{} is no longer a managed LoadBalancer",
                namespace,
                service.name_any()
            );
            cleanup_service(&ctx, &service).await?;
            remove_finalizer(&api, &service).await?;
        }
        return Ok(Action::await_change());
    }

    finalizer(&api, LOAD_BALANCER_CLEANUP_FINALIZER, service, |event| async {
        match event {
            FinalizerEvent::Apply(service) => apply_service(&ctx, &service).await,
            FinalizerEvent::Cleanup(service) => cleanup_service(&ctx, &service).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Ensure or update the load balancer and publish its address
#[instrument(skip(ctx, service), fields(name = %service.name_any(), namespace = service.namespace()))]
async fn apply_service(ctx: &ControllerState, service: &Service) -> Result<Action> {
    let cluster = ctx.cluster_name.as_str();
    let _guard = ctx.locks.lock(cluster).await;

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let nodes = nodes.list(&ListParams::default()).await?.items;

    let status = sync_load_balancer(ctx.provider.as_ref(), cluster, service, &nodes).await?;

    if published_status(service) != Some(&status) {
        update_status(&ctx.client, service, &status).await?;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Update the load balancer when the platform already serves the address
/// the Service publishes, ensure it otherwise. Returns the status to publish.
pub async fn sync_load_balancer(
    provider: &dyn LoadBalancerProvider,
    cluster: &str,
    service: &Service,
    nodes: &[Node],
) -> Result<LoadBalancerStatus> {
    match provider.get_load_balancer(cluster, service).await? {
        Some(existing) if is_published(service, &existing) => {
            match provider.update_load_balancer(cluster, service, nodes).await {
                Ok(()) => Ok(existing),
                Err(e) if e.is_not_found() => {
                    warn!("Update failed ({}), ensuring instead", e);
                    provider.ensure_load_balancer(cluster, service, nodes).await
                }
                Err(e) => Err(e),
            }
        }
        _ => provider.ensure_load_balancer(cluster, service, nodes).await,
    }
}

/// Release the load balancer on the platform
#[instrument(skip(ctx, service), fields(name = %service.name_any(), namespace = service.namespace()))]
async fn cleanup_service(ctx: &ControllerState, service: &Service) -> Result<Action> {
    let cluster = ctx.cluster_name.as_str();
    let _guard = ctx.locks.lock(cluster).await;

    ctx.provider
        .ensure_load_balancer_deleted(cluster, service)
        .await?;
    info!("Released load balancer for Service {}", service.name_any());
    Ok(Action::await_change())
}

async fn update_status(client: &Client, service: &Service, status: &LoadBalancerStatus) -> Result<()> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let patch = json!({
        "status": {
            "loadBalancer": status
        }
    });
    api.patch_status(
        &service.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    info!(
        "Published {:?} for Service {}/{}",
        ingress_ip(status),
        namespace,
        service.name_any()
    );
    Ok(())
}

/// Requeue delay after a failed reconciliation
pub fn retry_after(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", service.name_any(), error);
    Action::requeue(retry_after(error))
}
