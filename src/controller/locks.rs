//! Per-cluster serialization
//!
//! The load-balancer engine holds no lock of its own. Every call for a
//! cluster shares the router context and reservations, so the controller
//! runs them one at a time per cluster name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ClusterLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `cluster`; released on drop
    pub async fn lock(&self, cluster: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(cluster.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
