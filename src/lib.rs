//! OpenNebula cloud provider: LoadBalancer reconciliation
//!
//! Exposes Kubernetes `LoadBalancer` Services through an OpenNebula virtual
//! router running an HAProxy sidecar. Addresses come from per-cluster
//! reservations carved out of a parent network; the proxy configuration is
//! pushed into the router instances as CONTEXT attributes.

pub mod config;
pub mod controller;
pub mod error;
pub mod lb;
pub mod one;
pub mod provider;

pub use crate::error::{Error, Result};
