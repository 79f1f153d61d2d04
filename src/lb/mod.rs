//! Load-balancer reconciliation engine
//!
//! Bottom-up: `context` encodes the router CONTEXT, `reservation` manages
//! the two per-cluster address reservations, `router` manages the router
//! appliance, and `driver` sequences them per lifecycle call.

pub mod context;
mod driver;
pub mod reservation;
pub mod router;

pub use context::{reindex, Backend, ContextEntry, LbContext};
pub use driver::{build_entries, load_balancer_name, OneLoadBalancer};
pub use reservation::{lb_reservation_name, router_reservation_name, LbAddress, LbLookup};
pub use router::router_name;
