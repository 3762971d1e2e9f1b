//! Node provisioning for kpve
//!
//! [`InstanceProvider`] turns a NodeClaim into a running VM. It walks
//! instance types cheapest first and, for each, the candidate zones in
//! placement order, trying to launch in one zone at a time. A failed launch
//! is rolled back completely before the next candidate is tried.

#![deny(missing_docs)]

pub mod cloudinit;
pub mod network;
pub mod node;
pub mod placement;
pub mod provider;
pub mod rollback;

#[cfg(test)]
mod test_support;

pub use node::{launched_node, node_from_vm, parse_provider_id, provider_id, LaunchedVm, ProviderId};
pub use placement::{order_by_price, order_zones, resolve_capacity_type, Candidate};
pub use provider::{BootstrapServices, InstanceProvider};
pub use rollback::{Compensation, RollbackContext, RollbackStack};
