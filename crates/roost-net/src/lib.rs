//! # roost-net: tenant network materialization for Roost
//!
//! Watch-driven instances that turn a tenant network's declared state into
//! kernel objects: a VLAN-under-bridge for bridged networks, a VXLAN-
//! under-bridge for managed ones, and, on the current primary coordinator,
//! the managed network's L3 services (gateway addresses, DHCP server,
//! firewall chains, DNS delegation via the DHCP daemon's authoritative
//! zone).

pub mod dhcp;
pub mod error;
pub mod firewall;
pub mod instance;

pub use dhcp::{handle_lease_event, sync_reservations, DhcpConfig, LeaseEvent};
pub use error::{Error, Result};
pub use firewall::{render_rules, AclRule, FirewallFacts};
pub use instance::{NetContext, NetworkInstance};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The fleet map of materialized networks, keyed by VNI. Mutated by the
/// daemon's children watch, iterated by snapshot everywhere else.
pub type NetworkMap = Arc<RwLock<HashMap<u32, Arc<NetworkInstance>>>>;

/// Snapshot of the current network instances.
pub fn network_snapshot(map: &NetworkMap) -> Vec<Arc<NetworkInstance>> {
    map.read().unwrap().values().cloned().collect()
}
