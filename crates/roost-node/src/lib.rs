//! # roost-node: node lifecycle and cluster-wide supervision for Roost
//!
//! The node-level half of the control plane:
//! - [`Coordinator`]: election contention, the takeover/relinquish role
//!   machine, and the seven-phase primary hand-off
//! - [`keepalive`]: the periodic liveness and resource snapshot that
//!   doubles as the fencing heartbeat
//! - [`Fencer`]: stale-peer detection, IPMI power fencing, VM recovery
//! - [`SelfNode`]: flush/unflush drains of this node's VMs
//! - [`selector`]: migration target selection policy

pub mod coordinator;
pub mod fencing;
pub mod keepalive;
pub mod node;
pub mod selector;

pub use coordinator::{Coordinator, ServiceSet};
pub use fencing::Fencer;
pub use keepalive::{node_keepalive, start_keepalive_timer, KeepaliveContext};
pub use node::SelfNode;
pub use selector::{find_target, valid_candidates};
