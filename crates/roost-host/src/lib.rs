//! # roost-host: host-side external interfaces for Roost
//!
//! Everything the control plane touches outside the coordination store
//! lives behind the seams in this crate:
//! - [`Commander`]: bounded-timeout external command execution
//! - [`Hypervisor`]: the local domain API (and remote, for migration)
//! - [`BlockStore`]: image operations and advisory locks
//! - [`IpmiClient`]: chassis power control for fencing
//! - [`NetPlumbing`]: addresses, bridges, VLAN/VXLAN links, packet filter
//! - [`StorageMonitor`]: storage-cluster stats for the keepalive mirror
//! - [`DaemonProcess`]: supervised child daemons (DHCP servers)
//! - [`metrics`]: host memory and load figures
//!
//! Each seam ships a mock, which is how the rest of the workspace tests
//! whole-cluster behavior without a hypervisor or root privileges.

pub mod blockstore;
pub mod cmd;
pub mod daemonproc;
pub mod error;
pub mod hypervisor;
pub mod ipmi;
pub mod metrics;
pub mod netplumb;
pub mod storagemon;

pub use blockstore::{BlockStore, CliBlockStore, MockBlockStore};
pub use cmd::{CommandOutput, Commander, MockCommander};
pub use daemonproc::DaemonProcess;
pub use error::{Error, Result};
pub use hypervisor::{
    migration_uri, resources_from_xml, uuid_from_xml, CliHypervisor, DomainStats, GraphicsInfo,
    Hypervisor, MockHypervisor,
};
pub use ipmi::{IpmiClient, IpmiTarget, PowerState};
pub use netplumb::NetPlumbing;
pub use storagemon::{CliStorageMonitor, MockStorageMonitor, OsdStat, StorageMonitor};
