//! Configuration for the Roost node daemon.
//!
//! Configuration is merged from built-in defaults, a system-wide TOML file,
//! a local override file, and `ROOST_*` environment variables; see
//! [`ConfigLoader`]. The resulting [`RoostConfig`] is passed explicitly into
//! every subsystem constructor rather than living in a global.

pub mod error;
pub mod loader;
pub mod paths;

pub use error::{Error, Result};
pub use loader::ConfigLoader;
pub use paths::Paths;

use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use roost_types::{FailedFenceAction, SelectorMode, SuccessfulFenceAction};
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoostConfig {
    pub node: NodeSection,
    pub daemon: DaemonSection,
    pub timing: TimingSection,
    pub fencing: FencingSection,
    pub network: NetworkSection,
    pub storage: StorageSection,
    pub vm: VmSection,
    pub logging: LoggingSection,
}

/// Identity of this node and of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Short hostname of this node. Filled from the kernel hostname when
    /// left empty.
    pub hostname: String,

    /// DNS domain appended to peer hostnames for cluster-network URIs.
    pub cluster_domain: String,

    /// Hostnames of the coordinator nodes. A node finding itself in this
    /// list runs in coordinator mode.
    pub coordinators: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            cluster_domain: "local".to_string(),
            coordinators: Vec::new(),
        }
    }
}

/// Which subsystems this daemon runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub enable_hypervisor: bool,
    pub enable_networking: bool,
    pub enable_storage: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            enable_hypervisor: true,
            enable_networking: true,
            enable_storage: true,
        }
    }
}

/// Intervals and timeouts. All values are in seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// Keepalive publish interval (`T_k`).
    pub keepalive_interval: u64,

    /// Number of keepalive intervals after which a silent peer becomes a
    /// fencing candidate (`T_fence = fence_intervals * keepalive_interval`).
    pub fence_intervals: u64,

    /// Consecutive failed fence scans required before fencing triggers.
    pub fence_consecutive: u32,

    /// How long a graceful VM shutdown may take before it is forced off.
    pub vm_shutdown_timeout: u64,

    /// Peer-rendezvous timeout for each side of the migration handshake.
    pub migration_sync_timeout: u64,

    /// Lock timeout for primary contention, in milliseconds. Kept below the
    /// half-second takeover settle delay so a failed contender cannot
    /// deadlock an incoming primary.
    pub primary_contention_timeout_ms: u64,

    /// Timeout for the final reader acquisition of the hand-off sync lock.
    pub handoff_sync_timeout: u64,

    /// How long shutdown waits for a forced primary hand-off to complete.
    pub shutdown_handoff_timeout: u64,

    /// Timeout for long-running external commands.
    pub command_timeout: u64,

    /// Timeout for quick external probes (power status, storage health).
    pub probe_timeout: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            keepalive_interval: 5,
            fence_intervals: 6,
            fence_consecutive: 3,
            vm_shutdown_timeout: 180,
            migration_sync_timeout: 30,
            primary_contention_timeout_ms: 400,
            handoff_sync_timeout: 60,
            shutdown_handoff_timeout: 240,
            command_timeout: 128,
            probe_timeout: 1,
        }
    }
}

impl TimingSection {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    /// Keepalive age at which a peer becomes a fencing candidate.
    pub fn fence_age(&self) -> Duration {
        Duration::from_secs(self.fence_intervals * self.keepalive_interval)
    }

    pub fn vm_shutdown(&self) -> Duration {
        Duration::from_secs(self.vm_shutdown_timeout)
    }

    pub fn migration_sync(&self) -> Duration {
        Duration::from_secs(self.migration_sync_timeout)
    }

    pub fn primary_contention(&self) -> Duration {
        Duration::from_millis(self.primary_contention_timeout_ms)
    }

    pub fn handoff_sync(&self) -> Duration {
        Duration::from_secs(self.handoff_sync_timeout)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

/// Out-of-band management endpoint for this node and fence-result policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FencingSection {
    pub ipmi_host: String,
    pub ipmi_user: String,
    pub ipmi_password: String,

    /// What happens to a fenced node's VMs after a confirmed power-off.
    pub successful_fence: SuccessfulFenceAction,

    /// What happens when the power-off could not be confirmed.
    pub failed_fence: FailedFenceAction,
}

impl Default for FencingSection {
    fn default() -> Self {
        Self {
            ipmi_host: String::new(),
            ipmi_user: String::new(),
            ipmi_password: String::new(),
            successful_fence: SuccessfulFenceAction::Migrate,
            failed_fence: FailedFenceAction::None,
        }
    }
}

/// Physical and floating addressing for the three cluster networks, plus
/// tenant-network plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Upstream-facing device and its bridge.
    pub upstream_dev: String,
    pub upstream_dev_ip: String,
    /// Floating IP (CIDR form) owned by the primary on the upstream bridge.
    pub upstream_floating_ip: String,

    /// Cluster (VM/meta traffic) device.
    pub cluster_dev: String,
    pub cluster_dev_ip: String,
    pub cluster_floating_ip: String,

    /// Storage network device.
    pub storage_dev: String,
    pub storage_dev_ip: String,
    pub storage_floating_ip: String,

    /// Uplink device for bridged tenant networks.
    pub bridge_dev: String,

    /// MTU of the bridged uplink; bridged tenant networks are capped here.
    pub bridge_mtu: u32,

    /// MTU of the cluster device; managed-network MTUs are capped at this
    /// minus the VXLAN overhead.
    pub cluster_mtu: u32,

    /// Directory for generated packet-filter fragments.
    pub nft_dynamic_directory: PathBuf,

    /// Directory for per-network DHCP state (hosts files, lease databases).
    pub dhcp_directory: PathBuf,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            upstream_dev: String::new(),
            upstream_dev_ip: String::new(),
            upstream_floating_ip: String::new(),
            cluster_dev: String::new(),
            cluster_dev_ip: String::new(),
            cluster_floating_ip: String::new(),
            storage_dev: String::new(),
            storage_dev_ip: String::new(),
            storage_floating_ip: String::new(),
            bridge_dev: String::new(),
            bridge_mtu: 1500,
            cluster_mtu: 9000,
            nft_dynamic_directory: PathBuf::from("/run/roost/nft"),
            dhcp_directory: PathBuf::from("/run/roost/dhcp"),
        }
    }
}

impl NetworkSection {
    /// VXLAN encapsulation overhead subtracted from `cluster_mtu` for
    /// managed networks.
    pub const VXLAN_OVERHEAD: u32 = 50;

    pub fn managed_max_mtu(&self) -> u32 {
        self.cluster_mtu.saturating_sub(Self::VXLAN_OVERHEAD)
    }
}

/// Block-store and storage-monitor endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Block-store CLI used for image and advisory-lock operations.
    pub block_cli: String,

    /// Cluster-monitor CLI used for health and utilization stats.
    pub monitor_cli: String,

    /// Address on the storage network that image advisory locks held by
    /// this node carry as their holder address.
    pub storage_ip: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            block_cli: "rbd".to_string(),
            monitor_cli: "ceph".to_string(),
            storage_ip: String::new(),
        }
    }
}

/// VM scheduling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSection {
    /// Cluster-default migration target selector, used when a VM does not
    /// declare its own.
    pub migration_target_selector: SelectorMode,

    /// Lines of serial console output retained per VM.
    pub console_log_lines: usize,
}

impl Default for VmSection {
    fn default() -> Self {
        Self {
            migration_target_selector: SelectorMode::Mem,
            console_log_lines: 1000,
        }
    }
}

/// Log destinations and verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive, overridable with `ROOST_LOG`.
    pub level: String,

    /// Optional log file; reopened on SIGHUP.
    pub file: Option<PathBuf>,

    /// Log a summary line for every keepalive run.
    pub log_keepalives: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            log_keepalives: true,
        }
    }
}

impl RoostConfig {
    /// Whether this node is a coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.node.coordinators.iter().any(|c| *c == self.node.hostname)
    }

    /// Checks invariants that would otherwise surface as confusing runtime
    /// behavior.
    pub fn validate(&self) -> Result<()> {
        if self.node.hostname.is_empty() {
            return Err(Error::Invalid("node.hostname must be set".into()));
        }
        if self.timing.keepalive_interval == 0 {
            return Err(Error::Invalid(
                "timing.keepalive_interval must be at least 1".into(),
            ));
        }
        if self.timing.fence_intervals < 2 {
            return Err(Error::Invalid(
                "timing.fence_intervals must be at least 2".into(),
            ));
        }
        if self.timing.fence_consecutive == 0 {
            return Err(Error::Invalid(
                "timing.fence_consecutive must be at least 1".into(),
            ));
        }
        if self.timing.primary_contention_timeout_ms >= 500 {
            return Err(Error::Invalid(
                "timing.primary_contention_timeout_ms must stay below 500".into(),
            ));
        }
        if self.daemon.enable_networking {
            for (name, value) in [
                ("network.upstream_floating_ip", &self.network.upstream_floating_ip),
                ("network.cluster_floating_ip", &self.network.cluster_floating_ip),
                ("network.storage_floating_ip", &self.network.storage_floating_ip),
            ] {
                if value.is_empty() {
                    continue;
                }
                value
                    .parse::<IpNet>()
                    .map_err(|e| Error::Invalid(format!("{name}: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RoostConfig {
        let mut config = RoostConfig::default();
        config.node.hostname = "hv1".to_string();
        config.network.upstream_floating_ip = "10.0.0.1/24".to_string();
        config
    }

    #[test]
    fn test_defaults_match_documented_timings() {
        let timing = TimingSection::default();
        assert_eq!(timing.keepalive(), Duration::from_secs(5));
        assert_eq!(timing.fence_age(), Duration::from_secs(30));
        assert_eq!(timing.fence_consecutive, 3);
        assert_eq!(timing.vm_shutdown(), Duration::from_secs(180));
    }

    #[test]
    fn test_validate_accepts_good_config() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_hostname() {
        let config = RoostConfig::default();
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_floating_ip() {
        let mut config = valid_config();
        config.network.cluster_floating_ip = "not-a-network".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_contention_timeout_stays_below_settle_delay() {
        let mut config = valid_config();
        config.timing.primary_contention_timeout_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_coordinator_detection() {
        let mut config = valid_config();
        assert!(!config.is_coordinator());
        config.node.coordinators = vec!["hv1".to_string(), "hv2".to_string()];
        assert!(config.is_coordinator());
    }

    #[test]
    fn test_managed_max_mtu() {
        let mut network = NetworkSection::default();
        network.cluster_mtu = 1500;
        assert_eq!(network.managed_max_mtu(), 1450);
    }
}
