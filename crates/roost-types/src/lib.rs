//! # roost-types: Core types for Roost
//!
//! This crate contains the shared vocabulary used across the Roost system:
//! - Node identity and lifecycle states ([`DaemonMode`], [`DaemonState`],
//!   [`CoordinatorState`], [`DomainState`])
//! - VM lifecycle states ([`VmState`], [`MigrateMethod`], [`HvState`])
//! - Tenant network identity and kinds ([`Vni`], [`NetworkType`])
//! - Scheduling and fencing policy ([`SelectorMode`], [`SuccessfulFenceAction`],
//!   [`FailedFenceAction`])
//!
//! Every state enum here is persisted in the coordination store as a plain
//! lowercase string, so each one carries a `Display`/`FromStr` pair whose
//! wire form is stable. Unknown strings parse to an error rather than a
//! default; callers at the store boundary decide how to degrade.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use uuid::Uuid;

/// A domain (VM) identifier: the UUID under which the VM is keyed in the
/// store and known to the hypervisor.
pub type DomainUuid = Uuid;

/// Error returned when a persisted state string does not match any variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value {value:?}")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

impl ParseStateError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! store_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// The stable string form stored in the coordination store.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let text = String::deserialize(de)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStateError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseStateError::new(stringify!($name), other)),
                }
            }
        }
    };
}

store_enum! {
    /// Whether a node participates in coordinator election or only hosts VMs.
    DaemonMode {
        Coordinator => "coordinator",
        Hypervisor => "hypervisor",
    }
}

store_enum! {
    /// Lifecycle state of a node daemon.
    ///
    /// `Dead` is never written by the node itself; it is assigned by a peer's
    /// fencer once the node has been confirmed powered off.
    DaemonState {
        Init => "init",
        Run => "run",
        Flush => "flush",
        Flushed => "flushed",
        Unflush => "unflush",
        Shutdown => "shutdown",
        Stop => "stop",
        Dead => "dead",
    }
}

store_enum! {
    /// Coordinator role of a node. Non-coordinator nodes stay in `Client`.
    ///
    /// `Takeover` and `Relinquish` are the transient states held during the
    /// seven-phase primary hand-off.
    CoordinatorState {
        Primary => "primary",
        Secondary => "secondary",
        Takeover => "takeover",
        Relinquish => "relinquish",
        Client => "client",
    }
}

store_enum! {
    /// Domain-hosting state of a node: whether it accepts VMs or is being
    /// drained.
    DomainState {
        Ready => "ready",
        Flush => "flush",
        Flushed => "flushed",
        Unflush => "unflush",
    }
}

store_enum! {
    /// Declared lifecycle state of a VM.
    VmState {
        Start => "start",
        Restart => "restart",
        Shutdown => "shutdown",
        Stop => "stop",
        Disable => "disable",
        Fail => "fail",
        Migrate => "migrate",
        MigrateLive => "migrate-live",
        Unmigrate => "unmigrate",
        Provision => "provision",
    }
}

impl VmState {
    /// True for the two states that request a migration toward the declared
    /// `node`.
    pub fn is_migrate(self) -> bool {
        matches!(self, Self::Migrate | Self::MigrateLive)
    }
}

store_enum! {
    /// Per-VM migration policy.
    MigrateMethod {
        None => "none",
        Live => "live",
        Shutdown => "shutdown",
    }
}

store_enum! {
    /// Migration target selection policy.
    SelectorMode {
        /// Most free memory.
        Mem => "mem",
        /// Most unprovisioned-memory headroom.
        MemProv => "memprov",
        /// Lowest 1-minute load average.
        Load => "load",
        /// Fewest allocated vCPUs.
        Vcpus => "vcpus",
        /// Fewest running VMs.
        Vms => "vms",
    }
}

store_enum! {
    /// Kind of tenant network.
    NetworkType {
        Bridged => "bridged",
        Managed => "managed",
    }
}

store_enum! {
    /// What to do with a fenced node's VMs after a confirmed power-off.
    SuccessfulFenceAction {
        Migrate => "migrate",
        None => "none",
    }
}

store_enum! {
    /// What to do when a fence power-off could not be confirmed.
    FailedFenceAction {
        Reset => "reset",
        None => "none",
    }
}

/// Hypervisor-reported run state of a domain, as surfaced by the local
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HvState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
}

impl HvState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for HvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoState => "NOSTATE",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
            Self::ShuttingDown => "SHUTDOWN",
            Self::Shutoff => "SHUTOFF",
            Self::Crashed => "CRASHED",
            Self::Suspended => "PMSUSPENDED",
        };
        f.write_str(s)
    }
}

/// A VXLAN network identifier. Valid VNIs are 24-bit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Vni(u32);

impl Vni {
    pub const MAX: u32 = (1 << 24) - 1;

    /// Creates a VNI, rejecting values that do not fit in 24 bits.
    pub fn new(id: u32) -> Result<Self, ParseStateError> {
        if id > Self::MAX {
            return Err(ParseStateError::new("Vni", &id.to_string()));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Vni {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u32 = s
            .parse()
            .map_err(|_| ParseStateError::new("Vni", s))?;
        Self::new(id)
    }
}

/// An advisory lock held on a block-store image, as reported by the storage
/// layer's lock listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLock {
    pub id: String,
    pub locker: String,
    /// Address of the holder, `host:port/nonce` form; the host part
    /// identifies which node acquired the lock.
    pub address: String,
}

impl ImageLock {
    /// The host portion of the holder address.
    pub fn holder_host(&self) -> &str {
        self.address.split(':').next().unwrap_or(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("start", VmState::Start)]
    #[test_case("migrate-live", VmState::MigrateLive)]
    #[test_case("fail", VmState::Fail)]
    fn test_vm_state_wire_form(text: &str, state: VmState) {
        assert_eq!(text.parse::<VmState>().unwrap(), state);
        assert_eq!(state.to_string(), text);
    }

    #[test]
    fn test_unknown_state_is_an_error() {
        let err = "sleeping".parse::<VmState>().unwrap_err();
        assert!(err.to_string().contains("sleeping"));
    }

    #[test]
    fn test_coordinator_state_round_trip() {
        for state in [
            CoordinatorState::Primary,
            CoordinatorState::Secondary,
            CoordinatorState::Takeover,
            CoordinatorState::Relinquish,
            CoordinatorState::Client,
        ] {
            assert_eq!(state.as_str().parse::<CoordinatorState>().unwrap(), state);
        }
    }

    #[test]
    fn test_vni_bounds() {
        assert!(Vni::new(0).is_ok());
        assert!(Vni::new(Vni::MAX).is_ok());
        assert!(Vni::new(Vni::MAX + 1).is_err());
        assert_eq!("100".parse::<Vni>().unwrap().get(), 100);
    }

    #[test]
    fn test_image_lock_holder_host() {
        let lock = ImageLock {
            id: "auto 140095".into(),
            locker: "client.4123".into(),
            address: "10.0.1.12:0/1020202".into(),
        };
        assert_eq!(lock.holder_host(), "10.0.1.12");
    }
}
