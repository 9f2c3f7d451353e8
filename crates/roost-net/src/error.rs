//! Error types for tenant network handling.

use thiserror::Error;

/// Tenant network errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] roost_store::Error),

    /// Host plumbing failed.
    #[error(transparent)]
    Host(#[from] roost_host::Error),

    /// IO error (rule files, hosts directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A network definition is unusable.
    #[error("invalid network definition for VNI {vni}: {detail}")]
    InvalidDefinition { vni: u32, detail: String },

    /// Unknown lease event verb from the DHCP daemon.
    #[error("unknown lease event {0:?}")]
    LeaseEvent(String),
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, Error>;
