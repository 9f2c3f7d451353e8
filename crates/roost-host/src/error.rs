//! Error types for host-side interfaces.

use thiserror::Error;

/// Host interface errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn an external command.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// An external command exceeded its timeout.
    #[error("command {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// An external command exited nonzero.
    #[error("command {command} failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The hypervisor refused or failed an operation.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// The block store refused or failed an operation.
    #[error("block store error: {0}")]
    BlockStore(String),

    /// Malformed output from an external tool.
    #[error("unparseable output from {tool}: {detail}")]
    Parse { tool: String, detail: String },

    /// IO error (metrics files, log files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, Error>;
