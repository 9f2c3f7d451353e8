//! Error types for the coordination store.

use thiserror::Error;

/// Store and schema errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A symbolic key used with an operation that requires resolution.
    #[error("symbolic key {0:?} does not resolve in the active schema")]
    UnknownKey(String),

    /// A transaction failed its optimistic version check.
    #[error("version check failed for {path}: expected {expected}, found {found}")]
    VersionMismatch {
        path: String,
        expected: u64,
        found: u64,
    },

    /// Rename source missing.
    #[error("rename source {0} does not exist")]
    RenameSourceMissing(String),

    /// Rename destination already present.
    #[error("rename destination {0} already exists")]
    RenameDestinationExists(String),

    /// No schema artifact is shipped for the requested version.
    #[error("no schema artifact for version {0}")]
    UnknownSchemaVersion(u32),

    /// A schema artifact failed to parse.
    #[error("schema artifact for version {version} is malformed: {source}")]
    MalformedArtifact {
        version: u32,
        source: serde_json::Error,
    },

    /// The live tree is missing keys required by the active schema.
    #[error("schema validation failed: {missing} missing keys (first: {first})")]
    ValidationFailed { missing: usize, first: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;
