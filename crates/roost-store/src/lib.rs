//! # roost-store: the coordination store for Roost
//!
//! Every observable state change in a Roost cluster flows through this
//! crate: a hierarchical path-keyed tree with per-key versions, watches,
//! and advisory locks, addressed through a versioned symbolic-key schema.
//!
//! - [`Store`] is the engine: the tree, watch dispatch, and the lock
//!   registry. It is shared behind `Arc` by every daemon core.
//! - [`Client`] is the typed layer: it resolves symbolic keys against the
//!   active [`Schema`] dialect, so unknown keys read as absent and write as
//!   no-ops, which is the property that makes rolling schema upgrades safe.
//! - [`schema::key_diff`] and the client's migrate/rollback walk the tree
//!   from one schema version to another, preserving renamed subtrees.

pub mod client;
pub mod error;
pub mod lock;
pub mod path;
pub mod schema;
pub mod tree;

pub use client::Client;
pub use error::{Error, Result};
pub use lock::{ExclusiveGuard, ExclusiveLockHandle, ReadGuard, RwLockHandle, WriteGuard};
pub use path::KeyRef;
pub use schema::{key_diff, Schema, SchemaDiff, CURRENT_VERSION};
pub use tree::{ChildrenEvent, DataEvent, SessionState, Store};
