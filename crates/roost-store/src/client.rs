//! Typed client over the store engine.
//!
//! The client pairs a store handle with a loaded schema dialect. Every
//! operation takes symbolic [`KeyRef`]s and resolves them first; keys the
//! active schema does not know read as absent and write as no-ops. That
//! property is load-bearing for rolling upgrades: a peer speaking a newer
//! dialect can write keys this node simply does not see.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock::{ExclusiveLockHandle, RwLockHandle};
use crate::path::KeyRef;
use crate::schema::{key_diff, Schema, SchemaDiff};
use crate::tree::{ChildrenEvent, DataEvent, Store};

/// A typed, schema-aware handle onto the coordination store.
#[derive(Clone)]
pub struct Client {
    store: Arc<Store>,
    schema: Arc<RwLock<Arc<Schema>>>,
}

impl Client {
    /// Connects to the store, adopting whatever schema version the cluster
    /// is on. A fresh store (no version key yet) speaks the current
    /// dialect; callers then run [`Client::apply_schema`] to initialize the
    /// tree.
    pub fn connect(store: Arc<Store>) -> Result<Self> {
        let current = Schema::current();
        let version_path = current
            .resolve(KeyRef::Base("base.schema.version"))
            .ok_or_else(|| Error::UnknownKey("base.schema.version".into()))?;

        let schema = match store.read(&version_path) {
            Some(text) => {
                let version = text.trim().parse::<u32>().unwrap_or(0);
                if version == current.version() {
                    current
                } else {
                    debug!(version, "loading cluster-active schema dialect");
                    Schema::load(version)?
                }
            }
            None => current,
        };

        Ok(Self {
            store,
            schema: Arc::new(RwLock::new(Arc::new(schema))),
        })
    }

    /// The underlying engine handle.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The active schema dialect.
    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().unwrap().clone()
    }

    /// Switches this client to another shipped schema version.
    pub fn load_schema(&self, version: u32) -> Result<()> {
        let schema = Schema::load(version)?;
        *self.schema.write().unwrap() = Arc::new(schema);
        Ok(())
    }

    fn resolve(&self, key: KeyRef<'_>) -> Option<String> {
        self.schema().resolve(key)
    }

    // ------------------------------------------------------------------
    // Key operations
    // ------------------------------------------------------------------

    pub fn exists<'a>(&self, key: impl Into<KeyRef<'a>>) -> bool {
        match self.resolve(key.into()) {
            Some(path) => self.store.exists(&path),
            None => false,
        }
    }

    pub fn read<'a>(&self, key: impl Into<KeyRef<'a>>) -> Option<String> {
        let path = self.resolve(key.into())?;
        self.store.read(&path)
    }

    /// Reads a value together with its version.
    pub fn read_stat<'a>(&self, key: impl Into<KeyRef<'a>>) -> Option<(String, u64)> {
        let path = self.resolve(key.into())?;
        self.store.read_stat(&path)
    }

    /// Batched read; each slot is `None` when absent or unresolved.
    pub fn read_many<'a, K>(&self, keys: impl IntoIterator<Item = K>) -> Vec<Option<String>>
    where
        K: Into<KeyRef<'a>>,
    {
        keys.into_iter().map(|k| self.read(k)).collect()
    }

    /// Writes a batch of key/value pairs as one transaction. Unresolved
    /// keys are skipped silently.
    pub fn write<'a, K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<KeyRef<'a>>,
        V: Into<String>,
    {
        let resolved: Vec<(String, String)> = pairs
            .into_iter()
            .filter_map(|(key, value)| {
                let key = key.into();
                match self.resolve(key) {
                    Some(path) => Some((path, value.into())),
                    None => {
                        debug!(key = %key.describe(), "skipping write to unresolved key");
                        None
                    }
                }
            })
            .collect();
        self.store.write_batch(resolved)
    }

    /// Compare-and-set on one key: writes only when the stored version
    /// still matches `expected`. Used for contention points.
    pub fn write_if_version<'a>(
        &self,
        key: impl Into<KeyRef<'a>>,
        value: &str,
        expected: u64,
    ) -> Result<bool> {
        let key = key.into();
        let path = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownKey(key.describe()))?;
        self.store.write_if_version(&path, value, expected)
    }

    /// Deletes keys recursively; unresolved and absent keys are skipped.
    pub fn delete<'a, K>(&self, keys: impl IntoIterator<Item = K>) -> Result<()>
    where
        K: Into<KeyRef<'a>>,
    {
        let paths: Vec<String> = keys
            .into_iter()
            .filter_map(|k| self.resolve(k.into()))
            .collect();
        self.store.delete(paths)
    }

    /// Lists children of a key; `None` when absent or unresolved.
    pub fn children<'a>(&self, key: impl Into<KeyRef<'a>>) -> Option<Vec<String>> {
        let path = self.resolve(key.into())?;
        self.store.children(&path)
    }

    /// Renames subtrees. Pairs with an unresolved endpoint are skipped;
    /// missing sources and existing destinations are hard errors.
    pub fn rename<'a, K>(&self, pairs: impl IntoIterator<Item = (K, K)>) -> Result<()>
    where
        K: Into<KeyRef<'a>>,
    {
        let resolved: Vec<(String, String)> = pairs
            .into_iter()
            .filter_map(|(from, to)| {
                let from = self.resolve(from.into())?;
                let to = self.resolve(to.into())?;
                Some((from, to))
            })
            .collect();
        self.store.rename_batch(resolved)
    }

    // ------------------------------------------------------------------
    // Watches
    // ------------------------------------------------------------------

    /// Watches a key's data. The current state is delivered immediately.
    pub fn watch_data<'a>(
        &self,
        key: impl Into<KeyRef<'a>>,
    ) -> Result<mpsc::UnboundedReceiver<DataEvent>> {
        let key = key.into();
        let path = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownKey(key.describe()))?;
        Ok(self.store.watch_data(&path))
    }

    /// Watches a key's child list. The current list is delivered
    /// immediately.
    pub fn watch_children<'a>(
        &self,
        key: impl Into<KeyRef<'a>>,
    ) -> Result<mpsc::UnboundedReceiver<ChildrenEvent>> {
        let key = key.into();
        let path = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownKey(key.describe()))?;
        Ok(self.store.watch_children(&path))
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Read/write lock on a key (shared readers, fair exclusive writer).
    pub fn rw_lock<'a>(&self, key: impl Into<KeyRef<'a>>) -> Result<RwLockHandle> {
        let key = key.into();
        let path = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownKey(key.describe()))?;
        Ok(self.store.rw_lock(&path))
    }

    /// Mutual-exclusion lock on a key.
    pub fn exclusive_lock<'a>(&self, key: impl Into<KeyRef<'a>>) -> Result<ExclusiveLockHandle> {
        let key = key.into();
        let path = self
            .resolve(key)
            .ok_or_else(|| Error::UnknownKey(key.describe()))?;
        Ok(self.store.exclusive_lock(&path))
    }

    // ------------------------------------------------------------------
    // Schema maintenance
    // ------------------------------------------------------------------

    /// Walks the tree and verifies every key the active schema requires.
    pub fn validate_schema(&self) -> Result<()> {
        let mut missing = Vec::new();
        self.walk_schema(|_, path, exists| {
            if !exists {
                missing.push(path.to_string());
            }
            None
        });
        if missing.is_empty() {
            Ok(())
        } else {
            for path in &missing {
                warn!(%path, "schema key not found");
            }
            Err(Error::ValidationFailed {
                missing: missing.len(),
                first: missing.remove(0),
            })
        }
    }

    /// Creates every key the active schema requires that is missing,
    /// including per-entity defaults.
    pub fn apply_schema(&self) -> Result<()> {
        let schema = self.schema();
        let creates = self.walk_schema(|key, path, exists| {
            if exists {
                return None;
            }
            let value = if key == "base.schema.version" {
                schema.version().to_string()
            } else if key.ends_with(".tier") {
                "default".to_string()
            } else {
                String::new()
            };
            Some((path.to_string(), value))
        });
        self.store.write_batch(creates)
    }

    /// Visits every required key, returning whatever the visitor collects.
    fn walk_schema<F>(&self, mut visit: F) -> Vec<(String, String)>
    where
        F: FnMut(&str, &str, bool) -> Option<(String, String)>,
    {
        let schema = self.schema();
        let mut out = Vec::new();

        for key in schema.keys("base") {
            let full = format!("base.{key}");
            if let Some(path) = schema.path(&full, None) {
                if let Some(v) = visit(&full, &path, self.store.exists(&path)) {
                    out.push(v);
                }
            }
        }

        for (group, depth) in schema.entity_groups() {
            for instance in self.instances(&schema, group, depth) {
                for key in schema.keys(group) {
                    let full = format!("{group}.{key}");
                    if let Some(path) = schema.path(&full, Some(instance.as_str())) {
                        if let Some(v) = visit(&full, &path, self.store.exists(&path)) {
                            out.push(v);
                        }
                    }
                }

                // Second-layer records under networks: reservations and
                // firewall rules have their own key groups.
                if group == "network" {
                    for (outer, inner) in
                        [("reservation", "reservation"), ("rule.in", "rule"), ("rule.out", "rule")]
                    {
                        let outer_key = format!("network.{outer}");
                        let Some(outer_path) = schema.path(&outer_key, Some(instance.as_str())) else {
                            continue;
                        };
                        for record in self.store.children(&outer_path).unwrap_or_default() {
                            for key in schema.keys(inner) {
                                let full = format!("{inner}.{key}");
                                let Some(fragment) = schema.path(&full, Some(record.as_str())) else {
                                    continue;
                                };
                                let path = format!("{outer_path}{fragment}");
                                if let Some(v) = visit(&full, &path, self.store.exists(&path)) {
                                    out.push(v);
                                }
                            }
                        }
                    }
                }
            }
        }

        out
    }

    /// Existing instance ids of an entity group, joined with `/` for
    /// nested kinds.
    fn instances(&self, schema: &Schema, group: &str, depth: usize) -> Vec<String> {
        let Some(root) = schema.path(&format!("base.{group}"), None) else {
            return Vec::new();
        };
        let mut level: Vec<String> = vec![String::new()];
        for _ in 0..depth {
            let mut next = Vec::new();
            for prefix in &level {
                let path = format!("{root}{prefix}");
                for child in self.store.children(&path).unwrap_or_default() {
                    next.push(format!("{prefix}/{child}"));
                }
            }
            level = next;
        }
        level
            .into_iter()
            .map(|p| p.trim_start_matches('/').to_string())
            .collect()
    }

    // ------------------------------------------------------------------
    // Schema migration
    // ------------------------------------------------------------------

    /// Migrates the tree (and this client) stepwise up to `new_version`.
    pub fn migrate_schema(&self, new_version: u32) -> Result<()> {
        let mut active = (*self.schema()).clone();
        let Some(versions) = Schema::find_all(active.version(), Some(new_version)) else {
            return Ok(());
        };
        for version in versions {
            let next = Schema::load(version)?;
            let diff = key_diff(&active, &next);
            self.apply_diff(&active, &next, &diff)?;
            active = next;
        }
        *self.schema.write().unwrap() = Arc::new(active);
        Ok(())
    }

    /// Rolls the tree (and this client) stepwise back to `old_version`.
    pub fn rollback_schema(&self, old_version: u32) -> Result<()> {
        let mut active = (*self.schema()).clone();
        let mut versions: Vec<u32> = Schema::shipped_versions()
            .into_iter()
            .filter(|v| *v >= old_version && *v < active.version())
            .collect();
        versions.reverse();
        for version in versions {
            let next = Schema::load(version)?;
            let diff = key_diff(&active, &next);
            self.apply_diff(&active, &next, &diff)?;
            active = next;
        }
        *self.schema.write().unwrap() = Arc::new(active);
        Ok(())
    }

    /// Applies one `{add, remove, rename}` diff across the tree, expanding
    /// entity-group keys over every existing instance so renamed keys keep
    /// their subtrees.
    fn apply_diff(&self, from: &Schema, to: &Schema, diff: &SchemaDiff) -> Result<()> {
        let mut adds: Vec<(String, String)> = Vec::new();
        for (key, _) in &diff.add {
            for path in self.expand(to, key) {
                adds.push((path, String::new()));
            }
        }
        self.store.write_batch(adds)?;

        let mut removes = Vec::new();
        for (key, _) in &diff.remove {
            removes.extend(self.expand(from, key));
        }
        self.store.delete(removes)?;

        let mut renames = Vec::new();
        for renamed in &diff.rename {
            let sources = self.expand(from, &renamed.key);
            let targets = self.expand(to, &renamed.key);
            renames.extend(sources.into_iter().zip(targets));
        }
        self.store.rename_batch(renames)?;

        Ok(())
    }

    /// Concrete paths a symbolic key covers under a given schema: one path
    /// for `base` keys, one per existing instance for entity groups.
    fn expand(&self, schema: &Schema, key: &str) -> Vec<String> {
        let group = key.split('.').next().unwrap_or(key);
        if group == "base" {
            return schema.path(key, None).into_iter().collect();
        }
        match schema.entity_groups().iter().find(|(g, _)| *g == group) {
            Some((_, depth)) => self
                .instances(schema, group, *depth)
                .iter()
                .filter_map(|instance| schema.path(key, Some(instance)))
                .collect(),
            None => {
                // Second-layer record groups have no shipped diffs; warn so
                // a future artifact that needs them is noticed in review.
                warn!(%key, "schema diff touches a record group; skipped");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_client() -> Client {
        let store = Arc::new(Store::new());
        let client = Client::connect(store).unwrap();
        client.apply_schema().unwrap();
        client
    }

    #[test]
    fn test_connect_adopts_cluster_version() {
        let store = Arc::new(Store::new());
        store.write_batch([("/schema/version", "1")]).unwrap();

        let client = Client::connect(store).unwrap();
        assert_eq!(client.schema().version(), 1);
    }

    #[test]
    fn test_apply_then_validate() {
        let client = fresh_client();
        client.validate_schema().unwrap();
        assert_eq!(
            client.read("base.schema.version").unwrap(),
            Schema::current().version().to_string()
        );
    }

    #[test]
    fn test_validate_flags_missing_entity_keys() {
        let client = fresh_client();
        // A node registered with only some of its keys fails validation.
        client
            .store()
            .write_batch([("/nodes/hv1/keepalive", "0")])
            .unwrap();
        assert!(matches!(
            client.validate_schema(),
            Err(Error::ValidationFailed { .. })
        ));

        client.apply_schema().unwrap();
        client.validate_schema().unwrap();
    }

    #[test]
    fn test_unknown_key_reads_absent_writes_noop() {
        let client = fresh_client();
        assert_eq!(client.read(("node.memory.utilized", "hv1")), None);
        // The write is silently dropped, not an error.
        client
            .write([(("node.memory.utilized", "hv1"), "123")])
            .unwrap();
        assert_eq!(client.read(("node.memory.utilized", "hv1")), None);
    }

    #[test]
    fn test_typed_write_and_read() {
        let client = fresh_client();
        client
            .write([
                (("node.memory.free", "hv1"), "2048"),
                (("node.memory.used", "hv1"), "1024"),
            ])
            .unwrap();

        assert_eq!(client.read(("node.memory.free", "hv1")).unwrap(), "2048");
        let many = client.read_many([
            KeyRef::from(("node.memory.free", "hv1")),
            KeyRef::from(("node.memory.used", "hv1")),
            KeyRef::from(("node.cpu.load", "hv1")),
        ]);
        assert_eq!(many[0].as_deref(), Some("2048"));
        assert_eq!(many[1].as_deref(), Some("1024"));
        assert_eq!(many[2], None);
    }

    #[test]
    fn test_nested_record_access() {
        let client = fresh_client();
        let key = ("network.reservation", "100", "reservation.ip", "52:54:00:00:00:01");
        client.write([(key, "10.100.0.10")]).unwrap();
        assert_eq!(client.read(key).unwrap(), "10.100.0.10");
    }

    #[test]
    fn test_migrate_and_rollback_round_trip() {
        let store = Arc::new(Store::new());
        store.write_batch([("/schema/version", "0")]).unwrap();
        let client = Client::connect(Arc::clone(&store)).unwrap();
        assert_eq!(client.schema().version(), 0);
        client.apply_schema().unwrap();

        // Register a node under the v0 dialect; vcpu lives at /vcpu.
        client.write([(("node.vcpu.allocated", "hv1"), "8")]).unwrap();
        assert_eq!(store.read("/nodes/hv1/vcpu").unwrap(), "8");

        client.migrate_schema(2).unwrap();
        assert_eq!(client.schema().version(), 2);
        // The renamed key kept its data at the new path.
        assert_eq!(store.read("/nodes/hv1/vcpu_allocated").unwrap(), "8");
        assert!(!store.exists("/nodes/hv1/vcpu"));
        assert_eq!(client.read(("node.vcpu.allocated", "hv1")).unwrap(), "8");

        client.rollback_schema(0).unwrap();
        assert_eq!(client.schema().version(), 0);
        assert_eq!(store.read("/nodes/hv1/vcpu").unwrap(), "8");
        assert!(!store.exists("/nodes/hv1/vcpu_allocated"));
    }

    #[test]
    fn test_migration_preserves_untouched_keys() {
        let store = Arc::new(Store::new());
        store.write_batch([("/schema/version", "1")]).unwrap();
        let client = Client::connect(Arc::clone(&store)).unwrap();
        client.apply_schema().unwrap();
        client.write([(("domain", "u1"), "vm1")]).unwrap();
        client.write([(("domain.state", "u1"), "start")]).unwrap();

        client.migrate_schema(2).unwrap();

        assert_eq!(client.read(("domain.state", "u1")).unwrap(), "start");
        // v2's new key was created for the already-registered domain.
        assert!(client.exists(("domain.console.vnc", "u1")));
    }

    #[tokio::test]
    async fn test_watch_through_symbolic_key() {
        let client = fresh_client();
        client.write([(("domain.state", "u1"), "start")]).unwrap();

        let mut watch = client.watch_data(("domain.state", "u1")).unwrap();
        assert_eq!(watch.recv().await.unwrap().value.as_deref(), Some("start"));

        client.write([(("domain.state", "u1"), "migrate")]).unwrap();
        assert_eq!(watch.recv().await.unwrap().value.as_deref(), Some("migrate"));
    }
}
