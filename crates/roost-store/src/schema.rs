//! Versioned symbolic-key schema.
//!
//! A schema maps dotted symbolic keys to path templates, per group: the
//! `base` group holds singletons and entity roots, every other group holds
//! the per-entity sub-keys of one entity kind. Each schema version ships as
//! an immutable JSON artifact embedded in the binary, so a node can always
//! speak whichever dialect the cluster is currently on, including older
//! ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{normalize, KeyRef};

/// The newest schema version this binary ships.
pub const CURRENT_VERSION: u32 = 2;

/// All shipped schema artifacts, oldest first.
const ARTIFACTS: &[(u32, &str)] = &[
    (0, include_str!("../versions/0.json")),
    (1, include_str!("../versions/1.json")),
    (2, include_str!("../versions/2.json")),
];

/// Entity groups that have per-instance subtrees under a `base` root, with
/// the nesting depth of their instances (volumes live under a pool, and
/// snapshots under a volume under a pool).
const ENTITY_DEPTHS: &[(&str, usize)] = &[
    ("node", 1),
    ("domain", 1),
    ("network", 1),
    ("osd", 1),
    ("pool", 1),
    ("volume", 2),
    ("snapshot", 3),
];

/// One schema version: groups of symbolic keys and their path fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    version: u32,
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl Schema {
    /// Loads the artifact for one version.
    pub fn load(version: u32) -> Result<Self> {
        let (_, text) = ARTIFACTS
            .iter()
            .find(|(v, _)| *v == version)
            .ok_or(Error::UnknownSchemaVersion(version))?;
        serde_json::from_str(text).map_err(|source| Error::MalformedArtifact { version, source })
    }

    /// Loads the newest shipped schema.
    pub fn current() -> Self {
        // The current artifact is validated by tests; a malformed one is a
        // build defect, not a runtime condition.
        Self::load(CURRENT_VERSION).unwrap_or(Self {
            version: CURRENT_VERSION,
            groups: BTreeMap::new(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Symbolic keys of one group, or empty when the group is absent in
    /// this version.
    pub fn keys(&self, group: &str) -> Vec<&str> {
        self.groups
            .get(group)
            .map(|g| g.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All group names in this version.
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Entity groups present in this version, with their instance depth.
    pub fn entity_groups(&self) -> Vec<(&'static str, usize)> {
        ENTITY_DEPTHS
            .iter()
            .copied()
            .filter(|(g, _)| self.groups.contains_key(*g))
            .collect()
    }

    /// Resolves a dotted symbolic key, optionally for one entity instance.
    ///
    /// Returns `None` for keys this schema version does not know; callers
    /// treat that as "no path" (reads absent, writes no-op), which is what
    /// makes rolling upgrades safe.
    pub fn path(&self, key: &str, item: Option<&str>) -> Option<String> {
        let (group, sub) = match key.split_once('.') {
            Some((group, sub)) => (group, Some(sub)),
            None => (key, None),
        };

        match item {
            None => {
                let fragment = self.groups.get(group)?.get(sub?)?;
                Some(normalize(fragment))
            }
            Some(item) => {
                // Second-layer groups (reservation, lease, rule, tag) have
                // no base root; their fragments are joined onto an outer
                // path by the caller.
                let base = self
                    .groups
                    .get("base")
                    .and_then(|b| b.get(group))
                    .cloned()
                    .unwrap_or_default();

                match sub {
                    None => Some(normalize(&format!("{base}/{item}"))),
                    Some(sub) => {
                        let fragment = self.groups.get(group)?.get(sub)?;
                        Some(normalize(&format!("{base}/{item}{fragment}")))
                    }
                }
            }
        }
    }

    /// Resolves a [`KeyRef`] to a concrete path.
    ///
    /// A literal `/`-prefixed base reference passes through unresolved;
    /// the migration engine relies on this to address paths computed by
    /// [`key_diff`].
    pub fn resolve(&self, key: KeyRef<'_>) -> Option<String> {
        match key {
            KeyRef::Base(k) if k.starts_with('/') => Some(normalize(k)),
            KeyRef::Base(k) => self.path(k, None),
            KeyRef::Item(k, item) => self.path(k, Some(item)),
            KeyRef::Sub(k, item, sub, sub_item) => {
                let outer = self.path(k, Some(item))?;
                let inner = self.path(sub, Some(sub_item))?;
                Some(normalize(&format!("{outer}{inner}")))
            }
        }
    }

    /// Versions shipped in `(start, end]`, ascending. `None` when empty.
    pub fn find_all(start: u32, end: Option<u32>) -> Option<Vec<u32>> {
        let versions: Vec<u32> = ARTIFACTS
            .iter()
            .map(|(v, _)| *v)
            .filter(|v| *v > start && end.map_or(true, |e| *v <= e))
            .collect();
        if versions.is_empty() {
            None
        } else {
            Some(versions)
        }
    }

    /// Newest shipped version number.
    pub fn find_latest() -> u32 {
        ARTIFACTS.iter().map(|(v, _)| *v).max().unwrap_or(0)
    }

    /// All shipped version numbers, ascending.
    pub fn shipped_versions() -> Vec<u32> {
        ARTIFACTS.iter().map(|(v, _)| *v).collect()
    }
}

/// A path-level diff between two schema versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// `(symbolic key, path)` present only in the newer schema.
    pub add: Vec<(String, String)>,

    /// `(symbolic key, path)` present only in the older schema.
    pub remove: Vec<(String, String)>,

    /// Keys present in both whose paths moved.
    pub rename: Vec<RenamedKey>,
}

/// One key whose path changed between versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedKey {
    pub key: String,
    pub from: String,
    pub to: String,
}

/// Computes the ordered `{add, remove, rename}` diff from `a` to `b`.
pub fn key_diff(a: &Schema, b: &Schema) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    let mut groups: Vec<&str> = a.group_names();
    for g in b.group_names() {
        if !groups.contains(&g) {
            groups.push(g);
        }
    }
    groups.sort_unstable();

    for group in groups {
        let keys_a = a.keys(group);
        let keys_b = b.keys(group);

        for key in &keys_b {
            let full = format!("{group}.{key}");
            if !keys_a.contains(key) {
                if let Some(path) = b.path(&full, None) {
                    diff.add.push((full, path));
                }
            }
        }

        for key in &keys_a {
            let full = format!("{group}.{key}");
            if !keys_b.contains(key) {
                if let Some(path) = a.path(&full, None) {
                    diff.remove.push((full, path));
                }
            }
        }

        for key in &keys_b {
            let full = format!("{group}.{key}");
            if let (Some(from), Some(to)) = (a.path(&full, None), b.path(&full, None)) {
                if from != to {
                    diff.rename.push(RenamedKey {
                        key: full,
                        from,
                        to,
                    });
                }
            }
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_every_artifact_parses() {
        for (version, _) in ARTIFACTS {
            let schema = Schema::load(*version).unwrap();
            assert_eq!(schema.version(), *version);
        }
    }

    #[test]
    fn test_current_matches_latest_artifact() {
        assert_eq!(Schema::find_latest(), CURRENT_VERSION);
        assert_eq!(Schema::current().version(), CURRENT_VERSION);
    }

    #[test]
    fn test_base_resolution() {
        let schema = Schema::current();
        assert_eq!(
            schema.path("base.config.primary_node", None).unwrap(),
            "/config/primary_node"
        );
        assert_eq!(schema.path("base.node", None).unwrap(), "/nodes");
    }

    #[test]
    fn test_item_resolution() {
        let schema = Schema::current();
        assert_eq!(
            schema.path("node.memory.free", Some("hv1")).unwrap(),
            "/nodes/hv1/mem_free"
        );
        // Bare entity key resolves to the instance root.
        assert_eq!(schema.path("domain", Some("abcd")).unwrap(), "/domains/abcd");
    }

    #[test]
    fn test_nested_resolution() {
        let schema = Schema::current();
        let key = KeyRef::Sub("network.reservation", "100", "reservation.ip", "52:54:00:00:00:01");
        assert_eq!(
            schema.resolve(key).unwrap(),
            "/networks/100/dhcp4_reservations/52:54:00:00:00:01/ip"
        );
    }

    #[test]
    fn test_unknown_key_resolves_to_none() {
        let schema = Schema::current();
        assert!(schema.path("node.memory.utilized", Some("hv1")).is_none());
        assert!(schema.path("widget.size", None).is_none());
    }

    #[test]
    fn test_raw_path_passthrough() {
        let schema = Schema::current();
        assert_eq!(
            schema.resolve(KeyRef::Base("/nodes/hv1/mem_free")).unwrap(),
            "/nodes/hv1/mem_free"
        );
    }

    #[test]
    fn test_key_diff_across_shipped_history() {
        let v0 = Schema::load(0).unwrap();
        let v1 = Schema::load(1).unwrap();
        let v2 = Schema::load(2).unwrap();

        let d01 = key_diff(&v0, &v1);
        assert!(d01
            .add
            .iter()
            .any(|(k, _)| k == "base.config.migration_target_selector"));
        assert!(d01.add.iter().any(|(k, _)| k == "domain.meta.tags"));
        assert!(d01
            .rename
            .iter()
            .any(|r| r.key == "node.vcpu.allocated"
                && r.from == "/vcpu"
                && r.to == "/vcpu_allocated"));
        assert!(d01.remove.is_empty());

        let d12 = key_diff(&v1, &v2);
        assert_eq!(d12.add.len(), 1);
        assert_eq!(d12.add[0].0, "domain.console.vnc");
        assert!(d12.remove.is_empty());
        assert!(d12.rename.is_empty());
    }

    #[test]
    fn test_key_diff_is_symmetric() {
        let v0 = Schema::load(0).unwrap();
        let v2 = Schema::load(2).unwrap();

        let forward = key_diff(&v0, &v2);
        let backward = key_diff(&v2, &v0);

        let fwd_adds: Vec<_> = forward.add.iter().map(|(k, _)| k.clone()).collect();
        let bwd_removes: Vec<_> = backward.remove.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(fwd_adds, bwd_removes);
    }

    #[test]
    fn test_find_all_ranges() {
        assert_eq!(Schema::find_all(0, Some(2)), Some(vec![1, 2]));
        assert_eq!(Schema::find_all(1, None), Some(vec![2]));
        assert_eq!(Schema::find_all(2, None), None);
    }

    proptest! {
        // Identical schemas always diff to nothing, whatever version pair.
        #[test]
        fn prop_self_diff_is_empty(version in 0u32..=CURRENT_VERSION) {
            let schema = Schema::load(version).unwrap();
            let diff = key_diff(&schema, &schema);
            prop_assert!(diff.add.is_empty());
            prop_assert!(diff.remove.is_empty());
            prop_assert!(diff.rename.is_empty());
        }

        // Resolution never emits double slashes or trailing slashes.
        #[test]
        fn prop_paths_are_normalized(item in "[a-z0-9-]{1,12}") {
            let schema = Schema::current();
            for group in schema.group_names() {
                let group = group.to_string();
                for key in schema.keys(&group) {
                    let full = format!("{group}.{key}");
                    if let Some(path) = schema.path(&full, Some(item.as_str())) {
                        prop_assert!(path.starts_with('/'));
                        prop_assert!(!path.contains("//"));
                        prop_assert!(path.len() == 1 || !path.ends_with('/'));
                    }
                }
            }
        }
    }
}
