//! The hierarchical versioned tree underlying the coordination store.
//!
//! Paths are `/`-separated; every node carries string data and a
//! monotonically increasing version. Mutations go through batched
//! operations that apply atomically under one lock, and registered data and
//! children watchers are notified after every mutation. Watch dispatch uses
//! unbounded channels so a slow watcher can never block a writer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::path::{is_direct_child, normalize, parent_of};

/// A change observed by a data watcher. The first event on a fresh watch
/// reports the current state of the path.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// Current value; `None` when the path does not exist.
    pub value: Option<String>,

    /// Version of the value; 0 for absent paths.
    pub version: u64,
}

/// A change observed by a children watcher.
#[derive(Debug, Clone)]
pub struct ChildrenEvent {
    /// Sorted names of the direct children.
    pub children: Vec<String>,
}

/// Connection state surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Closed,
}

#[derive(Debug, Default, Clone)]
struct NodeData {
    value: String,
    version: u64,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, NodeData>,
    data_watchers: HashMap<String, Vec<mpsc::UnboundedSender<DataEvent>>>,
    child_watchers: HashMap<String, Vec<mpsc::UnboundedSender<ChildrenEvent>>>,
}

/// The store engine. Shared behind `Arc`; every daemon core on the cluster
/// talks to the same instance (or, in production, to a client speaking the
/// same API against the replicated store service).
pub struct Store {
    state: Mutex<TreeState>,
    locks: crate::lock::LockRegistry,
    session: watch::Sender<SessionState>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let mut state = TreeState::default();
        state.nodes.insert("/".to_string(), NodeData::default());
        let (session, _) = watch::channel(SessionState::Connected);
        Self {
            state: Mutex::new(state),
            locks: crate::lock::LockRegistry::default(),
            session,
        }
    }

    /// Read/write lock primitive for a path.
    pub fn rw_lock(&self, path: &str) -> crate::lock::RwLockHandle {
        self.locks.rw_handle(&normalize(path))
    }

    /// Mutual-exclusion lock primitive for a path.
    pub fn exclusive_lock(&self, path: &str) -> crate::lock::ExclusiveLockHandle {
        self.locks.exclusive_handle(&normalize(path))
    }

    /// Subscribe to session-state changes (disconnect notification).
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Marks the session closed, waking subscribers.
    pub fn close(&self) {
        let _ = self.session.send(SessionState::Closed);
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.state.lock().unwrap().nodes.contains_key(&path)
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.read_stat(path).map(|(value, _)| value)
    }

    /// Reads a value together with its version.
    pub fn read_stat(&self, path: &str) -> Option<(String, u64)> {
        let path = normalize(path);
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(&path)
            .map(|n| (n.value.clone(), n.version))
    }

    /// Sorted direct children of a path, or `None` when the path is absent.
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        let path = normalize(path);
        let state = self.state.lock().unwrap();
        if !state.nodes.contains_key(&path) {
            return None;
        }
        Some(Self::children_locked(&state, &path))
    }

    fn children_locked(state: &TreeState, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| is_direct_child(path, k))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    /// Creates or updates a batch of paths atomically. Parents are created
    /// as needed.
    pub fn write_batch<I, P, V>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (P, V)>,
        P: AsRef<str>,
        V: Into<String>,
    {
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();
        for (path, value) in pairs {
            Self::set_locked(&mut state, &normalize(path.as_ref()), value.into(), &mut events);
        }
        drop(state);
        self.dispatch(events);
        Ok(())
    }

    /// Updates a single path only when its version still matches
    /// `expected`. Returns whether the write happened. The path must exist.
    pub fn write_if_version(&self, path: &str, value: &str, expected: u64) -> Result<bool> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get(&path) else {
            return Err(Error::VersionMismatch {
                path,
                expected,
                found: 0,
            });
        };
        if node.version != expected {
            return Ok(false);
        }
        let mut events = Vec::new();
        Self::set_locked(&mut state, &path, value.to_string(), &mut events);
        drop(state);
        self.dispatch(events);
        Ok(true)
    }

    /// Deletes paths recursively. Absent paths are skipped.
    pub fn delete<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();
        for path in paths {
            Self::delete_locked(&mut state, &normalize(path.as_ref()), &mut events);
        }
        drop(state);
        self.dispatch(events);
        Ok(())
    }

    /// Moves whole subtrees. Every source must exist and no destination may
    /// exist; the batch applies atomically or not at all.
    pub fn rename_batch<I, P>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (P, P)>,
        P: AsRef<str>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(from, to)| (normalize(from.as_ref()), normalize(to.as_ref())))
            .collect();

        let mut state = self.state.lock().unwrap();
        for (from, to) in &pairs {
            if !state.nodes.contains_key(from) {
                return Err(Error::RenameSourceMissing(from.clone()));
            }
            if state.nodes.contains_key(to) {
                return Err(Error::RenameDestinationExists(to.clone()));
            }
        }

        let mut events = Vec::new();
        for (from, to) in &pairs {
            let subtree: Vec<(String, NodeData)> = state
                .nodes
                .range(from.clone()..)
                .take_while(|(k, _)| k == &from || k.starts_with(&format!("{from}/")))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            for (old_path, data) in &subtree {
                let new_path = format!("{to}{}", &old_path[from.len()..]);
                Self::set_locked(&mut state, &normalize(&new_path), data.value.clone(), &mut events);
            }
            Self::delete_locked(&mut state, from, &mut events);
        }
        drop(state);
        self.dispatch(events);
        Ok(())
    }

    /// Registers a data watcher. The current state is delivered
    /// immediately, then every create/update/delete of the path.
    pub fn watch_data(&self, path: &str) -> mpsc::UnboundedReceiver<DataEvent> {
        let path = normalize(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let initial = match state.nodes.get(&path) {
            Some(node) => DataEvent {
                value: Some(node.value.clone()),
                version: node.version,
            },
            None => DataEvent {
                value: None,
                version: 0,
            },
        };
        let _ = tx.send(initial);
        state.data_watchers.entry(path).or_default().push(tx);
        rx
    }

    /// Registers a children watcher. The current child list is delivered
    /// immediately, then on every child create/delete.
    pub fn watch_children(&self, path: &str) -> mpsc::UnboundedReceiver<ChildrenEvent> {
        let path = normalize(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let children = Self::children_locked(&state, &path);
        let _ = tx.send(ChildrenEvent { children });
        state.child_watchers.entry(path).or_default().push(tx);
        rx
    }

    // ------------------------------------------------------------------
    // Locked mutation helpers. Each records the events to dispatch once
    // the state lock is released.
    // ------------------------------------------------------------------

    fn set_locked(state: &mut TreeState, path: &str, value: String, events: &mut Vec<Event>) {
        // Materialize missing ancestors first.
        let mut missing = Vec::new();
        let mut cursor = path.to_string();
        while let Some(parent) = parent_of(&cursor) {
            if !state.nodes.contains_key(parent) {
                missing.push(parent.to_string());
                cursor = parent.to_string();
            } else {
                break;
            }
        }
        for ancestor in missing.into_iter().rev() {
            state.nodes.insert(ancestor.clone(), NodeData::default());
            events.push(Event::Data(ancestor.clone(), Some(String::new()), 0));
            if let Some(parent) = parent_of(&ancestor) {
                events.push(Event::children_of(state, parent));
            }
        }

        let created = !state.nodes.contains_key(path);
        let node = state.nodes.entry(path.to_string()).or_default();
        if !created {
            node.version += 1;
        }
        node.value = value.clone();
        let version = node.version;

        events.push(Event::Data(path.to_string(), Some(value), version));
        if created {
            if let Some(parent) = parent_of(path) {
                events.push(Event::children_of(state, parent));
            }
        }
    }

    fn delete_locked(state: &mut TreeState, path: &str, events: &mut Vec<Event>) {
        if !state.nodes.contains_key(path) {
            return;
        }
        let doomed: Vec<String> = state
            .nodes
            .range(path.to_string()..)
            .take_while(|(k, _)| *k == path || k.starts_with(&format!("{path}/")))
            .map(|(k, _)| k.clone())
            .collect();
        for victim in &doomed {
            state.nodes.remove(victim);
            events.push(Event::Data(victim.clone(), None, 0));
        }
        if let Some(parent) = parent_of(path) {
            events.push(Event::children_of(state, parent));
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        let mut state = self.state.lock().unwrap();
        for event in events {
            match event {
                Event::Data(path, value, version) => {
                    if let Some(watchers) = state.data_watchers.get_mut(&path) {
                        watchers.retain(|tx| {
                            tx.send(DataEvent {
                                value: value.clone(),
                                version,
                            })
                            .is_ok()
                        });
                    }
                }
                Event::Children(path, children) => {
                    if let Some(watchers) = state.child_watchers.get_mut(&path) {
                        watchers.retain(|tx| {
                            tx.send(ChildrenEvent {
                                children: children.clone(),
                            })
                            .is_ok()
                        });
                    }
                }
            }
        }
    }
}

enum Event {
    Data(String, Option<String>, u64),
    Children(String, Vec<String>),
}

impl Event {
    fn children_of(state: &TreeState, path: &str) -> Self {
        Event::Children(path.to_string(), Store::children_locked(state, path))
    }
}
