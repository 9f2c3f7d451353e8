//! Advisory locks keyed by store path.
//!
//! Three flavors, mirroring the store's locking contract: read locks are
//! shared; write and exclusive locks are both mutual exclusion, FIFO-fair
//! against readers and each other. All three flavors on the same path
//! contend on the same primitive: a reader queued on a path waits for an
//! exclusive holder of that path, which is what the schema-migration and
//! hand-off protocols rely on.
//!
//! Acquisition is always timeout-capable; a timed-out acquire reports "not
//! acquired" rather than raising, and callers decide what that means.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Guard for a held read lock; released on drop.
pub type ReadGuard = OwnedRwLockReadGuard<()>;

/// Guard for a held write lock; released on drop.
pub type WriteGuard = OwnedRwLockWriteGuard<()>;

/// Guard for a held exclusive lock; released on drop.
pub type ExclusiveGuard = OwnedRwLockWriteGuard<()>;

/// Registry of per-path lock primitives.
///
/// Lock objects are created lazily and shared: every handle for the same
/// path contends on the same primitive, exactly as peers contend on the
/// same lock path in the store.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    fn primitive(&self, path: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn rw_handle(&self, path: &str) -> RwLockHandle {
        RwLockHandle {
            path: path.to_string(),
            inner: self.primitive(path),
        }
    }

    pub fn exclusive_handle(&self, path: &str) -> ExclusiveLockHandle {
        ExclusiveLockHandle {
            path: path.to_string(),
            inner: self.primitive(path),
        }
    }
}

/// A read/write lock on one store path.
#[derive(Clone)]
pub struct RwLockHandle {
    path: String,
    inner: Arc<RwLock<()>>,
}

impl RwLockHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Acquires shared access, waiting as long as it takes.
    pub async fn read(&self) -> ReadGuard {
        self.inner.clone().read_owned().await
    }

    /// Acquires shared access or gives up after `timeout`.
    pub async fn read_timeout(&self, timeout: Duration) -> Option<ReadGuard> {
        tokio::time::timeout(timeout, self.read()).await.ok()
    }

    /// Acquires exclusive access, waiting as long as it takes.
    pub async fn write(&self) -> WriteGuard {
        self.inner.clone().write_owned().await
    }

    /// Acquires exclusive access or gives up after `timeout`.
    pub async fn write_timeout(&self, timeout: Duration) -> Option<WriteGuard> {
        tokio::time::timeout(timeout, self.write()).await.ok()
    }
}

/// A mutual-exclusion lock on one store path.
#[derive(Clone)]
pub struct ExclusiveLockHandle {
    path: String,
    inner: Arc<RwLock<()>>,
}

impl ExclusiveLockHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Acquires the lock, waiting as long as it takes.
    pub async fn acquire(&self) -> ExclusiveGuard {
        self.inner.clone().write_owned().await
    }

    /// Acquires the lock or gives up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<ExclusiveGuard> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_share_the_primitive() {
        let registry = LockRegistry::default();
        let a = registry.exclusive_handle("/config/primary_node");
        let b = registry.exclusive_handle("/config/primary_node");

        let guard = a.acquire().await;
        assert!(b.acquire_timeout(Duration::from_millis(20)).await.is_none());
        drop(guard);
        assert!(b.acquire_timeout(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_readers_share_writers_exclude() {
        let registry = LockRegistry::default();
        let lock = registry.rw_handle("/config/primary_node/sync_lock");

        let r1 = lock.read().await;
        let r2 = lock.read_timeout(Duration::from_millis(20)).await;
        assert!(r2.is_some());

        assert!(lock.write_timeout(Duration::from_millis(20)).await.is_none());
        drop(r1);
        drop(r2);
        assert!(lock.write_timeout(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_contend() {
        let registry = LockRegistry::default();
        let a = registry.exclusive_handle("/domains/u1/migrate_sync_lock");
        let b = registry.exclusive_handle("/domains/u2/migrate_sync_lock");

        let _guard = a.acquire().await;
        assert!(b.acquire_timeout(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_readers_queue_behind_exclusive_holder() {
        let registry = LockRegistry::default();
        let exclusive = registry.exclusive_handle("/schema/version");
        let rw = registry.rw_handle("/schema/version");

        let guard = exclusive.acquire().await;
        // A reader on the same path waits for the exclusive holder.
        assert!(rw.read_timeout(Duration::from_millis(20)).await.is_none());
        drop(guard);
        assert!(rw.read_timeout(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_timed_out_acquire_reports_not_acquired() {
        let registry = LockRegistry::default();
        let lock = registry.rw_handle("/x");
        let _w = lock.write().await;
        // A reader times out quietly rather than erroring.
        assert!(lock.read_timeout(Duration::from_millis(10)).await.is_none());
    }
}
