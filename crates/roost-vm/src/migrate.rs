//! The live-migration handshake.
//!
//! Source and destination rendezvous on the per-VM migration sync lock so
//! neither side can believe it owns the VM while the other still does.
//! The source freezes the declaration under exclusive locks on the VM's
//! `node` and `state` keys (always taken in that order), waits for the
//! receiver's presence, performs the transfer under the sync lock, and
//! rolls the declaration back on any abort.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use roost_types::MigrateMethod;
use tracing::{info, warn};

use crate::instance::VmInstance;

impl VmInstance {
    /// Source side of a migration. `force_live` is set when the declared
    /// state is `migrate-live`; the VM's own `migrate_method` can force
    /// either mode as well.
    pub(crate) async fn migrate_vm(self: Arc<Self>, force_live: bool) {
        // Serialize against a migration already in flight.
        while self.flags.migrating.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.flags.migrating.store(true, Ordering::SeqCst);

        let method = self
            .read_dom("domain.meta.migrate_method")
            .and_then(|m| m.parse::<MigrateMethod>().ok())
            .unwrap_or(MigrateMethod::None);
        let force_live = force_live || method == MigrateMethod::Live;
        let force_shutdown = method == MigrateMethod::Shutdown;

        let dest = self.read_dom("domain.node").unwrap_or_default();
        let last_node = self.read_dom("domain.last_node").unwrap_or_default();
        info!(uuid = %self.uuid, %dest, "migrating VM");

        // Remembered for sanity checking after the rendezvous.
        let target_node = dest.clone();

        let id = self.uuid.to_string();
        let Ok(node_lock) = self.ctx.client.exclusive_lock(("domain.node", id.as_str())) else {
            self.flags.migrating.store(false, Ordering::SeqCst);
            return;
        };
        let Ok(state_lock) = self.ctx.client.exclusive_lock(("domain.state", id.as_str()))
        else {
            self.flags.migrating.store(false, Ordering::SeqCst);
            return;
        };
        let node_guard = node_lock.acquire().await;
        let state_guard = state_lock.acquire().await;

        let abort = |reason: &str| {
            let prior_last = self.last_last_node.lock().unwrap().clone();
            self.write_dom(&[
                ("domain.state", "start"),
                ("domain.node", &self.ctx.hostname),
                ("domain.last_node", &prior_last),
            ]);
            self.flags.migrating.store(false, Ordering::SeqCst);
            info!(uuid = %self.uuid, %reason, "aborted migration");
        };

        if dest == last_node || dest == self.ctx.hostname {
            abort("target node matches the current active node during initial check");
            drop(node_guard);
            drop(state_guard);
            return;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        // Wait for the receiver to announce itself in the sync-lock key.
        let sync_timeout = self.ctx.config.timing.migration_sync();
        let presence = tokio::time::timeout(sync_timeout, async {
            loop {
                match self.read_dom("domain.migrate.sync_lock") {
                    Some(value) if !value.is_empty() => break,
                    _ => tokio::time::sleep(Duration::from_millis(100)).await,
                }
            }
        })
        .await;
        if presence.is_err() {
            abort("timed out waiting for peer");
            drop(node_guard);
            drop(state_guard);
            return;
        }

        info!(uuid = %self.uuid, "acquiring sync lock for migration phase B");
        let Ok(sync_lock) = self
            .ctx
            .client
            .exclusive_lock(("domain.migrate.sync_lock", id.as_str()))
        else {
            abort("sync lock unavailable");
            drop(node_guard);
            drop(state_guard);
            return;
        };
        let Some(sync_guard) = sync_lock.acquire_timeout(sync_timeout).await else {
            abort("timed out waiting for peer");
            drop(node_guard);
            drop(state_guard);
            return;
        };
        info!(uuid = %self.uuid, "acquired sync lock for migration phase B");

        // Final verification under the lock.
        let node_now = self.read_dom("domain.node").unwrap_or_default();
        if node_now == last_node || node_now == self.ctx.hostname {
            abort("target node matches the current active node during final check");
            drop(sync_guard);
            drop(node_guard);
            drop(state_guard);
            return;
        }
        if node_now != target_node {
            abort("target node changed during preparation");
            drop(sync_guard);
            drop(node_guard);
            drop(state_guard);
            return;
        }

        let mut live_ok = false;
        if !force_shutdown {
            // A live transfer is attempted 3 times in succession.
            for attempt in 1..=3 {
                info!(uuid = %self.uuid, attempt, "attempting live migration");
                match self
                    .ctx
                    .hypervisor
                    .migrate_live(self.uuid, &dest, &self.ctx.config.node.cluster_domain)
                    .await
                {
                    Ok(()) => {
                        live_ok = true;
                        break;
                    }
                    Err(error) => {
                        warn!(uuid = %self.uuid, attempt, %error, "live migration failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        if live_ok {
            info!(uuid = %self.uuid, "successfully live-migrated VM");
            self.console.stop();
            self.ctx.running.remove(self.uuid);
        } else if force_live {
            warn!(uuid = %self.uuid, "could not live migrate while live migration enforced");
            abort("live migration failed and is required");
            drop(sync_guard);
            drop(node_guard);
            drop(state_guard);
            return;
        } else {
            info!(uuid = %self.uuid, "shutting down VM for offline migration");
            Arc::clone(&self).shutdown_vm().await;
        }

        *self.last_current_node.lock().unwrap() =
            self.read_dom("domain.node").unwrap_or_default();
        *self.last_last_node.lock().unwrap() =
            self.read_dom("domain.last_node").unwrap_or_default();

        drop(sync_guard);
        drop(node_guard);
        drop(state_guard);
        self.flags.migrating.store(false, Ordering::SeqCst);
    }

    /// Destination side of a migration: announce presence, let the source
    /// serialize against us, then converge on whatever actually arrived.
    pub(crate) async fn receive_migrate(self: Arc<Self>) {
        while self.flags.receiving.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.flags.receiving.store(true, Ordering::SeqCst);
        let mut redeclared_start = false;

        let source = self.last_current_node.lock().unwrap().clone();
        info!(uuid = %self.uuid, %source, "receiving VM migration");

        let id = self.uuid.to_string();
        // Our uuid in the sync-lock key is the "present" signal.
        self.write_dom(&[("domain.migrate.sync_lock", &id)]);

        let Ok(sync_lock) = self
            .ctx
            .client
            .exclusive_lock(("domain.migrate.sync_lock", id.as_str()))
        else {
            self.flags.receiving.store(false, Ordering::SeqCst);
            return;
        };

        info!(uuid = %self.uuid, "acquiring sync lock for migration phase A");
        let sync_timeout = self.ctx.config.timing.migration_sync();
        let Some(guard) = sync_lock.acquire_timeout(sync_timeout).await else {
            warn!(uuid = %self.uuid, "failed to acquire sync lock for receive");
            self.flags.receiving.store(false, Ordering::SeqCst);
            return;
        };
        info!(uuid = %self.uuid, "acquired sync lock for migration phase A");
        // Hold long enough for the source to queue behind us.
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(guard);

        info!(uuid = %self.uuid, "acquiring sync lock for migration phase C");
        let _guard = sync_lock.acquire().await;
        info!(uuid = %self.uuid, "acquired sync lock for migration phase C");

        *self.last_current_node.lock().unwrap() =
            self.read_dom("domain.node").unwrap_or_default();
        *self.last_last_node.lock().unwrap() =
            self.read_dom("domain.last_node").unwrap_or_default();
        let declared = self.read_dom("domain.state").unwrap_or_default();
        let node = self.read_dom("domain.node").unwrap_or_default();

        match self.ctx.hypervisor.domain_state(self.uuid).await.ok().flatten() {
            Some(state) if state.is_running() => {
                // The live stream landed and the domain is up.
                self.ctx.running.add(self.uuid);
                self.write_dom(&[("domain.state", "start")]);
                info!(uuid = %self.uuid, "successfully received migrated VM");
            }
            Some(_) => {
                self.record_failure("failed to receive migration");
            }
            None => {
                if node == self.ctx.hostname {
                    match declared.as_str() {
                        // The send was aborted; the source rolled back.
                        "start" => {
                            warn!(uuid = %self.uuid, "receive aborted via state change");
                        }
                        // Shutdown-based migration: trigger a fresh start
                        // sequence here.
                        "stop" => {
                            self.write_dom(&[("domain.state", "start")]);
                            redeclared_start = true;
                        }
                        other => {
                            warn!(
                                uuid = %self.uuid,
                                state = other,
                                "migrate aborted or failed"
                            );
                        }
                    }
                }
            }
        }
        drop(_guard);

        self.write_dom(&[("domain.migrate.sync_lock", "")]);
        self.flags.receiving.store(false, Ordering::SeqCst);

        if redeclared_start {
            // The watch event for our own start write may have fired while
            // the receive guard was still held; dispatch once more so the
            // start sequence cannot be lost.
            tokio::spawn(Arc::clone(&self).manage_vm_state());
        }
    }
}
