//! Self-node lifecycle: domain-state drains.
//!
//! A node declared `flush` serially migrates every resident VM away, then
//! publishes `flushed`; `unflush` brings them back. A drain already in
//! flight is cancelled by the stopper flag when the declared state flips
//! again mid-drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roost_config::RoostConfig;
use roost_store::Client;
use roost_types::DomainState;
use tracing::{info, warn};

use crate::selector;

/// Drain supervisor for this node.
pub struct SelfNode {
    client: Client,
    config: Arc<RoostConfig>,
    hostname: String,
    flush_stopper: Arc<AtomicBool>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SelfNode {
    pub fn new(client: Client, config: Arc<RoostConfig>, hostname: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            hostname: hostname.into(),
            flush_stopper: Arc::new(AtomicBool::new(false)),
            flush_task: Mutex::new(None),
        })
    }

    /// Arms the domain-state watch; `flush` and `unflush` spawn drains.
    pub fn spawn(self: Arc<Self>) -> roost_store::Result<()> {
        let mut watch = self
            .client
            .watch_data(("node.state.domain", self.hostname.as_str()))?;
        let node = self;
        tokio::spawn(async move {
            let mut last: Option<String> = None;
            while let Some(event) = watch.recv().await {
                let Some(value) = event.value else { break };
                if last.as_deref() == Some(value.as_str()) {
                    continue;
                }
                last = Some(value.clone());
                let Ok(state) = value.parse::<DomainState>() else {
                    continue;
                };
                match state {
                    DomainState::Flush => Arc::clone(&node).start_drain(true).await,
                    DomainState::Unflush => Arc::clone(&node).start_drain(false).await,
                    DomainState::Ready | DomainState::Flushed => {
                        // A drain in flight is cancelled by the flip.
                        node.flush_stopper.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
        Ok(())
    }

    /// Whether a drain is currently running.
    pub fn drain_active(&self) -> bool {
        self.flush_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Waits for any active drain to wind down (used at shutdown).
    pub async fn wait_for_drain(&self) {
        while self.drain_active() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn start_drain(self: Arc<Self>, flush: bool) {
        // Stop any previous drain first.
        if self.drain_active() {
            info!(node = %self.hostname, "waiting for previous drain to stop");
            self.flush_stopper.store(true, Ordering::SeqCst);
            self.wait_for_drain().await;
        }
        self.flush_stopper.store(false, Ordering::SeqCst);

        let node = Arc::clone(&self);
        let task = tokio::spawn(async move {
            if flush {
                node.flush().await;
            } else {
                node.unflush().await;
            }
        });
        *self.flush_task.lock().unwrap() = Some(task);
    }

    fn stopped(&self) -> bool {
        self.flush_stopper.load(Ordering::SeqCst)
    }

    /// Waits for one VM to leave its transition states, bounded, and
    /// bails early when the drain is cancelled.
    async fn wait_for_vm_settle(&self, uuid: &str) {
        for _ in 0..600 {
            if self.stopped() {
                return;
            }
            let state = self
                .client
                .read(("domain.state", uuid))
                .unwrap_or_default();
            if !matches!(state.as_str(), "migrate" | "unmigrate" | "shutdown") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        warn!(%uuid, "VM did not settle while draining, continuing");
    }

    /// Migrates every resident VM away, serially so each selection sees
    /// fresh resource figures.
    async fn flush(&self) {
        info!(node = %self.hostname, "flushing node of running VMs");
        let resident: Vec<String> = self
            .client
            .read(("node.running_domains", self.hostname.as_str()))
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        for uuid in resident {
            if self.stopped() {
                info!(node = %self.hostname, "aborting node flush");
                self.flush_stopper.store(false, Ordering::SeqCst);
                return;
            }

            info!(%uuid, "selecting target to migrate VM");
            // Keep the original home if this VM was already migrated once.
            let current_node = self
                .client
                .read(("domain.last_node", uuid.as_str()))
                .filter(|n| !n.is_empty())
                .or_else(|| self.client.read(("domain.node", uuid.as_str())))
                .unwrap_or_default();

            let target = selector::find_target(
                &self.client,
                &uuid,
                self.config.vm.migration_target_selector,
            )
            .filter(|t| *t != current_node);

            match target {
                None => {
                    warn!(%uuid, "no migration target; shutting down with autostart flag");
                    let _ = self.client.write([
                        (("domain.state", uuid.as_str()), "shutdown".to_string()),
                        (("domain.meta.autostart", uuid.as_str()), "true".to_string()),
                    ]);
                }
                Some(target) => {
                    info!(%uuid, %target, "migrating VM away");
                    let _ = self.client.write([
                        (("domain.state", uuid.as_str()), "migrate".to_string()),
                        (("domain.node", uuid.as_str()), target),
                        (("domain.last_node", uuid.as_str()), current_node),
                    ]);
                }
            }

            self.wait_for_vm_settle(&uuid).await;
        }

        let _ = self.client.write([
            (
                ("node.running_domains", self.hostname.as_str()),
                String::new(),
            ),
            (
                ("node.state.domain", self.hostname.as_str()),
                "flushed".to_string(),
            ),
        ]);
    }

    /// Brings flushed VMs home and starts autostart-flagged ones.
    async fn unflush(&self) {
        info!(node = %self.hostname, "restoring node to active service");
        for uuid in self.client.children("base.domain").unwrap_or_default() {
            if self.stopped() {
                info!(node = %self.hostname, "aborting node unflush");
                self.flush_stopper.store(false, Ordering::SeqCst);
                return;
            }

            let autostart = self
                .client
                .read(("domain.meta.autostart", uuid.as_str()))
                .unwrap_or_default();
            let node = self
                .client
                .read(("domain.node", uuid.as_str()))
                .unwrap_or_default();
            if autostart == "true" && node == self.hostname {
                info!(%uuid, "starting autostart VM");
                let _ = self.client.write([
                    (("domain.state", uuid.as_str()), "start".to_string()),
                    (("domain.node", uuid.as_str()), self.hostname.clone()),
                    (("domain.last_node", uuid.as_str()), String::new()),
                    (("domain.meta.autostart", uuid.as_str()), "false".to_string()),
                ]);
                continue;
            }

            let last_node = self
                .client
                .read(("domain.last_node", uuid.as_str()))
                .unwrap_or_default();
            if last_node != self.hostname {
                continue;
            }

            info!(%uuid, "unmigrating VM home");
            let _ = self.client.write([
                (("domain.state", uuid.as_str()), "migrate".to_string()),
                (("domain.node", uuid.as_str()), self.hostname.clone()),
                (("domain.last_node", uuid.as_str()), String::new()),
            ]);

            self.wait_for_vm_settle(&uuid).await;
        }

        let _ = self.client.write([(
            ("node.state.domain", self.hostname.as_str()),
            "ready".to_string(),
        )]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_store::Store;

    fn fixture(hostname: &str) -> (Arc<SelfNode>, Client) {
        let client = Client::connect(Arc::new(Store::new())).unwrap();
        client.apply_schema().unwrap();
        let mut config = RoostConfig::default();
        config.node.hostname = hostname.to_string();
        let node = SelfNode::new(client.clone(), Arc::new(config), hostname);
        (node, client)
    }

    fn seed_peer(client: &Client, name: &str, free: u64) {
        client
            .write([
                (("node.state.daemon", name), "run".to_string()),
                (("node.state.domain", name), "ready".to_string()),
                (("node.memory.free", name), free.to_string()),
            ])
            .unwrap();
    }

    fn seed_vm(client: &Client, uuid: &str, node: &str) {
        client
            .write([
                (("domain", uuid), format!("vm-{uuid}")),
                (("domain.state", uuid), "start".to_string()),
                (("domain.node", uuid), node.to_string()),
                (("domain.last_node", uuid), String::new()),
                (("domain.meta.autostart", uuid), "false".to_string()),
            ])
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_migrates_resident_vms() {
        let (node, client) = fixture("h1");
        seed_peer(&client, "h2", 4096);
        seed_vm(&client, "u1", "h1");
        client
            .write([(("node.running_domains", "h1"), "u1".to_string())])
            .unwrap();

        // Simulate the receiving side completing the migration so the
        // settle wait returns promptly.
        let settle_client = client.clone();
        let settle = tokio::spawn(async move {
            loop {
                if settle_client.read(("domain.state", "u1")).as_deref() == Some("migrate") {
                    settle_client
                        .write([(("domain.state", "u1"), "start".to_string())])
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        node.flush().await;
        settle.await.unwrap();

        assert_eq!(client.read(("domain.node", "u1")).unwrap(), "h2");
        assert_eq!(client.read(("domain.last_node", "u1")).unwrap(), "h1");
        assert_eq!(client.read(("node.state.domain", "h1")).unwrap(), "flushed");
        assert_eq!(client.read(("node.running_domains", "h1")).unwrap(), "");
    }

    #[tokio::test]
    async fn test_flush_without_target_shuts_down_with_autostart() {
        let (node, client) = fixture("h1");
        // No live peers at all.
        seed_vm(&client, "u1", "h1");
        client
            .write([(("node.running_domains", "h1"), "u1".to_string())])
            .unwrap();

        let settle_client = client.clone();
        let settle = tokio::spawn(async move {
            loop {
                if settle_client.read(("domain.state", "u1")).as_deref() == Some("shutdown") {
                    settle_client
                        .write([(("domain.state", "u1"), "stop".to_string())])
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        node.flush().await;
        settle.await.unwrap();

        assert_eq!(client.read(("domain.meta.autostart", "u1")).unwrap(), "true");
        assert_eq!(client.read(("node.state.domain", "h1")).unwrap(), "flushed");
    }

    #[tokio::test]
    async fn test_unflush_brings_vms_home_and_autostarts() {
        let (node, client) = fixture("h1");
        seed_peer(&client, "h2", 4096);

        // u1 was flushed to h2 earlier; u2 was shut down with autostart.
        seed_vm(&client, "u1", "h2");
        client
            .write([(("domain.last_node", "u1"), "h1".to_string())])
            .unwrap();
        seed_vm(&client, "u2", "h1");
        client
            .write([
                (("domain.state", "u2"), "stop".to_string()),
                (("domain.meta.autostart", "u2"), "true".to_string()),
            ])
            .unwrap();

        let settle_client = client.clone();
        let settle = tokio::spawn(async move {
            loop {
                if settle_client.read(("domain.state", "u1")).as_deref() == Some("migrate") {
                    settle_client
                        .write([(("domain.state", "u1"), "start".to_string())])
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        node.unflush().await;
        settle.await.unwrap();

        assert_eq!(client.read(("domain.node", "u1")).unwrap(), "h1");
        assert_eq!(client.read(("domain.state", "u2")).unwrap(), "start");
        assert_eq!(client.read(("domain.meta.autostart", "u2")).unwrap(), "false");
        assert_eq!(client.read(("node.state.domain", "h1")).unwrap(), "ready");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_cancelled_by_stopper() {
        let (node, client) = fixture("h1");
        seed_peer(&client, "h2", 4096);
        seed_vm(&client, "u1", "h1");
        seed_vm(&client, "u2", "h1");
        client
            .write([(("node.running_domains", "h1"), "u1 u2".to_string())])
            .unwrap();

        // u1 never settles; the drain parks in the settle wait until the
        // stopper fires. u2 must then never be touched.
        Arc::clone(&node).start_drain(true).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        node.flush_stopper.store(true, Ordering::SeqCst);
        node.wait_for_drain().await;

        assert_eq!(client.read(("domain.node", "u2")).unwrap(), "h1");
        assert_eq!(client.read(("domain.state", "u2")).unwrap(), "start");
        // The drain never finished, so the node is not flushed.
        assert_ne!(
            client.read(("node.state.domain", "h1")).as_deref(),
            Some("flushed")
        );
    }
}
