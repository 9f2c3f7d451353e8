//! Dead-node detection and power fencing.
//!
//! The primary scans peers every keepalive. A peer whose keepalive age
//! crosses the fence threshold accumulates consecutive misses; only after
//! the configured number of consecutive stale scans does fencing trigger,
//! which absorbs transient clock skew and slow ticks. Fencing powers the
//! node off out-of-band and only recovers its VMs once the power-off is
//! confirmed; an unconfirmed power-off must never restart VMs elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use roost_config::RoostConfig;
use roost_host::{IpmiClient, IpmiTarget, PowerState};
use roost_store::Client;
use roost_types::{FailedFenceAction, SuccessfulFenceAction};
use tracing::{error, info, warn};

use crate::selector;

/// The fence scanner and executor.
pub struct Fencer {
    client: Client,
    config: Arc<RoostConfig>,
    ipmi: IpmiClient,
    hostname: String,
    /// Consecutive stale-keepalive observations per peer.
    miss_counts: Mutex<HashMap<String, u32>>,
    /// Peers currently being fenced, to keep the scan re-entrant safe.
    in_progress: Mutex<Vec<String>>,
}

impl Fencer {
    pub fn new(
        client: Client,
        config: Arc<RoostConfig>,
        ipmi: IpmiClient,
        hostname: String,
    ) -> Self {
        Self {
            client,
            config,
            ipmi,
            hostname,
            miss_counts: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(Vec::new()),
        }
    }

    /// One scan over all running peers. Called from the keepalive tick on
    /// the primary, outside maintenance.
    pub async fn fence_scan(self: Arc<Self>) {
        let now = chrono::Utc::now().timestamp();
        let fence_age = self.config.timing.fence_age().as_secs() as i64;

        for peer in self.client.children("base.node").unwrap_or_default() {
            if peer == self.hostname {
                continue;
            }
            let daemon_state = self
                .client
                .read(("node.state.daemon", peer.as_str()))
                .unwrap_or_default();
            if daemon_state != "run" {
                self.miss_counts.lock().unwrap().remove(&peer);
                continue;
            }

            let keepalive: i64 = self
                .client
                .read(("node.keepalive", peer.as_str()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let age = now - keepalive;

            if age < fence_age {
                self.miss_counts.lock().unwrap().remove(&peer);
                continue;
            }

            let misses = {
                let mut counts = self.miss_counts.lock().unwrap();
                let count = counts.entry(peer.clone()).or_insert(0);
                *count += 1;
                *count
            };
            warn!(%peer, age, misses, "peer keepalive is stale");

            if misses < self.config.timing.fence_consecutive {
                continue;
            }

            {
                let mut in_progress = self.in_progress.lock().unwrap();
                if in_progress.contains(&peer) {
                    continue;
                }
                in_progress.push(peer.clone());
            }
            self.miss_counts.lock().unwrap().remove(&peer);

            let fencer = Arc::clone(&self);
            tokio::spawn(async move {
                fencer.fence_node(&peer).await;
                fencer.in_progress.lock().unwrap().retain(|p| *p != peer);
            });
        }
    }

    /// Fences one peer: declare it dead, power it off out-of-band, verify,
    /// power it back on, and recover its VMs when policy allows.
    pub async fn fence_node(&self, peer: &str) {
        error!(%peer, "fencing dead node");

        // The declaration comes first so every surface sees the node as
        // dead even if IPMI fails below.
        let _ = self
            .client
            .write([(("node.state.daemon", peer), "dead".to_string())]);

        let target = IpmiTarget {
            host: self
                .client
                .read(("node.ipmi.hostname", peer))
                .unwrap_or_default(),
            user: self
                .client
                .read(("node.ipmi.username", peer))
                .unwrap_or_default(),
            password: self
                .client
                .read(("node.ipmi.password", peer))
                .unwrap_or_default(),
        };
        if target.host.is_empty() {
            error!(%peer, "no IPMI endpoint stored; cannot fence");
            return;
        }

        let off_ok = match self.ipmi.power_off(&target).await {
            Ok(ok) => ok,
            Err(error) => {
                warn!(%peer, %error, "IPMI power-off errored");
                false
            }
        };
        let verified = off_ok
            && matches!(self.ipmi.power_status(&target).await, Ok(PowerState::Off));

        if verified {
            info!(%peer, "fence power-off verified");
            // Bring the node back up; it will rejoin in init state.
            if let Ok(false) | Err(_) = self.ipmi.power_on(&target).await {
                warn!(%peer, "IPMI power-on after fence failed");
            }
            if self.config.fencing.successful_fence == SuccessfulFenceAction::Migrate {
                self.recover_vms(peer).await;
            }
        } else {
            error!(%peer, "could not verify fence power-off");
            match self.config.fencing.failed_fence {
                FailedFenceAction::Reset => {
                    warn!(%peer, "issuing chassis reset per failed-fence policy");
                    let _ = self.ipmi.power_reset(&target).await;
                }
                FailedFenceAction::None => {}
            }
        }
    }

    /// Restarts a fenced node's VMs on freshly-selected live targets.
    async fn recover_vms(&self, peer: &str) {
        let victims: Vec<String> = self
            .client
            .read(("node.running_domains", peer))
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        for uuid in victims {
            let tags = self
                .client
                .children(("domain.meta.tags", uuid.as_str()))
                .unwrap_or_default();
            if tags.iter().any(|t| t == "no_autorecover") {
                info!(%uuid, "skipping auto-recovery for tagged VM");
                continue;
            }

            let target = selector::find_target(
                &self.client,
                &uuid,
                self.config.vm.migration_target_selector,
            );
            match target {
                Some(target) => {
                    info!(%uuid, %target, "recovering VM from fenced node");
                    let _ = self.client.write([
                        (("domain.state", uuid.as_str()), "start".to_string()),
                        (("domain.node", uuid.as_str()), target),
                        (("domain.last_node", uuid.as_str()), peer.to_string()),
                    ]);
                }
                None => {
                    warn!(%uuid, "no live target for VM recovery");
                }
            }
        }
    }
}
