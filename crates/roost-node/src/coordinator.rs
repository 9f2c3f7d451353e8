//! Coordinator election and the primary hand-off.
//!
//! Only coordinator-mode nodes participate. Election is contention on the
//! `base.config.primary_node` key: when it reads `none`, any eligible
//! secondary races to CAS its own name in under a short-lived exclusive
//! lock. Role changes then run the seven-phase hand-off, serialized
//! between the outgoing and incoming primary by the read/write lock on
//! `base.config.primary_node.sync_lock`: floating IPs, the metadata
//! address, per-network gateways, and the singleton services move in a
//! strict order so no address is ever bound twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roost_config::RoostConfig;
use roost_host::{Commander, NetPlumbing};
use roost_net::{network_snapshot, NetworkMap};
use roost_store::Client;
use roost_types::{CoordinatorState, DaemonMode};
use tracing::{info, warn};

/// Handles to everything the hand-off orchestrates.
#[derive(Clone)]
pub struct Coordinator {
    pub client: Client,
    pub config: Arc<RoostConfig>,
    pub hostname: String,
    pub plumbing: NetPlumbing,
    pub services: ServiceSet,
    pub networks: NetworkMap,
    /// Mirrored into every network instance: gates gateway/DHCP ownership.
    pub primary_flag: Arc<AtomicBool>,
}

impl Coordinator {
    /// Arms the primary-node and self coordinator-state watches. Returns
    /// immediately; transitions run on their own tasks.
    pub fn spawn(self: Arc<Self>) -> roost_store::Result<()> {
        let mut primary_watch = self.client.watch_data("base.config.primary_node")?;
        let mut role_watch = self
            .client
            .watch_data(("node.state.coordinator", self.hostname.as_str()))?;

        let coordinator = Arc::clone(&self);
        tokio::spawn(async move {
            let mut last: Option<String> = None;
            while let Some(event) = primary_watch.recv().await {
                let new_primary = event.value.unwrap_or_else(|| "none".to_string());
                if last.as_deref() == Some(new_primary.as_str()) {
                    continue;
                }
                last = Some(new_primary.clone());
                let this = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    this.handle_primary_change(&new_primary, event.version).await;
                });
            }
        });

        let coordinator = self;
        tokio::spawn(async move {
            while let Some(event) = role_watch.recv().await {
                let Some(state) = event.value.and_then(|v| v.parse::<CoordinatorState>().ok())
                else {
                    continue;
                };
                coordinator
                    .primary_flag
                    .store(
                        matches!(state, CoordinatorState::Primary | CoordinatorState::Takeover),
                        Ordering::SeqCst,
                    );
                match state {
                    CoordinatorState::Takeover => {
                        info!(node = %coordinator.hostname, "setting node to primary state");
                        let this = Arc::clone(&coordinator);
                        tokio::spawn(async move { this.become_primary().await });
                    }
                    CoordinatorState::Relinquish => {
                        let daemon_state = coordinator
                            .client
                            .read(("node.state.daemon", coordinator.hostname.as_str()))
                            .unwrap_or_default();
                        if daemon_state == "run" || daemon_state == "shutdown" {
                            info!(node = %coordinator.hostname, "setting node to secondary state");
                            let this = Arc::clone(&coordinator);
                            tokio::spawn(async move { this.become_secondary().await });
                        } else {
                            // Nothing was ever started here; skip the
                            // release sequence.
                            let _ = coordinator.client.write([(
                                ("node.state.coordinator", coordinator.hostname.as_str()),
                                "secondary".to_string(),
                            )]);
                        }
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    fn coordinator_state(&self) -> CoordinatorState {
        self.client
            .read(("node.state.coordinator", self.hostname.as_str()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(CoordinatorState::Client)
    }

    fn daemon_mode(&self) -> DaemonMode {
        if self.config.is_coordinator() {
            DaemonMode::Coordinator
        } else {
            DaemonMode::Hypervisor
        }
    }

    /// Reaction to a change of the primary-node key.
    pub async fn handle_primary_change(&self, new_primary: &str, key_version: u64) {
        if self.daemon_mode() != DaemonMode::Coordinator {
            let _ = self.client.write([(
                ("node.state.coordinator", self.hostname.as_str()),
                "client".to_string(),
            )]);
            return;
        }

        let role = self.coordinator_state();
        if new_primary == "none" {
            let daemon_state = self
                .client
                .read(("node.state.daemon", self.hostname.as_str()))
                .unwrap_or_default();
            let eligible = daemon_state == "run"
                && !matches!(
                    role,
                    CoordinatorState::Primary
                        | CoordinatorState::Takeover
                        | CoordinatorState::Relinquish
                );
            if eligible {
                self.contend_for_primary(key_version).await;
            }
        } else if new_primary == self.hostname {
            if role == CoordinatorState::Secondary {
                // Let other contenders time out before taking over.
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = self.client.write([(
                    ("node.state.coordinator", self.hostname.as_str()),
                    "takeover".to_string(),
                )]);
            }
        } else if role == CoordinatorState::Primary {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = self.client.write([(
                ("node.state.coordinator", self.hostname.as_str()),
                "relinquish".to_string(),
            )]);
        }
    }

    /// Contends for a vacant primary-node key. The lock timeout stays
    /// below the takeover settle delay so a losing contender can never
    /// deadlock the incoming primary.
    async fn contend_for_primary(&self, key_version: u64) {
        info!(node = %self.hostname, "contending for primary coordinator state");
        let Ok(lock) = self.client.exclusive_lock("base.config.primary_node") else {
            return;
        };
        let Some(guard) = lock
            .acquire_timeout(self.config.timing.primary_contention())
            .await
        else {
            info!(node = %self.hostname, "timed out contending for primary coordinator state");
            return;
        };

        // The key version must not have moved since the watch fired;
        // another contender may already have won.
        match self
            .client
            .write_if_version("base.config.primary_node", &self.hostname, key_version)
        {
            Ok(true) => {
                info!(node = %self.hostname, "acquired primary coordinator state");
            }
            Ok(false) => {
                info!(node = %self.hostname, "lost primary contention");
            }
            Err(error) => {
                warn!(node = %self.hostname, %error, "primary contention write failed");
            }
        }
        drop(guard);
    }

    // ------------------------------------------------------------------
    // Seven-phase hand-off
    // ------------------------------------------------------------------

    fn split_floating(address: &str) -> Option<(String, String)> {
        let (ip, prefix) = address.split_once('/')?;
        Some((ip.to_string(), prefix.to_string()))
    }

    /// Acquisition side (candidate): takes writer in phases A and C-G,
    /// reader in B, binding addresses and starting services as the old
    /// primary releases them.
    pub async fn become_primary(&self) {
        // Hold the primary-node key itself until the transition completes.
        let Ok(primary_lock) = self.client.exclusive_lock("base.config.primary_node") else {
            return;
        };
        let primary_guard = primary_lock.acquire().await;

        // Ensure the rendezvous key exists before anyone locks it.
        let _ = self
            .client
            .write([("base.config.primary_node.sync_lock", String::new())]);

        let Ok(sync) = self.client.rw_lock("base.config.primary_node.sync_lock") else {
            return;
        };
        let network = &self.config.network;

        // Phase A: handshake. Give the releasing side time to queue as
        // reader before we let go.
        info!("acquiring write lock for synchronization phase A");
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase A");
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Phase B: the releasing primary stops its singleton services.
        info!("acquiring read lock for synchronization phase B");
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase B");
        drop(guard);

        // Phase C: upstream floating IP.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase C");
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Some((ip, prefix)) = Self::split_floating(&network.upstream_floating_ip) {
            info!(%ip, dev = %network.upstream_dev, "creating floating upstream IP");
            let _ = self
                .plumbing
                .create_ip_address(&ip, &prefix, &network.upstream_dev)
                .await;
        }
        drop(guard);

        // Phase D: cluster and storage floating IPs.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase D");
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some((ip, prefix)) = Self::split_floating(&network.cluster_floating_ip) {
            info!(%ip, dev = %network.cluster_dev, "creating floating management IP");
            let _ = self
                .plumbing
                .create_ip_address(&ip, &prefix, &network.cluster_dev)
                .await;
        }
        if let Some((ip, prefix)) = Self::split_floating(&network.storage_floating_ip) {
            info!(%ip, dev = %network.storage_dev, "creating floating storage IP");
            let _ = self
                .plumbing
                .create_ip_address(&ip, &prefix, &network.storage_dev)
                .await;
        }
        drop(guard);

        // Phase E: metadata link-local IP.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase E");
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("creating metadata link-local IP 169.254.169.254/32 on lo");
        let _ = self
            .plumbing
            .create_ip_address("169.254.169.254", "32", "lo")
            .await;
        drop(guard);

        // Phase F: per-network gateway addresses.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase F");
        tokio::time::sleep(Duration::from_millis(200)).await;
        for instance in network_snapshot(&self.networks) {
            instance.create_gateways().await;
        }
        drop(guard);

        // Phase G: singleton services come up here.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase G");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let db_ok = self.services.transition_db_leader(&self.hostname).await;
        self.services.start_client_api().await;
        self.services.start_metadata_api().await;
        for instance in network_snapshot(&self.networks) {
            instance.start_dhcp().await;
        }
        if db_ok {
            self.services.start_dns_aggregator().await;
        } else {
            warn!("not starting DNS aggregator due to database leader failures");
        }
        drop(guard);

        // Let everything stabilize before declaring the transition done.
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(primary_guard);
        let _ = self.client.write([(
            ("node.state.coordinator", self.hostname.as_str()),
            "primary".to_string(),
        )]);
        info!(node = %self.hostname, "node transitioned to primary state");
    }

    /// Release side (old primary): reader everywhere except phase B,
    /// unbinding each address only after the candidate holds the phase.
    pub async fn become_secondary(&self) {
        // Let the candidate grab the phase A writer first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Ok(sync) = self.client.rw_lock("base.config.primary_node.sync_lock") else {
            return;
        };
        let network = &self.config.network;

        // Phase A: handshake.
        info!("acquiring read lock for synchronization phase A");
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase A");
        drop(guard);

        // Phase B: stop the singleton services we own.
        let guard = sync.write().await;
        info!("acquired write lock for synchronization phase B");
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.services.stop_dns_aggregator().await;
        for instance in network_snapshot(&self.networks) {
            instance.stop_dhcp().await;
        }
        drop(guard);
        self.services.stop_client_api().await;
        self.services.stop_metadata_api().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Phase C: release the upstream floating IP.
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase C");
        if let Some((ip, prefix)) = Self::split_floating(&network.upstream_floating_ip) {
            info!(%ip, dev = %network.upstream_dev, "removing floating upstream IP");
            let _ = self
                .plumbing
                .remove_ip_address(&ip, &prefix, &network.upstream_dev)
                .await;
        }
        drop(guard);

        // Phase D: release cluster and storage floating IPs.
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase D");
        if let Some((ip, prefix)) = Self::split_floating(&network.cluster_floating_ip) {
            let _ = self
                .plumbing
                .remove_ip_address(&ip, &prefix, &network.cluster_dev)
                .await;
        }
        if let Some((ip, prefix)) = Self::split_floating(&network.storage_floating_ip) {
            let _ = self
                .plumbing
                .remove_ip_address(&ip, &prefix, &network.storage_dev)
                .await;
        }
        drop(guard);

        // Phase E: release the metadata link-local IP.
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase E");
        let _ = self
            .plumbing
            .remove_ip_address("169.254.169.254", "32", "lo")
            .await;
        drop(guard);

        // Phase F: release per-network gateways.
        let guard = sync.read().await;
        info!("acquired read lock for synchronization phase F");
        for instance in network_snapshot(&self.networks) {
            instance.remove_gateways().await;
        }
        drop(guard);

        // Phase G: wait out the candidate's service start, but never
        // forever.
        info!("acquiring read lock for synchronization phase G");
        match sync.read_timeout(self.config.timing.handoff_sync()).await {
            Some(guard) => {
                info!("acquired read lock for synchronization phase G");
                drop(guard);
            }
            None => {
                // Best-effort: the candidate is taking long; proceed.
                warn!("timed out waiting for synchronization phase G");
            }
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = self.client.write([(
            ("node.state.coordinator", self.hostname.as_str()),
            "secondary".to_string(),
        )]);
        info!(node = %self.hostname, "node transitioned to secondary state");
    }
}

/// The singleton services that follow the primary, driven through the
/// service manager and the cluster database CLI.
#[derive(Clone)]
pub struct ServiceSet {
    commander: Commander,
    command_timeout: Duration,
    enabled: bool,
}

impl ServiceSet {
    pub fn new(commander: Commander, command_timeout: Duration, enabled: bool) -> Self {
        Self {
            commander,
            command_timeout,
            enabled,
        }
    }

    async fn systemctl(&self, verb: &str, unit: &str) {
        if !self.enabled {
            return;
        }
        if let Err(error) = self
            .commander
            .run(&["systemctl", verb, unit], self.command_timeout)
            .await
        {
            warn!(%verb, %unit, %error, "service manager call failed");
        }
    }

    pub async fn start_client_api(&self) {
        info!("starting client API service");
        self.systemctl("enable", "roost-api.service").await;
        self.systemctl("start", "roost-api.service").await;
        self.systemctl("start", "roost-worker.service").await;
    }

    pub async fn stop_client_api(&self) {
        info!("stopping client API service");
        self.systemctl("stop", "roost-api.service").await;
        self.systemctl("disable", "roost-api.service").await;
    }

    pub async fn start_metadata_api(&self) {
        self.systemctl("start", "roost-metadata.service").await;
    }

    pub async fn stop_metadata_api(&self) {
        self.systemctl("stop", "roost-metadata.service").await;
    }

    pub async fn start_dns_aggregator(&self) {
        self.systemctl("start", "roost-dns.service").await;
    }

    pub async fn stop_dns_aggregator(&self) {
        self.systemctl("stop", "roost-dns.service").await;
    }

    /// Moves the backing database leadership here, retrying a few times.
    /// Returns whether leadership is (or already was) local.
    pub async fn transition_db_leader(&self, hostname: &str) -> bool {
        if !self.enabled {
            return true;
        }
        info!("switching database leader to this node");
        for attempt in 1..=5u32 {
            let result = self
                .commander
                .run(
                    &[
                        "patronictl",
                        "-c",
                        "/etc/patroni/config.yml",
                        "switchover",
                        "--candidate",
                        hostname,
                        "--force",
                        "roost",
                    ],
                    self.command_timeout,
                )
                .await;
            match result {
                Ok(out) if out.success() => return true,
                Ok(out) if out.stderr.contains("are the same") || out.stdout.contains("are the same") => {
                    // Leadership already local.
                    return true;
                }
                Ok(out) => {
                    warn!(attempt, stderr = %out.stderr.trim(), "database switchover failed");
                }
                Err(error) => {
                    warn!(attempt, %error, "database switchover errored");
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_store::Store;
    use std::collections::HashMap;
    use std::sync::RwLock;

    fn coordinator(store: &Arc<Store>, hostname: &str) -> (Arc<Coordinator>, Arc<roost_host::MockCommander>) {
        let client = Client::connect(Arc::clone(store)).unwrap();
        client.apply_schema().unwrap();
        let (commander, mock) = Commander::mock();
        let mut config = RoostConfig::default();
        config.node.hostname = hostname.to_string();
        config.node.coordinators =
            vec!["cx1".to_string(), "cx2".to_string(), "cx3".to_string()];
        config.network.upstream_dev = "brupstream".to_string();
        config.network.upstream_floating_ip = "10.0.0.1/24".to_string();
        config.network.cluster_dev = "brcluster".to_string();
        config.network.cluster_floating_ip = "10.0.1.254/24".to_string();
        config.network.storage_dev = "brstorage".to_string();
        config.network.storage_floating_ip = "10.0.2.254/24".to_string();
        client
            .write([
                (("node.state.daemon", hostname), "run".to_string()),
                (("node.state.coordinator", hostname), "secondary".to_string()),
            ])
            .unwrap();
        (
            Arc::new(Coordinator {
                client,
                config: Arc::new(config),
                hostname: hostname.to_string(),
                plumbing: NetPlumbing::new(commander.clone(), Duration::from_secs(1)),
                services: ServiceSet::new(commander.clone(), Duration::from_secs(1), true),
                networks: Arc::new(RwLock::new(HashMap::new())),
                primary_flag: Arc::new(AtomicBool::new(false)),
            }),
            mock,
        )
    }

    #[tokio::test]
    async fn test_contention_single_winner() {
        let store = Arc::new(Store::new());
        let (cx1, _m1) = coordinator(&store, "cx1");
        let (cx2, _m2) = coordinator(&store, "cx2");

        cx1.client
            .write([("base.config.primary_node", "none".to_string())])
            .unwrap();
        let version = cx1
            .client
            .read_stat("base.config.primary_node")
            .unwrap()
            .1;

        let a = tokio::spawn({
            let cx1 = Arc::clone(&cx1);
            async move { cx1.handle_primary_change("none", version).await }
        });
        let b = tokio::spawn({
            let cx2 = Arc::clone(&cx2);
            async move { cx2.handle_primary_change("none", version).await }
        });
        let _ = tokio::join!(a, b);

        let winner = cx1.client.read("base.config.primary_node").unwrap();
        assert!(winner == "cx1" || winner == "cx2", "winner was {winner:?}");
        // Exactly one write happened: the version advanced exactly once.
        assert_eq!(
            cx1.client.read_stat("base.config.primary_node").unwrap().1,
            version + 1
        );
    }

    #[tokio::test]
    async fn test_non_coordinator_goes_client() {
        let store = Arc::new(Store::new());
        let (cx1, _mock) = coordinator(&store, "hv9");
        cx1.handle_primary_change("cx1", 0).await;
        assert_eq!(
            cx1.client.read(("node.state.coordinator", "hv9")).unwrap(),
            "client"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handoff_moves_floating_ips_in_order() {
        let store = Arc::new(Store::new());
        let (outgoing, out_mock) = coordinator(&store, "cx1");
        let (incoming, in_mock) = coordinator(&store, "cx2");
        outgoing
            .client
            .write([(("node.state.coordinator", "cx1"), "primary".to_string())])
            .unwrap();

        let release = tokio::spawn({
            let outgoing = Arc::clone(&outgoing);
            async move { outgoing.become_secondary().await }
        });
        let acquire = tokio::spawn({
            let incoming = Arc::clone(&incoming);
            async move { incoming.become_primary().await }
        });
        let _ = tokio::join!(release, acquire);

        // Candidate bound everything.
        assert!(in_mock.saw("ip address add 10.0.0.1/24 dev brupstream"));
        assert!(in_mock.saw("ip address add 10.0.1.254/24 dev brcluster"));
        assert!(in_mock.saw("ip address add 10.0.2.254/24 dev brstorage"));
        assert!(in_mock.saw("ip address add 169.254.169.254/32 dev lo"));
        assert!(in_mock.saw("systemctl start roost-api.service"));
        assert!(in_mock.saw("systemctl start roost-dns.service"));

        // Old primary released everything, stopping services first.
        assert!(out_mock.saw("ip address delete 10.0.0.1/24 dev brupstream"));
        assert!(out_mock.saw("ip address delete 169.254.169.254/32 dev lo"));
        let calls = out_mock.calls();
        let stop_dns = calls
            .iter()
            .position(|c| c.starts_with("systemctl stop roost-dns"))
            .unwrap();
        let del_upstream = calls
            .iter()
            .position(|c| c.starts_with("ip address delete 10.0.0.1/24"))
            .unwrap();
        assert!(stop_dns < del_upstream, "services must stop before IPs move");

        // Final states.
        assert_eq!(
            outgoing.client.read(("node.state.coordinator", "cx1")).unwrap(),
            "secondary"
        );
        assert_eq!(
            incoming.client.read(("node.state.coordinator", "cx2")).unwrap(),
            "primary"
        );
    }

    #[tokio::test]
    async fn test_db_leader_same_node_is_success() {
        let (commander, mock) = Commander::mock();
        mock.respond(
            "patronictl",
            roost_host::CommandOutput::failed(1, "Error: Switchover target and source are the same."),
        );
        let services = ServiceSet::new(commander, Duration::from_secs(1), true);
        assert!(services.transition_db_leader("cx1").await);
    }
}
