//! # roostd: the Roost node daemon
//!
//! Wires the whole control plane together on one node: the store client
//! and schema, the coordinator role machine, the keepalive/fencing loop,
//! the per-VM and per-network fleet maps driven by children watches, the
//! schema hot-upgrade handler, and graceful teardown. The daemon core is a
//! library so integration tests can run several nodes over one store with
//! mock host seams.

pub mod logging;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use roost_config::RoostConfig;
use roost_host::{
    BlockStore, CliBlockStore, CliHypervisor, CliStorageMonitor, Commander, Hypervisor,
    IpmiClient, IpmiTarget, MockBlockStore, MockCommander, MockHypervisor, MockStorageMonitor,
    NetPlumbing, StorageMonitor,
};
use roost_net::{NetContext, NetworkInstance, NetworkMap};
use roost_node::{
    start_keepalive_timer, Coordinator, Fencer, KeepaliveContext, SelfNode, ServiceSet,
};
use roost_store::{Client, Store};
use roost_types::{CoordinatorState, Vni};
use roost_vm::{RunningList, VmContext, VmInstance};
use tracing::{error, info, warn};
use uuid::Uuid;

/// The external interfaces a daemon runs against.
#[derive(Clone)]
pub struct HostSeams {
    pub commander: Commander,
    pub hypervisor: Hypervisor,
    pub blockstore: BlockStore,
    pub storage: StorageMonitor,
}

/// Mock counterparts, for tests.
pub struct MockSeams {
    pub commander: Arc<MockCommander>,
    pub hypervisor: Arc<MockHypervisor>,
    pub blockstore: Arc<MockBlockStore>,
    pub storage: Arc<MockStorageMonitor>,
}

impl HostSeams {
    /// CLI-backed seams for a real host.
    pub fn system(config: &RoostConfig) -> Self {
        let commander = Commander::System;
        Self {
            hypervisor: Hypervisor::Cli(CliHypervisor::new(
                commander.clone(),
                "qemu:///system",
                "/var/log/roost/console",
                config.timing.command(),
                config.timing.probe(),
            )),
            blockstore: BlockStore::Cli(CliBlockStore::new(
                commander.clone(),
                &config.storage.block_cli,
                config.timing.command(),
            )),
            storage: StorageMonitor::Cli(CliStorageMonitor::new(
                commander.clone(),
                &config.storage.monitor_cli,
                config.timing.probe(),
            )),
            commander,
        }
    }

    /// Fully mocked seams.
    pub fn mock() -> (Self, MockSeams) {
        let (commander, commander_mock) = Commander::mock();
        let (hypervisor, hypervisor_mock) = Hypervisor::mock();
        let (blockstore, blockstore_mock) = BlockStore::mock();
        let (storage, storage_mock) = StorageMonitor::mock();
        (
            Self {
                commander,
                hypervisor,
                blockstore,
                storage,
            },
            MockSeams {
                commander: commander_mock,
                hypervisor: hypervisor_mock,
                blockstore: blockstore_mock,
                storage: storage_mock,
            },
        )
    }
}

/// One node's running control plane.
pub struct DaemonCore {
    pub config: Arc<RoostConfig>,
    pub client: Client,
    pub hostname: String,
    store: Arc<Store>,
    seams: HostSeams,
    running: RunningList,
    networks: NetworkMap,
    domains: Arc<RwLock<HashMap<Uuid, Arc<VmInstance>>>>,
    self_node: Arc<SelfNode>,
    keepalive_ctx: KeepaliveContext,
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    maintenance: Arc<AtomicBool>,
    keepalive_paused: Arc<AtomicBool>,
}

impl DaemonCore {
    /// Brings the node up: store connect, schema validation, self
    /// registration, watches, keepalive timer.
    pub async fn start(
        config: RoostConfig,
        store: Arc<Store>,
        seams: HostSeams,
    ) -> Result<Arc<Self>> {
        config.validate().context("configuration invalid")?;
        let config = Arc::new(config);
        let hostname = config.node.hostname.clone();
        info!(node = %hostname, coordinator = config.is_coordinator(), "starting roostd");

        let client = Client::connect(Arc::clone(&store)).context("store connection failed")?;

        // A fresh cluster gets the full tree; an existing one must already
        // carry everything our dialect requires.
        if !client.exists("base.schema.version") {
            info!("initializing store schema");
            client.apply_schema().context("schema initialization failed")?;
        }

        Self::register_self(&client, &config, &hostname)?;
        client.apply_schema().context("schema apply failed")?;
        client
            .validate_schema()
            .context("schema validation failed on startup")?;

        if config.daemon.enable_hypervisor {
            seams
                .hypervisor
                .validate()
                .await
                .context("cannot open local hypervisor")?;
        }

        // Fencing of this node depends on our own management endpoint.
        if !config.fencing.ipmi_host.is_empty() {
            let ipmi = IpmiClient::new(seams.commander.clone(), config.timing.probe());
            let target = IpmiTarget {
                host: config.fencing.ipmi_host.clone(),
                user: config.fencing.ipmi_user.clone(),
                password: config.fencing.ipmi_password.clone(),
            };
            if !ipmi.verify(&target).await {
                warn!("our IPMI endpoint is not reachable; fencing of this node will likely fail");
            }
        }

        // Claim a vacant primary slot on first boot.
        let current_primary = client.read("base.config.primary_node").unwrap_or_default();
        if current_primary.is_empty() || current_primary == "none" {
            if config.is_coordinator() {
                info!("no primary node found; setting us as primary");
                client
                    .write([("base.config.primary_node", hostname.clone())])
                    .context("claiming primary")?;
            }
        } else {
            info!(primary = %current_primary, "current primary node");
        }

        let plumbing = NetPlumbing::new(seams.commander.clone(), config.timing.command());
        let running = RunningList::new(client.clone(), hostname.clone());
        let networks: NetworkMap = Arc::new(RwLock::new(HashMap::new()));
        let primary_flag = Arc::new(AtomicBool::new(false));
        let maintenance = Arc::new(AtomicBool::new(false));
        let keepalive_paused = Arc::new(AtomicBool::new(false));

        let coordinator = Arc::new(Coordinator {
            client: client.clone(),
            config: Arc::clone(&config),
            hostname: hostname.clone(),
            plumbing: plumbing.clone(),
            services: ServiceSet::new(
                seams.commander.clone(),
                config.timing.command(),
                config.is_coordinator(),
            ),
            networks: Arc::clone(&networks),
            primary_flag: Arc::clone(&primary_flag),
        });
        Arc::clone(&coordinator).spawn()?;

        let self_node = SelfNode::new(client.clone(), Arc::clone(&config), hostname.clone());
        Arc::clone(&self_node).spawn()?;

        let fencer = Arc::new(Fencer::new(
            client.clone(),
            Arc::clone(&config),
            IpmiClient::new(seams.commander.clone(), config.timing.probe()),
            hostname.clone(),
        ));

        let keepalive_ctx = KeepaliveContext {
            client: client.clone(),
            config: Arc::clone(&config),
            hostname: hostname.clone(),
            hypervisor: seams.hypervisor.clone(),
            storage: seams.storage.clone(),
            fencer,
            maintenance: Arc::clone(&maintenance),
            paused: Arc::clone(&keepalive_paused),
        };

        let core = Arc::new(Self {
            config: Arc::clone(&config),
            client: client.clone(),
            hostname,
            store,
            seams,
            running,
            networks,
            domains: Arc::new(RwLock::new(HashMap::new())),
            self_node,
            keepalive_ctx: keepalive_ctx.clone(),
            keepalive_task: Mutex::new(None),
            maintenance,
            keepalive_paused,
        });

        // Surface store session changes; subscribers re-arm their watches
        // through the reload path when the session drops.
        let mut session = core.store.session_state();
        tokio::spawn(async move {
            while session.changed().await.is_ok() {
                let state = *session.borrow();
                warn!(?state, "store session state changed");
            }
        });

        core.spawn_maintenance_watch()?;
        core.spawn_domain_watch()?;
        if config.daemon.enable_networking {
            Arc::clone(&core).spawn_network_watch(primary_flag)?;
        }
        Arc::clone(&core).spawn_schema_upgrade_watch()?;

        *core.keepalive_task.lock().unwrap() = Some(start_keepalive_timer(keepalive_ctx));

        Ok(core)
    }

    /// Creates or refreshes this node's own entries.
    fn register_self(client: &Client, config: &RoostConfig, hostname: &str) -> Result<()> {
        let mode = if config.is_coordinator() {
            "coordinator"
        } else {
            "hypervisor"
        };
        let coordinator_state = if config.is_coordinator() {
            "secondary"
        } else {
            "client"
        };
        let domain_state = client
            .read(("node.state.domain", hostname))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "ready".to_string());

        client
            .write([
                (("node", hostname), hostname.to_string()),
                (("node.mode", hostname), mode.to_string()),
                (("node.state.daemon", hostname), "init".to_string()),
                (
                    ("node.state.coordinator", hostname),
                    coordinator_state.to_string(),
                ),
                (("node.state.domain", hostname), domain_state),
                (
                    ("node.data.active_schema", hostname),
                    client.schema().version().to_string(),
                ),
                (
                    ("node.ipmi.hostname", hostname),
                    config.fencing.ipmi_host.clone(),
                ),
                (
                    ("node.ipmi.username", hostname),
                    config.fencing.ipmi_user.clone(),
                ),
                (
                    ("node.ipmi.password", hostname),
                    config.fencing.ipmi_password.clone(),
                ),
                (
                    ("node.keepalive", hostname),
                    chrono::Utc::now().timestamp().to_string(),
                ),
            ])
            .context("registering node entries")?;
        Ok(())
    }

    fn spawn_maintenance_watch(&self) -> Result<()> {
        let mut watch = self.client.watch_data("base.config.maintenance")?;
        let maintenance = Arc::clone(&self.maintenance);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                let on = event.value.as_deref() == Some("true");
                maintenance.store(on, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    /// Keeps the per-VM instance map in step with the domain list.
    fn spawn_domain_watch(&self) -> Result<()> {
        let mut watch = self.client.watch_children("base.domain")?;
        let domains = Arc::clone(&self.domains);
        let ctx = VmContext {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            hostname: self.hostname.clone(),
            hypervisor: self.seams.hypervisor.clone(),
            blockstore: self.seams.blockstore.clone(),
            running: self.running.clone(),
        };
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                let mut current: Vec<Uuid> = Vec::new();
                for id in &event.children {
                    let Ok(uuid) = id.parse::<Uuid>() else {
                        continue;
                    };
                    current.push(uuid);
                    let known = domains.read().unwrap().contains_key(&uuid);
                    if !known {
                        match VmInstance::spawn(ctx.clone(), uuid) {
                            Ok(instance) => {
                                info!(%uuid, "tracking new VM");
                                domains.write().unwrap().insert(uuid, instance);
                            }
                            Err(error) => {
                                warn!(%uuid, %error, "could not track VM");
                            }
                        }
                    }
                }
                // Reap instances for deleted VMs; their own state watches
                // terminate on key deletion.
                domains.write().unwrap().retain(|uuid, instance| {
                    let keep = current.contains(uuid);
                    if !keep {
                        info!(%uuid, "reaping VM instance");
                        instance.stop_console();
                    }
                    keep
                });
            }
        });
        Ok(())
    }

    /// Keeps the per-network instance map in step with the network list.
    fn spawn_network_watch(self: Arc<Self>, primary_flag: Arc<AtomicBool>) -> Result<()> {
        let mut watch = self.client.watch_children("base.network")?;
        let core = self;
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                let ctx = NetContext {
                    client: core.client.clone(),
                    config: Arc::clone(&core.config),
                    hostname: core.hostname.clone(),
                    plumbing: NetPlumbing::new(
                        core.seams.commander.clone(),
                        core.config.timing.command(),
                    ),
                    commander: core.seams.commander.clone(),
                    primary: Arc::clone(&primary_flag),
                };
                let mut current: Vec<u32> = Vec::new();
                for id in &event.children {
                    let Ok(vni) = id.parse::<Vni>() else {
                        continue;
                    };
                    current.push(vni.get());
                    let known = core.networks.read().unwrap().contains_key(&vni.get());
                    if !known {
                        match NetworkInstance::spawn(ctx.clone(), vni).await {
                            Ok(instance) => {
                                info!(%vni, "tracking new network");
                                core.networks.write().unwrap().insert(vni.get(), instance);
                            }
                            Err(error) => {
                                warn!(%vni, %error, "could not materialize network");
                            }
                        }
                    }
                }
                let doomed: Vec<Arc<NetworkInstance>> = {
                    let mut map = core.networks.write().unwrap();
                    let doomed = map
                        .iter()
                        .filter(|(vni, _)| !current.contains(vni))
                        .map(|(_, i)| Arc::clone(i))
                        .collect();
                    map.retain(|vni, _| current.contains(vni));
                    doomed
                };
                for instance in doomed {
                    info!(vni = %instance.vni(), "removing deleted network");
                    if let Err(error) = instance.remove_network().await {
                        warn!(%error, "network teardown failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// The cluster-wide schema hot-upgrade handler.
    fn spawn_schema_upgrade_watch(self: Arc<Self>) -> Result<()> {
        let mut watch = self.client.watch_data("base.schema.version")?;
        let core = self;
        tokio::spawn(async move {
            // Skip the initial snapshot.
            let _ = watch.recv().await;
            while let Some(event) = watch.recv().await {
                let Some(new_version) = event.value.as_deref().and_then(|v| v.parse().ok())
                else {
                    continue;
                };
                core.hot_upgrade_schema(new_version).await;
            }
        });
        Ok(())
    }

    async fn hot_upgrade_schema(&self, new_version: u32) {
        let active = self.client.schema().version();
        if new_version == active {
            return;
        }
        info!(active, new_version, "hot update of schema version started");

        // No keepalives may land mid-migration.
        self.keepalive_paused.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let primary = self.client.read("base.config.primary_node").unwrap_or_default();
        if primary == self.hostname {
            info!("primary node acquiring exclusive lock");
            tokio::time::sleep(Duration::from_millis(500)).await;
            let Ok(lock) = self.client.exclusive_lock("base.schema.version") else {
                self.keepalive_paused.store(false, Ordering::SeqCst);
                return;
            };
            let guard = lock.acquire().await;
            info!("performing schema update");
            let result = if new_version > active {
                self.client.migrate_schema(new_version)
            } else {
                self.client.rollback_schema(new_version)
            };
            if let Err(error) = result {
                error!(%error, "schema migration failed");
            }
            drop(guard);
        } else {
            info!("non-primary node acquiring read lock");
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Ok(lock) = self.client.rw_lock("base.schema.version") {
                let guard = lock.read().await;
                drop(guard);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(error) = self.client.load_schema(new_version) {
                error!(%error, "could not load new schema dialect");
            }
        }

        let _ = self.client.write([(
            ("node.data.active_schema", self.hostname.as_str()),
            new_version.to_string(),
        )]);

        // Watches owned by this core survive a dialect switch (the paths
        // they were armed on were resolved under the old dialect and moved
        // subtrees re-fire them), so an in-process reload suffices here.
        info!("reloading node daemon services");
        self.keepalive_paused.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Introspection helpers (used by tests and teardown)
    // ------------------------------------------------------------------

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.client
            .read(("node.state.coordinator", self.hostname.as_str()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(CoordinatorState::Client)
    }

    pub fn vm_instance(&self, uuid: Uuid) -> Option<Arc<VmInstance>> {
        self.domains.read().unwrap().get(&uuid).cloned()
    }

    pub fn network_instance(&self, vni: u32) -> Option<Arc<NetworkInstance>> {
        self.networks.read().unwrap().get(&vni).cloned()
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Runs one keepalive immediately (tests drive time explicitly).
    pub async fn keepalive_now(&self) {
        roost_node::node_keepalive(&self.keepalive_ctx).await;
    }

    /// Graceful teardown: drain waits, forced hand-off, final keepalive,
    /// `stop` publication.
    pub async fn shutdown(&self) {
        info!(node = %self.hostname, "terminating roostd and cleaning up");
        let _ = self.client.write([(
            ("node.state.daemon", self.hostname.as_str()),
            "shutdown".to_string(),
        )]);

        info!("waiting for any active drains");
        self.self_node.wait_for_drain().await;

        info!("stopping domain console watchers");
        for instance in self.domains.read().unwrap().values() {
            instance.stop_console();
        }

        // Force the primary role elsewhere before we disappear.
        let peers = self.client.children("base.node").unwrap_or_default();
        if self.coordinator_state() == CoordinatorState::Primary && peers.len() > 1 {
            info!("forcing primary hand-off before shutdown");
            let _ = self
                .client
                .write([("base.config.primary_node", "none".to_string())]);
            let deadline = tokio::time::Instant::now()
                + Duration::from_secs(self.config.timing.shutdown_handoff_timeout);
            while self.coordinator_state() == CoordinatorState::Primary {
                if tokio::time::Instant::now() >= deadline {
                    warn!("primary hand-off did not complete before shutdown deadline");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        if let Some(task) = self.keepalive_task.lock().unwrap().take() {
            task.abort();
        }
        info!("performing final keepalive update");
        self.keepalive_now().await;

        let _ = self.client.write([(
            ("node.state.daemon", self.hostname.as_str()),
            "stop".to_string(),
        )]);
        self.store.close();
        info!(node = %self.hostname, "terminated roostd");
    }
}
