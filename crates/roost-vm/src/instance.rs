//! Per-VM instance supervision.
//!
//! A [`VmInstance`] mirrors one VM's declared state and drives the local
//! hypervisor to match. The store watch re-fires the dispatcher on every
//! state change; the dispatcher is guarded by per-instance flags so a
//! transition already in flight is never re-entered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roost_config::RoostConfig;
use roost_host::{BlockStore, Hypervisor};
use roost_store::Client;
use roost_types::{HvState, VmState};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::console::ConsoleWatcher;
use crate::RunningList;

/// Shared handles a VM instance needs to do its job.
#[derive(Clone)]
pub struct VmContext {
    pub client: Client,
    pub config: Arc<RoostConfig>,
    pub hostname: String,
    pub hypervisor: Hypervisor,
    pub blockstore: BlockStore,
    pub running: RunningList,
}

/// In-flight transition flags; any set flag makes the dispatcher no-op.
#[derive(Default)]
pub(crate) struct Flags {
    pub(crate) starting: AtomicBool,
    pub(crate) restarting: AtomicBool,
    pub(crate) migrating: AtomicBool,
    pub(crate) receiving: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) stopping: AtomicBool,
}

impl Flags {
    fn any(&self) -> bool {
        [
            &self.starting,
            &self.restarting,
            &self.migrating,
            &self.receiving,
            &self.shutting_down,
            &self.stopping,
        ]
        .iter()
        .any(|f| f.load(Ordering::SeqCst))
    }
}

/// Supervisor for a single VM on this node.
pub struct VmInstance {
    pub(crate) uuid: Uuid,
    pub(crate) ctx: VmContext,
    pub(crate) flags: Flags,
    pub(crate) console: ConsoleWatcher,
    /// Node/last-node as they were before the migration in flight, used to
    /// roll a failed migration back.
    pub(crate) last_current_node: Mutex<String>,
    pub(crate) last_last_node: Mutex<String>,
}

impl VmInstance {
    /// Creates the instance and arms its state watch. Every state change
    /// spawns a guarded dispatch.
    pub fn spawn(ctx: VmContext, uuid: Uuid) -> roost_store::Result<Arc<Self>> {
        let id = uuid.to_string();
        let mut watch = ctx.client.watch_data(("domain.state", id.as_str()))?;

        let instance = Arc::new(Self {
            uuid,
            console: ConsoleWatcher::new(uuid),
            last_current_node: Mutex::new(
                ctx.client.read(("domain.node", id.as_str())).unwrap_or_default(),
            ),
            last_last_node: Mutex::new(
                ctx.client
                    .read(("domain.last_node", id.as_str()))
                    .unwrap_or_default(),
            ),
            ctx,
            flags: Flags::default(),
        });

        let watcher = Arc::clone(&instance);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                if event.value.is_none() {
                    // Key deleted: the VM is being reaped.
                    watcher.console.stop();
                    break;
                }
                let dispatch = Arc::clone(&watcher);
                tokio::spawn(async move { dispatch.manage_vm_state().await });
            }
        });

        Ok(instance)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether any transition is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.flags.any()
    }

    /// Stops the console watcher (daemon teardown and instance reaping).
    pub fn stop_console(&self) {
        self.console.stop();
    }

    pub(crate) fn read_dom(&self, key: &str) -> Option<String> {
        let id = self.uuid.to_string();
        self.ctx.client.read((key, id.as_str()))
    }

    pub(crate) fn write_dom(&self, pairs: &[(&str, &str)]) {
        let id = self.uuid.to_string();
        let result = self
            .ctx
            .client
            .write(pairs.iter().map(|(k, v)| ((*k, id.as_str()), (*v).to_string())));
        if let Err(error) = result {
            warn!(uuid = %self.uuid, %error, "store write failed");
        }
    }

    /// Central failure recorder: flips the VM to `fail` with a reason, in
    /// one transaction.
    pub(crate) fn record_failure(&self, reason: &str) {
        error!(uuid = %self.uuid, %reason, "recording VM failure");
        self.write_dom(&[("domain.state", "fail"), ("domain.failed_reason", reason)]);
    }

    async fn hv_running(&self) -> bool {
        matches!(
            self.ctx.hypervisor.domain_state(self.uuid).await,
            Ok(Some(state)) if state.is_running()
        )
    }

    fn start_console(&self) {
        self.console.start(
            self.ctx.client.clone(),
            self.ctx.hypervisor.clone(),
            self.ctx.config.vm.console_log_lines,
        );
    }

    /// The guarded dispatcher: reads the declaration, inspects the local
    /// hypervisor, and runs the matching transition.
    pub fn manage_vm_state(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.manage_vm_state_inner())
    }

    async fn manage_vm_state_inner(self: Arc<Self>) {
        let state_text = self.read_dom("domain.state").unwrap_or_default();
        let Ok(state) = state_text.parse::<VmState>() else {
            return;
        };
        let node = self.read_dom("domain.node").unwrap_or_default();
        let running = self.hv_running().await;

        info!(uuid = %self.uuid, %state, %node, running, "VM state change");

        // Disable and provisioning states belong to the operator surfaces.
        if matches!(state, VmState::Disable | VmState::Provision | VmState::Fail) {
            return;
        }

        if self.flags.any() {
            return;
        }

        if node == self.ctx.hostname {
            if running {
                match state {
                    VmState::Start => {
                        self.start_console();
                        self.ctx.running.add(self.uuid);
                    }
                    // Running here and declared here, but stuck in a
                    // migrate state: converge back to start.
                    VmState::Migrate | VmState::MigrateLive => {
                        self.start_console();
                        self.write_dom(&[("domain.state", "start")]);
                        self.ctx.running.add(self.uuid);
                    }
                    VmState::Restart => Arc::clone(&self).restart_vm().await,
                    VmState::Shutdown => Arc::clone(&self).shutdown_vm().await,
                    VmState::Stop => self.stop_vm().await,
                    _ => {}
                }
            } else {
                match state {
                    VmState::Start => self.start_vm().await,
                    VmState::Migrate | VmState::MigrateLive => {
                        Arc::clone(&self).receive_migrate().await;
                    }
                    VmState::Restart => self.write_dom(&[("domain.state", "start")]),
                    VmState::Shutdown | VmState::Stop => {
                        self.ctx.running.remove(self.uuid);
                        self.console.stop();
                    }
                    _ => {}
                }
            }
            self.update_vnc().await;
        } else if running {
            // Declared elsewhere but running here.
            match state {
                VmState::Migrate => Arc::clone(&self).migrate_vm(false).await,
                VmState::MigrateLive => Arc::clone(&self).migrate_vm(true).await,
                VmState::Shutdown => Arc::clone(&self).shutdown_vm().await,
                _ => self.terminate_vm().await,
            }
        }
    }

    /// Start sequence: console watcher up, image advisory locks flushed,
    /// then domain creation from the stored XML.
    pub(crate) async fn start_vm(&self) {
        self.start_console();
        self.flags.starting.store(true, Ordering::SeqCst);
        info!(uuid = %self.uuid, "starting VM");

        if !self.hv_running().await && !self.flush_image_locks().await {
            self.flags.starting.store(false, Ordering::SeqCst);
            return;
        }

        if self.hv_running().await {
            // Crashed daemon or unexpected reboot: the domain survived,
            // just adopt it.
            self.ctx.running.add(self.uuid);
            self.write_dom(&[("domain.failed_reason", "")]);
        } else {
            let xml = self.read_dom("domain.xml").unwrap_or_default();
            match self.ctx.hypervisor.create_from_xml(&xml).await {
                Ok(()) => {
                    info!(uuid = %self.uuid, "successfully started VM");
                    self.ctx.running.add(self.uuid);
                    self.write_dom(&[("domain.failed_reason", "")]);
                }
                Err(error) => {
                    self.record_failure(&error.to_string());
                }
            }
        }

        self.flags.starting.store(false, Ordering::SeqCst);
    }

    /// Releases image advisory locks held by this host; a lock held by any
    /// other host fails the start. Freeing a foreign lock would invite two
    /// writers onto the same image.
    async fn flush_image_locks(&self) -> bool {
        let volumes = self.read_dom("domain.storage.volumes").unwrap_or_default();
        for volume in volumes.split(',').filter(|v| !v.is_empty()) {
            let locks = match self.ctx.blockstore.lock_list(volume).await {
                Ok(locks) => locks,
                Err(error) => {
                    warn!(uuid = %self.uuid, %volume, %error, "image lock listing failed");
                    continue;
                }
            };
            for lock in locks {
                if lock.holder_host() == self.ctx.config.storage.storage_ip {
                    if let Err(error) = self
                        .ctx
                        .blockstore
                        .lock_remove(volume, &lock.id, &lock.locker)
                        .await
                    {
                        warn!(uuid = %self.uuid, %volume, %error, "image lock removal failed");
                    }
                } else {
                    self.record_failure(&format!(
                        "could not safely free image lock {} held by {} on volume {}; stop the VM and flush locks manually",
                        lock.id,
                        lock.holder_host(),
                        volume
                    ));
                    return false;
                }
            }
        }
        true
    }

    pub(crate) async fn restart_vm(self: Arc<Self>) {
        info!(uuid = %self.uuid, "restarting VM");
        self.flags.restarting.store(true, Ordering::SeqCst);

        Arc::clone(&self).shutdown_vm().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.start_vm().await;

        self.write_dom(&[("domain.state", "start")]);
        self.flags.restarting.store(false, Ordering::SeqCst);
    }

    /// Graceful shutdown: ask the guest, poll up to the configured
    /// timeout, abort if the declaration changes under us.
    pub(crate) async fn shutdown_vm(self: Arc<Self>) {
        info!(uuid = %self.uuid, "gracefully stopping VM");
        self.flags.shutting_down.store(true, Ordering::SeqCst);
        let mut aborted = false;

        if let Err(error) = self.ctx.hypervisor.shutdown(self.uuid).await {
            warn!(uuid = %self.uuid, %error, "shutdown request failed");
        }

        let timeout = self.ctx.config.timing.vm_shutdown_timeout;
        let mut tick: u64 = 0;
        loop {
            tick += 1;
            tokio::time::sleep(Duration::from_secs(1)).await;

            let declared = self.read_dom("domain.state").unwrap_or_default();
            if !matches!(declared.as_str(), "shutdown" | "restart" | "migrate") {
                info!(uuid = %self.uuid, "aborting VM shutdown due to state change");
                aborted = true;
                break;
            }

            let hv_state = self
                .ctx
                .hypervisor
                .domain_state(self.uuid)
                .await
                .ok()
                .flatten();
            if !matches!(hv_state, Some(HvState::Running)) {
                self.ctx.running.remove(self.uuid);
                if !self.flags.restarting.load(Ordering::SeqCst) {
                    self.write_dom(&[("domain.state", "stop")]);
                }
                info!(uuid = %self.uuid, "successfully shut down VM");
                self.console.stop();
                break;
            }

            if tick >= timeout {
                warn!(uuid = %self.uuid, timeout, "shutdown timeout expired, forcing off");
                self.write_dom(&[("domain.state", "stop")]);
                break;
            }
        }

        self.flags.shutting_down.store(false, Ordering::SeqCst);

        if aborted {
            // Re-dispatch against whatever the declaration now says.
            tokio::spawn(Arc::clone(&self).manage_vm_state());
        }
    }

    /// Force destroy and publish `stop`.
    pub(crate) async fn stop_vm(&self) {
        info!(uuid = %self.uuid, "forcibly stopping VM");
        self.destroy_locally(true).await;
    }

    /// Force destroy without touching the declared state (used when the
    /// declaration already points elsewhere).
    pub(crate) async fn terminate_vm(&self) {
        info!(uuid = %self.uuid, "terminating VM");
        self.destroy_locally(false).await;
    }

    async fn destroy_locally(&self, write_stop: bool) {
        self.flags.stopping.store(true, Ordering::SeqCst);

        if let Err(error) = self.ctx.hypervisor.destroy(self.uuid).await {
            warn!(uuid = %self.uuid, %error, "destroy failed");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.hv_running().await {
            // It did not die the first time.
            let _ = self.ctx.hypervisor.destroy(self.uuid).await;
        }

        self.ctx.running.remove(self.uuid);
        if write_stop && !self.flags.restarting.load(Ordering::SeqCst) {
            self.write_dom(&[("domain.state", "stop")]);
        }
        self.console.stop();
        self.flags.stopping.store(false, Ordering::SeqCst);
    }

    /// Hot-attaches a device to the running domain.
    pub async fn attach_device(&self, device_xml: &str) -> bool {
        if !self.hv_running().await {
            warn!(uuid = %self.uuid, "cannot attach device to non-running domain");
            return false;
        }
        match self.ctx.hypervisor.attach_device(self.uuid, device_xml).await {
            Ok(()) => {
                info!(uuid = %self.uuid, "attached device to VM");
                true
            }
            Err(error) => {
                error!(uuid = %self.uuid, %error, "failed to attach device");
                false
            }
        }
    }

    /// Hot-detaches a device from the running domain.
    pub async fn detach_device(&self, device_xml: &str) -> bool {
        if !self.hv_running().await {
            warn!(uuid = %self.uuid, "cannot detach device from non-running domain");
            return false;
        }
        match self.ctx.hypervisor.detach_device(self.uuid, device_xml).await {
            Ok(()) => {
                info!(uuid = %self.uuid, "detached device from VM");
                true
            }
            Err(error) => {
                error!(uuid = %self.uuid, %error, "failed to detach device");
                false
            }
        }
    }

    /// Mirrors the live VNC endpoint into the store.
    pub(crate) async fn update_vnc(&self) {
        let value = match self.ctx.hypervisor.graphics(self.uuid).await {
            Ok(Some(info)) => format!("{}:{}", info.listen, info.port),
            _ => String::new(),
        };
        self.write_dom(&[("domain.console.vnc", &value)]);
    }

}
