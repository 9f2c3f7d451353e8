//! # roost-vm: per-VM supervision for Roost
//!
//! Every node keeps a [`VmInstance`] for every VM the cluster knows about.
//! A watch on the VM's declared state re-enters the guarded dispatcher on
//! every change; the dispatcher drives the local hypervisor to match the
//! declaration, including the two-phase live-migration handshake between
//! the source and destination nodes.

pub mod console;
pub mod instance;
pub mod migrate;

pub use console::ConsoleWatcher;
pub use instance::{VmContext, VmInstance};

use std::sync::{Arc, Mutex};

use roost_store::Client;
use tracing::warn;
use uuid::Uuid;

/// The node-local list of running domains, mirrored into the store on
/// every change.
#[derive(Clone)]
pub struct RunningList {
    client: Client,
    hostname: String,
    inner: Arc<Mutex<Vec<Uuid>>>,
}

impl RunningList {
    pub fn new(client: Client, hostname: impl Into<String>) -> Self {
        Self {
            client,
            hostname: hostname.into(),
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add(&self, uuid: Uuid) {
        {
            let mut list = self.inner.lock().unwrap();
            if list.contains(&uuid) {
                return;
            }
            list.push(uuid);
        }
        self.publish();
    }

    pub fn remove(&self, uuid: Uuid) {
        {
            let mut list = self.inner.lock().unwrap();
            if !list.contains(&uuid) {
                return;
            }
            list.retain(|u| *u != uuid);
        }
        self.publish();
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.inner.lock().unwrap().contains(&uuid)
    }

    pub fn snapshot(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().clone()
    }

    fn publish(&self) {
        let joined = self
            .snapshot()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        if let Err(error) = self
            .client
            .write([(("node.running_domains", self.hostname.as_str()), joined)])
        {
            warn!(%error, "failed to publish running domain list");
        }
    }
}
