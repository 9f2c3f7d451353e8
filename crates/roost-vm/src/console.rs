//! Per-VM console log watcher.
//!
//! A background task that periodically snapshots the tail of a domain's
//! serial console into its store key. Started whenever the VM should run
//! here, stopped when it should not; never in the correctness path.

use std::sync::Mutex;
use std::time::Duration;

use roost_host::Hypervisor;
use roost_store::Client;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running console watcher task.
pub struct ConsoleWatcher {
    uuid: Uuid,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleWatcher {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            handle: Mutex::new(None),
        }
    }

    /// Starts the watcher if it is not already running.
    pub fn start(&self, client: Client, hypervisor: Hypervisor, max_lines: usize) {
        let mut handle = self.handle.lock().unwrap();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let uuid = self.uuid;
        debug!(%uuid, "starting console watcher");
        *handle = Some(tokio::spawn(async move {
            let mut last = String::new();
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Ok(tail) = hypervisor.console_tail(uuid, max_lines).await else {
                    continue;
                };
                if tail != last {
                    let uuid_text = uuid.to_string();
                    let _ = client.write([(("domain.console.log", uuid_text.as_str()), tail.clone())]);
                    last = tail;
                }
            }
        }));
    }

    /// Stops the watcher if it is running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            debug!(uuid = %self.uuid, "stopping console watcher");
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ConsoleWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_store::Store;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_console_tail_lands_in_store() {
        let store = Arc::new(Store::new());
        let client = Client::connect(Arc::clone(&store)).unwrap();
        client.apply_schema().unwrap();

        let (hypervisor, mock) = Hypervisor::mock();
        let uuid = Uuid::new_v4();
        mock.push_console(uuid, "booting kernel\n");

        let watcher = ConsoleWatcher::new(uuid);
        watcher.start(client.clone(), hypervisor, 100);

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        let uuid_text = uuid.to_string();
        let log = client.read(("domain.console.log", uuid_text.as_str()));
        assert_eq!(log.as_deref(), Some("booting kernel"));

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_single_task() {
        let (hypervisor, _mock) = Hypervisor::mock();
        let store = Arc::new(Store::new());
        let client = Client::connect(store).unwrap();
        client.apply_schema().unwrap();

        let watcher = ConsoleWatcher::new(Uuid::new_v4());
        watcher.start(client.clone(), hypervisor.clone(), 10);
        watcher.start(client, hypervisor, 10);
        assert!(watcher.is_running());
        watcher.stop();
    }
}
