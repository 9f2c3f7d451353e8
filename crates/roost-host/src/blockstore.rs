//! Replicated block store access.
//!
//! Volumes are addressed as `pool/image`. The control plane only needs a
//! handful of operations: image management for provisioning, map/unmap for
//! local access, and the advisory-lock listing that the VM start sequence
//! uses to guard against split-brain image corruption.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roost_types::ImageLock;

use crate::cmd::Commander;
use crate::error::{Error, Result};

/// Handle onto the block store.
#[derive(Clone)]
pub enum BlockStore {
    /// Shells out to the block-store CLI.
    Cli(CliBlockStore),

    /// In-memory test double.
    Mock(Arc<MockBlockStore>),
}

impl BlockStore {
    pub fn mock() -> (Self, Arc<MockBlockStore>) {
        let mock = Arc::new(MockBlockStore::default());
        (Self::Mock(Arc::clone(&mock)), mock)
    }

    pub async fn create(&self, pool: &str, name: &str, size: &str) -> Result<()> {
        match self {
            Self::Cli(cli) => {
                cli.expect_ok(&["create", "--size", size, &format!("{pool}/{name}")])
                    .await
            }
            Self::Mock(mock) => {
                mock.locks
                    .lock()
                    .unwrap()
                    .entry(format!("{pool}/{name}"))
                    .or_default();
                Ok(())
            }
        }
    }

    pub async fn clone_image(&self, pool: &str, src: &str, dst: &str) -> Result<()> {
        match self {
            Self::Cli(cli) => {
                cli.expect_ok(&["clone", &format!("{pool}/{src}"), &format!("{pool}/{dst}")])
                    .await
            }
            Self::Mock(mock) => {
                mock.locks
                    .lock()
                    .unwrap()
                    .entry(format!("{pool}/{dst}"))
                    .or_default();
                Ok(())
            }
        }
    }

    /// Maps an image into the host, returning the device path.
    pub async fn map(&self, pool: &str, name: &str) -> Result<String> {
        match self {
            Self::Cli(cli) => {
                let out = cli.run(&["map", &format!("{pool}/{name}")]).await?;
                if out.success() {
                    Ok(out.stdout.trim().to_string())
                } else {
                    Err(Error::BlockStore(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(_) => Ok(format!("/dev/mock/{pool}/{name}")),
        }
    }

    pub async fn unmap(&self, pool: &str, name: &str) -> Result<()> {
        match self {
            Self::Cli(cli) => cli.expect_ok(&["unmap", &format!("{pool}/{name}")]).await,
            Self::Mock(_) => Ok(()),
        }
    }

    /// Advisory locks currently held on an image (`pool/image` form).
    pub async fn lock_list(&self, image: &str) -> Result<Vec<ImageLock>> {
        match self {
            Self::Cli(cli) => {
                let out = cli
                    .run(&["lock", "list", "--format", "json", image])
                    .await?;
                if !out.success() {
                    return Err(Error::BlockStore(out.stderr.trim().to_string()));
                }
                serde_json::from_str(&out.stdout).map_err(|e| Error::Parse {
                    tool: cli.cli.clone(),
                    detail: e.to_string(),
                })
            }
            Self::Mock(mock) => Ok(mock
                .locks
                .lock()
                .unwrap()
                .get(image)
                .cloned()
                .unwrap_or_default()),
        }
    }

    pub async fn lock_remove(&self, image: &str, id: &str, locker: &str) -> Result<()> {
        match self {
            Self::Cli(cli) => cli.expect_ok(&["lock", "remove", image, id, locker]).await,
            Self::Mock(mock) => {
                let mut locks = mock.locks.lock().unwrap();
                if let Some(held) = locks.get_mut(image) {
                    held.retain(|l| !(l.id == id && l.locker == locker));
                }
                Ok(())
            }
        }
    }
}

/// Block store driven through its CLI.
#[derive(Clone)]
pub struct CliBlockStore {
    commander: Commander,
    cli: String,
    timeout: Duration,
}

impl CliBlockStore {
    pub fn new(commander: Commander, cli: impl Into<String>, timeout: Duration) -> Self {
        Self {
            commander,
            cli: cli.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<crate::cmd::CommandOutput> {
        let mut argv = vec![self.cli.as_str()];
        argv.extend_from_slice(args);
        self.commander.run(&argv, self.timeout).await
    }

    async fn expect_ok(&self, args: &[&str]) -> Result<()> {
        let out = self.run(args).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::BlockStore(out.stderr.trim().to_string()))
        }
    }
}

/// In-memory block store double: a map of image name to held locks.
#[derive(Default)]
pub struct MockBlockStore {
    locks: Mutex<HashMap<String, Vec<ImageLock>>>,
}

impl MockBlockStore {
    /// Test helper: place an advisory lock on an image.
    pub fn hold_lock(&self, image: &str, id: &str, locker: &str, address: &str) {
        self.locks
            .lock()
            .unwrap()
            .entry(image.to_string())
            .or_default()
            .push(ImageLock {
                id: id.to_string(),
                locker: locker.to_string(),
                address: address.to_string(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lock_lifecycle() {
        let (store, mock) = BlockStore::mock();
        mock.hold_lock("vms/disk0", "auto 1", "client.7", "10.0.1.11:0/99");

        let locks = store.lock_list("vms/disk0").await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].holder_host(), "10.0.1.11");

        store
            .lock_remove("vms/disk0", "auto 1", "client.7")
            .await
            .unwrap();
        assert!(store.lock_list("vms/disk0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cli_lock_list_parses_json() {
        let (commander, mock) = Commander::mock();
        mock.respond(
            "rbd lock list",
            crate::cmd::CommandOutput::ok(
                r#"[{"id":"auto 2","locker":"client.4","address":"10.0.1.12:0/1"}]"#,
            ),
        );
        let store = BlockStore::Cli(CliBlockStore::new(
            commander,
            "rbd",
            Duration::from_secs(1),
        ));

        let locks = store.lock_list("vms/disk0").await.unwrap();
        assert_eq!(locks[0].id, "auto 2");
        assert!(mock.saw("rbd lock list --format json vms/disk0"));
    }
}
