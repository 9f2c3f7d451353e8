//! Supervision of long-lived child daemons (per-network DHCP servers).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::cmd::Commander;
use crate::error::{Error, Result};

/// A supervised child daemon with its output captured to a log file.
pub struct DaemonProcess {
    child: Child,
    commander: Commander,
    description: String,
}

impl DaemonProcess {
    /// Spawns `argv` with stdout/stderr appended to `logfile`.
    pub fn spawn(
        commander: Commander,
        argv: &[String],
        env: &[(String, String)],
        logfile: &Path,
    ) -> Result<Self> {
        let description = argv.join(" ");
        let (program, args) = argv.split_first().ok_or_else(|| Error::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        })?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)?;
        let log_err = log.try_clone()?;

        let child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| Error::Spawn {
                command: description.clone(),
                source,
            })?;

        info!(command = %description, pid = child.id(), "started child daemon");
        Ok(Self {
            child,
            commander,
            description,
        })
    }

    /// Sends a signal by name (`HUP`, `TERM`, ...) to the child.
    pub async fn signal(&self, name: &str) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        self.commander
            .run(
                &["kill", &format!("-{name}"), &pid.to_string()],
                Duration::from_secs(1),
            )
            .await?;
        Ok(())
    }

    /// Terminates the child: TERM first, then a hard kill if it lingers.
    pub async fn stop(mut self) {
        let description = self.description.clone();
        let _ = self.signal("TERM").await;
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => info!(command = %description, "child daemon stopped"),
            Err(_) => {
                warn!(command = %description, "child daemon ignored TERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}
