//! Storage-cluster monitoring for the keepalive storage collector.
//!
//! The primary mirrors storage status, health, and utilization blobs into
//! the store every keepalive; every node counts its own OSDs. All calls
//! are quick probes: an unreachable storage layer must never hold up a
//! keepalive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cmd::Commander;
use crate::error::{Error, Result};

/// Handle onto the storage cluster's monitor.
#[derive(Clone)]
pub enum StorageMonitor {
    Cli(CliStorageMonitor),
    Mock(Arc<MockStorageMonitor>),
}

impl StorageMonitor {
    pub fn mock() -> (Self, Arc<MockStorageMonitor>) {
        let mock = Arc::new(MockStorageMonitor::default());
        (Self::Mock(Arc::clone(&mock)), mock)
    }

    /// Human-readable cluster status blob.
    pub async fn status(&self) -> Result<String> {
        match self {
            Self::Cli(cli) => cli.capture(&["status"]).await,
            Self::Mock(mock) => mock.get("status"),
        }
    }

    /// Health summary (JSON).
    pub async fn health(&self) -> Result<String> {
        match self {
            Self::Cli(cli) => cli.capture(&["health", "--format", "json"]).await,
            Self::Mock(mock) => mock.get("health"),
        }
    }

    /// Utilization summary.
    pub async fn utilization(&self) -> Result<String> {
        match self {
            Self::Cli(cli) => cli.capture(&["df"]).await,
            Self::Mock(mock) => mock.get("df"),
        }
    }

    /// Per-pool stats blobs keyed by pool name (JSON each).
    pub async fn pool_stats(&self) -> Result<HashMap<String, String>> {
        match self {
            Self::Cli(cli) => {
                let raw = cli.capture(&["df", "--format", "json"]).await?;
                parse_pool_df(&raw).map_err(|detail| Error::Parse {
                    tool: cli.cli.clone(),
                    detail,
                })
            }
            Self::Mock(mock) => Ok(mock.pools.lock().unwrap().clone()),
        }
    }

    /// Per-OSD stats blobs keyed by OSD id, each carrying the owning node.
    pub async fn osd_stats(&self) -> Result<HashMap<String, OsdStat>> {
        match self {
            Self::Cli(cli) => {
                let raw = cli.capture(&["osd", "df", "--format", "json"]).await?;
                parse_osd_df(&raw).map_err(|detail| Error::Parse {
                    tool: cli.cli.clone(),
                    detail,
                })
            }
            Self::Mock(mock) => Ok(mock.osds.lock().unwrap().clone()),
        }
    }
}

/// One OSD's stats and placement.
#[derive(Debug, Clone)]
pub struct OsdStat {
    pub node: String,
    pub stats_json: String,
}

/// Monitor driven through the storage CLI.
#[derive(Clone)]
pub struct CliStorageMonitor {
    commander: Commander,
    cli: String,
    timeout: Duration,
}

impl CliStorageMonitor {
    pub fn new(commander: Commander, cli: impl Into<String>, timeout: Duration) -> Self {
        Self {
            commander,
            cli: cli.into(),
            timeout,
        }
    }

    async fn capture(&self, args: &[&str]) -> Result<String> {
        let mut argv = vec![self.cli.as_str()];
        argv.extend_from_slice(args);
        let out = self.commander.run(&argv, self.timeout).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(Error::CommandFailed {
                command: argv.join(" "),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

fn parse_pool_df(raw: &str) -> std::result::Result<HashMap<String, String>, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let pools = value
        .get("pools")
        .and_then(|p| p.as_array())
        .ok_or("no pools array")?;
    let mut out = HashMap::new();
    for pool in pools {
        if let Some(name) = pool.get("name").and_then(|n| n.as_str()) {
            out.insert(name.to_string(), pool.to_string());
        }
    }
    Ok(out)
}

fn parse_osd_df(raw: &str) -> std::result::Result<HashMap<String, OsdStat>, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let nodes = value
        .get("nodes")
        .and_then(|p| p.as_array())
        .ok_or("no nodes array")?;
    let mut out = HashMap::new();
    for osd in nodes {
        let Some(id) = osd.get("id").map(ToString::to_string) else {
            continue;
        };
        let node = osd
            .get("name")
            .and_then(|n| n.as_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or_default()
            .to_string();
        out.insert(
            id,
            OsdStat {
                node,
                stats_json: osd.to_string(),
            },
        );
    }
    Ok(out)
}

/// In-memory monitor double. With no data configured, every call errors,
/// which is how tests model an unreachable storage layer.
#[derive(Default)]
pub struct MockStorageMonitor {
    blobs: Mutex<HashMap<&'static str, String>>,
    pools: Mutex<HashMap<String, String>>,
    osds: Mutex<HashMap<String, OsdStat>>,
}

impl MockStorageMonitor {
    pub fn set_healthy(&self) {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert("status", "cluster ok".to_string());
        blobs.insert("health", r#"{"status":"HEALTH_OK"}"#.to_string());
        blobs.insert("df", "POOLS: 1".to_string());
    }

    pub fn add_osd(&self, id: &str, node: &str) {
        self.osds.lock().unwrap().insert(
            id.to_string(),
            OsdStat {
                node: node.to_string(),
                stats_json: format!(r#"{{"id":{id},"up":1}}"#),
            },
        );
    }

    fn get(&self, key: &'static str) -> Result<String> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BlockStore("storage layer unreachable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_df() {
        let raw = r#"{"pools":[{"name":"vms","stats":{"stored":10}},{"name":"images","stats":{"stored":5}}]}"#;
        let pools = parse_pool_df(raw).unwrap();
        assert_eq!(pools.len(), 2);
        assert!(pools["vms"].contains("stored"));
    }

    #[test]
    fn test_parse_osd_df() {
        let raw = r#"{"nodes":[{"id":0,"name":"hv1.cluster.local","kb":100},{"id":1,"name":"hv2","kb":100}]}"#;
        let osds = parse_osd_df(raw).unwrap();
        assert_eq!(osds["0"].node, "hv1");
        assert_eq!(osds["1"].node, "hv2");
    }

    #[tokio::test]
    async fn test_mock_unreachable_by_default() {
        let (monitor, mock) = StorageMonitor::mock();
        assert!(monitor.health().await.is_err());

        mock.set_healthy();
        assert!(monitor.health().await.unwrap().contains("HEALTH_OK"));
    }
}
