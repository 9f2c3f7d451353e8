//! Local hypervisor access.
//!
//! The daemon drives domains through its node-local hypervisor; migration
//! additionally opens a connection to the destination's hypervisor over the
//! cluster network. The CLI-backed variant shells out through the command
//! runner; the mock variant keeps domains in memory and can hand them to a
//! registered peer mock, which is how integration tests exercise the
//! migration handshake end to end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use roost_types::HvState;

use crate::cmd::Commander;
use crate::error::{Error, Result};

/// Graphics (VNC) endpoint of a running domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsInfo {
    pub listen: String,
    pub port: String,
}

/// Point-in-time stats for one running domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStats {
    pub state: String,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

/// Builds the destination hypervisor URI used for live migration, forcing
/// traffic over the cluster network.
pub fn migration_uri(dest_host: &str, cluster_domain: &str) -> (String, String) {
    let fqdn = format!("{dest_host}.{cluster_domain}");
    (format!("qemu+tcp://{fqdn}/system"), format!("tcp://{fqdn}"))
}

/// Handle onto a hypervisor.
#[derive(Clone)]
pub enum Hypervisor {
    /// Shells out to the hypervisor CLI on this host.
    Cli(CliHypervisor),

    /// In-memory test double.
    Mock(Arc<MockHypervisor>),
}

impl Hypervisor {
    pub fn mock() -> (Self, Arc<MockHypervisor>) {
        let mock = Arc::new(MockHypervisor::default());
        (Self::Mock(Arc::clone(&mock)), mock)
    }

    /// Confirms the local hypervisor answers at all.
    pub async fn validate(&self) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv.virsh(&["version"], hv.probe_timeout).await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(format!(
                        "local hypervisor not responding: {}",
                        out.stderr.trim()
                    )))
                }
            }
            Self::Mock(_) => Ok(()),
        }
    }

    /// Current state of a domain, or `None` when it is not defined here.
    pub async fn domain_state(&self, uuid: Uuid) -> Result<Option<HvState>> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["domstate", &uuid.to_string()], hv.probe_timeout)
                    .await?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(Some(parse_domstate(out.stdout.trim())))
            }
            Self::Mock(mock) => Ok(mock.state_of(uuid)),
        }
    }

    /// Defines and starts a domain from its XML description.
    pub async fn create_from_xml(&self, xml: &str) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv.virsh_stdin(&["create", "/dev/stdin"], xml).await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => mock.create_from_xml(xml),
        }
    }

    /// Forcibly terminates a domain.
    pub async fn destroy(&self, uuid: Uuid) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["destroy", &uuid.to_string()], hv.command_timeout)
                    .await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => {
                mock.set_running(uuid, false);
                Ok(())
            }
        }
    }

    /// Requests a guest-cooperative shutdown; returns immediately.
    pub async fn shutdown(&self, uuid: Uuid) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["shutdown", &uuid.to_string()], hv.command_timeout)
                    .await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => {
                // Guests in the mock comply immediately unless told not to.
                if !mock.ignore_shutdown.lock().unwrap().contains(&uuid) {
                    mock.set_running(uuid, false);
                }
                Ok(())
            }
        }
    }

    /// Pushes a live-migration stream to the destination host over the
    /// cluster network.
    pub async fn migrate_live(
        &self,
        uuid: Uuid,
        dest_host: &str,
        cluster_domain: &str,
    ) -> Result<()> {
        let (dest_uri, transport_uri) = migration_uri(dest_host, cluster_domain);
        match self {
            Self::Cli(hv) => {
                debug!(%uuid, %dest_uri, "starting live migration stream");
                let out = hv
                    .virsh(
                        &[
                            "migrate",
                            "--live",
                            "--domain",
                            &uuid.to_string(),
                            "--desturi",
                            &dest_uri,
                            "--migrateuri",
                            &transport_uri,
                        ],
                        hv.command_timeout,
                    )
                    .await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => mock.migrate_live(uuid, dest_host),
        }
    }

    /// Hot-attaches a device described by an XML fragment.
    pub async fn attach_device(&self, uuid: Uuid, device_xml: &str) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh_stdin(
                        &["attach-device", &uuid.to_string(), "/dev/stdin", "--live"],
                        device_xml,
                    )
                    .await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => {
                mock.devices
                    .lock()
                    .unwrap()
                    .entry(uuid)
                    .or_default()
                    .push(device_xml.to_string());
                Ok(())
            }
        }
    }

    /// Hot-detaches a device described by an XML fragment.
    pub async fn detach_device(&self, uuid: Uuid, device_xml: &str) -> Result<()> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh_stdin(
                        &["detach-device", &uuid.to_string(), "/dev/stdin", "--live"],
                        device_xml,
                    )
                    .await?;
                if out.success() {
                    Ok(())
                } else {
                    Err(Error::Hypervisor(out.stderr.trim().to_string()))
                }
            }
            Self::Mock(mock) => {
                if let Some(devices) = mock.devices.lock().unwrap().get_mut(&uuid) {
                    devices.retain(|d| d != device_xml);
                }
                Ok(())
            }
        }
    }

    /// Live XML description of a domain.
    pub async fn domain_xml(&self, uuid: Uuid) -> Result<Option<String>> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["dumpxml", &uuid.to_string()], hv.probe_timeout)
                    .await?;
                Ok(out.success().then_some(out.stdout))
            }
            Self::Mock(mock) => Ok(mock.xml_of(uuid)),
        }
    }

    /// VNC endpoint of a running domain, when graphics are configured.
    pub async fn graphics(&self, uuid: Uuid) -> Result<Option<GraphicsInfo>> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["domdisplay", &uuid.to_string()], hv.probe_timeout)
                    .await?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(parse_domdisplay(out.stdout.trim()))
            }
            Self::Mock(mock) => Ok(mock.graphics_of(uuid)),
        }
    }

    /// Last `max_lines` of the domain's serial console.
    pub async fn console_tail(&self, uuid: Uuid, max_lines: usize) -> Result<String> {
        match self {
            Self::Cli(hv) => {
                let path = hv.console_log_directory.join(format!("{uuid}.log"));
                let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                Ok(tail_lines(&text, max_lines))
            }
            Self::Mock(mock) => {
                let consoles = mock.consoles.lock().unwrap();
                Ok(tail_lines(
                    consoles.get(&uuid).map(String::as_str).unwrap_or(""),
                    max_lines,
                ))
            }
        }
    }

    /// Memory/vCPU/cputime snapshot for a defined domain.
    pub async fn domain_stats(&self, uuid: Uuid) -> Result<Option<DomainStats>> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["dominfo", &uuid.to_string()], hv.probe_timeout)
                    .await?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(parse_dominfo(&out.stdout))
            }
            Self::Mock(mock) => Ok(mock.stats_of(uuid)),
        }
    }

    /// UUIDs of every domain currently running on this hypervisor.
    pub async fn list_running(&self) -> Result<Vec<Uuid>> {
        match self {
            Self::Cli(hv) => {
                let out = hv
                    .virsh(&["list", "--uuid", "--state-running"], hv.probe_timeout)
                    .await?;
                Ok(out
                    .stdout
                    .lines()
                    .filter_map(|l| l.trim().parse().ok())
                    .collect())
            }
            Self::Mock(mock) => Ok(mock.running()),
        }
    }
}

/// Hypervisor driven through its CLI.
#[derive(Clone)]
pub struct CliHypervisor {
    commander: Commander,
    uri: String,
    console_log_directory: PathBuf,
    command_timeout: Duration,
    probe_timeout: Duration,
}

impl CliHypervisor {
    pub fn new(
        commander: Commander,
        uri: impl Into<String>,
        console_log_directory: impl Into<PathBuf>,
        command_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            commander,
            uri: uri.into(),
            console_log_directory: console_log_directory.into(),
            command_timeout,
            probe_timeout,
        }
    }

    async fn virsh(&self, args: &[&str], timeout: Duration) -> Result<crate::cmd::CommandOutput> {
        let mut argv = vec!["virsh", "-c", &self.uri];
        argv.extend_from_slice(args);
        self.commander.run(&argv, timeout).await
    }

    async fn virsh_stdin(&self, args: &[&str], input: &str) -> Result<crate::cmd::CommandOutput> {
        let mut argv = vec!["virsh", "-c", &self.uri];
        argv.extend_from_slice(args);
        self.commander
            .run_with_stdin(&argv, input, self.command_timeout)
            .await
    }
}

fn parse_domstate(text: &str) -> HvState {
    match text {
        "running" => HvState::Running,
        "blocked" => HvState::Blocked,
        "paused" => HvState::Paused,
        "in shutdown" => HvState::ShuttingDown,
        "shut off" => HvState::Shutoff,
        "crashed" => HvState::Crashed,
        "pmsuspended" => HvState::Suspended,
        _ => HvState::NoState,
    }
}

fn parse_domdisplay(text: &str) -> Option<GraphicsInfo> {
    // Format: vnc://listen:display, display offset from 5900.
    let rest = text.strip_prefix("vnc://")?;
    let (listen, display) = rest.rsplit_once(':')?;
    let port = 5900 + display.parse::<u32>().ok()?;
    Some(GraphicsInfo {
        listen: listen.to_string(),
        port: port.to_string(),
    })
}

fn parse_dominfo(text: &str) -> Option<DomainStats> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim());
        }
    }
    let kib = |v: &str| v.split_whitespace().next()?.parse::<u64>().ok();
    Some(DomainStats {
        state: (*fields.get("State")?).to_string(),
        max_memory_kib: kib(fields.get("Max memory")?)?,
        memory_kib: kib(fields.get("Used memory")?)?,
        vcpus: fields.get("CPU(s)")?.parse().ok()?,
        cpu_time_ns: fields
            .get("CPU time")
            .and_then(|v| v.trim_end_matches('s').parse::<f64>().ok())
            .map_or(0, |s| (s * 1e9) as u64),
    })
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Extracts the `<uuid>` element from a domain XML description.
pub fn uuid_from_xml(xml: &str) -> Option<Uuid> {
    let start = xml.find("<uuid>")? + "<uuid>".len();
    let end = xml[start..].find("</uuid>")? + start;
    xml[start..end].trim().parse().ok()
}

/// Extracts `(memory KiB, vcpus)` from a domain XML description. Used for
/// provisioned-resource accounting when a domain is not running.
pub fn resources_from_xml(xml: &str) -> Option<(u64, u32)> {
    fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
        let open = format!("<{name}");
        let start = xml.find(&open)?;
        let body_start = xml[start..].find('>')? + start + 1;
        let end = xml[body_start..].find(&format!("</{name}>"))? + body_start;
        Some(xml[body_start..end].trim())
    }
    let memory = element_text(xml, "memory")?.parse().ok()?;
    let vcpus = element_text(xml, "vcpu")?.parse().ok()?;
    Some((memory, vcpus))
}

#[derive(Debug, Clone, Default)]
struct MockDomain {
    running: bool,
    xml: String,
    graphics: Option<GraphicsInfo>,
    memory_kib: u64,
    vcpus: u32,
}

/// In-memory hypervisor double.
#[derive(Default)]
pub struct MockHypervisor {
    domains: Mutex<HashMap<Uuid, MockDomain>>,
    peers: Mutex<HashMap<String, Arc<MockHypervisor>>>,
    consoles: Mutex<HashMap<Uuid, String>>,
    devices: Mutex<HashMap<Uuid, Vec<String>>>,
    ignore_shutdown: Mutex<Vec<Uuid>>,
    fail_create: Mutex<Option<String>>,
    live_failures_left: AtomicU32,
}

impl MockHypervisor {
    /// Registers the hypervisor serving `host`, for mock live migrations.
    pub fn register_peer(&self, host: &str, peer: Arc<MockHypervisor>) {
        self.peers.lock().unwrap().insert(host.to_string(), peer);
    }

    /// Every `create_from_xml` fails with `reason` until cleared.
    pub fn fail_creates(&self, reason: Option<&str>) {
        *self.fail_create.lock().unwrap() = reason.map(str::to_string);
    }

    /// The next `count` live migrations fail before succeeding.
    pub fn inject_live_failures(&self, count: u32) {
        self.live_failures_left.store(count, Ordering::SeqCst);
    }

    /// Makes a guest ignore cooperative shutdown requests.
    pub fn ignore_shutdown_for(&self, uuid: Uuid) {
        self.ignore_shutdown.lock().unwrap().push(uuid);
    }

    /// Appends text to a domain's serial console.
    pub fn push_console(&self, uuid: Uuid, text: &str) {
        self.consoles
            .lock()
            .unwrap()
            .entry(uuid)
            .or_default()
            .push_str(text);
    }

    /// Whether a domain is present here, and running if so.
    pub fn domain_running(&self, uuid: Uuid) -> Option<bool> {
        self.domains.lock().unwrap().get(&uuid).map(|d| d.running)
    }

    /// Devices currently hot-attached to a domain.
    pub fn attached_devices(&self, uuid: Uuid) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Test helper: place a running domain directly on this hypervisor.
    pub fn insert_running(&self, uuid: Uuid, xml: &str) {
        self.domains.lock().unwrap().insert(
            uuid,
            MockDomain {
                running: true,
                xml: xml.to_string(),
                graphics: Some(GraphicsInfo {
                    listen: "127.0.0.1".to_string(),
                    port: "5900".to_string(),
                }),
                memory_kib: 2 * 1024 * 1024,
                vcpus: 2,
            },
        );
    }

    fn create_from_xml(&self, xml: &str) -> Result<()> {
        if let Some(reason) = self.fail_create.lock().unwrap().clone() {
            return Err(Error::Hypervisor(reason));
        }
        let uuid = uuid_from_xml(xml)
            .ok_or_else(|| Error::Hypervisor("domain XML carries no uuid".to_string()))?;
        self.insert_running(uuid, xml);
        Ok(())
    }

    fn migrate_live(&self, uuid: Uuid, dest_host: &str) -> Result<()> {
        if self
            .live_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Hypervisor("migration stream reset by peer".into()));
        }
        let peer = self
            .peers
            .lock()
            .unwrap()
            .get(dest_host)
            .cloned()
            .ok_or_else(|| Error::Hypervisor(format!("no route to {dest_host}")))?;
        let domain = self
            .domains
            .lock()
            .unwrap()
            .remove(&uuid)
            .ok_or_else(|| Error::Hypervisor("domain not running here".into()))?;
        peer.domains.lock().unwrap().insert(uuid, domain);
        Ok(())
    }

    fn state_of(&self, uuid: Uuid) -> Option<HvState> {
        self.domains.lock().unwrap().get(&uuid).map(|d| {
            if d.running {
                HvState::Running
            } else {
                HvState::Shutoff
            }
        })
    }

    fn xml_of(&self, uuid: Uuid) -> Option<String> {
        self.domains.lock().unwrap().get(&uuid).map(|d| d.xml.clone())
    }

    fn graphics_of(&self, uuid: Uuid) -> Option<GraphicsInfo> {
        self.domains
            .lock()
            .unwrap()
            .get(&uuid)
            .and_then(|d| d.graphics.clone())
    }

    fn stats_of(&self, uuid: Uuid) -> Option<DomainStats> {
        self.domains.lock().unwrap().get(&uuid).map(|d| DomainStats {
            state: if d.running { "running" } else { "shut off" }.to_string(),
            max_memory_kib: d.memory_kib,
            memory_kib: d.memory_kib,
            vcpus: d.vcpus,
            cpu_time_ns: 0,
        })
    }

    fn set_running(&self, uuid: Uuid, running: bool) {
        if let Some(domain) = self.domains.lock().unwrap().get_mut(&uuid) {
            domain.running = running;
        }
    }

    fn running(&self) -> Vec<Uuid> {
        self.domains
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| d.running)
            .map(|(u, _)| *u)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml_for(uuid: Uuid) -> String {
        format!("<domain type='kvm'><name>vm</name><uuid>{uuid}</uuid></domain>")
    }

    #[tokio::test]
    async fn test_mock_create_and_state() {
        let (hv, _mock) = Hypervisor::mock();
        let uuid = Uuid::new_v4();

        assert_eq!(hv.domain_state(uuid).await.unwrap(), None);
        hv.create_from_xml(&xml_for(uuid)).await.unwrap();
        assert_eq!(hv.domain_state(uuid).await.unwrap(), Some(HvState::Running));

        hv.destroy(uuid).await.unwrap();
        assert_eq!(hv.domain_state(uuid).await.unwrap(), Some(HvState::Shutoff));
    }

    #[tokio::test]
    async fn test_mock_live_migration_moves_domain() {
        let (src, src_mock) = Hypervisor::mock();
        let (dst, dst_mock) = Hypervisor::mock();
        src_mock.register_peer("h2", Arc::clone(&dst_mock));

        let uuid = Uuid::new_v4();
        src.create_from_xml(&xml_for(uuid)).await.unwrap();

        src.migrate_live(uuid, "h2", "cluster.local").await.unwrap();

        assert_eq!(src.domain_state(uuid).await.unwrap(), None);
        assert_eq!(dst.domain_state(uuid).await.unwrap(), Some(HvState::Running));
    }

    #[tokio::test]
    async fn test_mock_injected_live_failures() {
        let (src, src_mock) = Hypervisor::mock();
        let (_dst, dst_mock) = Hypervisor::mock();
        src_mock.register_peer("h2", dst_mock);
        src_mock.inject_live_failures(2);

        let uuid = Uuid::new_v4();
        src.create_from_xml(&xml_for(uuid)).await.unwrap();

        assert!(src.migrate_live(uuid, "h2", "d").await.is_err());
        assert!(src.migrate_live(uuid, "h2", "d").await.is_err());
        assert!(src.migrate_live(uuid, "h2", "d").await.is_ok());
    }

    #[test]
    fn test_parse_domdisplay() {
        let info = parse_domdisplay("vnc://127.0.0.1:2").unwrap();
        assert_eq!(info.listen, "127.0.0.1");
        assert_eq!(info.port, "5902");
        assert!(parse_domdisplay("spice://x:1").is_none());
    }

    #[test]
    fn test_parse_dominfo() {
        let text = "Id: 3\nName: vm1\nState: running\nCPU(s): 4\nCPU time: 12.5s\nMax memory: 4194304 KiB\nUsed memory: 2097152 KiB\n";
        let stats = parse_dominfo(text).unwrap();
        assert_eq!(stats.vcpus, 4);
        assert_eq!(stats.max_memory_kib, 4_194_304);
        assert_eq!(stats.state, "running");
    }

    #[test]
    fn test_uuid_from_xml() {
        let uuid = Uuid::new_v4();
        assert_eq!(uuid_from_xml(&xml_for(uuid)), Some(uuid));
        assert_eq!(uuid_from_xml("<domain/>"), None);
    }

    #[test]
    fn test_resources_from_xml() {
        let xml = "<domain><memory unit='KiB'>2097152</memory><currentMemory unit='KiB'>2097152</currentMemory><vcpu placement='static'>2</vcpu></domain>";
        assert_eq!(resources_from_xml(xml), Some((2_097_152, 2)));
        assert_eq!(resources_from_xml("<domain/>"), None);
    }

    #[test]
    fn test_migration_uri_forces_cluster_network() {
        let (dest, transport) = migration_uri("h2", "cluster.local");
        assert_eq!(dest, "qemu+tcp://h2.cluster.local/system");
        assert_eq!(transport, "tcp://h2.cluster.local");
    }
}
