//! DHCP server supervision and lease bookkeeping.
//!
//! The primary runs one dnsmasq per managed network. Reservations are
//! operator-declared and materialize as static host files in the
//! per-network hosts directory; leases are written back into the store by
//! the lease-hook entry point, which dnsmasq invokes on every lease event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use roost_store::Client;
use roost_types::Vni;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Builds the dnsmasq argument vector for one managed network.
pub struct DhcpConfig {
    pub vni: Vni,
    pub bridge_nic: String,
    pub domain: String,
    pub hosts_dir: PathBuf,
    pub lease_hook: PathBuf,
    pub ip4_gateway: Option<String>,
    pub dhcp4_range: Option<(String, String)>,
    pub ip6_gateway: Option<String>,
    pub dhcp6: bool,
}

impl DhcpConfig {
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = vec![
            "/usr/sbin/dnsmasq".into(),
            "--keep-in-foreground".into(),
            "--leasefile-ro".into(),
            "--no-hosts".into(),
            "--bogus-priv".into(),
            "--filterwin2k".into(),
            "--expand-hosts".into(),
            "--domain-needed".into(),
            "--dhcp-authoritative".into(),
            "--log-facility=-".into(),
            "--log-dhcp".into(),
            format!("--domain={}", self.domain),
            format!("--local=/{}/", self.domain),
            format!("--dhcp-script={}", self.lease_hook.display()),
            format!("--dhcp-hostsdir={}", self.hosts_dir.display()),
            "--bind-interfaces".into(),
        ];

        if self.dhcp6 {
            if let Some(gw6) = &self.ip6_gateway {
                argv.push(format!("--listen-address={gw6}"));
                argv.push(format!("--dhcp-option=option6:dns-server,[{gw6}]"));
                argv.push("--enable-ra".into());
                argv.push(format!(
                    "--dhcp-range=net:{nic},::,constructor:{nic},ra-stateless,ra-names",
                    nic = self.bridge_nic
                ));
            }
        } else if let Some(gw4) = &self.ip4_gateway {
            argv.push(format!("--listen-address={gw4}"));
        }

        if let (Some(gw4), Some((start, end))) = (&self.ip4_gateway, &self.dhcp4_range) {
            argv.push(format!("--dhcp-option=option:ntp-server,{gw4}"));
            argv.push(format!("--dhcp-range={start},{end},48h"));
        }

        argv
    }

    /// Environment handed to dnsmasq so the lease hook can find its
    /// network.
    pub fn env(&self, config_file: &Path) -> Vec<(String, String)> {
        vec![
            (
                "DNSMASQ_BRIDGE_INTERFACE".to_string(),
                self.bridge_nic.clone(),
            ),
            (
                "ROOSTD_CONFIG_FILE".to_string(),
                config_file.display().to_string(),
            ),
        ]
    }
}

/// Writes reservation host files for the daemon to consume, removing
/// files for reservations that disappeared. Returns whether anything
/// changed (the caller HUPs the daemon on removals).
pub fn sync_reservations(
    client: &Client,
    vni: Vni,
    hosts_dir: &Path,
    old: &[String],
    new: &[String],
) -> Result<bool> {
    std::fs::create_dir_all(hosts_dir).map_err(Error::Io)?;
    let vni_text = vni.to_string();
    let mut changed = false;

    for mac in new {
        if old.contains(mac) {
            continue;
        }
        let ip = client
            .read((
                "network.reservation",
                vni_text.as_str(),
                "reservation.ip",
                mac.as_str(),
            ))
            .unwrap_or_default();
        let hostname = client
            .read((
                "network.reservation",
                vni_text.as_str(),
                "reservation.hostname",
                mac.as_str(),
            ))
            .unwrap_or_default();
        let entry = if hostname.is_empty() {
            format!("{mac},{ip}")
        } else {
            format!("{mac},{ip},{hostname}")
        };
        debug!(%vni, %mac, %ip, "writing DHCP reservation");
        std::fs::write(hosts_dir.join(mac), entry).map_err(Error::Io)?;
        changed = true;
    }

    for mac in old {
        if new.contains(mac) {
            continue;
        }
        debug!(%vni, %mac, "removing DHCP reservation");
        if let Err(error) = std::fs::remove_file(hosts_dir.join(mac)) {
            warn!(%vni, %mac, %error, "failed to remove reservation file");
        }
        changed = true;
    }

    Ok(changed)
}

/// A lease event as dnsmasq's script interface reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Add,
    Old,
    Del,
}

impl std::str::FromStr for LeaseEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "old" => Ok(Self::Old),
            "del" => Ok(Self::Del),
            other => Err(Error::LeaseEvent(other.to_string())),
        }
    }
}

/// Translates one lease event into store writes under the per-network
/// lease subtree. This is the body of the hook script dnsmasq runs.
pub fn handle_lease_event(
    client: &Client,
    vni: Vni,
    event: LeaseEvent,
    mac: &str,
    ip: &str,
    hostname: Option<&str>,
    client_id: Option<&str>,
    expiry: Option<&str>,
) -> Result<()> {
    let vni_text = vni.to_string();
    match event {
        LeaseEvent::Add | LeaseEvent::Old => {
            let pairs: HashMap<&str, String> = HashMap::from([
                ("lease.ip", ip.to_string()),
                ("lease.hostname", hostname.unwrap_or_default().to_string()),
                ("lease.client_id", client_id.unwrap_or("*").to_string()),
                ("lease.expiry", expiry.unwrap_or("0").to_string()),
            ]);
            client
                .write(pairs.into_iter().map(|(key, value)| {
                    (
                        ("network.lease", vni_text.as_str(), key, mac),
                        value,
                    )
                }))
                .map_err(Error::Store)?;
        }
        LeaseEvent::Del => {
            client
                .delete([("network.lease", vni_text.as_str(), "lease.mac", mac)])
                .map_err(Error::Store)?;
        }
    }
    Ok(())
}
