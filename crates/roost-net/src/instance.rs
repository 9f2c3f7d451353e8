//! Per-network instance supervision.
//!
//! A [`NetworkInstance`] materializes one tenant network's declared state
//! as kernel objects on this node: the L2 carrier (VLAN sub-interface or
//! VXLAN), the bridge, and, on the current primary for managed networks,
//! gateway addresses, the DHCP server, and the firewall chains.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ipnet::IpNet;
use roost_config::RoostConfig;
use roost_host::{Commander, DaemonProcess, NetPlumbing};
use roost_store::Client;
use roost_types::{NetworkType, Vni};
use tracing::{info, warn};

use crate::dhcp::{sync_reservations, DhcpConfig};
use crate::error::{Error, Result};
use crate::firewall::{render_rules, AclRule, FirewallFacts};

/// Shared handles a network instance needs.
#[derive(Clone)]
pub struct NetContext {
    pub client: Client,
    pub config: Arc<RoostConfig>,
    pub hostname: String,
    pub plumbing: NetPlumbing,
    pub commander: Commander,
    /// True while this node's coordinator state is `primary` or
    /// `takeover`; gates all L3 service ownership.
    pub primary: Arc<AtomicBool>,
}

/// One tenant network materialized on this node.
pub struct NetworkInstance {
    vni: Vni,
    ctx: NetContext,
    net_type: NetworkType,
    base_nic: String,
    bridge_nic: String,
    dhcp_server: tokio::sync::Mutex<Option<DaemonProcess>>,
    reservations: Mutex<Vec<String>>,
    cached_gw4: Mutex<Option<String>>,
}

impl NetworkInstance {
    /// Materializes the network and arms its watches.
    pub async fn spawn(ctx: NetContext, vni: Vni) -> Result<Arc<Self>> {
        let vni_text = vni.to_string();
        let type_text = ctx
            .client
            .read(("network.type", vni_text.as_str()))
            .unwrap_or_default();
        let net_type: NetworkType =
            type_text
                .parse()
                .map_err(|_| Error::InvalidDefinition {
                    vni: vni.get(),
                    detail: format!("unusable network type {type_text:?}"),
                })?;

        let (base_nic, bridge_nic) = match net_type {
            NetworkType::Bridged => (format!("vlan{vni}"), format!("vmbr{vni}")),
            NetworkType::Managed => (format!("vxlan{vni}"), format!("vmbr{vni}")),
        };

        let instance = Arc::new(Self {
            vni,
            ctx,
            net_type,
            base_nic,
            bridge_nic,
            dhcp_server: tokio::sync::Mutex::new(None),
            reservations: Mutex::new(Vec::new()),
            cached_gw4: Mutex::new(None),
        });

        instance.validate_mtu();
        instance.create_network().await?;

        if net_type == NetworkType::Managed {
            instance.update_firewall().await?;
            if instance.is_primary() {
                instance.create_gateways().await;
                instance.start_dhcp().await;
            }
            let current = instance.current_reservations();
            instance.apply_reservations(current).await;
        }

        Arc::clone(&instance).arm_watches()?;
        Ok(instance)
    }

    pub fn vni(&self) -> Vni {
        self.vni
    }

    pub fn net_type(&self) -> NetworkType {
        self.net_type
    }

    pub fn bridge_nic(&self) -> &str {
        &self.bridge_nic
    }

    fn is_primary(&self) -> bool {
        self.ctx.primary.load(Ordering::SeqCst)
    }

    fn read_net(&self, key: &str) -> Option<String> {
        let vni_text = self.vni.to_string();
        self.ctx
            .client
            .read((key, vni_text.as_str()))
            .filter(|v| !v.is_empty() && v != "None")
    }

    /// Highest MTU this network may declare.
    fn max_mtu(&self) -> u32 {
        match self.net_type {
            NetworkType::Managed => self.ctx.config.network.managed_max_mtu(),
            NetworkType::Bridged => self.ctx.config.network.bridge_mtu,
        }
    }

    /// Declared MTU, clamped and republished when out of range.
    pub fn effective_mtu(&self) -> u32 {
        let max = self.max_mtu();
        match self.read_net("network.mtu").and_then(|m| m.parse::<u32>().ok()) {
            Some(mtu) if mtu <= max => mtu,
            _ => max,
        }
    }

    fn validate_mtu(&self) {
        let max = self.max_mtu();
        let declared = self.read_net("network.mtu").and_then(|m| m.parse::<u32>().ok());
        let clamp = match declared {
            None => true,
            Some(mtu) => mtu > max,
        };
        if clamp {
            warn!(vni = %self.vni, max, ?declared, "MTU out of range, clamping to maximum");
            let vni_text = self.vni.to_string();
            if let Err(error) = self
                .ctx
                .client
                .write([(("network.mtu", vni_text.as_str()), max.to_string())])
            {
                warn!(vni = %self.vni, %error, "could not republish clamped MTU");
            }
        }
    }

    async fn create_network(&self) -> Result<()> {
        let plumbing = &self.ctx.plumbing;
        let mtu = self.effective_mtu();

        match self.net_type {
            NetworkType::Bridged => {
                info!(vni = %self.vni, dev = %self.base_nic, "creating bridged network");
                plumbing
                    .create_vlan(&self.ctx.config.network.bridge_dev, &self.base_nic, self.vni.get())
                    .await?;
                plumbing.create_bridge(&self.bridge_nic).await?;
                plumbing.set_link_mtu_up(&self.base_nic, mtu).await?;
                plumbing.set_link_mtu_up(&self.bridge_nic, mtu).await?;
                plumbing.disable_tx_offload(&self.bridge_nic).await?;
                plumbing.disable_ipv6(&self.bridge_nic).await?;
                plumbing.add_to_bridge(&self.bridge_nic, &self.base_nic).await?;
            }
            NetworkType::Managed => {
                info!(vni = %self.vni, dev = %self.base_nic, "creating managed network");
                plumbing
                    .create_vxlan(&self.ctx.config.network.cluster_dev, &self.base_nic, self.vni.get())
                    .await?;
                plumbing.create_bridge(&self.bridge_nic).await?;
                plumbing.set_link_mtu_up(&self.base_nic, mtu).await?;
                plumbing.set_link_mtu_up(&self.bridge_nic, mtu).await?;
                plumbing.disable_tx_offload(&self.bridge_nic).await?;
                plumbing.disable_dad(&self.bridge_nic).await?;
                plumbing.add_to_bridge(&self.bridge_nic, &self.base_nic).await?;
            }
        }
        Ok(())
    }

    /// Tears the network down on this node.
    pub async fn remove_network(&self) -> Result<()> {
        info!(vni = %self.vni, "removing network");
        self.stop_dhcp().await;
        if self.net_type == NetworkType::Managed {
            self.remove_gateways().await;
            let _ = std::fs::remove_file(self.rules_file());
            let _ = self
                .ctx
                .plumbing
                .reload_firewall(&self.base_rules_file().display().to_string())
                .await;
        }
        self.ctx.plumbing.delete_link(&self.bridge_nic).await?;
        self.ctx.plumbing.delete_link(&self.base_nic).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gateways
    // ------------------------------------------------------------------

    fn prefix_of(network: &str) -> Option<&str> {
        network.rsplit_once('/').map(|(_, prefix)| prefix)
    }

    /// Adds gateway addresses on the bridge. Only ever effective on the
    /// primary (or a node mid-takeover); repeats are harmless.
    pub async fn create_gateways(&self) {
        if self.net_type != NetworkType::Managed || !self.is_primary() {
            return;
        }
        if let (Some(gw6), Some(net6)) = (
            self.read_net("network.ip6.gateway"),
            self.read_net("network.ip6.network"),
        ) {
            if let Some(prefix) = Self::prefix_of(&net6) {
                info!(vni = %self.vni, gateway = %gw6, "creating gateway address");
                let _ = self
                    .ctx
                    .plumbing
                    .create_ip_address(&gw6, prefix, &self.bridge_nic)
                    .await;
            }
        }
        if let (Some(gw4), Some(net4)) = (
            self.read_net("network.ip4.gateway"),
            self.read_net("network.ip4.network"),
        ) {
            if let Some(prefix) = Self::prefix_of(&net4) {
                info!(vni = %self.vni, gateway = %gw4, "creating gateway address");
                let _ = self
                    .ctx
                    .plumbing
                    .create_ip_address(&gw4, prefix, &self.bridge_nic)
                    .await;
                *self.cached_gw4.lock().unwrap() = Some(gw4);
            }
        }
    }

    /// Removes gateway addresses from the bridge; repeats are harmless.
    pub async fn remove_gateways(&self) {
        if self.net_type != NetworkType::Managed {
            return;
        }
        if let (Some(gw6), Some(net6)) = (
            self.read_net("network.ip6.gateway"),
            self.read_net("network.ip6.network"),
        ) {
            if let Some(prefix) = Self::prefix_of(&net6) {
                let _ = self
                    .ctx
                    .plumbing
                    .remove_ip_address(&gw6, prefix, &self.bridge_nic)
                    .await;
            }
        }
        if let (Some(gw4), Some(net4)) = (
            self.read_net("network.ip4.gateway"),
            self.read_net("network.ip4.network"),
        ) {
            if let Some(prefix) = Self::prefix_of(&net4) {
                let _ = self
                    .ctx
                    .plumbing
                    .remove_ip_address(&gw4, prefix, &self.bridge_nic)
                    .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // DHCP
    // ------------------------------------------------------------------

    fn hosts_dir(&self) -> PathBuf {
        self.ctx.config.network.dhcp_directory.join(self.vni.to_string())
    }

    /// Checks the declared L3 configuration: a DHCP-enabled network must
    /// carry a range and a gateway inside its network.
    pub fn validate_l3(&self) -> Result<()> {
        let dhcp4 = self.read_net("network.ip4.dhcp").as_deref() == Some("true");
        if !dhcp4 {
            return Ok(());
        }
        let range = (
            self.read_net("network.ip4.dhcp_start"),
            self.read_net("network.ip4.dhcp_end"),
        );
        if range.0.is_none() || range.1.is_none() {
            return Err(Error::InvalidDefinition {
                vni: self.vni.get(),
                detail: "dhcp4 enabled without a dhcp range".to_string(),
            });
        }
        let network: IpNet = self
            .read_net("network.ip4.network")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::InvalidDefinition {
                vni: self.vni.get(),
                detail: "dhcp4 enabled without a valid ip4 network".to_string(),
            })?;
        let gateway: std::net::IpAddr = self
            .read_net("network.ip4.gateway")
            .and_then(|g| g.parse().ok())
            .ok_or_else(|| Error::InvalidDefinition {
                vni: self.vni.get(),
                detail: "dhcp4 enabled without a gateway".to_string(),
            })?;
        if !network.contains(&gateway) {
            return Err(Error::InvalidDefinition {
                vni: self.vni.get(),
                detail: format!("gateway {gateway} outside network {network}"),
            });
        }
        Ok(())
    }

    /// The DHCP daemon configuration this network currently calls for, or
    /// `None` when no daemon should run here.
    pub fn dhcp_plan(&self) -> Option<DhcpConfig> {
        if self.net_type != NetworkType::Managed || !self.is_primary() {
            return None;
        }
        let dhcp4 = self.read_net("network.ip4.dhcp").as_deref() == Some("true");
        let dhcp6 = self.read_net("network.ip6.dhcp").as_deref() == Some("true");
        if !dhcp4 && !dhcp6 {
            return None;
        }
        if let Err(error) = self.validate_l3() {
            warn!(vni = %self.vni, %error, "refusing to start DHCP");
            return None;
        }
        let range = match (
            self.read_net("network.ip4.dhcp_start"),
            self.read_net("network.ip4.dhcp_end"),
        ) {
            (Some(start), Some(end)) if dhcp4 => Some((start, end)),
            _ => None,
        };
        Some(DhcpConfig {
            vni: self.vni,
            bridge_nic: self.bridge_nic.clone(),
            domain: self
                .read_net("network.domain")
                .unwrap_or_else(|| format!("net{}.local", self.vni)),
            hosts_dir: self.hosts_dir(),
            lease_hook: self.ctx.config.network.dhcp_directory.join("lease-hook"),
            ip4_gateway: self.read_net("network.ip4.gateway"),
            dhcp4_range: range,
            ip6_gateway: self.read_net("network.ip6.gateway"),
            dhcp6,
        })
    }

    /// Starts the DHCP daemon when this network calls for one.
    pub async fn start_dhcp(&self) {
        let Some(plan) = self.dhcp_plan() else {
            return;
        };
        let mut server = self.dhcp_server.lock().await;
        if server.is_some() {
            return;
        }
        info!(vni = %self.vni, bridge = %self.bridge_nic, "starting DHCP server");
        if let Err(error) = std::fs::create_dir_all(plan.hosts_dir.as_path()) {
            warn!(vni = %self.vni, %error, "could not create DHCP hosts directory");
            return;
        }
        let logfile = self
            .ctx
            .config
            .network
            .dhcp_directory
            .join(format!("dnsmasq-{}.log", self.vni));
        let env = plan.env(&roost_config::Paths::system_config_file());
        match DaemonProcess::spawn(self.ctx.commander.clone(), &plan.argv(), &env, &logfile) {
            Ok(daemon) => *server = Some(daemon),
            Err(error) => warn!(vni = %self.vni, %error, "failed to start DHCP server"),
        }
    }

    /// Stops the DHCP daemon if one is running.
    pub async fn stop_dhcp(&self) {
        let daemon = self.dhcp_server.lock().await.take();
        if let Some(daemon) = daemon {
            info!(vni = %self.vni, "stopping DHCP server");
            daemon.stop().await;
        }
    }

    pub async fn dhcp_running(&self) -> bool {
        self.dhcp_server.lock().await.is_some()
    }

    fn current_reservations(&self) -> Vec<String> {
        let vni_text = self.vni.to_string();
        self.ctx
            .client
            .children(("network.reservation", vni_text.as_str()))
            .unwrap_or_default()
    }

    async fn apply_reservations(&self, new: Vec<String>) {
        let old = self.reservations.lock().unwrap().clone();
        match sync_reservations(&self.ctx.client, self.vni, &self.hosts_dir(), &old, &new) {
            Ok(changed) => {
                let removed = old.iter().any(|m| !new.contains(m));
                *self.reservations.lock().unwrap() = new;
                if changed && removed {
                    // The daemon only rereads host files on HUP when one
                    // disappeared.
                    if let Some(daemon) = self.dhcp_server.lock().await.as_ref() {
                        let _ = daemon.signal("HUP").await;
                    }
                }
            }
            Err(error) => warn!(vni = %self.vni, %error, "reservation sync failed"),
        }
    }

    // ------------------------------------------------------------------
    // Firewall
    // ------------------------------------------------------------------

    fn rules_file(&self) -> PathBuf {
        self.ctx
            .config
            .network
            .nft_dynamic_directory
            .join("networks")
            .join(format!("{}.nft", self.vni))
    }

    fn base_rules_file(&self) -> PathBuf {
        self.ctx.config.network.nft_dynamic_directory.join("base.nft")
    }

    fn read_acls(&self, direction: &str) -> Vec<AclRule> {
        let vni_text = self.vni.to_string();
        let key = format!("network.rule.{direction}");
        let names = self
            .ctx
            .client
            .children((key.as_str(), vni_text.as_str()))
            .unwrap_or_default();
        names
            .into_iter()
            .filter_map(|name| {
                let order = self
                    .ctx
                    .client
                    .read((key.as_str(), vni_text.as_str(), "rule.order", name.as_str()))?
                    .parse()
                    .ok()?;
                let rule = self.ctx.client.read((
                    key.as_str(),
                    vni_text.as_str(),
                    "rule.rule",
                    name.as_str(),
                ))?;
                Some(AclRule {
                    order,
                    description: name,
                    rule,
                })
            })
            .collect()
    }

    /// Rewrites this network's chain file and reloads the packet filter.
    pub async fn update_firewall(&self) -> Result<()> {
        if self.net_type != NetworkType::Managed || self.read_net("network.ip4.network").is_none()
        {
            return Ok(());
        }
        info!(vni = %self.vni, "updating firewall rules");
        let facts = FirewallFacts {
            vni: self.vni.get(),
            base_nic: self.base_nic.clone(),
            bridge_nic: self.bridge_nic.clone(),
            ip4_network: self.read_net("network.ip4.network"),
            ip4_gateway: self.read_net("network.ip4.gateway"),
            ip6_network: self.read_net("network.ip6.network"),
            ip6_gateway: self.read_net("network.ip6.gateway"),
        };
        let text = render_rules(&facts, &self.read_acls("in"), &self.read_acls("out"));

        let path = self.rules_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, text)?;
        let _ = self
            .ctx
            .plumbing
            .reload_firewall(&self.base_rules_file().display().to_string())
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watches
    // ------------------------------------------------------------------

    fn arm_watches(self: Arc<Self>) -> Result<()> {
        let vni_text = self.vni.to_string();
        let client = &self.ctx.client;

        let mut mtu = client.watch_data(("network.mtu", vni_text.as_str()))?;
        let mut gw4 = client.watch_data(("network.ip4.gateway", vni_text.as_str()))?;
        let mut dhcp4 = client.watch_data(("network.ip4.dhcp", vni_text.as_str()))?;
        let mut reservations =
            client.watch_children(("network.reservation", vni_text.as_str()))?;
        let mut rules_in = client.watch_children(("network.rule.in", vni_text.as_str()))?;
        let mut rules_out = client.watch_children(("network.rule.out", vni_text.as_str()))?;

        tokio::spawn(async move {
            // Skip each watch's initial snapshot; spawn() already acted on
            // current state.
            let _ = mtu.recv().await;
            let _ = gw4.recv().await;
            let _ = dhcp4.recv().await;
            let _ = reservations.recv().await;
            let _ = rules_in.recv().await;
            let _ = rules_out.recv().await;

            loop {
                tokio::select! {
                    event = mtu.recv() => {
                        if event.is_none() { break; }
                        let mtu = self.effective_mtu();
                        info!(vni = %self.vni, mtu, "applying network MTU");
                        let _ = self.ctx.plumbing.set_link_mtu_up(&self.base_nic, mtu).await;
                        let _ = self.ctx.plumbing.set_link_mtu_up(&self.bridge_nic, mtu).await;
                    }
                    event = gw4.recv() => {
                        let Some(event) = event else { break };
                        if self.is_primary() {
                            let old = self.cached_gw4.lock().unwrap().clone();
                            if let (Some(old_gw), Some(net4)) =
                                (old, self.read_net("network.ip4.network"))
                            {
                                if Some(&old_gw) != event.value.as_ref() {
                                    if let Some(prefix) = Self::prefix_of(&net4) {
                                        let _ = self
                                            .ctx
                                            .plumbing
                                            .remove_ip_address(&old_gw, prefix, &self.bridge_nic)
                                            .await;
                                    }
                                }
                            }
                            self.create_gateways().await;
                        }
                        let _ = self.update_firewall().await;
                    }
                    event = dhcp4.recv() => {
                        let Some(event) = event else { break };
                        if event.value.as_deref() == Some("true") {
                            self.start_dhcp().await;
                        } else {
                            self.stop_dhcp().await;
                        }
                    }
                    event = reservations.recv() => {
                        let Some(event) = event else { break };
                        self.apply_reservations(event.children).await;
                    }
                    event = rules_in.recv() => {
                        if event.is_none() { break; }
                        let _ = self.update_firewall().await;
                    }
                    event = rules_out.recv() => {
                        if event.is_none() { break; }
                        let _ = self.update_firewall().await;
                    }
                }
            }
        });
        Ok(())
    }
}
