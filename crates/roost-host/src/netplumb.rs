//! Kernel networking plumbing.
//!
//! Thin wrappers over the host tools that materialize tenant networks:
//! address management, VLAN/VXLAN link creation, bridge membership, and
//! the packet-filter reload. All calls go through the command runner, so
//! tests observe exactly which plumbing a state transition produced.

use std::time::Duration;

use tracing::warn;

use crate::cmd::Commander;
use crate::error::Result;

/// Host networking operations.
#[derive(Clone)]
pub struct NetPlumbing {
    commander: Commander,
    timeout: Duration,
}

impl NetPlumbing {
    pub fn new(commander: Commander, timeout: Duration) -> Self {
        Self { commander, timeout }
    }

    /// Adds an address to a device. Safe to repeat; an already-present
    /// address is not an error.
    pub async fn create_ip_address(&self, addr: &str, prefix: &str, dev: &str) -> Result<()> {
        let cidr = format!("{addr}/{prefix}");
        let out = self
            .commander
            .run(&["ip", "address", "add", &cidr, "dev", dev], self.timeout)
            .await?;
        if !out.success() && !out.stderr.contains("File exists") {
            warn!(%cidr, %dev, stderr = %out.stderr.trim(), "failed to add address");
        }
        // Gratuitous ARP so upstream gear learns the move immediately.
        let _ = self
            .commander
            .run(
                &["arping", "-A", "-c", "2", "-I", dev, addr],
                self.timeout,
            )
            .await;
        Ok(())
    }

    /// Removes an address from a device. Safe to repeat.
    pub async fn remove_ip_address(&self, addr: &str, prefix: &str, dev: &str) -> Result<()> {
        let cidr = format!("{addr}/{prefix}");
        let out = self
            .commander
            .run(&["ip", "address", "delete", &cidr, "dev", dev], self.timeout)
            .await?;
        if !out.success() && !out.stderr.contains("Cannot assign") {
            warn!(%cidr, %dev, stderr = %out.stderr.trim(), "failed to remove address");
        }
        Ok(())
    }

    /// Creates a VLAN sub-interface of `uplink`.
    pub async fn create_vlan(&self, uplink: &str, name: &str, vid: u32) -> Result<()> {
        self.commander
            .run(
                &[
                    "ip", "link", "add", "link", uplink, "name", name, "type", "vlan",
                    "id", &vid.to_string(),
                ],
                self.timeout,
            )
            .await?;
        Ok(())
    }

    /// Creates a VXLAN interface carrying `vni` over `dev` (UDP 4789).
    pub async fn create_vxlan(&self, dev: &str, name: &str, vni: u32) -> Result<()> {
        self.commander
            .run(
                &[
                    "ip", "link", "add", name, "type", "vxlan", "id", &vni.to_string(),
                    "dstport", "4789", "dev", dev,
                ],
                self.timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn create_bridge(&self, name: &str) -> Result<()> {
        self.commander
            .run(&["brctl", "addbr", name], self.timeout)
            .await?;
        Ok(())
    }

    pub async fn add_to_bridge(&self, bridge: &str, member: &str) -> Result<()> {
        self.commander
            .run(&["brctl", "addif", bridge, member], self.timeout)
            .await?;
        Ok(())
    }

    pub async fn set_link_mtu_up(&self, dev: &str, mtu: u32) -> Result<()> {
        self.commander
            .run(
                &["ip", "link", "set", dev, "mtu", &mtu.to_string(), "up"],
                self.timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn delete_link(&self, dev: &str) -> Result<()> {
        self.commander
            .run(&["ip", "link", "set", dev, "down"], self.timeout)
            .await?;
        self.commander
            .run(&["ip", "link", "delete", dev], self.timeout)
            .await?;
        Ok(())
    }

    /// Disables TX checksum offload on a bridge (breaks DHCP otherwise).
    pub async fn disable_tx_offload(&self, dev: &str) -> Result<()> {
        self.commander
            .run(&["ethtool", "-K", dev, "tx", "off"], self.timeout)
            .await?;
        Ok(())
    }

    /// Disables IPv6 entirely on a device (bridged networks: prevents
    /// leakage).
    pub async fn disable_ipv6(&self, dev: &str) -> Result<()> {
        self.commander
            .run(
                &["sysctl", &format!("net.ipv6.conf.{dev}.disable_ipv6=1")],
                self.timeout,
            )
            .await?;
        Ok(())
    }

    /// Disables IPv6 duplicate address detection on a device (managed
    /// networks: the gateway address moves between hosts).
    pub async fn disable_dad(&self, dev: &str) -> Result<()> {
        self.commander
            .run(
                &["sysctl", &format!("net.ipv6.conf.{dev}.accept_dad=0")],
                self.timeout,
            )
            .await?;
        Ok(())
    }

    /// Reloads the packet filter from its base file.
    pub async fn reload_firewall(&self, base_file: &str) -> Result<bool> {
        let out = self
            .commander
            .run(&["nft", "-f", base_file], self.timeout)
            .await?;
        if !out.success() {
            warn!(stderr = %out.stderr.trim(), "packet filter reload failed");
        }
        Ok(out.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_address_add_emits_plumbing_and_arp() {
        let (commander, mock) = Commander::mock();
        let plumbing = NetPlumbing::new(commander, Duration::from_secs(1));

        plumbing
            .create_ip_address("10.0.0.1", "24", "brupstream")
            .await
            .unwrap();

        assert!(mock.saw("ip address add 10.0.0.1/24 dev brupstream"));
        assert!(mock.saw("arping -A -c 2 -I brupstream 10.0.0.1"));
    }

    #[tokio::test]
    async fn test_vxlan_uses_standard_port() {
        let (commander, mock) = Commander::mock();
        let plumbing = NetPlumbing::new(commander, Duration::from_secs(1));

        plumbing.create_vxlan("eth1", "vxlan100", 100).await.unwrap();

        assert!(mock.saw("ip link add vxlan100 type vxlan id 100 dstport 4789 dev eth1"));
    }
}
