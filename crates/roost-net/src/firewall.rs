//! Packet-filter rule emission for tenant networks.
//!
//! Each network owns a chain pair (`vxlan{vni}-in`, `vxlan{vni}-out`)
//! jumped into from the forward chain on a src/dst network match. The base
//! rules always admit ICMP, DNS, DHCP, NTP, and the metadata endpoint into
//! the router from the tenant bridge and drop everything else inbound;
//! user ACLs append in ascending order. The whole node-local chain file is
//! rewritten on every change and the packet filter reloaded atomically.

use std::fmt::Write as _;

/// One user ACL, already resolved from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub order: u32,
    pub description: String,
    pub rule: String,
}

/// Addressing facts the rule generator needs.
#[derive(Debug, Clone, Default)]
pub struct FirewallFacts {
    pub vni: u32,
    /// The VXLAN/VLAN device carrying the network.
    pub base_nic: String,
    /// The tenant bridge the router addresses live on.
    pub bridge_nic: String,
    pub ip4_network: Option<String>,
    pub ip4_gateway: Option<String>,
    pub ip6_network: Option<String>,
    pub ip6_gateway: Option<String>,
}

/// Renders the complete chain file for one network: base admits, forward
/// jumps, then user rules sorted by order.
pub fn render_rules(facts: &FirewallFacts, rules_in: &[AclRule], rules_out: &[AclRule]) -> String {
    let vxlannic = &facts.base_nic;
    let bridgenic = &facts.bridge_nic;

    let mut out = String::new();
    let _ = writeln!(out, "# Rules for network {vxlannic}");
    let _ = writeln!(out, "add chain inet filter {vxlannic}-in");
    let _ = writeln!(out, "add chain inet filter {vxlannic}-out");
    let _ = writeln!(out, "add rule inet filter {vxlannic}-in counter");
    let _ = writeln!(out, "add rule inet filter {vxlannic}-out counter");
    out.push_str(&format!(
        "# Allow ICMP traffic into the router from network\n\
         add rule inet filter input ip protocol icmp meta iifname {bridgenic} counter accept\n\
         add rule inet filter input ip6 nexthdr icmpv6 meta iifname {bridgenic} counter accept\n\
         # Allow DNS, DHCP, and NTP traffic into the router from network\n\
         add rule inet filter input tcp dport 53 meta iifname {bridgenic} counter accept\n\
         add rule inet filter input udp dport 53 meta iifname {bridgenic} counter accept\n\
         add rule inet filter input udp dport 67 meta iifname {bridgenic} counter accept\n\
         add rule inet filter input udp dport 123 meta iifname {bridgenic} counter accept\n\
         add rule inet filter input ip6 nexthdr udp udp dport 547 meta iifname {bridgenic} counter accept\n\
         # Allow metadata API into the router from network\n\
         add rule inet filter input tcp dport 80 meta iifname {bridgenic} counter accept\n\
         # Block traffic into the router from network\n\
         add rule inet filter input meta iifname {bridgenic} counter drop\n"
    ));

    if let (Some(network), Some(_)) = (&facts.ip6_network, &facts.ip6_gateway) {
        let _ = writeln!(
            out,
            "# Jump from forward chain to this chain when matching net (IPv6)\n\
             add rule inet filter forward ip6 daddr {network} counter jump {vxlannic}-in\n\
             add rule inet filter forward ip6 saddr {network} counter jump {vxlannic}-out"
        );
    }
    if let (Some(network), Some(_)) = (&facts.ip4_network, &facts.ip4_gateway) {
        let _ = writeln!(
            out,
            "# Jump from forward chain to this chain when matching net (IPv4)\n\
             add rule inet filter forward ip daddr {network} counter jump {vxlannic}-in\n\
             add rule inet filter forward ip saddr {network} counter jump {vxlannic}-out"
        );
    }

    out.push_str("# User rules\n");
    for (direction, rules) in [("in", rules_in), ("out", rules_out)] {
        let mut sorted: Vec<&AclRule> = rules.iter().collect();
        sorted.sort_by_key(|r| r.order);
        for rule in sorted {
            let _ = writeln!(
                out,
                "add rule inet filter {vxlannic}-{direction} counter {}",
                rule.rule
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> FirewallFacts {
        FirewallFacts {
            vni: 100,
            base_nic: "vxlan100".to_string(),
            bridge_nic: "vmbr100".to_string(),
            ip4_network: Some("10.100.0.0/24".to_string()),
            ip4_gateway: Some("10.100.0.1".to_string()),
            ip6_network: None,
            ip6_gateway: None,
        }
    }

    #[test]
    fn test_base_rules_admit_router_services_and_drop_rest() {
        let text = render_rules(&facts(), &[], &[]);

        assert!(text.contains("add chain inet filter vxlan100-in"));
        assert!(text.contains("add chain inet filter vxlan100-out"));
        for admitted in ["udp dport 53", "udp dport 67", "udp dport 123", "tcp dport 80"] {
            assert!(text.contains(admitted), "missing admit for {admitted}");
        }
        // The bridge-inbound drop comes after every admit.
        let drop_pos = text.find("iifname vmbr100 counter drop").unwrap();
        let last_accept = text.rfind("iifname vmbr100 counter accept").unwrap();
        assert!(drop_pos > last_accept);
    }

    #[test]
    fn test_forward_jumps_match_network() {
        let text = render_rules(&facts(), &[], &[]);
        assert!(text.contains("forward ip daddr 10.100.0.0/24 counter jump vxlan100-in"));
        assert!(text.contains("forward ip saddr 10.100.0.0/24 counter jump vxlan100-out"));
    }

    #[test]
    fn test_user_rules_sorted_by_order() {
        let rules = vec![
            AclRule {
                order: 20,
                description: "allow web".to_string(),
                rule: "tcp dport 443 accept".to_string(),
            },
            AclRule {
                order: 10,
                description: "allow ssh".to_string(),
                rule: "tcp dport 22 accept".to_string(),
            },
        ];
        let text = render_rules(&facts(), &rules, &[]);

        let ssh = text.find("tcp dport 22 accept").unwrap();
        let web = text.find("tcp dport 443 accept").unwrap();
        assert!(ssh < web);
        assert!(text.contains("add rule inet filter vxlan100-in counter tcp dport 22 accept"));
    }

    #[test]
    fn test_no_l3_config_means_no_jumps() {
        let mut facts = facts();
        facts.ip4_network = None;
        facts.ip4_gateway = None;
        let text = render_rules(&facts, &[], &[]);
        assert!(!text.contains("jump vxlan100-in\n# User"));
        assert!(!text.contains("forward ip daddr"));
    }
}
