//! Migration target selection.
//!
//! Given a VM, candidates are every node with `daemon_state=run` and
//! `domain_state=ready`, intersected with the VM's node limit when one is
//! declared, minus the VM's current node. The best candidate is picked by
//! the selector mode; ties break by lexical hostname.

use roost_store::Client;
use roost_types::SelectorMode;
use tracing::debug;

/// Valid migration targets for a VM, sorted lexically.
pub fn valid_candidates(client: &Client, uuid: &str) -> Vec<String> {
    let node_limit: Vec<String> = client
        .read(("domain.meta.node_limit", uuid))
        .unwrap_or_default()
        .split(',')
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    let current = client.read(("domain.node", uuid)).unwrap_or_default();

    let mut candidates: Vec<String> = client
        .children("base.node")
        .unwrap_or_default()
        .into_iter()
        .filter(|node| *node != current)
        .filter(|node| node_limit.is_empty() || node_limit.contains(node))
        .filter(|node| {
            let daemon = client
                .read(("node.state.daemon", node.as_str()))
                .unwrap_or_default();
            let domain = client
                .read(("node.state.domain", node.as_str()))
                .unwrap_or_default();
            daemon == "run" && domain == "ready"
        })
        .collect();
    candidates.sort();
    candidates
}

/// The selector mode a VM asks for, falling back to the cluster default.
fn selector_mode(client: &Client, uuid: &str, cluster_default: SelectorMode) -> SelectorMode {
    let declared = client
        .read(("domain.meta.node_selector", uuid))
        .filter(|s| !s.is_empty() && s != "none" && s != "None");
    declared
        .or_else(|| client.read("base.config.migration_target_selector"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(cluster_default)
}

fn metric_u64(client: &Client, key: &str, node: &str) -> u64 {
    client
        .read((key, node))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn metric_f64(client: &Client, key: &str, node: &str) -> f64 {
    client
        .read((key, node))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

/// Picks the best live target for a VM, or `None` when no candidate
/// remains.
pub fn find_target(
    client: &Client,
    uuid: &str,
    cluster_default: SelectorMode,
) -> Option<String> {
    let candidates = valid_candidates(client, uuid);
    if candidates.is_empty() {
        return None;
    }
    let mode = selector_mode(client, uuid, cluster_default);
    debug!(%uuid, ?mode, ?candidates, "selecting migration target");

    // Candidates are sorted, and only strict improvements displace the
    // incumbent, so ties resolve to the lexically first hostname.
    match mode {
        SelectorMode::Mem => pick_max(client, &candidates, |c, n| {
            metric_u64(c, "node.memory.free", n)
        }),
        SelectorMode::MemProv => pick_max(client, &candidates, |c, n| {
            let total = metric_u64(c, "node.memory.used", n) + metric_u64(c, "node.memory.free", n);
            total.saturating_sub(metric_u64(c, "node.memory.provisioned", n))
        }),
        SelectorMode::Load => {
            let mut best: Option<(String, f64)> = None;
            for node in &candidates {
                let load = metric_f64(client, "node.cpu.load", node);
                if best.as_ref().map_or(true, |(_, b)| load < *b) {
                    best = Some((node.clone(), load));
                }
            }
            best.map(|(node, _)| node)
        }
        SelectorMode::Vcpus => pick_min(client, &candidates, |c, n| {
            metric_u64(c, "node.vcpu.allocated", n)
        }),
        SelectorMode::Vms => pick_min(client, &candidates, |c, n| {
            metric_u64(c, "node.count.provisioned_domains", n)
        }),
    }
}

fn pick_max(
    client: &Client,
    candidates: &[String],
    metric: impl Fn(&Client, &str) -> u64,
) -> Option<String> {
    let mut best: Option<(String, u64)> = None;
    for node in candidates {
        let value = metric(client, node);
        if best.as_ref().map_or(true, |(_, b)| value > *b) {
            best = Some((node.clone(), value));
        }
    }
    best.map(|(node, _)| node)
}

fn pick_min(
    client: &Client,
    candidates: &[String],
    metric: impl Fn(&Client, &str) -> u64,
) -> Option<String> {
    let mut best: Option<(String, u64)> = None;
    for node in candidates {
        let value = metric(client, node);
        if best.as_ref().map_or(true, |(_, b)| value < *b) {
            best = Some((node.clone(), value));
        }
    }
    best.map(|(node, _)| node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_store::Store;
    use std::sync::Arc;
    use test_case::test_case;

    fn client() -> Client {
        let client = Client::connect(Arc::new(Store::new())).unwrap();
        client.apply_schema().unwrap();
        client
    }

    fn seed_node(client: &Client, name: &str, free: u64, prov: u64, load: f64, vcpus: u64, vms: u64) {
        client
            .write([
                (("node.state.daemon", name), "run".to_string()),
                (("node.state.domain", name), "ready".to_string()),
                (("node.memory.free", name), free.to_string()),
                (("node.memory.used", name), "4096".to_string()),
                (("node.memory.provisioned", name), prov.to_string()),
                (("node.cpu.load", name), load.to_string()),
                (("node.vcpu.allocated", name), vcpus.to_string()),
                (("node.count.provisioned_domains", name), vms.to_string()),
            ])
            .unwrap();
    }

    fn seed_vm(client: &Client, uuid: &str, node: &str, limit: &str, selector: &str) {
        client
            .write([
                (("domain.node", uuid), node.to_string()),
                (("domain.meta.node_limit", uuid), limit.to_string()),
                (("domain.meta.node_selector", uuid), selector.to_string()),
            ])
            .unwrap();
    }

    #[test]
    fn test_candidates_require_run_and_ready() {
        let client = client();
        seed_node(&client, "h1", 1, 0, 0.0, 0, 0);
        seed_node(&client, "h2", 1, 0, 0.0, 0, 0);
        seed_node(&client, "h3", 1, 0, 0.0, 0, 0);
        client
            .write([(("node.state.daemon", "h2"), "dead".to_string())])
            .unwrap();
        client
            .write([(("node.state.domain", "h3"), "flush".to_string())])
            .unwrap();
        seed_vm(&client, "u1", "h1", "", "");

        // h1 is the current node, h2 is dead, h3 is draining.
        assert!(valid_candidates(&client, "u1").is_empty());
    }

    #[test]
    fn test_node_limit_intersection() {
        let client = client();
        for name in ["h1", "h2", "h3"] {
            seed_node(&client, name, 1, 0, 0.0, 0, 0);
        }
        seed_vm(&client, "u1", "h1", "h3", "");
        assert_eq!(valid_candidates(&client, "u1"), vec!["h3"]);
    }

    #[test_case("mem", "h3"; "most free memory wins")]
    #[test_case("load", "h2"; "lowest load wins")]
    #[test_case("vcpus", "h2"; "fewest vcpus wins")]
    #[test_case("vms", "h3"; "fewest vms wins")]
    fn test_selector_modes(selector: &str, expected: &str) {
        let client = client();
        seed_node(&client, "h1", 9999, 0, 0.0, 0, 0);
        seed_node(&client, "h2", 1024, 512, 0.5, 2, 9);
        seed_node(&client, "h3", 8192, 8192, 2.0, 16, 1);
        seed_vm(&client, "u1", "h1", "", selector);

        assert_eq!(
            find_target(&client, "u1", SelectorMode::Mem).as_deref(),
            Some(expected)
        );
    }

    #[test]
    fn test_memprov_headroom() {
        let client = client();
        // h2 headroom: 4096+1024-512 = 4608; h3: 4096+8192-8192 = 4096.
        seed_node(&client, "h2", 1024, 512, 0.0, 0, 0);
        seed_node(&client, "h3", 8192, 8192, 0.0, 0, 0);
        seed_vm(&client, "u1", "h1", "", "memprov");

        assert_eq!(
            find_target(&client, "u1", SelectorMode::Mem).as_deref(),
            Some("h2")
        );
    }

    #[test]
    fn test_ties_break_lexically() {
        let client = client();
        seed_node(&client, "hb", 2048, 0, 0.0, 4, 4);
        seed_node(&client, "ha", 2048, 0, 0.0, 4, 4);
        seed_vm(&client, "u1", "hz", "", "mem");

        assert_eq!(
            find_target(&client, "u1", SelectorMode::Mem).as_deref(),
            Some("ha")
        );
    }

    #[test]
    fn test_cluster_default_used_when_unset() {
        let client = client();
        seed_node(&client, "h2", 1, 0, 0.9, 1, 1);
        seed_node(&client, "h3", 9, 0, 0.1, 9, 9);
        seed_vm(&client, "u1", "h1", "", "");
        client
            .write([("base.config.migration_target_selector", "load".to_string())])
            .unwrap();

        assert_eq!(
            find_target(&client, "u1", SelectorMode::Mem).as_deref(),
            Some("h3")
        );
    }

    #[test]
    fn test_empty_candidate_set_is_none() {
        let client = client();
        seed_vm(&client, "u1", "h1", "", "");
        assert_eq!(find_target(&client, "u1", SelectorMode::Mem), None);
    }
}
