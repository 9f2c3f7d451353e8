//! The keepalive cycle.
//!
//! A single timer fires every `T_k` seconds. Each fire snapshots host
//! resources, runs the VM and storage collectors in parallel with bounded
//! joins, publishes one transactional batch (ending with the keepalive
//! timestamp that peers use as the fencing heartbeat), and, on the
//! primary, mirrors cluster config and kicks the fence scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roost_config::RoostConfig;
use roost_host::{metrics, resources_from_xml, Hypervisor, StorageMonitor};
use roost_store::Client;
use roost_types::CoordinatorState;
use tracing::{debug, info, warn};

use crate::fencing::Fencer;

/// Everything one keepalive tick needs.
#[derive(Clone)]
pub struct KeepaliveContext {
    pub client: Client,
    pub config: Arc<RoostConfig>,
    pub hostname: String,
    pub hypervisor: Hypervisor,
    pub storage: StorageMonitor,
    pub fencer: Arc<Fencer>,
    /// Cluster-wide maintenance flag mirror; suspends fencing.
    pub maintenance: Arc<AtomicBool>,
    /// Set during schema migration to pause publishing.
    pub paused: Arc<AtomicBool>,
}

/// Results of the VM collector.
#[derive(Debug, Default, Clone, Copy)]
struct VmCollectorReport {
    domains_count: usize,
    mem_allocated_mib: u64,
    mem_provisioned_mib: u64,
    vcpu_allocated: u64,
}

/// Starts the keepalive timer task.
pub fn start_keepalive_timer(ctx: KeepaliveContext) -> tokio::task::JoinHandle<()> {
    let interval = ctx.config.timing.keepalive();
    info!(seconds = interval.as_secs(), "starting keepalive timer");
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if ctx.paused.load(Ordering::SeqCst) {
                continue;
            }
            node_keepalive(&ctx).await;
        }
    })
}

fn coordinator_state(ctx: &KeepaliveContext) -> CoordinatorState {
    ctx.client
        .read(("node.state.coordinator", ctx.hostname.as_str()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(CoordinatorState::Client)
}

/// One keepalive run.
pub async fn node_keepalive(ctx: &KeepaliveContext) {
    let started = std::time::Instant::now();
    let is_primary = coordinator_state(ctx) == CoordinatorState::Primary;

    if is_primary {
        mirror_primary_config(ctx);
    }

    // Self-heal the daemon state unless we are deliberately leaving.
    let past_state = ctx
        .client
        .read(("node.state.daemon", ctx.hostname.as_str()))
        .unwrap_or_default();
    if past_state != "run" && past_state != "shutdown" {
        let _ = ctx
            .client
            .write([(("node.state.daemon", ctx.hostname.as_str()), "run".to_string())]);
    }

    // Collectors run in parallel, each bounded by the keepalive interval.
    let collector_budget = ctx
        .config
        .timing
        .keepalive()
        .saturating_sub(Duration::from_secs(1))
        .max(Duration::from_secs(1));

    let vm_task = ctx.config.daemon.enable_hypervisor.then(|| {
        let ctx = ctx.clone();
        tokio::spawn(async move { collect_vm_stats(&ctx).await })
    });
    let storage_task = ctx.config.daemon.enable_storage.then(|| {
        let ctx = ctx.clone();
        let primary = is_primary;
        tokio::spawn(async move { collect_storage_stats(&ctx, primary).await })
    });

    let vm_report = match vm_task {
        Some(task) => match tokio::time::timeout(collector_budget, task).await {
            Ok(Ok(report)) => report,
            _ => {
                warn!("VM stats gathering exceeded timeout, continuing");
                VmCollectorReport::default()
            }
        },
        None => VmCollectorReport::default(),
    };
    let osd_count = match storage_task {
        Some(task) => match tokio::time::timeout(collector_budget, task).await {
            Ok(Ok(count)) => count,
            _ => {
                warn!("storage stats gathering exceeded timeout, continuing");
                "?".to_string()
            }
        },
        None => "0".to_string(),
    };

    let memory = metrics::memory().unwrap_or_default();
    let load = metrics::load_average().unwrap_or_default();
    let netstats = metrics::network().unwrap_or_default();
    let running = ctx
        .client
        .read(("node.running_domains", ctx.hostname.as_str()))
        .unwrap_or_default();

    let keepalive_time = chrono::Utc::now().timestamp();
    let host = ctx.hostname.as_str();
    let result = ctx.client.write([
        (("node.memory.total", host), memory.total_mib.to_string()),
        (("node.memory.used", host), memory.used_mib.to_string()),
        (("node.memory.free", host), memory.free_mib.to_string()),
        (
            ("node.memory.allocated", host),
            vm_report.mem_allocated_mib.to_string(),
        ),
        (
            ("node.memory.provisioned", host),
            vm_report.mem_provisioned_mib.to_string(),
        ),
        (
            ("node.vcpu.allocated", host),
            vm_report.vcpu_allocated.to_string(),
        ),
        (("node.cpu.load", host), format!("{load:.2}")),
        (
            ("node.count.provisioned_domains", host),
            vm_report.domains_count.to_string(),
        ),
        (("node.running_domains", host), running),
        (("node.keepalive", host), keepalive_time.to_string()),
    ]);
    if result.is_err() {
        warn!("failed to set keepalive data");
    }

    if ctx.config.logging.log_keepalives {
        info!(
            node = host,
            state = %coordinator_state(ctx),
            domains = vm_report.domains_count,
            osds = %osd_count,
            load,
            mem_free_mib = memory.free_mib,
            net_rx = netstats.rx_bytes,
            net_tx = netstats.tx_bytes,
            runtime_ms = started.elapsed().as_millis() as u64,
            "keepalive"
        );
    }

    // Fence scan: primary only, and never in maintenance.
    if ctx.config.is_coordinator() && is_primary && !ctx.maintenance.load(Ordering::SeqCst) {
        let fencer = Arc::clone(&ctx.fencer);
        tokio::spawn(async move { fencer.fence_scan().await });
    }
}

/// Primary-only: mirror daemon configuration into the canonical cluster
/// keys when drifted, and re-assert the primary-node key.
fn mirror_primary_config(ctx: &KeepaliveContext) {
    if ctx.config.daemon.enable_hypervisor {
        let selector = ctx.config.vm.migration_target_selector.to_string();
        if ctx.client.read("base.config.migration_target_selector").as_deref()
            != Some(selector.as_str())
        {
            let _ = ctx
                .client
                .write([("base.config.migration_target_selector", selector)]);
        }
    }
    if ctx.config.daemon.enable_networking {
        let upstream = ctx.config.network.upstream_floating_ip.clone();
        if !upstream.is_empty()
            && ctx.client.read("base.config.upstream_ip").as_deref() != Some(upstream.as_str())
        {
            let _ = ctx.client.write([("base.config.upstream_ip", upstream)]);
        }
    }
    // Re-assert the primary-node key only when it carries garbage. A
    // `none` means a hand-off is in progress and contention owns the key;
    // a peer coordinator's name means the role is moving there and our
    // own relinquish is imminent.
    let primary_key = ctx.client.read("base.config.primary_node").unwrap_or_default();
    let legitimate = primary_key == ctx.hostname
        || primary_key == "none"
        || primary_key.is_empty()
        || ctx.config.node.coordinators.contains(&primary_key);
    if !legitimate {
        let _ = ctx
            .client
            .write([("base.config.primary_node", ctx.hostname.clone())]);
    }
}

/// VM collector: per-domain stats, allocation accounting, and the
/// should-be-running reconciler.
async fn collect_vm_stats(ctx: &KeepaliveContext) -> VmCollectorReport {
    debug!("VM collector starting");
    let mut report = VmCollectorReport::default();

    let running = ctx.hypervisor.list_running().await.unwrap_or_default();
    report.domains_count = running.len();

    for uuid in &running {
        if let Ok(Some(stats)) = ctx.hypervisor.domain_stats(*uuid).await {
            report.mem_allocated_mib += stats.memory_kib / 1024;
            report.vcpu_allocated += u64::from(stats.vcpus);
            if let Ok(blob) = serde_json::to_string(&stats) {
                let id = uuid.to_string();
                let _ = ctx.client.write([(("domain.stats", id.as_str()), blob)]);
            }
        }
    }

    // Provisioned accounting and the dead-VM reconciler walk the whole
    // fleet, not just what is live here.
    for id in ctx.client.children("base.domain").unwrap_or_default() {
        let node = ctx.client.read(("domain.node", id.as_str())).unwrap_or_default();
        if node != ctx.hostname {
            continue;
        }
        let declared = ctx.client.read(("domain.state", id.as_str())).unwrap_or_default();
        let Ok(uuid) = id.parse::<uuid::Uuid>() else {
            continue;
        };

        let is_running = running.contains(&uuid);
        if !is_running {
            if let Some((memory_kib, _)) = ctx
                .client
                .read(("domain.xml", id.as_str()))
                .as_deref()
                .and_then(resources_from_xml)
            {
                report.mem_provisioned_mib += memory_kib / 1024;
            }
        } else if let Ok(Some(stats)) = ctx.hypervisor.domain_stats(uuid).await {
            report.mem_provisioned_mib += stats.memory_kib / 1024;
        }

        // A VM that should be running here but is not gets its state
        // re-written to itself, which re-fires the instance dispatcher.
        if declared == "start" && !is_running {
            info!(uuid = %id, "resetting state for dead VM");
            let _ = ctx
                .client
                .write([(("domain.state", id.as_str()), declared.clone())]);
        }
    }

    debug!(?report, "VM collector finished");
    report
}

/// Storage collector: mirrors cluster stats (primary only) and counts the
/// OSDs homed on this node. An unreachable storage layer yields the `"?"`
/// sentinel, which is opaque text to every consumer.
async fn collect_storage_stats(ctx: &KeepaliveContext, is_primary: bool) -> String {
    debug!("storage collector starting");

    if is_primary {
        match ctx.storage.status().await {
            Ok(blob) => {
                let _ = ctx.client.write([("base.storage", blob)]);
            }
            Err(error) => {
                warn!(%error, "failed to read storage status");
                return "?".to_string();
            }
        }
        if let Ok(blob) = ctx.storage.health().await {
            let _ = ctx.client.write([("base.storage.health", blob)]);
        }
        if let Ok(blob) = ctx.storage.utilization().await {
            let _ = ctx.client.write([("base.storage.util", blob)]);
        }

        let known_pools = ctx.client.children("base.pool").unwrap_or_default();
        if let Ok(pools) = ctx.storage.pool_stats().await {
            for (name, blob) in pools {
                if known_pools.contains(&name) {
                    let _ = ctx.client.write([(("pool.stats", name.as_str()), blob)]);
                }
            }
        }
    }

    match ctx.storage.osd_stats().await {
        Ok(osds) => {
            let mut local = 0usize;
            for (id, stat) in &osds {
                if stat.node == ctx.hostname {
                    local += 1;
                }
                if is_primary {
                    let _ = ctx
                        .client
                        .write([(("osd.stats", id.as_str()), stat.stats_json.clone())]);
                }
            }
            local.to_string()
        }
        Err(_) => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_host::{Commander, IpmiClient};
    use roost_store::Store;

    fn context(store: &Arc<Store>, hostname: &str) -> (KeepaliveContext, Arc<roost_host::MockHypervisor>, Arc<roost_host::MockStorageMonitor>) {
        let client = Client::connect(Arc::clone(store)).unwrap();
        client.apply_schema().unwrap();
        let (hypervisor, hv_mock) = Hypervisor::mock();
        let (storage, st_mock) = StorageMonitor::mock();
        let (commander, _cmd) = Commander::mock();
        let mut config = RoostConfig::default();
        config.node.hostname = hostname.to_string();
        config.node.coordinators = vec![hostname.to_string()];
        let config = Arc::new(config);
        let fencer = Arc::new(Fencer::new(
            client.clone(),
            Arc::clone(&config),
            IpmiClient::new(commander, Duration::from_secs(1)),
            hostname.to_string(),
        ));
        (
            KeepaliveContext {
                client,
                config,
                hostname: hostname.to_string(),
                hypervisor,
                storage,
                fencer,
                maintenance: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(AtomicBool::new(false)),
            },
            hv_mock,
            st_mock,
        )
    }

    #[tokio::test]
    async fn test_keepalive_publishes_batch() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "hv1");

        node_keepalive(&ctx).await;

        let ts: i64 = ctx
            .client
            .read(("node.keepalive", "hv1"))
            .unwrap()
            .parse()
            .unwrap();
        assert!(ts > 0);
        assert!(ctx.client.read(("node.memory.total", "hv1")).is_some());
        assert_eq!(ctx.client.read(("node.state.daemon", "hv1")).unwrap(), "run");
    }

    #[tokio::test]
    async fn test_keepalive_respects_shutdown_state() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "hv1");
        ctx.client
            .write([(("node.state.daemon", "hv1"), "shutdown".to_string())])
            .unwrap();

        node_keepalive(&ctx).await;

        assert_eq!(
            ctx.client.read(("node.state.daemon", "hv1")).unwrap(),
            "shutdown"
        );
    }

    #[tokio::test]
    async fn test_primary_mirrors_config() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "cx1");
        ctx.client
            .write([(("node.state.coordinator", "cx1"), "primary".to_string())])
            .unwrap();
        ctx.client
            .write([("base.config.primary_node", "cx9".to_string())])
            .unwrap();

        node_keepalive(&ctx).await;

        assert_eq!(
            ctx.client.read("base.config.migration_target_selector").unwrap(),
            "mem"
        );
        // The primary re-asserts a drifted primary-node key.
        assert_eq!(ctx.client.read("base.config.primary_node").unwrap(), "cx1");
    }

    #[tokio::test]
    async fn test_dead_vm_reconciler_toggles_state() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "hv1");
        let uuid = uuid::Uuid::new_v4();
        let id = uuid.to_string();
        ctx.client
            .write([
                (("domain", id.as_str()), "vm1".to_string()),
                (("domain.state", id.as_str()), "start".to_string()),
                (("domain.node", id.as_str()), "hv1".to_string()),
                (
                    ("domain.xml", id.as_str()),
                    format!("<domain><uuid>{id}</uuid><memory unit='KiB'>1048576</memory><vcpu>1</vcpu></domain>"),
                ),
            ])
            .unwrap();
        let version_before = ctx
            .client
            .read_stat(("domain.state", id.as_str()))
            .unwrap()
            .1;

        node_keepalive(&ctx).await;

        // The declared-but-dead VM had its state rewritten in place,
        // re-firing any watcher.
        let (value, version_after) =
            ctx.client.read_stat(("domain.state", id.as_str())).unwrap();
        assert_eq!(value, "start");
        assert!(version_after > version_before);
        // Provisioned accounting picked up the XML-declared memory.
        assert_eq!(
            ctx.client.read(("node.memory.provisioned", "hv1")).unwrap(),
            "1024"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_maintenance_suppresses_fencing() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "cx1");
        ctx.client
            .write([(("node.state.coordinator", "cx1"), "primary".to_string())])
            .unwrap();
        ctx.maintenance.store(true, Ordering::SeqCst);

        // A peer that would otherwise be fenced immediately.
        let stale = chrono::Utc::now().timestamp() - 3600;
        ctx.client
            .write([
                (("node.state.daemon", "h3"), "run".to_string()),
                (("node.keepalive", "h3"), stale.to_string()),
            ])
            .unwrap();

        for _ in 0..5 {
            node_keepalive(&ctx).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(ctx.client.read(("node.state.daemon", "h3")).unwrap(), "run");
    }

    #[tokio::test]
    async fn test_unreachable_storage_is_question_mark() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, _st) = context(&store, "cx1");
        // Mock storage has no data configured: every call errors.
        let osd_count = collect_storage_stats(&ctx, true).await;
        assert_eq!(osd_count, "?");
    }

    #[tokio::test]
    async fn test_storage_collector_counts_local_osds() {
        let store = Arc::new(Store::new());
        let (ctx, _hv, st) = context(&store, "cx1");
        st.set_healthy();
        st.add_osd("0", "cx1");
        st.add_osd("1", "cx2");
        st.add_osd("2", "cx1");

        let osd_count = collect_storage_stats(&ctx, true).await;
        assert_eq!(osd_count, "2");
        assert!(ctx.client.read("base.storage.health").unwrap().contains("HEALTH_OK"));
    }
}
