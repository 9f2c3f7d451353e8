//! Whole-cluster scenarios: several daemon cores over one shared store,
//! with mocked host seams.

use std::sync::Arc;
use std::time::Duration;

use roost_config::RoostConfig;
use roost_store::{Client, Store};
use roost_types::CoordinatorState;
use roostd::{DaemonCore, HostSeams, MockSeams};
use uuid::Uuid;

struct TestNode {
    core: Arc<DaemonCore>,
    mocks: MockSeams,
}

fn node_config(hostname: &str, coordinators: &[&str], keepalive_secs: u64) -> RoostConfig {
    let mut config = RoostConfig::default();
    config.node.hostname = hostname.to_string();
    config.node.cluster_domain = "cluster.local".to_string();
    config.node.coordinators = coordinators.iter().map(|c| (*c).to_string()).collect();
    config.timing.keepalive_interval = keepalive_secs;
    config.timing.fence_intervals = 4;
    config.timing.fence_consecutive = 2;
    config.timing.migration_sync_timeout = 10;
    config.network.upstream_dev = "brupstream".to_string();
    config.network.upstream_floating_ip = "10.0.0.1/24".to_string();
    config.network.cluster_dev = "brcluster".to_string();
    config.network.cluster_floating_ip = "10.0.1.254/24".to_string();
    config.network.storage_dev = "brstorage".to_string();
    config.network.storage_floating_ip = "10.0.2.254/24".to_string();
    config.storage.storage_ip = format!("10.0.2.{}", hostname.len());
    config.daemon.enable_storage = false;
    config.logging.log_keepalives = false;
    config
}

async fn start_node(
    store: &Arc<Store>,
    hostname: &str,
    coordinators: &[&str],
    keepalive_secs: u64,
) -> TestNode {
    let (seams, mocks) = HostSeams::mock();
    let core = DaemonCore::start(
        node_config(hostname, coordinators, keepalive_secs),
        Arc::clone(store),
        seams,
    )
    .await
    .expect("daemon start");
    TestNode { core, mocks }
}

fn admin(store: &Arc<Store>) -> Client {
    Client::connect(Arc::clone(store)).unwrap()
}

async fn wait_until(secs: u64, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in {secs}s"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn seed_vm(client: &Client, uuid: &Uuid, node: &str, migrate_method: &str) -> String {
    let id = uuid.to_string();
    let xml = format!(
        "<domain type='kvm'><name>vm-{id}</name><uuid>{id}</uuid><memory unit='KiB'>2097152</memory><vcpu>2</vcpu></domain>"
    );
    client
        .write([
            (("domain", id.as_str()), format!("vm-{id}")),
            (("domain.state", id.as_str()), "start".to_string()),
            (("domain.node", id.as_str()), node.to_string()),
            (("domain.last_node", id.as_str()), String::new()),
            (("domain.xml", id.as_str()), xml.clone()),
            (("domain.storage.volumes", id.as_str()), String::new()),
            (("domain.failed_reason", id.as_str()), String::new()),
            (("domain.meta.migrate_method", id.as_str()), migrate_method.to_string()),
            (("domain.meta.node_limit", id.as_str()), String::new()),
            (("domain.meta.node_selector", id.as_str()), String::new()),
            (("domain.migrate.sync_lock", id.as_str()), String::new()),
        ])
        .unwrap();
    xml
}

// ---------------------------------------------------------------------
// Scenario: primary failover moves the floating IPs and the role.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_primary_failover() {
    let store = Arc::new(Store::new());
    let coordinators = ["cx1", "cx2", "cx3"];
    let cx1 = start_node(&store, "cx1", &coordinators, 3).await;
    let cx2 = start_node(&store, "cx2", &coordinators, 3).await;
    let _cx3 = start_node(&store, "cx3", &coordinators, 3).await;

    // cx1 claimed the vacant slot at boot and completes the takeover.
    wait_until(30, || {
        cx1.core.coordinator_state() == CoordinatorState::Primary
    })
    .await;
    assert!(cx1.mocks.commander.saw("ip address add 10.0.0.1/24 dev brupstream"));

    // Operator moves the primary to cx2.
    let client = admin(&store);
    client
        .write([("base.config.primary_node", "cx2".to_string())])
        .unwrap();

    wait_until(30, || {
        cx2.core.coordinator_state() == CoordinatorState::Primary
            && cx1.core.coordinator_state() == CoordinatorState::Secondary
    })
    .await;

    // The upstream floating IP moved: released on cx1, bound on cx2.
    assert!(cx1.mocks.commander.saw("ip address delete 10.0.0.1/24 dev brupstream"));
    assert!(cx2.mocks.commander.saw("ip address add 10.0.0.1/24 dev brupstream"));
    assert!(cx2.mocks.commander.saw("ip address add 169.254.169.254/32 dev lo"));
    // Singleton services follow the role.
    assert!(cx1.mocks.commander.saw("systemctl stop roost-dns.service"));
    assert!(cx2.mocks.commander.saw("systemctl start roost-dns.service"));
}

// ---------------------------------------------------------------------
// Scenario: live migration between two hypervisors.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_vm_live_migrate() {
    let store = Arc::new(Store::new());
    let h1 = start_node(&store, "h1", &[], 3).await;
    let h2 = start_node(&store, "h2", &[], 3).await;
    h1.mocks
        .hypervisor
        .register_peer("h2", Arc::clone(&h2.mocks.hypervisor));
    h2.mocks
        .hypervisor
        .register_peer("h1", Arc::clone(&h1.mocks.hypervisor));

    let client = admin(&store);
    let uuid = Uuid::new_v4();
    let xml = seed_vm(&client, &uuid, "h1", "live");
    h1.mocks.hypervisor.insert_running(uuid, &xml);

    let id = uuid.to_string();
    // The children watch picks the VM up and h1 adopts it.
    wait_until(15, || {
        client
            .read(("node.running_domains", "h1"))
            .unwrap_or_default()
            .contains(&id)
    })
    .await;

    // Operator declares the migration.
    client
        .write([
            (("domain.node", id.as_str()), "h2".to_string()),
            (("domain.last_node", id.as_str()), "h1".to_string()),
            (("domain.state", id.as_str()), "migrate".to_string()),
        ])
        .unwrap();

    wait_until(30, || {
        client.read(("domain.state", id.as_str())).as_deref() == Some("start")
            && client
                .read(("node.running_domains", "h2"))
                .unwrap_or_default()
                .contains(&id)
    })
    .await;

    assert_eq!(client.read(("domain.node", id.as_str())).unwrap(), "h2");
    assert_eq!(client.read(("domain.last_node", id.as_str())).unwrap(), "h1");
    assert!(!client
        .read(("node.running_domains", "h1"))
        .unwrap_or_default()
        .contains(&id));
    // Exactly one live stream crossed the cluster network.
    assert!(matches!(
        h2.mocks.hypervisor.domain_running(uuid),
        Some(true)
    ));
}

// ---------------------------------------------------------------------
// Scenario: live fails three times, shutdown-based migration completes.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_shutdown_fallback_migration() {
    let store = Arc::new(Store::new());
    let h1 = start_node(&store, "h1", &[], 3).await;
    let h2 = start_node(&store, "h2", &[], 3).await;
    h1.mocks
        .hypervisor
        .register_peer("h2", Arc::clone(&h2.mocks.hypervisor));

    let client = admin(&store);
    let uuid = Uuid::new_v4();
    let xml = seed_vm(&client, &uuid, "h1", "none");
    h1.mocks.hypervisor.insert_running(uuid, &xml);
    h1.mocks.hypervisor.inject_live_failures(3);

    let id = uuid.to_string();
    wait_until(15, || {
        client
            .read(("node.running_domains", "h1"))
            .unwrap_or_default()
            .contains(&id)
    })
    .await;

    client
        .write([
            (("domain.node", id.as_str()), "h2".to_string()),
            (("domain.last_node", id.as_str()), "h1".to_string()),
            (("domain.state", id.as_str()), "migrate".to_string()),
        ])
        .unwrap();

    // The source shuts the guest down, the receiver starts it fresh.
    wait_until(60, || {
        client.read(("domain.state", id.as_str())).as_deref() == Some("start")
            && matches!(h2.mocks.hypervisor.domain_running(uuid), Some(true))
    })
    .await;

    assert_eq!(client.read(("domain.node", id.as_str())).unwrap(), "h2");
    assert!(!matches!(h1.mocks.hypervisor.domain_running(uuid), Some(true)));
}

// ---------------------------------------------------------------------
// Scenario: a silent node is fenced and its VMs recovered.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_node_fencing_and_autorecovery() {
    let store = Arc::new(Store::new());
    let cx1 = start_node(&store, "cx1", &["cx1"], 1).await;
    let h2 = start_node(&store, "h2", &["cx1"], 1).await;

    wait_until(30, || {
        cx1.core.coordinator_state() == CoordinatorState::Primary
    })
    .await;

    // h3 exists only as store state: it has gone silent.
    let client = admin(&store);
    let stale = chrono::Utc::now().timestamp() - 3600;
    client
        .write([
            (("node", "h3"), "h3".to_string()),
            (("node.state.daemon", "h3"), "run".to_string()),
            (("node.state.domain", "h3"), "ready".to_string()),
            (("node.keepalive", "h3"), stale.to_string()),
            (("node.ipmi.hostname", "h3"), "h3-lom".to_string()),
            (("node.ipmi.username", "h3"), "admin".to_string()),
            (("node.ipmi.password", "h3"), "secret".to_string()),
        ])
        .unwrap();
    cx1.mocks.commander.respond(
        "ipmitool -I lanplus -H h3-lom -U admin -P secret chassis power status",
        roost_host::CommandOutput::ok("Chassis Power is off\n"),
    );

    let uuid = Uuid::new_v4();
    seed_vm(&client, &uuid, "h3", "none");
    let id = uuid.to_string();
    client
        .write([(("node.running_domains", "h3"), id.clone())])
        .unwrap();

    // The primary's fence scan declares h3 dead, powers it off, and
    // recovers the VM onto a live node.
    wait_until(30, || {
        client.read(("node.state.daemon", "h3")).as_deref() == Some("dead")
    })
    .await;
    assert!(cx1
        .mocks
        .commander
        .saw("ipmitool -I lanplus -H h3-lom -U admin -P secret chassis power off"));

    wait_until(30, || {
        client.read(("domain.node", id.as_str())).as_deref() != Some("h3")
    })
    .await;
    let new_home = client.read(("domain.node", id.as_str())).unwrap();
    assert!(new_home == "cx1" || new_home == "h2", "recovered to {new_home}");
    assert_eq!(client.read(("domain.last_node", id.as_str())).unwrap(), "h3");

    // And the VM actually comes up on its new home.
    let target_hv = if new_home == "cx1" {
        &cx1.mocks.hypervisor
    } else {
        &h2.mocks.hypervisor
    };
    let target_hv = Arc::clone(target_hv);
    wait_until(30, move || {
        matches!(target_hv.domain_running(uuid), Some(true))
    })
    .await;
}

// ---------------------------------------------------------------------
// Scenario: cluster-wide schema upgrade from v1 to v2.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_schema_upgrade() {
    let store = Arc::new(Store::new());
    // The cluster starts on the previous schema dialect.
    store.write_batch([("/schema/version", "1")]).unwrap();

    let cx1 = start_node(&store, "cx1", &["cx1"], 3).await;
    let _h2 = start_node(&store, "h2", &["cx1"], 3).await;
    wait_until(30, || {
        cx1.core.coordinator_state() == CoordinatorState::Primary
    })
    .await;

    let client = admin(&store);
    assert_eq!(client.schema().version(), 1);
    let uuid = Uuid::new_v4();
    seed_vm(&client, &uuid, "h2", "none");
    let id = uuid.to_string();

    // Operator bumps the cluster-wide schema version.
    client
        .write([("base.schema.version", "2".to_string())])
        .unwrap();

    wait_until(30, || {
        client.read(("node.data.active_schema", "cx1")).as_deref() == Some("2")
            && client.read(("node.data.active_schema", "h2")).as_deref() == Some("2")
    })
    .await;

    // Data survived the migration, and the new v2 key materialized for
    // the existing domain.
    assert_eq!(client.read(("domain.state", id.as_str())).unwrap(), "start");
    assert!(store.exists(&format!("/domains/{id}/vnc")));
}

// ---------------------------------------------------------------------
// Scenario: two simultaneous contenders, exactly one winner.
// ---------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scenario_contention_single_winner() {
    let store = Arc::new(Store::new());
    let coordinators = ["cx1", "cx2", "cx3"];
    let cx1 = start_node(&store, "cx1", &coordinators, 3).await;
    let cx2 = start_node(&store, "cx2", &coordinators, 3).await;
    let cx3 = start_node(&store, "cx3", &coordinators, 3).await;

    wait_until(30, || {
        cx1.core.coordinator_state() == CoordinatorState::Primary
    })
    .await;

    // Vacating the key makes cx2 and cx3 contend simultaneously.
    let client = admin(&store);
    client
        .write([("base.config.primary_node", "none".to_string())])
        .unwrap();

    wait_until(60, || {
        let states = [
            cx1.core.coordinator_state(),
            cx2.core.coordinator_state(),
            cx3.core.coordinator_state(),
        ];
        states
            .iter()
            .filter(|s| **s == CoordinatorState::Primary)
            .count()
            == 1
            && states
                .iter()
                .all(|s| matches!(s, CoordinatorState::Primary | CoordinatorState::Secondary))
    })
    .await;

    // The winner is one of the two contenders, never the old primary.
    let winner = client.read("base.config.primary_node").unwrap();
    assert!(winner == "cx2" || winner == "cx3", "winner was {winner}");

    let primaries = [&cx1, &cx2, &cx3]
        .iter()
        .filter(|n| n.core.coordinator_state() == CoordinatorState::Primary)
        .count();
    assert_eq!(primaries, 1);
}
