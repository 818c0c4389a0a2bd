//! Bulk DHCP resync tests.
//!
//! Builds a tenant model with several networks directly in the catalog and
//! checks which servers and bindings a resync pass creates or reuses.

use std::net::Ipv4Addr;
use std::sync::Arc;

use nsx_sync::audit::AuditLogger;
use nsx_sync::dhcp::{DhcpReconciler, ResyncReport};
use nsx_sync::locks::KeyedLocks;
use nsx_sync::store::MappingStore;
use nsx_sync::test_util::{
    Call, FakeBackend, MemoryCatalog, init_tracing, native_dhcp_config, test_network, test_port,
    test_subnet,
};
use tempfile::TempDir;

struct Env {
    backend: Arc<FakeBackend>,
    store: Arc<MappingStore>,
    reconciler: DhcpReconciler,
    _dir: TempDir,
}

/// Networks a (new server), b (server already recorded) and c (no DHCP port).
async fn setup() -> Env {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MappingStore::new(dir.path().to_str().unwrap()).await.unwrap());
    let backend = Arc::new(FakeBackend::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let reconciler = DhcpReconciler::new(
        backend.clone(),
        catalog.clone(),
        store.clone(),
        native_dhcp_config(),
        Arc::new(KeyedLocks::new()),
        Arc::new(AuditLogger::new_noop()),
    );

    for (net, cidr) in [("a", "10.0.0.0/24"), ("b", "10.1.0.0/24"), ("c", "10.2.0.0/24")] {
        let network_id = format!("net-{}", net);
        catalog.add_network(test_network(&network_id, net));
        catalog.add_subnet(test_subnet(&format!("s{}", net), &network_id, cidr, true));
        store
            .set_network_mapping(&network_id, &format!("ls-{}", net))
            .await
            .unwrap();
    }
    catalog.add_subnet(test_subnet("s6", "net-a", "fd00::/64", true));

    let ports = [
        test_port(
            "dhcp-a",
            "net-a",
            "network:dhcp",
            "fa:16:3e:00:0a:02",
            &[("sa", "10.0.0.2"), ("sa", "10.0.0.250")],
        ),
        test_port(
            "vm-a1",
            "net-a",
            "compute:nova",
            "fa:16:3e:00:0a:03",
            &[("sa", "10.0.0.3"), ("sa", "10.0.0.4"), ("s6", "fd00::3")],
        ),
        test_port("vm-a2", "net-a", "compute:nova", "fa:16:3e:00:0a:05", &[("sa", "10.0.0.5")]),
        test_port(
            "router-a",
            "net-a",
            "network:router_interface",
            "fa:16:3e:00:0a:01",
            &[("sa", "10.0.0.1")],
        ),
        test_port("dhcp-b", "net-b", "network:dhcp", "fa:16:3e:00:0b:02", &[("sb", "10.1.0.2")]),
        test_port("vm-b", "net-b", "compute:nova", "fa:16:3e:00:0b:03", &[("sb", "10.1.0.3")]),
        test_port("vm-c", "net-c", "compute:nova", "fa:16:3e:00:0c:03", &[("sc", "10.2.0.3")]),
    ];
    for port in ports {
        catalog.add_port(port);
    }

    // Network b already has its server from the per-event path
    let dhcp_b = test_port("dhcp-b", "net-b", "network:dhcp", "fa:16:3e:00:0b:02", &[("sb", "10.1.0.2")]);
    reconciler.port_created(&dhcp_b).await.unwrap();
    backend.clear_calls();

    Env {
        backend,
        store,
        reconciler,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_resync_creates_missing_servers_and_all_bindings() {
    let env = setup().await;

    let report = env.reconciler.resync(None).await.unwrap();
    assert_eq!(
        report,
        ResyncReport {
            servers_created: 1,
            servers_reused: 1,
            servers_failed: 0,
            bindings_created: 4,
            bindings_failed: 0,
        }
    );

    // Only one new server, built from the first address of the DHCP port
    let servers: Vec<_> = env
        .backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CreateDhcpServer(config) => Some(config),
            _ => None,
        })
        .collect();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].server_ip.to_string(), "10.0.0.2/24");

    // Every IPv4 address of every compute port with a server gets a binding
    let mut bound: Vec<Ipv4Addr> = env
        .backend
        .binding_creates()
        .iter()
        .map(|r| r.ip_address)
        .collect();
    bound.sort();
    let expected: Vec<Ipv4Addr> = ["10.0.0.3", "10.0.0.4", "10.0.0.5", "10.1.0.3"]
        .iter()
        .map(|ip| ip.parse().unwrap())
        .collect();
    assert_eq!(bound, expected);

    assert_eq!(env.store.get_dhcp_bindings("vm-a1").await.unwrap().len(), 2);
    assert!(env.store.get_dhcp_bindings("vm-c").await.unwrap().is_empty());
    assert!(env.store.get_dhcp_bindings("router-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resync_binding_failures_are_best_effort() {
    let env = setup().await;
    env.backend.fail_binding_create_for(Ipv4Addr::new(10, 0, 0, 4));

    let report = env.reconciler.resync(None).await.unwrap();
    assert_eq!(report.bindings_created, 3);
    assert_eq!(report.bindings_failed, 1);

    let rows = env.store.get_dhcp_bindings("vm-a1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].ip_address, Ipv4Addr::new(10, 0, 0, 3));
}

#[tokio::test]
async fn test_resync_profile_override() {
    let env = setup().await;
    env.reconciler.resync(Some("profile-override")).await.unwrap();

    let servers = env.backend.dhcp_servers();
    let created = servers
        .iter()
        .find(|(_, config)| config.server_ip.to_string() == "10.0.0.2/24")
        .unwrap();
    assert_eq!(created.1.dhcp_profile_id, "profile-override");
}

#[tokio::test]
async fn test_second_resync_reuses_servers() {
    let env = setup().await;
    env.reconciler.resync(None).await.unwrap();
    env.backend.clear_calls();

    let report = env.reconciler.resync(None).await.unwrap();
    assert_eq!(report.servers_created, 0);
    assert_eq!(report.servers_reused, 2);
    assert!(
        !env.backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CreateDhcpServer(_)))
    );
    // Rows stay one per (port, address) and each points at a live binding
    let rows = env.store.list_dhcp_bindings().await.unwrap();
    assert_eq!(rows.len(), 4);
    let remote = env.backend.bindings();
    assert_eq!(remote.len(), rows.len());
    assert!(rows
        .iter()
        .all(|row| remote.iter().any(|b| b.id == row.nsx_binding_id)));
    assert_eq!(env.backend.binding_deletes().len(), 4);
}
