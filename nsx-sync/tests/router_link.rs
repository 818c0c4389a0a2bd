//! Router linking, gateway and interface tests against the fake backend.
//!
//! Covers tier-0 validation caching, link port pair lifecycle and the
//! switch-keyed idempotency of router downlink ports.

use std::sync::Arc;

use nsx_sync::Error;
use nsx_sync::audit::AuditLogger;
use nsx_sync::backend::{AddressGroup, EdgeCluster, EdgeClusterMember, LogicalRouter};
use nsx_sync::router::{
    GatewayConfigurator, InterfaceManager, MIN_EDGE_NODE_NUM, RouterLinker, Tier0Cache,
};
use nsx_sync::test_util::{Call, FakeBackend, init_tracing};

fn provider_router(backend: &FakeBackend, tier0_id: &str, members: &[u32]) {
    let edge_cluster_id = format!("{}-cluster", tier0_id);
    backend.add_router(LogicalRouter {
        id: tier0_id.to_string(),
        display_name: "provider".to_string(),
        edge_cluster_id: Some(edge_cluster_id.clone()),
    });
    backend.add_edge_cluster(EdgeCluster {
        id: edge_cluster_id,
        members: members
            .iter()
            .map(|&member_index| EdgeClusterMember { member_index })
            .collect(),
    });
}

fn linker(backend: &Arc<FakeBackend>) -> RouterLinker {
    RouterLinker::new(backend.clone(), Arc::new(AuditLogger::new_noop()))
}

/// Second validation of the same tier-0 router is served without backend fetches.
#[tokio::test]
async fn test_tier0_validation_is_memoized() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    provider_router(&backend, "t0-a", &[0, 1, 2]);
    provider_router(&backend, "t0-b", &[4]);
    let linker = linker(&backend);
    let cache = Tier0Cache::new();

    for tier0_id in ["t0-a", "t0-b"] {
        linker.validate_tier0(&cache, tier0_id).await.unwrap();
        let fetched = backend.calls().len();
        linker.validate_tier0(&cache, tier0_id).await.unwrap();
        assert_eq!(backend.calls().len(), fetched, "cache miss for {}", tier0_id);
    }
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_tier0_member_minimum() {
    let backend = Arc::new(FakeBackend::new());
    provider_router(&backend, "empty", &[]);
    provider_router(&backend, "minimal", &[9]);
    let linker = linker(&backend);
    let cache = Tier0Cache::new();

    let err = linker.validate_tier0(&cache, "empty").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let ok = linker.validate_tier0(&cache, "minimal").await.unwrap();
    assert_eq!(ok.member_index_list, vec![9]);
    assert_eq!(ok.member_index_list.len(), MIN_EDGE_NODE_NUM);
}

/// Linking then unlinking leaves no router ports behind; unlinking again is a no-op.
#[tokio::test]
async fn test_link_unlink_cycle() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    provider_router(&backend, "t0", &[0, 1]);
    let linker = linker(&backend);
    let cache = Tier0Cache::new();

    let pair = linker.link_tier1_to_tier0(&cache, "t1", "t0").await.unwrap();
    assert_eq!(backend.router_ports().len(), 2);
    assert_eq!(
        pair.tier1_port.linked_logical_router_port_id.as_deref(),
        Some(pair.tier0_port.id.as_str())
    );

    linker.remove_router_link_port("t1", "t0").await.unwrap();
    assert!(backend.router_ports().is_empty());

    backend.clear_calls();
    linker.remove_router_link_port("t1", "t0").await.unwrap();
    assert!(
        !backend
            .calls()
            .iter()
            .any(|c| matches!(c, Call::DeleteRouterPort { .. }))
    );
}

#[tokio::test]
async fn test_failed_tier1_port_leaves_no_orphan() {
    let backend = Arc::new(FakeBackend::new());
    provider_router(&backend, "t0", &[0]);
    backend.fail_router_port_create_for("t1");
    let cache = Tier0Cache::new();

    let err = linker(&backend)
        .link_tier1_to_tier0(&cache, "t1", "t0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert!(backend.router_ports().is_empty());
}

/// Same logical switch twice: one create, one update.
#[tokio::test]
async fn test_interface_port_keyed_by_switch() {
    let backend = Arc::new(FakeBackend::new());
    backend.add_switch_port("ls-web", "lsp-web");
    let manager = InterfaceManager::new(backend.clone(), Arc::new(AuditLogger::new_noop()));

    let first = vec![AddressGroup {
        ip_addresses: vec!["10.0.0.1".parse().unwrap()],
        prefix_length: 24,
    }];
    let second = vec![AddressGroup {
        ip_addresses: vec!["10.0.0.1".parse().unwrap(), "10.0.5.1".parse().unwrap()],
        prefix_length: 24,
    }];

    manager
        .create_or_update_interface("t1", "ls-web", "lsp-web", &first)
        .await
        .unwrap();
    let port = manager
        .create_or_update_interface("t1", "ls-web", "lsp-web", &second)
        .await
        .unwrap();

    assert_eq!(port.subnets, second);
    assert_eq!(backend.router_port_creates().len(), 1);
    let updates = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::UpdateRouterPort { .. }))
        .count();
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn test_gateway_setup_and_teardown() {
    let backend = Arc::new(FakeBackend::new());
    let gateway = GatewayConfigurator::new(backend.clone(), Arc::new(AuditLogger::new_noop()));
    let gw_ip = "172.24.4.7".parse().unwrap();

    gateway.update_advertisement("t1", true, true).await.unwrap();
    gateway.add_gw_snat_rule("t1", gw_ip).await.unwrap();
    assert_eq!(backend.nat_rules("t1").len(), 1);

    gateway.delete_gw_snat_rule("t1", gw_ip).await.unwrap();
    gateway.update_advertisement("t1", false, false).await.unwrap();
    assert!(backend.nat_rules("t1").is_empty());
}
