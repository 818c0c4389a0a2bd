//! Test utilities for nsx-sync unit and integration tests.
//!
//! Provides an in-memory NSX backend that records every call, an in-memory
//! tenant catalog, and builders for the records the reconcilers consume.

pub mod fake_backend;
pub mod memory_catalog;

pub use fake_backend::{Call, FakeBackend, StoredBinding};
pub use memory_catalog::MemoryCatalog;

use crate::config::NsxConfig;
use crate::model::{FixedIp, Network, Port, Subnet};

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Native DHCP enabled with every identifier it needs.
pub fn native_dhcp_config() -> NsxConfig {
    NsxConfig {
        native_dhcp_metadata: true,
        dhcp_agent_notification: false,
        dhcp_profile_uuid: Some("dhcp-profile-1".to_string()),
        metadata_proxy_uuid: Some("md-proxy-1".to_string()),
        ..Default::default()
    }
}

pub fn test_network(id: &str, name: &str) -> Network {
    Network {
        id: id.to_string(),
        name: name.to_string(),
        tenant_id: "tenant-1".to_string(),
    }
}

pub fn test_subnet(id: &str, network_id: &str, cidr: &str, enable_dhcp: bool) -> Subnet {
    let cidr: ipnet::IpNet = cidr.parse().expect("valid cidr");
    Subnet {
        id: id.to_string(),
        network_id: network_id.to_string(),
        gateway_ip: cidr.hosts().next(),
        cidr,
        enable_dhcp,
        dns_nameservers: Vec::new(),
        host_routes: Vec::new(),
    }
}

/// A port with fixed addresses given as `(subnet_id, ip)` pairs.
pub fn test_port(
    id: &str,
    network_id: &str,
    device_owner: &str,
    mac_address: &str,
    fixed_ips: &[(&str, &str)],
) -> Port {
    Port {
        id: id.to_string(),
        network_id: network_id.to_string(),
        name: format!("port-{}", id),
        mac_address: mac_address.to_string(),
        device_owner: device_owner.to_string(),
        fixed_ips: fixed_ips
            .iter()
            .map(|(subnet_id, ip)| FixedIp {
                subnet_id: subnet_id.to_string(),
                ip_address: ip.parse().expect("valid ip"),
            })
            .collect(),
    }
}
