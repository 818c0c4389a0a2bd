//! Contract with the NSX object-access layer.
//!
//! Everything the router and DHCP code needs from the controller goes through
//! [`NsxBackend`]. Lookups whose absence is an expected branch return
//! `Ok(None)` rather than [`BackendError::NotFound`].

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport or server side failure; not distinguished from permanent ones.
    #[error("request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub id: String,
    pub display_name: String,
    pub edge_cluster_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeClusterMember {
    pub member_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCluster {
    pub id: String,
    pub members: Vec<EdgeClusterMember>,
}

/// Logical router port resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterPortType {
    #[serde(rename = "LogicalRouterLinkPort")]
    Link,
    #[serde(rename = "LogicalRouterDownLinkPort")]
    Downlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressGroup {
    pub ip_addresses: Vec<IpAddr>,
    pub prefix_length: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRouterPortRequest {
    pub logical_router_id: String,
    pub display_name: String,
    pub resource_type: RouterPortType,
    /// Downlink: the logical switch port. Tier-1 link: the peer tier-0 link port.
    pub logical_port_id: Option<String>,
    pub address_groups: Option<Vec<AddressGroup>>,
    pub edge_cluster_member_index: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouterPort {
    pub id: String,
    pub logical_router_id: String,
    pub resource_type: RouterPortType,
    pub linked_logical_router_port_id: Option<String>,
    #[serde(default)]
    pub subnets: Vec<AddressGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NatAction {
    Snat,
    Dnat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub action: NatAction,
    pub translated_network: IpAddr,
    pub rule_priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub scope: String,
    pub tag: String,
}

/// Logical switch port attachment kinds used by native DHCP and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentType {
    #[serde(rename = "VIF")]
    Vif,
    #[serde(rename = "DHCP_SERVICE")]
    Dhcp,
    #[serde(rename = "METADATA_PROXY")]
    MetadataProxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLogicalPortRequest {
    pub logical_switch_id: String,
    pub attachment_id: String,
    pub attachment_type: AttachmentType,
    pub display_name: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPort {
    pub id: String,
    pub logical_switch_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub network: IpNet,
    pub next_hop: IpAddr,
}

/// DHCP option 121 (classless static routes).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClasslessStaticRoutes {
    pub static_routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DhcpOptions {
    pub option121: Option<ClasslessStaticRoutes>,
}

impl DhcpOptions {
    pub fn with_static_routes(static_routes: Vec<StaticRoute>) -> Self {
        Self {
            option121: Some(ClasslessStaticRoutes { static_routes }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpServerConfig {
    pub name: String,
    pub dhcp_profile_id: String,
    /// Server address with the subnet prefix length, e.g. `10.0.0.2/24`.
    pub server_ip: IpNet,
    pub dns_nameservers: Vec<IpAddr>,
    pub domain_name: String,
    pub gateway_ip: Option<IpAddr>,
    pub options: DhcpOptions,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpServer {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBindingRequest {
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub host_name: String,
    pub lease_time: u32,
    pub options: DhcpOptions,
}

/// Fields of an existing static binding to change; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindingUpdate {
    pub mac_address: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    pub host_name: Option<String>,
    pub options: Option<DhcpOptions>,
}

impl BindingUpdate {
    pub fn is_empty(&self) -> bool {
        self.mac_address.is_none()
            && self.ip_address.is_none()
            && self.host_name.is_none()
            && self.options.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpStaticBinding {
    pub id: String,
}

/// CRUD primitives against the controller's routers, ports and DHCP servers.
#[async_trait]
pub trait NsxBackend: Send + Sync {
    // === Logical routers ===

    async fn get_logical_router(&self, router_id: &str) -> Result<Option<LogicalRouter>>;

    async fn update_logical_router(&self, router_id: &str, edge_cluster_id: &str) -> Result<()>;

    async fn get_edge_cluster(&self, edge_cluster_id: &str) -> Result<Option<EdgeCluster>>;

    async fn update_logical_router_advertisement(
        &self,
        router_id: &str,
        advertise_nat_routes: bool,
        advertise_connected_routes: bool,
    ) -> Result<()>;

    async fn add_nat_rule(&self, router_id: &str, rule: &NatRule) -> Result<()>;

    /// Remove every NAT rule of the router whose translated network matches.
    async fn delete_nat_rule_by_values(
        &self,
        router_id: &str,
        translated_network: IpAddr,
    ) -> Result<()>;

    // === Logical router ports ===

    async fn create_logical_router_port(
        &self,
        req: &CreateRouterPortRequest,
    ) -> Result<LogicalRouterPort>;

    async fn get_logical_router_port_by_ls_id(
        &self,
        logical_switch_id: &str,
    ) -> Result<Option<LogicalRouterPort>>;

    async fn get_tier1_logical_router_link_port(
        &self,
        tier1_id: &str,
    ) -> Result<Option<LogicalRouterPort>>;

    async fn update_logical_router_port(
        &self,
        port_id: &str,
        subnets: &[AddressGroup],
    ) -> Result<LogicalRouterPort>;

    async fn delete_logical_router_port(&self, port_id: &str) -> Result<()>;

    // === Logical switch ports ===

    async fn create_logical_port(&self, req: &CreateLogicalPortRequest) -> Result<LogicalPort>;

    async fn update_logical_port_attachment(
        &self,
        port_id: &str,
        attachment_id: &str,
        attachment_type: AttachmentType,
    ) -> Result<()>;

    // === DHCP servers ===

    async fn create_dhcp_server(&self, config: &DhcpServerConfig) -> Result<DhcpServer>;

    async fn update_dhcp_server_ip(&self, server_id: &str, server_ip: IpAddr) -> Result<()>;

    async fn delete_dhcp_server(&self, server_id: &str) -> Result<()>;

    async fn create_binding(
        &self,
        server_id: &str,
        req: &CreateBindingRequest,
    ) -> Result<DhcpStaticBinding>;

    async fn update_binding(
        &self,
        server_id: &str,
        binding_id: &str,
        update: &BindingUpdate,
    ) -> Result<()>;

    async fn delete_binding(&self, server_id: &str, binding_id: &str) -> Result<()>;
}
