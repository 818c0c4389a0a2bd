//! In-process [`NsxBackend`] that keeps objects in memory and records every call.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::backend::{
    AddressGroup, AttachmentType, BackendError, BindingUpdate, CreateBindingRequest,
    CreateLogicalPortRequest, CreateRouterPortRequest, DhcpServer, DhcpServerConfig,
    DhcpStaticBinding, EdgeCluster, LogicalPort, LogicalRouter, LogicalRouterPort, NatRule,
    NsxBackend, Result, RouterPortType,
};

/// A backend call as issued by the code under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetRouter {
        router_id: String,
    },
    UpdateRouter {
        router_id: String,
        edge_cluster_id: String,
    },
    GetEdgeCluster {
        edge_cluster_id: String,
    },
    UpdateAdvertisement {
        router_id: String,
        advertise_nat_routes: bool,
        advertise_connected_routes: bool,
    },
    AddNatRule {
        router_id: String,
        rule: NatRule,
    },
    DeleteNatRule {
        router_id: String,
        translated_network: IpAddr,
    },
    CreateRouterPort(CreateRouterPortRequest),
    GetRouterPortByLs {
        logical_switch_id: String,
    },
    GetTier1LinkPort {
        tier1_id: String,
    },
    UpdateRouterPort {
        port_id: String,
        subnets: Vec<AddressGroup>,
    },
    DeleteRouterPort {
        port_id: String,
    },
    CreateLogicalPort(CreateLogicalPortRequest),
    UpdatePortAttachment {
        port_id: String,
        attachment_id: String,
        attachment_type: AttachmentType,
    },
    CreateDhcpServer(DhcpServerConfig),
    UpdateDhcpServerIp {
        server_id: String,
        server_ip: IpAddr,
    },
    DeleteDhcpServer {
        server_id: String,
    },
    CreateBinding {
        server_id: String,
        req: CreateBindingRequest,
    },
    UpdateBinding {
        server_id: String,
        binding_id: String,
        update: BindingUpdate,
    },
    DeleteBinding {
        server_id: String,
        binding_id: String,
    },
}

/// A static binding held by a fake DHCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBinding {
    pub id: String,
    pub server_id: String,
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub host_name: String,
}

struct RouterPortEntry {
    port: LogicalRouterPort,
    logical_switch_id: Option<String>,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    routers: HashMap<String, LogicalRouter>,
    edge_clusters: HashMap<String, EdgeCluster>,
    router_ports: Vec<RouterPortEntry>,
    nat_rules: HashMap<String, Vec<NatRule>>,
    switch_ports: HashMap<String, String>,
    dhcp_servers: Vec<(String, DhcpServerConfig)>,
    bindings: Vec<StoredBinding>,
    failing_router_port_creates: HashSet<String>,
    failing_binding_ips: HashSet<Ipv4Addr>,
    failing_server_deletes: bool,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().as_simple())
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_call(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn record(&self, call: Call) -> MutexGuard<'_, State> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    // === Setup ===

    pub fn add_router(&self, router: LogicalRouter) {
        self.state().routers.insert(router.id.clone(), router);
    }

    pub fn add_edge_cluster(&self, cluster: EdgeCluster) {
        self.state()
            .edge_clusters
            .insert(cluster.id.clone(), cluster);
    }

    /// Declare that a logical switch port lives on a logical switch.
    pub fn add_switch_port(&self, logical_switch_id: &str, logical_port_id: &str) {
        self.state()
            .switch_ports
            .insert(logical_port_id.to_string(), logical_switch_id.to_string());
    }

    /// Make router port creates on `router_id` fail after being recorded.
    pub fn fail_router_port_create_for(&self, router_id: &str) {
        self.state()
            .failing_router_port_creates
            .insert(router_id.to_string());
    }

    /// Make binding creates for `ip` fail after being recorded.
    pub fn fail_binding_create_for(&self, ip: Ipv4Addr) {
        self.state().failing_binding_ips.insert(ip);
    }

    /// Make every DHCP server delete fail after being recorded.
    pub fn fail_dhcp_server_deletes(&self) {
        self.state().failing_server_deletes = true;
    }

    // === Inspection ===

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn router_port_creates(&self) -> Vec<CreateRouterPortRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateRouterPort(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn router_ports(&self) -> Vec<LogicalRouterPort> {
        self.state()
            .router_ports
            .iter()
            .map(|e| e.port.clone())
            .collect()
    }

    pub fn nat_rules(&self, router_id: &str) -> Vec<NatRule> {
        self.state()
            .nat_rules
            .get(router_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dhcp_servers(&self) -> Vec<(String, DhcpServerConfig)> {
        self.state().dhcp_servers.clone()
    }

    pub fn bindings(&self) -> Vec<StoredBinding> {
        self.state().bindings.clone()
    }

    pub fn binding_creates(&self) -> Vec<CreateBindingRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::CreateBinding { req, .. } => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn binding_updates(&self) -> Vec<BindingUpdate> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::UpdateBinding { update, .. } => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids of the bindings a delete was issued for.
    pub fn binding_deletes(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::DeleteBinding { binding_id, .. } => Some(binding_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of binding create/update/delete calls issued.
    pub fn binding_call_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::CreateBinding { .. }
                        | Call::UpdateBinding { .. }
                        | Call::DeleteBinding { .. }
                )
            })
            .count()
    }
}

#[async_trait]
impl NsxBackend for FakeBackend {
    async fn get_logical_router(&self, router_id: &str) -> Result<Option<LogicalRouter>> {
        let state = self.record(Call::GetRouter {
            router_id: router_id.to_string(),
        });
        Ok(state.routers.get(router_id).cloned())
    }

    async fn update_logical_router(&self, router_id: &str, edge_cluster_id: &str) -> Result<()> {
        let mut state = self.record(Call::UpdateRouter {
            router_id: router_id.to_string(),
            edge_cluster_id: edge_cluster_id.to_string(),
        });
        if let Some(router) = state.routers.get_mut(router_id) {
            router.edge_cluster_id = Some(edge_cluster_id.to_string());
        }
        Ok(())
    }

    async fn get_edge_cluster(&self, edge_cluster_id: &str) -> Result<Option<EdgeCluster>> {
        let state = self.record(Call::GetEdgeCluster {
            edge_cluster_id: edge_cluster_id.to_string(),
        });
        Ok(state.edge_clusters.get(edge_cluster_id).cloned())
    }

    async fn update_logical_router_advertisement(
        &self,
        router_id: &str,
        advertise_nat_routes: bool,
        advertise_connected_routes: bool,
    ) -> Result<()> {
        self.push_call(Call::UpdateAdvertisement {
            router_id: router_id.to_string(),
            advertise_nat_routes,
            advertise_connected_routes,
        });
        Ok(())
    }

    async fn add_nat_rule(&self, router_id: &str, rule: &NatRule) -> Result<()> {
        let mut state = self.record(Call::AddNatRule {
            router_id: router_id.to_string(),
            rule: rule.clone(),
        });
        state
            .nat_rules
            .entry(router_id.to_string())
            .or_default()
            .push(rule.clone());
        Ok(())
    }

    async fn delete_nat_rule_by_values(
        &self,
        router_id: &str,
        translated_network: IpAddr,
    ) -> Result<()> {
        let mut state = self.record(Call::DeleteNatRule {
            router_id: router_id.to_string(),
            translated_network,
        });
        if let Some(rules) = state.nat_rules.get_mut(router_id) {
            rules.retain(|r| r.translated_network != translated_network);
        }
        Ok(())
    }

    async fn create_logical_router_port(
        &self,
        req: &CreateRouterPortRequest,
    ) -> Result<LogicalRouterPort> {
        let mut state = self.record(Call::CreateRouterPort(req.clone()));
        if state
            .failing_router_port_creates
            .contains(&req.logical_router_id)
        {
            return Err(BackendError::Request(format!(
                "injected failure creating port on {}",
                req.logical_router_id
            )));
        }

        let port = LogicalRouterPort {
            id: new_id("lrp"),
            logical_router_id: req.logical_router_id.clone(),
            resource_type: req.resource_type,
            linked_logical_router_port_id: match req.resource_type {
                RouterPortType::Link => req.logical_port_id.clone(),
                RouterPortType::Downlink => None,
            },
            subnets: req.address_groups.clone().unwrap_or_default(),
        };

        // Link the peer back to the new tier-1 port
        if let (RouterPortType::Link, Some(peer_id)) = (req.resource_type, &req.logical_port_id) {
            if let Some(peer) = state.router_ports.iter_mut().find(|e| &e.port.id == peer_id) {
                peer.port.linked_logical_router_port_id = Some(port.id.clone());
            }
        }

        let logical_switch_id = match req.resource_type {
            RouterPortType::Downlink => req
                .logical_port_id
                .as_ref()
                .and_then(|lsp| state.switch_ports.get(lsp).cloned()),
            RouterPortType::Link => None,
        };
        state.router_ports.push(RouterPortEntry {
            port: port.clone(),
            logical_switch_id,
        });
        Ok(port)
    }

    async fn get_logical_router_port_by_ls_id(
        &self,
        logical_switch_id: &str,
    ) -> Result<Option<LogicalRouterPort>> {
        let state = self.record(Call::GetRouterPortByLs {
            logical_switch_id: logical_switch_id.to_string(),
        });
        Ok(state
            .router_ports
            .iter()
            .find(|e| e.logical_switch_id.as_deref() == Some(logical_switch_id))
            .map(|e| e.port.clone()))
    }

    async fn get_tier1_logical_router_link_port(
        &self,
        tier1_id: &str,
    ) -> Result<Option<LogicalRouterPort>> {
        let state = self.record(Call::GetTier1LinkPort {
            tier1_id: tier1_id.to_string(),
        });
        Ok(state
            .router_ports
            .iter()
            .find(|e| {
                e.port.logical_router_id == tier1_id && e.port.resource_type == RouterPortType::Link
            })
            .map(|e| e.port.clone()))
    }

    async fn update_logical_router_port(
        &self,
        port_id: &str,
        subnets: &[AddressGroup],
    ) -> Result<LogicalRouterPort> {
        let mut state = self.record(Call::UpdateRouterPort {
            port_id: port_id.to_string(),
            subnets: subnets.to_vec(),
        });
        let Some(entry) = state.router_ports.iter_mut().find(|e| e.port.id == port_id) else {
            return Err(BackendError::NotFound(format!("router port {}", port_id)));
        };
        entry.port.subnets = subnets.to_vec();
        Ok(entry.port.clone())
    }

    async fn delete_logical_router_port(&self, port_id: &str) -> Result<()> {
        let mut state = self.record(Call::DeleteRouterPort {
            port_id: port_id.to_string(),
        });
        let before = state.router_ports.len();
        state.router_ports.retain(|e| e.port.id != port_id);
        if state.router_ports.len() == before {
            return Err(BackendError::NotFound(format!("router port {}", port_id)));
        }
        Ok(())
    }

    async fn create_logical_port(&self, req: &CreateLogicalPortRequest) -> Result<LogicalPort> {
        let mut state = self.record(Call::CreateLogicalPort(req.clone()));
        let port = LogicalPort {
            id: new_id("lp"),
            logical_switch_id: req.logical_switch_id.clone(),
        };
        state
            .switch_ports
            .insert(port.id.clone(), port.logical_switch_id.clone());
        Ok(port)
    }

    async fn update_logical_port_attachment(
        &self,
        port_id: &str,
        attachment_id: &str,
        attachment_type: AttachmentType,
    ) -> Result<()> {
        self.push_call(Call::UpdatePortAttachment {
            port_id: port_id.to_string(),
            attachment_id: attachment_id.to_string(),
            attachment_type,
        });
        Ok(())
    }

    async fn create_dhcp_server(&self, config: &DhcpServerConfig) -> Result<DhcpServer> {
        let mut state = self.record(Call::CreateDhcpServer(config.clone()));
        let server = DhcpServer {
            id: new_id("dhcp"),
        };
        state.dhcp_servers.push((server.id.clone(), config.clone()));
        Ok(server)
    }

    async fn update_dhcp_server_ip(&self, server_id: &str, server_ip: IpAddr) -> Result<()> {
        let mut state = self.record(Call::UpdateDhcpServerIp {
            server_id: server_id.to_string(),
            server_ip,
        });
        let Some((_, config)) = state.dhcp_servers.iter_mut().find(|(id, _)| id == server_id)
        else {
            return Err(BackendError::NotFound(format!("DHCP server {}", server_id)));
        };
        let prefix_len = config.server_ip.prefix_len();
        if let Ok(net) = ipnet::IpNet::new(server_ip, prefix_len) {
            config.server_ip = net;
        }
        Ok(())
    }

    async fn delete_dhcp_server(&self, server_id: &str) -> Result<()> {
        let mut state = self.record(Call::DeleteDhcpServer {
            server_id: server_id.to_string(),
        });
        if state.failing_server_deletes {
            return Err(BackendError::Request(format!(
                "injected failure deleting DHCP server {}",
                server_id
            )));
        }
        let before = state.dhcp_servers.len();
        state.dhcp_servers.retain(|(id, _)| id != server_id);
        if state.dhcp_servers.len() == before {
            return Err(BackendError::NotFound(format!("DHCP server {}", server_id)));
        }
        state.bindings.retain(|b| b.server_id != server_id);
        Ok(())
    }

    async fn create_binding(
        &self,
        server_id: &str,
        req: &CreateBindingRequest,
    ) -> Result<DhcpStaticBinding> {
        let mut state = self.record(Call::CreateBinding {
            server_id: server_id.to_string(),
            req: req.clone(),
        });
        if state.failing_binding_ips.contains(&req.ip_address) {
            return Err(BackendError::Request(format!(
                "injected failure binding {}",
                req.ip_address
            )));
        }
        if !state.dhcp_servers.iter().any(|(id, _)| id == server_id) {
            return Err(BackendError::NotFound(format!("DHCP server {}", server_id)));
        }

        let binding = StoredBinding {
            id: new_id("binding"),
            server_id: server_id.to_string(),
            mac_address: req.mac_address.clone(),
            ip_address: req.ip_address,
            host_name: req.host_name.clone(),
        };
        let id = binding.id.clone();
        state.bindings.push(binding);
        Ok(DhcpStaticBinding { id })
    }

    async fn update_binding(
        &self,
        server_id: &str,
        binding_id: &str,
        update: &BindingUpdate,
    ) -> Result<()> {
        let mut state = self.record(Call::UpdateBinding {
            server_id: server_id.to_string(),
            binding_id: binding_id.to_string(),
            update: update.clone(),
        });
        let Some(binding) = state
            .bindings
            .iter_mut()
            .find(|b| b.server_id == server_id && b.id == binding_id)
        else {
            return Err(BackendError::NotFound(format!("binding {}", binding_id)));
        };
        if let Some(mac) = &update.mac_address {
            binding.mac_address = mac.clone();
        }
        if let Some(ip) = update.ip_address {
            binding.ip_address = ip;
        }
        if let Some(host_name) = &update.host_name {
            binding.host_name = host_name.clone();
        }
        Ok(())
    }

    async fn delete_binding(&self, server_id: &str, binding_id: &str) -> Result<()> {
        let mut state = self.record(Call::DeleteBinding {
            server_id: server_id.to_string(),
            binding_id: binding_id.to_string(),
        });
        let before = state.bindings.len();
        state
            .bindings
            .retain(|b| !(b.server_id == server_id && b.id == binding_id));
        if state.bindings.len() == before {
            return Err(BackendError::NotFound(format!("binding {}", binding_id)));
        }
        Ok(())
    }
}
