//! Downlink ports between tenant routers and tenant subnets.

use std::sync::Arc;

use tracing::{debug, info};

use crate::audit::AuditLogger;
use crate::backend::{
    AddressGroup, CreateRouterPortRequest, LogicalRouterPort, NsxBackend, RouterPortType,
};
use crate::error::Result;

pub const ROUTER_INTF_PORT_NAME: &str = "Tier1-RouterDownLinkPort";

pub struct InterfaceManager {
    backend: Arc<dyn NsxBackend>,
    audit: Arc<AuditLogger>,
}

impl InterfaceManager {
    pub fn new(backend: Arc<dyn NsxBackend>, audit: Arc<AuditLogger>) -> Self {
        Self { backend, audit }
    }

    /// Create the router's downlink port on a logical switch, or update its subnets.
    ///
    /// The logical switch identifies the port, so repeated calls converge on a
    /// single port carrying the latest `address_groups`.
    pub async fn create_or_update_interface(
        &self,
        router_id: &str,
        logical_switch_id: &str,
        logical_switch_port_id: &str,
        address_groups: &[AddressGroup],
    ) -> Result<LogicalRouterPort> {
        if let Some(port) = self
            .backend
            .get_logical_router_port_by_ls_id(logical_switch_id)
            .await?
        {
            debug!(
                router_id,
                logical_switch_id,
                port_id = %port.id,
                "Downlink port exists, updating subnets"
            );
            return Ok(self
                .backend
                .update_logical_router_port(&port.id, address_groups)
                .await?);
        }

        let port = self
            .backend
            .create_logical_router_port(&CreateRouterPortRequest {
                logical_router_id: router_id.to_string(),
                display_name: ROUTER_INTF_PORT_NAME.to_string(),
                resource_type: RouterPortType::Downlink,
                logical_port_id: Some(logical_switch_port_id.to_string()),
                address_groups: Some(address_groups.to_vec()),
                edge_cluster_member_index: None,
            })
            .await?;

        info!(
            router_id,
            logical_switch_id,
            port_id = %port.id,
            "Created router downlink port"
        );
        self.audit
            .interface_port_created(router_id, logical_switch_id, &port.id);
        Ok(port)
    }
}
