//! Audit trail of backend objects created and removed on behalf of tenants.
//!
//! Events go out as `tracing` events on the `audit` target, tagged with the
//! ids of every object involved, so any subscriber can route them separately.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Audit,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Audit => "audit",
        }
    }
}

/// Audit logger with domain-specific methods.
pub struct AuditLogger {
    component: &'static str,
    enabled: bool,
}

impl AuditLogger {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: "noop",
            enabled: false,
        }
    }

    fn log(&self, level: LogLevel, message: String, object_ids: &[&str]) {
        if !self.enabled {
            return;
        }
        info!(
            target: "audit",
            component = self.component,
            level = level.as_str(),
            objects = %object_ids.join(","),
            "{}",
            message
        );
    }

    // === Router Events ===

    pub fn link_ports_created(&self, tier1_id: &str, tier0_id: &str, tier1_port_id: &str) {
        self.log(
            LogLevel::Audit,
            "Router link port pair created".to_string(),
            &[tier1_id, tier0_id, tier1_port_id],
        );
    }

    pub fn link_ports_removed(&self, tier1_id: &str, tier0_id: &str) {
        self.log(
            LogLevel::Audit,
            "Router link port pair removed".to_string(),
            &[tier1_id, tier0_id],
        );
    }

    pub fn snat_rule_added(&self, router_id: &str, gw_ip: IpAddr) {
        self.log(
            LogLevel::Info,
            format!("Gateway SNAT rule to {} added", gw_ip),
            &[router_id],
        );
    }

    pub fn snat_rule_removed(&self, router_id: &str, gw_ip: IpAddr) {
        self.log(
            LogLevel::Info,
            format!("Gateway SNAT rule to {} removed", gw_ip),
            &[router_id],
        );
    }

    pub fn interface_port_created(&self, router_id: &str, switch_id: &str, port_id: &str) {
        self.log(
            LogLevel::Audit,
            "Router downlink port created".to_string(),
            &[router_id, switch_id, port_id],
        );
    }

    // === DHCP Events ===

    pub fn dhcp_server_created(&self, network_id: &str, server_id: &str) {
        self.log(
            LogLevel::Audit,
            "Logical DHCP server created".to_string(),
            &[network_id, server_id],
        );
    }

    pub fn dhcp_server_deleted(&self, network_id: &str, server_id: &str) {
        self.log(
            LogLevel::Audit,
            "Logical DHCP server deleted".to_string(),
            &[network_id, server_id],
        );
    }

    pub fn binding_created(&self, port_id: &str, mac: &str, ip: &str) {
        self.log(
            LogLevel::Info,
            format!("DHCP binding created: MAC={}, IP={}", mac, ip),
            &[port_id],
        );
    }

    pub fn binding_updated(&self, port_id: &str, binding_id: &str) {
        self.log(
            LogLevel::Info,
            "DHCP binding updated".to_string(),
            &[port_id, binding_id],
        );
    }

    pub fn binding_deleted(&self, port_id: &str, binding_id: &str) {
        self.log(
            LogLevel::Info,
            "DHCP binding deleted".to_string(),
            &[port_id, binding_id],
        );
    }

    pub fn metadata_proxy_attached(&self, network_id: &str, port_id: &str) {
        self.log(
            LogLevel::Audit,
            "Metadata proxy port created".to_string(),
            &[network_id, port_id],
        );
    }

    pub fn resync_finished(&self, servers: usize, bindings: usize, failed: usize) {
        self.log(
            LogLevel::Audit,
            format!(
                "DHCP resync finished: {} servers, {} bindings, {} failed",
                servers, bindings, failed
            ),
            &[],
        );
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(component: &'static str) -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new(component))
}
