//! Per-event DHCP and metadata reconciliation.
//!
//! Handlers lock the network before the port, so a DHCP service teardown
//! never interleaves with binding changes of a port on the same network.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::binding::{BindingAction, BindingTemplate, DesiredBinding, desired_bindings, plan_port};
use super::server::{build_dhcp_server_config, dhcp_port_ipv4, network_tags};
use crate::audit::AuditLogger;
use crate::backend::{
    AttachmentType, BackendError, CreateLogicalPortRequest, LogicalPort, NsxBackend,
};
use crate::catalog::NetworkCatalog;
use crate::config::NsxConfig;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::model::{FixedIp, Network, Port, PortRole, Subnet, name_and_uuid};
use crate::store::{DhcpBinding, DhcpServiceBinding, MappingStore};

/// A compute port with its persisted bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindings {
    pub port_id: String,
    pub mac_address: String,
    pub fixed_ips: Vec<FixedIp>,
    pub bindings: Vec<DhcpBinding>,
}

/// Keeps backend DHCP servers and static bindings in step with tenant events.
pub struct DhcpReconciler {
    pub(super) backend: Arc<dyn NsxBackend>,
    pub(super) catalog: Arc<dyn NetworkCatalog>,
    pub(super) store: Arc<MappingStore>,
    pub(super) config: NsxConfig,
    pub(super) locks: Arc<KeyedLocks>,
    pub(super) audit: Arc<AuditLogger>,
}

impl DhcpReconciler {
    pub fn new(
        backend: Arc<dyn NsxBackend>,
        catalog: Arc<dyn NetworkCatalog>,
        store: Arc<MappingStore>,
        config: NsxConfig,
        locks: Arc<KeyedLocks>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            backend,
            catalog,
            store,
            config,
            locks,
            audit,
        }
    }

    pub fn config(&self) -> &NsxConfig {
        &self.config
    }

    fn enabled(&self) -> bool {
        self.config.native_dhcp_metadata
    }

    // === Networks ===

    /// Attach the metadata proxy to a new network's logical switch.
    pub async fn network_created(&self, network: &Network) -> Result<Option<LogicalPort>> {
        if !self.enabled() {
            return Ok(None);
        }
        let metadata_proxy = self.config.metadata_proxy()?;
        let _guard = self.locks.lock_network(&network.id).await;

        let Some(switch_id) = self.store.get_switch_id(&network.id).await? else {
            return Err(Error::NotFound(format!(
                "logical switch for network {}",
                network.id
            )));
        };

        let name = if network.name.is_empty() {
            "network"
        } else {
            network.name.as_str()
        };
        let port = self
            .backend
            .create_logical_port(&CreateLogicalPortRequest {
                logical_switch_id: switch_id,
                attachment_id: metadata_proxy.to_string(),
                attachment_type: AttachmentType::MetadataProxy,
                display_name: name_and_uuid(&format!("mdproxy-{}", name), &network.id),
                tags: network_tags(network, &self.config.project_name),
            })
            .await?;

        info!(
            network_id = %network.id,
            port_id = %port.id,
            "Created metadata proxy port"
        );
        self.audit.metadata_proxy_attached(&network.id, &port.id);
        Ok(Some(port))
    }

    pub async fn network_deleted(&self, network_id: &str) -> Result<()> {
        let _guard = self.locks.lock_network(network_id).await;
        self.teardown_dhcp_service(network_id, None).await?;
        Ok(())
    }

    // === Subnets ===

    pub async fn subnet_created(&self, subnet: &Subnet) -> Result<()> {
        if !serves_dhcp(subnet) {
            return Ok(());
        }
        let _guard = self.locks.lock_network(&subnet.network_id).await;
        self.ensure_single_dhcp_subnet(subnet).await
    }

    pub async fn subnet_updated(&self, old: &Subnet, new: &Subnet) -> Result<()> {
        let _guard = self.locks.lock_network(&new.network_id).await;
        match (serves_dhcp(old), serves_dhcp(new)) {
            (false, true) => self.ensure_single_dhcp_subnet(new).await,
            (true, false) => {
                self.teardown_dhcp_service(&new.network_id, None).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn subnet_deleted(&self, subnet: &Subnet) -> Result<()> {
        if !serves_dhcp(subnet) {
            return Ok(());
        }
        let _guard = self.locks.lock_network(&subnet.network_id).await;
        self.teardown_dhcp_service(&subnet.network_id, None).await?;
        Ok(())
    }

    /// Under native DHCP a network carries at most one DHCP-enabled subnet.
    async fn ensure_single_dhcp_subnet(&self, subnet: &Subnet) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let existing = self
            .catalog
            .list_subnets(&subnet.network_id)
            .await?
            .into_iter()
            .find(|s| s.id != subnet.id && serves_dhcp(s));

        if let Some(existing) = existing {
            return Err(Error::InvalidInput(format!(
                "Can not enable DHCP on subnet {} because network {} already has \
                 DHCP-enabled subnet {}",
                subnet.id, subnet.network_id, existing.id
            )));
        }
        Ok(())
    }

    // === Ports ===

    pub async fn port_created(&self, port: &Port) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let _net = self.locks.lock_network(&port.network_id).await;
        let _port = self.locks.lock_port(&port.id).await;

        match port.role() {
            PortRole::Dhcp => {
                self.create_dhcp_service_for_port(port).await?;
            }
            PortRole::Compute => self.reconcile_port(port, &[]).await?,
            PortRole::Other => {}
        }
        Ok(())
    }

    pub async fn port_updated(&self, old: &Port, new: &Port) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        if old.mac_address == new.mac_address
            && old.device_owner == new.device_owner
            && old.fixed_ips == new.fixed_ips
        {
            debug!(port_id = %new.id, "No address change, bindings untouched");
            return Ok(());
        }

        let _net = self.locks.lock_network(&new.network_id).await;
        let _port = self.locks.lock_port(&new.id).await;

        // A delete that won the lock has already cleaned up
        if self.catalog.get_port(&new.id).await?.is_none() {
            debug!(port_id = %new.id, "Port no longer exists, update dropped");
            return Ok(());
        }

        if old.role() == PortRole::Dhcp && new.role() != PortRole::Dhcp {
            self.teardown_dhcp_service(&old.network_id, Some(&old.id))
                .await?;
        }

        let current = self.store.get_dhcp_bindings(&new.id).await?;
        self.reconcile_port(new, &current).await?;

        if new.role() == PortRole::Dhcp {
            if old.role() == PortRole::Dhcp {
                self.update_dhcp_server_ip(old, new).await?;
            } else {
                self.create_dhcp_service_for_port(new).await?;
            }
        }
        Ok(())
    }

    pub async fn port_deleted(&self, port: &Port) -> Result<()> {
        let _net = self.locks.lock_network(&port.network_id).await;
        let _port = self.locks.lock_port(&port.id).await;

        for binding in self.store.get_dhcp_bindings(&port.id).await? {
            self.apply(&port.id, BindingAction::Delete(binding), None)
                .await?;
        }

        if port.role() == PortRole::Dhcp {
            self.teardown_dhcp_service(&port.network_id, Some(&port.id))
                .await?;
        }
        Ok(())
    }

    /// Every compute port with its fixed addresses and persisted bindings.
    pub async fn list_compute_port_bindings(&self) -> Result<Vec<PortBindings>> {
        let mut out = Vec::new();
        for port in self.catalog.list_ports().await? {
            if !port.is_compute() {
                continue;
            }
            let bindings = self.store.get_dhcp_bindings(&port.id).await?;
            out.push(PortBindings {
                port_id: port.id,
                mac_address: port.mac_address,
                fixed_ips: port.fixed_ips,
                bindings,
            });
        }
        Ok(out)
    }

    // === Internals ===

    /// Converge `current` bindings on the addresses `port` should have bound.
    async fn reconcile_port(&self, port: &Port, current: &[DhcpBinding]) -> Result<()> {
        let desired = if port.is_compute() {
            let dhcp_subnets = self.dhcp_subnet_ids(&port.network_id).await?;
            desired_bindings(port, &dhcp_subnets)
        } else {
            Vec::new()
        };

        let template = BindingTemplate::from(&self.config);
        let actions = plan_port(current, &desired, &template);
        if actions.is_empty() {
            return Ok(());
        }

        let service = if actions
            .iter()
            .any(|a| matches!(a, BindingAction::Create(_)))
        {
            match self
                .store
                .get_dhcp_service_binding(&port.network_id)
                .await?
            {
                Some(service) => Some(service),
                None => {
                    return Err(Error::NotFound(format!(
                        "DHCP server for network {} of port {}",
                        port.network_id, port.id
                    )));
                }
            }
        } else {
            None
        };

        for action in actions {
            self.apply(&port.id, action, service.as_ref()).await?;
        }
        Ok(())
    }

    /// Perform one binding transition against the backend, then persist it.
    async fn apply(
        &self,
        port_id: &str,
        action: BindingAction,
        service: Option<&DhcpServiceBinding>,
    ) -> Result<()> {
        match action {
            BindingAction::Keep => {}
            BindingAction::Create(desired) => {
                let Some(service) = service else {
                    return Err(Error::NotFound(format!(
                        "DHCP server for port {}",
                        port_id
                    )));
                };
                self.create_binding(port_id, &desired, service).await?;
            }
            BindingAction::Update {
                current,
                desired,
                update,
            } => {
                self.backend
                    .update_binding(&current.nsx_service_id, &current.nsx_binding_id, &update)
                    .await?;
                self.store
                    .update_dhcp_binding(
                        port_id,
                        current.ip_address,
                        &desired.subnet_id,
                        desired.ip_address,
                        &desired.mac_address,
                    )
                    .await?;
                info!(
                    port_id,
                    binding_id = %current.nsx_binding_id,
                    ip = %desired.ip_address,
                    mac = %desired.mac_address,
                    "Updated DHCP binding"
                );
                self.audit
                    .binding_updated(port_id, &current.nsx_binding_id);
            }
            BindingAction::Delete(binding) => {
                match self
                    .backend
                    .delete_binding(&binding.nsx_service_id, &binding.nsx_binding_id)
                    .await
                {
                    Ok(()) => {}
                    Err(BackendError::NotFound(_)) => {
                        debug!(
                            port_id,
                            binding_id = %binding.nsx_binding_id,
                            "DHCP binding already gone from the backend"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
                self.store
                    .delete_dhcp_binding(port_id, binding.ip_address)
                    .await?;
                info!(
                    port_id,
                    binding_id = %binding.nsx_binding_id,
                    ip = %binding.ip_address,
                    "Deleted DHCP binding"
                );
                self.audit
                    .binding_deleted(port_id, &binding.nsx_binding_id);
            }
        }
        Ok(())
    }

    pub(super) async fn create_binding(
        &self,
        port_id: &str,
        desired: &DesiredBinding,
        service: &DhcpServiceBinding,
    ) -> Result<DhcpBinding> {
        let req = BindingTemplate::from(&self.config).create_request(desired);
        let created = self
            .backend
            .create_binding(&service.nsx_service_id, &req)
            .await?;

        self.release_superseded_binding(port_id, desired.ip_address, &created.id)
            .await?;

        let now = chrono::Utc::now();
        let binding = DhcpBinding {
            port_id: port_id.to_string(),
            subnet_id: desired.subnet_id.clone(),
            ip_address: desired.ip_address,
            mac_address: desired.mac_address.clone(),
            nsx_service_id: service.nsx_service_id.clone(),
            nsx_binding_id: created.id,
            created_at: now,
            updated_at: now,
        };
        self.store.add_dhcp_binding(&binding).await?;

        info!(
            port_id,
            server_id = %service.nsx_service_id,
            binding_id = %binding.nsx_binding_id,
            ip = %binding.ip_address,
            mac = %binding.mac_address,
            "Created DHCP binding"
        );
        self.audit
            .binding_created(port_id, &binding.mac_address, &binding.ip_address.to_string());
        Ok(binding)
    }

    /// Delete the backend binding a row for (port, ip) still points at
    /// before the row is repointed to `replacement`.
    async fn release_superseded_binding(
        &self,
        port_id: &str,
        ip_address: Ipv4Addr,
        replacement: &str,
    ) -> Result<()> {
        let Some(stale) = self
            .store
            .get_dhcp_bindings(port_id)
            .await?
            .into_iter()
            .find(|b| b.ip_address == ip_address && b.nsx_binding_id != replacement)
        else {
            return Ok(());
        };

        match self
            .backend
            .delete_binding(&stale.nsx_service_id, &stale.nsx_binding_id)
            .await
        {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        debug!(
            port_id,
            binding_id = %stale.nsx_binding_id,
            ip = %ip_address,
            "Released superseded DHCP binding"
        );
        Ok(())
    }

    /// Ids of the IPv4 DHCP-enabled subnets of a network.
    async fn dhcp_subnet_ids(&self, network_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .catalog
            .list_subnets(network_id)
            .await?
            .into_iter()
            .filter(serves_dhcp)
            .map(|s| s.id)
            .collect())
    }

    /// Create the network's DHCP server from its DHCP-owned port.
    ///
    /// Returns `None` when the port does not lead to a DHCP-enabled subnet.
    async fn create_dhcp_service_for_port(&self, port: &Port) -> Result<Option<DhcpServiceBinding>> {
        if let Some(existing) = self
            .store
            .get_dhcp_service_binding(&port.network_id)
            .await?
        {
            debug!(
                network_id = %port.network_id,
                server_id = %existing.nsx_service_id,
                "Network already has a DHCP server"
            );
            return Ok(Some(existing));
        }

        let Some((subnet_id, _)) = dhcp_port_ipv4(port)? else {
            debug!(port_id = %port.id, "DHCP port has no IPv4 address");
            return Ok(None);
        };
        let Some(subnet) = self.catalog.get_subnet(&subnet_id).await? else {
            return Err(Error::NotFound(format!("subnet {}", subnet_id)));
        };
        if !serves_dhcp(&subnet) {
            return Ok(None);
        }
        let Some(network) = self.catalog.get_network(&port.network_id).await? else {
            return Err(Error::NotFound(format!("network {}", port.network_id)));
        };

        self.create_dhcp_service(&self.config, &network, &subnet, port)
            .await
            .map(Some)
    }

    /// Create a DHCP server, record it and switch the port's attachment to it.
    pub(super) async fn create_dhcp_service(
        &self,
        config: &NsxConfig,
        network: &Network,
        subnet: &Subnet,
        port: &Port,
    ) -> Result<DhcpServiceBinding> {
        let server_config = build_dhcp_server_config(network, subnet, port, config)?;
        let server = self.backend.create_dhcp_server(&server_config).await?;
        info!(
            network_id = %network.id,
            server_id = %server.id,
            server_ip = %server_config.server_ip,
            "Created logical DHCP server"
        );

        let service = DhcpServiceBinding::new(&network.id, &port.id, &server.id);
        self.store.add_dhcp_service_binding(&service).await?;
        self.audit.dhcp_server_created(&network.id, &server.id);

        match self.store.get_port_mapping(&port.id).await? {
            Some(mapping) => {
                self.backend
                    .update_logical_port_attachment(
                        &mapping.nsx_port_id,
                        &server.id,
                        AttachmentType::Dhcp,
                    )
                    .await?;
                debug!(
                    port_id = %port.id,
                    logical_port_id = %mapping.nsx_port_id,
                    "Attached DHCP port to logical DHCP server"
                );
            }
            None => warn!(
                port_id = %port.id,
                "No logical port recorded for DHCP port, attachment left unchanged"
            ),
        }
        Ok(service)
    }

    async fn update_dhcp_server_ip(&self, old: &Port, new: &Port) -> Result<()> {
        let new_ip = dhcp_port_ipv4(new)?;
        let old_ip = dhcp_port_ipv4(old).ok().flatten();
        let Some((_, ip)) = new_ip else {
            return Ok(());
        };
        if old_ip.as_ref().map(|(_, old)| *old) == Some(ip) {
            return Ok(());
        }

        let Some(service) = self.store.get_dhcp_service_binding(&new.network_id).await? else {
            debug!(network_id = %new.network_id, "No DHCP server to readdress");
            return Ok(());
        };
        self.backend
            .update_dhcp_server_ip(&service.nsx_service_id, IpAddr::V4(ip))
            .await?;
        info!(
            network_id = %new.network_id,
            server_id = %service.nsx_service_id,
            server_ip = %ip,
            "Updated logical DHCP server address"
        );
        Ok(())
    }

    /// Remove the network's DHCP server, its service binding and the binding rows under it.
    ///
    /// With `owner` set, only a server created for that DHCP port is removed.
    /// Backend bindings go away with their server. Returns whether a server
    /// was torn down.
    async fn teardown_dhcp_service(&self, network_id: &str, owner: Option<&str>) -> Result<bool> {
        let Some(service) = self.store.get_dhcp_service_binding(network_id).await? else {
            return Ok(false);
        };
        if owner.is_some_and(|port_id| port_id != service.port_id) {
            return Ok(false);
        }

        match self.backend.delete_dhcp_server(&service.nsx_service_id).await {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                debug!(
                    server_id = %service.nsx_service_id,
                    "Logical DHCP server already gone from the backend"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let orphans = self
            .store
            .get_dhcp_bindings_by_service(&service.nsx_service_id)
            .await?;
        for binding in &orphans {
            self.store
                .delete_dhcp_binding(&binding.port_id, binding.ip_address)
                .await?;
        }
        self.store.delete_dhcp_service_binding(network_id).await?;

        info!(
            network_id,
            server_id = %service.nsx_service_id,
            bindings = orphans.len(),
            "Deleted logical DHCP server"
        );
        self.audit
            .dhcp_server_deleted(network_id, &service.nsx_service_id);
        Ok(true)
    }
}

/// Native DHCP covers IPv4 subnets only.
pub(super) fn serves_dhcp(subnet: &Subnet) -> bool {
    subnet.enable_dhcp && subnet.is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{Call, FakeBackend, MemoryCatalog};
    use tempfile::TempDir;

    const NET: &str = "net-1";
    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    struct Harness {
        backend: Arc<FakeBackend>,
        catalog: Arc<MemoryCatalog>,
        store: Arc<MappingStore>,
        reconciler: DhcpReconciler,
        _dir: TempDir,
    }

    fn native_config() -> NsxConfig {
        NsxConfig {
            native_dhcp_metadata: true,
            dhcp_agent_notification: false,
            dhcp_profile_uuid: Some("profile-1".to_string()),
            metadata_proxy_uuid: Some("mdproxy-1".to_string()),
            ..Default::default()
        }
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MappingStore::new(dir.path().to_str().unwrap()).await.unwrap());
        let backend = Arc::new(FakeBackend::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let reconciler = DhcpReconciler::new(
            backend.clone(),
            catalog.clone(),
            store.clone(),
            native_config(),
            Arc::new(KeyedLocks::new()),
            Arc::new(AuditLogger::new_noop()),
        );

        catalog.add_network(Network {
            id: NET.to_string(),
            name: "web".to_string(),
            tenant_id: "tenant-1".to_string(),
        });
        catalog.add_subnet(subnet("s1", "10.0.0.0/24", true));
        store.set_network_mapping(NET, "ls-1").await.unwrap();

        Harness {
            backend,
            catalog,
            store,
            reconciler,
            _dir: dir,
        }
    }

    fn subnet(id: &str, cidr: &str, enable_dhcp: bool) -> Subnet {
        Subnet {
            id: id.to_string(),
            network_id: NET.to_string(),
            cidr: cidr.parse().unwrap(),
            enable_dhcp,
            gateway_ip: None,
            dns_nameservers: Vec::new(),
            host_routes: Vec::new(),
        }
    }

    fn port(id: &str, device_owner: &str, ips: &[&str]) -> Port {
        Port {
            id: id.to_string(),
            network_id: NET.to_string(),
            name: id.to_string(),
            mac_address: MAC.to_string(),
            device_owner: device_owner.to_string(),
            fixed_ips: ips
                .iter()
                .map(|ip| FixedIp {
                    subnet_id: "s1".to_string(),
                    ip_address: ip.parse().unwrap(),
                })
                .collect(),
        }
    }

    async fn with_dhcp_server(h: &Harness) {
        h.reconciler
            .port_created(&port("dhcp", "network:dhcp", &["10.0.0.2"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dhcp_port_creates_server_and_attachment() {
        let h = harness().await;
        h.store
            .set_port_mapping(&crate::store::PortMapping {
                port_id: "dhcp".to_string(),
                nsx_switch_id: "ls-1".to_string(),
                nsx_port_id: "lp-dhcp".to_string(),
            })
            .await
            .unwrap();

        with_dhcp_server(&h).await;

        let service = h.store.get_dhcp_service_binding(NET).await.unwrap().unwrap();
        assert_eq!(service.port_id, "dhcp");
        assert!(h.backend.calls().contains(&Call::UpdatePortAttachment {
            port_id: "lp-dhcp".to_string(),
            attachment_id: service.nsx_service_id.clone(),
            attachment_type: AttachmentType::Dhcp,
        }));

        // A second DHCP port event for the network reuses the server
        with_dhcp_server(&h).await;
        assert_eq!(h.backend.dhcp_servers().len(), 1);
    }

    #[tokio::test]
    async fn test_compute_port_without_server_is_not_found() {
        let h = harness().await;
        let err = h
            .reconciler
            .port_created(&port("vm", "compute:nova", &["10.0.0.3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_native_dhcp_is_noop() {
        let h = harness().await;
        let reconciler = DhcpReconciler::new(
            h.backend.clone(),
            h.catalog.clone(),
            h.store.clone(),
            NsxConfig::default(),
            Arc::new(KeyedLocks::new()),
            Arc::new(AuditLogger::new_noop()),
        );
        reconciler
            .port_created(&port("dhcp", "network:dhcp", &["10.0.0.2"]))
            .await
            .unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mac_change_updates_every_binding() {
        let h = harness().await;
        with_dhcp_server(&h).await;
        let old = port("vm", "compute:nova", &["10.0.0.3", "10.0.0.4"]);
        h.reconciler.port_created(&old).await.unwrap();

        let mut new = old.clone();
        new.mac_address = "11:22:33:44:55:66".to_string();
        h.catalog.add_port(new.clone());
        h.reconciler.port_updated(&old, &new).await.unwrap();

        let updates = h.backend.binding_updates();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| {
            u.mac_address.as_deref() == Some("11:22:33:44:55:66") && u.ip_address.is_none()
        }));
        let rows = h.store.get_dhcp_bindings("vm").await.unwrap();
        assert!(rows.iter().all(|r| r.mac_address == "11:22:33:44:55:66"));
    }

    #[tokio::test]
    async fn test_device_owner_change() {
        let h = harness().await;
        with_dhcp_server(&h).await;
        let compute = port("vm", "compute:nova", &["10.0.0.3"]);
        h.reconciler.port_created(&compute).await.unwrap();

        let detached = port("vm", "", &["10.0.0.3"]);
        h.catalog.add_port(detached.clone());
        h.reconciler.port_updated(&compute, &detached).await.unwrap();
        assert!(h.store.get_dhcp_bindings("vm").await.unwrap().is_empty());
        assert_eq!(h.backend.binding_deletes().len(), 1);

        h.reconciler.port_updated(&detached, &compute).await.unwrap();
        assert_eq!(h.store.get_dhcp_bindings("vm").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dhcp_port_address_change() {
        let h = harness().await;
        let old = port("dhcp", "network:dhcp", &["10.0.0.2"]);
        h.reconciler.port_created(&old).await.unwrap();
        let service = h.store.get_dhcp_service_binding(NET).await.unwrap().unwrap();

        let new = port("dhcp", "network:dhcp", &["10.0.0.20"]);
        h.catalog.add_port(new.clone());
        h.reconciler.port_updated(&old, &new).await.unwrap();
        assert!(h.backend.calls().contains(&Call::UpdateDhcpServerIp {
            server_id: service.nsx_service_id,
            server_ip: "10.0.0.20".parse().unwrap(),
        }));

        let two = port("dhcp", "network:dhcp", &["10.0.0.20", "10.0.0.21"]);
        let err = h.reconciler.port_updated(&new, &two).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_dhcp_port_delete_tears_down_server() {
        let h = harness().await;
        let dhcp = port("dhcp", "network:dhcp", &["10.0.0.2"]);
        h.reconciler.port_created(&dhcp).await.unwrap();
        h.reconciler
            .port_created(&port("vm", "compute:nova", &["10.0.0.3"]))
            .await
            .unwrap();

        h.reconciler.port_deleted(&dhcp).await.unwrap();
        assert!(h.store.get_dhcp_service_binding(NET).await.unwrap().is_none());
        assert!(h.store.list_dhcp_bindings().await.unwrap().is_empty());
        assert!(h.backend.dhcp_servers().is_empty());
    }

    #[tokio::test]
    async fn test_update_after_delete_leaves_no_binding() {
        let h = harness().await;
        with_dhcp_server(&h).await;
        let old = port("vm", "compute:nova", &["10.0.0.3"]);
        h.catalog.add_port(old.clone());
        h.reconciler.port_created(&old).await.unwrap();

        h.catalog.remove_port("vm");
        h.reconciler.port_deleted(&old).await.unwrap();
        let stale = port("vm", "compute:nova", &["10.0.0.9"]);
        h.reconciler.port_updated(&old, &stale).await.unwrap();

        assert!(h.store.get_dhcp_bindings("vm").await.unwrap().is_empty());
        assert!(h.backend.bindings().is_empty());
        assert_eq!(h.backend.binding_creates().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_server_delete_keeps_rows() {
        let h = harness().await;
        with_dhcp_server(&h).await;
        h.reconciler
            .port_created(&port("vm", "compute:nova", &["10.0.0.3"]))
            .await
            .unwrap();
        h.backend.fail_dhcp_server_deletes();

        let err = h.reconciler.network_deleted(NET).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));

        assert!(h.store.get_dhcp_service_binding(NET).await.unwrap().is_some());
        assert_eq!(h.store.get_dhcp_bindings("vm").await.unwrap().len(), 1);
        assert_eq!(h.backend.dhcp_servers().len(), 1);
        assert_eq!(h.backend.bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_dhcp_subnets_allowed_without_native_dhcp() {
        let h = harness().await;
        let reconciler = DhcpReconciler::new(
            h.backend.clone(),
            h.catalog.clone(),
            h.store.clone(),
            NsxConfig::default(),
            Arc::new(KeyedLocks::new()),
            Arc::new(AuditLogger::new_noop()),
        );
        let second = subnet("s2", "10.1.0.0/24", true);
        h.catalog.add_subnet(second.clone());

        reconciler.subnet_created(&second).await.unwrap();
        reconciler
            .subnet_updated(&subnet("s2", "10.1.0.0/24", false), &second)
            .await
            .unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subnet_dhcp_toggle() {
        let h = harness().await;
        with_dhcp_server(&h).await;

        let on = subnet("s1", "10.0.0.0/24", true);
        let off = subnet("s1", "10.0.0.0/24", false);
        h.reconciler.subnet_updated(&on, &off).await.unwrap();
        assert!(h.store.get_dhcp_service_binding(NET).await.unwrap().is_none());

        // Enabling DHCP on a second subnet while s1 still serves it is rejected
        let s2_off = subnet("s2", "10.1.0.0/24", false);
        let s2_on = subnet("s2", "10.1.0.0/24", true);
        let err = h.reconciler.subnet_updated(&s2_off, &s2_on).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_network_created_attaches_metadata_proxy() {
        let h = harness().await;
        let network = h.catalog.get_network(NET).await.unwrap().unwrap();

        let port = h.reconciler.network_created(&network).await.unwrap().unwrap();
        assert_eq!(port.logical_switch_id, "ls-1");

        let Some(Call::CreateLogicalPort(req)) = h.backend.calls().into_iter().last() else {
            panic!("expected a logical port create");
        };
        assert_eq!(req.attachment_type, AttachmentType::MetadataProxy);
        assert_eq!(req.attachment_id, "mdproxy-1");
        assert!(req.display_name.starts_with("mdproxy-web_"));
    }

    #[tokio::test]
    async fn test_network_created_without_switch_mapping() {
        let h = harness().await;
        let network = Network {
            id: "net-2".to_string(),
            name: String::new(),
            tenant_id: "tenant-1".to_string(),
        };
        let err = h.reconciler.network_created(&network).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_compute_port_bindings() {
        let h = harness().await;
        with_dhcp_server(&h).await;
        let vm = port("vm", "compute:nova", &["10.0.0.3"]);
        h.catalog.add_port(vm.clone());
        h.catalog.add_port(port("dhcp", "network:dhcp", &["10.0.0.2"]));
        h.reconciler.port_created(&vm).await.unwrap();

        let listed = h.reconciler.list_compute_port_bindings().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port_id, "vm");
        assert_eq!(listed[0].bindings.len(), 1);
        assert_eq!(listed[0].bindings[0].ip_address.to_string(), "10.0.0.3");
    }
}
