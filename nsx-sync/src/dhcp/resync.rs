//! One-shot rebuild of backend DHCP servers and bindings from the tenant model.
//!
//! Additive only: servers are created where missing and every eligible
//! compute address gets a create-binding call. Bindings of ports deleted in
//! the meantime are not detected.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use super::binding::DesiredBinding;
use super::reconciler::{DhcpReconciler, serves_dhcp};
use crate::config::NsxConfig;
use crate::error::{Error, Result};
use crate::model::{Port, PortRole, Subnet};
use crate::store::DhcpServiceBinding;

/// Counts of what a resync pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub servers_created: usize,
    pub servers_reused: usize,
    pub servers_failed: usize,
    pub bindings_created: usize,
    pub bindings_failed: usize,
}

/// Compute addresses collected for one logical switch.
#[derive(Default)]
struct SwitchBindings {
    network_id: String,
    entries: Vec<(String, DesiredBinding)>,
}

impl DhcpReconciler {
    /// Rebuild DHCP servers and static bindings for every port.
    ///
    /// `dhcp_profile_uuid` overrides the configured profile for servers
    /// created by this pass. Fails before touching the backend unless native
    /// DHCP is enabled with agent notification disabled. Binding creates are
    /// best effort: failures are counted and the pass continues.
    pub async fn resync(&self, dhcp_profile_uuid: Option<&str>) -> Result<ResyncReport> {
        let config = self.config.with_dhcp_profile(dhcp_profile_uuid);
        if !config.native_dhcp_metadata {
            return Err(Error::Config(
                "native_dhcp_metadata is not enabled".to_string(),
            ));
        }
        if config.dhcp_agent_notification {
            return Err(Error::Config(
                "dhcp_agent_notification must be disabled to resync native DHCP".to_string(),
            ));
        }
        config.dhcp_profile()?;

        let mut report = ResyncReport::default();
        let mut subnets: HashMap<String, Option<Subnet>> = HashMap::new();
        let mut servers: HashMap<String, DhcpServiceBinding> = HashMap::new();
        let mut switches: BTreeMap<String, SwitchBindings> = BTreeMap::new();

        for port in self.catalog.list_ports().await? {
            match port.role() {
                PortRole::Dhcp => {
                    // One server per network: only the first IPv4 address counts
                    let Some((fixed_ip, _)) = port.ipv4_fixed_ips().next() else {
                        continue;
                    };
                    let Some(subnet) = self.cached_subnet(&mut subnets, &fixed_ip.subnet_id).await?
                    else {
                        continue;
                    };
                    if !serves_dhcp(&subnet) {
                        continue;
                    }
                    let Some(switch_id) = self.store.get_switch_id(&port.network_id).await? else {
                        warn!(network_id = %port.network_id, "No logical switch for network, skipping");
                        continue;
                    };

                    match self.resync_server(&config, &subnet, &port).await {
                        Ok((service, created)) => {
                            if created {
                                report.servers_created += 1;
                            } else {
                                report.servers_reused += 1;
                            }
                            servers.insert(switch_id, service);
                        }
                        Err(e) => {
                            warn!(
                                network_id = %port.network_id,
                                port_id = %port.id,
                                error = %e,
                                "Failed to create logical DHCP server"
                            );
                            report.servers_failed += 1;
                        }
                    }
                }
                PortRole::Compute => {
                    for (fixed_ip, ip) in port.ipv4_fixed_ips() {
                        let Some(subnet) =
                            self.cached_subnet(&mut subnets, &fixed_ip.subnet_id).await?
                        else {
                            continue;
                        };
                        if !serves_dhcp(&subnet) {
                            continue;
                        }
                        let Some(switch_id) = self.store.get_switch_id(&port.network_id).await?
                        else {
                            continue;
                        };
                        let group = switches.entry(switch_id).or_default();
                        group.network_id = port.network_id.clone();
                        group.entries.push((
                            port.id.clone(),
                            DesiredBinding {
                                subnet_id: fixed_ip.subnet_id.clone(),
                                ip_address: ip,
                                mac_address: port.mac_address.clone(),
                            },
                        ));
                    }
                }
                PortRole::Other => {}
            }
        }

        for (switch_id, group) in switches {
            let Some(service) = servers.get(&switch_id) else {
                debug!(switch_id = %switch_id, "No logical DHCP server for switch, skipping bindings");
                continue;
            };
            let _guard = self.locks.lock_network(&group.network_id).await;
            for (port_id, desired) in &group.entries {
                match self.create_binding(port_id, desired, service).await {
                    Ok(_) => report.bindings_created += 1,
                    Err(e) => {
                        warn!(
                            port_id = %port_id,
                            ip = %desired.ip_address,
                            error = %e,
                            "Failed to add DHCP binding"
                        );
                        report.bindings_failed += 1;
                    }
                }
            }
        }

        info!(
            servers_created = report.servers_created,
            servers_reused = report.servers_reused,
            bindings_created = report.bindings_created,
            bindings_failed = report.bindings_failed,
            "DHCP resync finished"
        );
        self.audit.resync_finished(
            report.servers_created + report.servers_reused,
            report.bindings_created,
            report.servers_failed + report.bindings_failed,
        );
        Ok(report)
    }

    /// The network's service binding, creating the server if there is none.
    async fn resync_server(
        &self,
        config: &NsxConfig,
        subnet: &Subnet,
        port: &Port,
    ) -> Result<(DhcpServiceBinding, bool)> {
        let _guard = self.locks.lock_network(&port.network_id).await;

        if let Some(existing) = self
            .store
            .get_dhcp_service_binding(&port.network_id)
            .await?
        {
            debug!(
                network_id = %port.network_id,
                server_id = %existing.nsx_service_id,
                "Reusing logical DHCP server"
            );
            return Ok((existing, false));
        }

        let Some(network) = self.catalog.get_network(&port.network_id).await? else {
            return Err(Error::NotFound(format!("network {}", port.network_id)));
        };
        let service = self
            .create_dhcp_service(config, &network, subnet, port)
            .await?;
        Ok((service, true))
    }

    async fn cached_subnet(
        &self,
        cache: &mut HashMap<String, Option<Subnet>>,
        subnet_id: &str,
    ) -> Result<Option<Subnet>> {
        if let Some(cached) = cache.get(subnet_id) {
            return Ok(cached.clone());
        }
        let subnet = self.catalog.get_subnet(subnet_id).await?;
        cache.insert(subnet_id.to_string(), subnet.clone());
        Ok(subnet)
    }
}
