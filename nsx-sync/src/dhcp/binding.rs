//! Per-(port, address) static binding transitions.
//!
//! A compute port address in a DHCP-enabled subnet is either absent from the
//! backend DHCP server or bound to it. [`transition`] maps the persisted
//! binding (if any) and the address the port should now have (if any) to the
//! single backend action that converges them; [`plan_port`] pairs a port's
//! persisted bindings with its desired addresses and applies it to each pair.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::backend::{BindingUpdate, CreateBindingRequest, DhcpOptions, StaticRoute};
use crate::config::NsxConfig;
use crate::model::Port;
use crate::store::DhcpBinding;

/// An address a compute port should have bound on its network's DHCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredBinding {
    pub subnet_id: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
}

/// Per-address values derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingTemplate {
    pub metadata_route: Ipv4Net,
    pub lease_time: u32,
}

impl From<&NsxConfig> for BindingTemplate {
    fn from(config: &NsxConfig) -> Self {
        Self {
            metadata_route: config.native_metadata_route,
            lease_time: config.dhcp_lease_time,
        }
    }
}

impl BindingTemplate {
    /// DNS-safe host name, e.g. `host-10-0-0-3`.
    pub fn host_name(ip: Ipv4Addr) -> String {
        format!("host-{}", ip.to_string().replace('.', "-"))
    }

    /// Option 121 route sending metadata traffic through the instance's own address.
    pub fn options(&self, ip: Ipv4Addr) -> DhcpOptions {
        DhcpOptions::with_static_routes(vec![StaticRoute {
            network: IpNet::V4(self.metadata_route),
            next_hop: IpAddr::V4(ip),
        }])
    }

    pub fn create_request(&self, desired: &DesiredBinding) -> CreateBindingRequest {
        CreateBindingRequest {
            mac_address: desired.mac_address.clone(),
            ip_address: desired.ip_address,
            host_name: Self::host_name(desired.ip_address),
            lease_time: self.lease_time,
            options: self.options(desired.ip_address),
        }
    }
}

/// Backend work needed to move one binding to its desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingAction {
    /// Already converged.
    Keep,
    /// ABSENT -> BOUND.
    Create(DesiredBinding),
    /// BOUND -> BOUND with a new MAC and/or address.
    Update {
        current: DhcpBinding,
        desired: DesiredBinding,
        update: BindingUpdate,
    },
    /// BOUND -> ABSENT.
    Delete(DhcpBinding),
}

pub fn transition(
    current: Option<&DhcpBinding>,
    desired: Option<&DesiredBinding>,
    template: &BindingTemplate,
) -> BindingAction {
    match (current, desired) {
        (None, None) => BindingAction::Keep,
        (None, Some(desired)) => BindingAction::Create(desired.clone()),
        (Some(current), None) => BindingAction::Delete(current.clone()),
        (Some(current), Some(desired)) => {
            let mut update = BindingUpdate::default();
            if current.mac_address != desired.mac_address {
                update.mac_address = Some(desired.mac_address.clone());
            }
            if current.ip_address != desired.ip_address {
                update.ip_address = Some(desired.ip_address);
                update.host_name = Some(BindingTemplate::host_name(desired.ip_address));
                update.options = Some(template.options(desired.ip_address));
            }
            if update.is_empty() {
                BindingAction::Keep
            } else {
                BindingAction::Update {
                    current: current.clone(),
                    desired: desired.clone(),
                    update,
                }
            }
        }
    }
}

/// Addresses of `port` that belong on a DHCP server.
///
/// Every IPv4 fixed address in a subnet listed in `dhcp_subnets` counts;
/// non-compute ports have none.
pub fn desired_bindings(port: &Port, dhcp_subnets: &HashSet<String>) -> Vec<DesiredBinding> {
    if !port.is_compute() {
        return Vec::new();
    }
    port.ipv4_fixed_ips()
        .filter(|(fixed_ip, _)| dhcp_subnets.contains(&fixed_ip.subnet_id))
        .map(|(fixed_ip, ip)| DesiredBinding {
            subnet_id: fixed_ip.subnet_id.clone(),
            ip_address: ip,
            mac_address: port.mac_address.clone(),
        })
        .collect()
}

/// Pair persisted bindings with desired addresses.
///
/// Unchanged (subnet, address) pairs match each other. The leftovers are
/// matched positionally when both sides name the same subnets in the same
/// order (an address moved within its subnet); otherwise removed bindings
/// pair with nothing and added addresses pair with nothing.
pub fn pair_bindings<'a>(
    current: &'a [DhcpBinding],
    desired: &'a [DesiredBinding],
) -> Vec<(Option<&'a DhcpBinding>, Option<&'a DesiredBinding>)> {
    let mut pairs = Vec::new();
    let mut removed = Vec::new();
    let mut matched = vec![false; desired.len()];

    for binding in current {
        let hit = desired.iter().enumerate().position(|(i, d)| {
            !matched[i] && d.subnet_id == binding.subnet_id && d.ip_address == binding.ip_address
        });
        match hit {
            Some(i) => {
                matched[i] = true;
                pairs.push((Some(binding), Some(&desired[i])));
            }
            None => removed.push(binding),
        }
    }

    let added: Vec<&DesiredBinding> = desired
        .iter()
        .zip(&matched)
        .filter(|(_, m)| !**m)
        .map(|(d, _)| d)
        .collect();

    let same_subnets = removed.len() == added.len()
        && removed
            .iter()
            .zip(&added)
            .all(|(b, d)| b.subnet_id == d.subnet_id);

    if same_subnets {
        pairs.extend(removed.into_iter().zip(added).map(|(b, d)| (Some(b), Some(d))));
    } else {
        pairs.extend(removed.into_iter().map(|b| (Some(b), None)));
        pairs.extend(added.into_iter().map(|d| (None, Some(d))));
    }
    pairs
}

/// Actions converging a port's persisted bindings on its desired addresses.
pub fn plan_port(
    current: &[DhcpBinding],
    desired: &[DesiredBinding],
    template: &BindingTemplate,
) -> Vec<BindingAction> {
    pair_bindings(current, desired)
        .into_iter()
        .map(|(c, d)| transition(c, d, template))
        .filter(|action| *action != BindingAction::Keep)
        .collect()
}
