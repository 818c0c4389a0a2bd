//! Backend DHCP server configuration for a network's DHCP-enabled subnet.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::backend::{DhcpOptions, DhcpServerConfig, StaticRoute, Tag};
use crate::config::NsxConfig;
use crate::error::{Error, Result};
use crate::model::{Network, Port, Subnet, name_and_uuid};

pub const TAG_SCOPE_NETWORK: &str = "os-neutron-net-id";
pub const TAG_SCOPE_PROJECT_ID: &str = "os-project-id";
pub const TAG_SCOPE_PROJECT_NAME: &str = "os-project-name";

/// The single IPv4 address of a DHCP-owned port, if it has one.
///
/// A DHCP port serves one subnet; more than one IPv4 address is rejected.
pub fn dhcp_port_ipv4(port: &Port) -> Result<Option<(String, Ipv4Addr)>> {
    let mut ips = port.ipv4_fixed_ips();
    let first = ips.next().map(|(f, ip)| (f.subnet_id.clone(), ip));
    if ips.next().is_some() {
        return Err(Error::InvalidInput(format!(
            "DHCP port {} cannot have more than one IPv4 address",
            port.id
        )));
    }
    Ok(first)
}

/// Tags identifying the tenant network on backend objects.
pub fn network_tags(network: &Network, project_name: &str) -> Vec<Tag> {
    vec![
        Tag {
            scope: TAG_SCOPE_NETWORK.to_string(),
            tag: network.id.clone(),
        },
        Tag {
            scope: TAG_SCOPE_PROJECT_ID.to_string(),
            tag: network.tenant_id.clone(),
        },
        Tag {
            scope: TAG_SCOPE_PROJECT_NAME.to_string(),
            tag: project_name.to_string(),
        },
    ]
}

/// Gateway and option 121 routes handed out for `subnet`.
///
/// Without a subnet gateway, the nexthop of a default host route stands in.
fn static_routes(subnet: &Subnet) -> (Option<IpAddr>, Vec<StaticRoute>) {
    let default_net = IpNet::V4(Ipv4Net::default());
    let mut gateway_ip = subnet.gateway_ip;

    let mut routes = vec![StaticRoute {
        network: subnet.cidr.trunc(),
        next_hop: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }];
    for route in &subnet.host_routes {
        if route.destination == default_net {
            if gateway_ip.is_none() {
                gateway_ip = Some(route.nexthop);
            }
            continue;
        }
        routes.push(StaticRoute {
            network: route.destination,
            next_hop: route.nexthop,
        });
    }
    if let Some(gateway) = gateway_ip {
        routes.push(StaticRoute {
            network: default_net,
            next_hop: gateway,
        });
    }
    (gateway_ip, routes)
}

/// Build the server that will serve `subnet` from `dhcp_port`'s address.
pub fn build_dhcp_server_config(
    network: &Network,
    subnet: &Subnet,
    dhcp_port: &Port,
    config: &NsxConfig,
) -> Result<DhcpServerConfig> {
    let profile = config.dhcp_profile()?;

    let Some(server_ip) = dhcp_port
        .ipv4_fixed_ips()
        .find(|(f, _)| f.subnet_id == subnet.id)
        .map(|(_, ip)| ip)
    else {
        return Err(Error::InvalidInput(format!(
            "DHCP port {} has no IPv4 address in subnet {}",
            dhcp_port.id, subnet.id
        )));
    };
    let server_ip = IpNet::new(IpAddr::V4(server_ip), subnet.cidr.prefix_len())
        .map_err(|e| Error::InvalidInput(format!("subnet {}: {}", subnet.id, e)))?;

    let dns_nameservers = if subnet.dns_nameservers.is_empty() {
        config.nameservers.clone()
    } else {
        subnet.dns_nameservers.clone()
    };

    let name = if network.name.is_empty() {
        "dhcpserver"
    } else {
        network.name.as_str()
    };
    let (gateway_ip, routes) = static_routes(subnet);

    Ok(DhcpServerConfig {
        name: name_and_uuid(name, &network.id),
        dhcp_profile_id: profile.to_string(),
        server_ip,
        dns_nameservers,
        domain_name: config.dns_domain.clone(),
        gateway_ip,
        options: DhcpOptions::with_static_routes(routes),
        tags: network_tags(network, &config.project_name),
    })
}
