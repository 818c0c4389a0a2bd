//! Tenant-side network records as delivered by the host plugin framework.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Device owner of the port serving DHCP for a network.
pub const DEVICE_OWNER_DHCP: &str = "network:dhcp";

/// Prefix shared by every device owner of an instance port.
pub const DEVICE_OWNER_COMPUTE_PREFIX: &str = "compute:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: IpNet,
    pub enable_dhcp: bool,
    pub gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub dns_nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
}

impl Subnet {
    pub fn is_ipv4(&self) -> bool {
        matches!(self.cidr, IpNet::V4(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: IpAddr,
}

impl FixedIp {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.ip_address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub name: String,
    pub mac_address: String,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

/// What a port is for, as far as DHCP is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    /// The port backing a network's DHCP server.
    Dhcp,
    /// An instance port that receives static bindings.
    Compute,
    Other,
}

impl Port {
    pub fn role(&self) -> PortRole {
        if self.device_owner == DEVICE_OWNER_DHCP {
            PortRole::Dhcp
        } else if self.device_owner.starts_with(DEVICE_OWNER_COMPUTE_PREFIX) {
            PortRole::Compute
        } else {
            PortRole::Other
        }
    }

    pub fn is_compute(&self) -> bool {
        self.role() == PortRole::Compute
    }

    /// IPv4 fixed addresses in declaration order.
    pub fn ipv4_fixed_ips(&self) -> impl Iterator<Item = (&FixedIp, Ipv4Addr)> {
        self.fixed_ips
            .iter()
            .filter_map(|fixed_ip| fixed_ip.ipv4().map(|ip| (fixed_ip, ip)))
    }
}

/// Shorten `name` and append an abbreviated uuid, keeping the result within 80 characters.
pub fn name_and_uuid(name: &str, uuid: &str) -> String {
    const MAX_LEN: usize = 80;
    let head: String = uuid.chars().take(5).collect();
    let tail: String = {
        let chars: Vec<char> = uuid.chars().collect();
        chars[chars.len().saturating_sub(5)..].iter().collect()
    };
    let short_uuid = format!("_{}...{}", head, tail);
    let keep = MAX_LEN.saturating_sub(short_uuid.chars().count());
    let name: String = name.chars().take(keep).collect();
    format!("{}{}", name, short_uuid)
}
