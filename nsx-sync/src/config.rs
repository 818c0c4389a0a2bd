use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default DHCP lease time in seconds.
pub const DEFAULT_DHCP_LEASE_TIME: u32 = 86400;

/// Default DNS domain handed out by backend DHCP servers.
pub const DEFAULT_DNS_DOMAIN: &str = "openstacklocal";

/// Default project name used when tagging backend objects.
pub const DEFAULT_PROJECT_NAME: &str = "admin";

fn default_dhcp_agent_notification() -> bool {
    true
}

fn default_dhcp_lease_time() -> u32 {
    DEFAULT_DHCP_LEASE_TIME
}

fn default_native_metadata_route() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(169, 254, 169, 254), 31).expect("prefix length 31 is valid")
}

fn default_dns_domain() -> String {
    DEFAULT_DNS_DOMAIN.to_string()
}

fn default_project_name() -> String {
    DEFAULT_PROJECT_NAME.to_string()
}

/// Native DHCP and metadata settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NsxConfig {
    #[serde(default)]
    pub native_dhcp_metadata: bool,
    /// Whether the host still notifies an external DHCP agent.
    #[serde(default = "default_dhcp_agent_notification")]
    pub dhcp_agent_notification: bool,
    #[serde(default)]
    pub dhcp_profile_uuid: Option<String>,
    #[serde(default)]
    pub metadata_proxy_uuid: Option<String>,
    /// Lease time in seconds for every static binding.
    #[serde(default = "default_dhcp_lease_time")]
    pub dhcp_lease_time: u32,
    /// Destination of the option 121 route pointing at the metadata proxy.
    #[serde(default = "default_native_metadata_route")]
    pub native_metadata_route: Ipv4Net,
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    /// Fallback nameservers for subnets that define none.
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(default = "default_project_name")]
    pub project_name: String,
}

impl Default for NsxConfig {
    fn default() -> Self {
        Self {
            native_dhcp_metadata: false,
            dhcp_agent_notification: default_dhcp_agent_notification(),
            dhcp_profile_uuid: None,
            metadata_proxy_uuid: None,
            dhcp_lease_time: DEFAULT_DHCP_LEASE_TIME,
            native_metadata_route: default_native_metadata_route(),
            dns_domain: default_dns_domain(),
            nameservers: Vec::new(),
            project_name: default_project_name(),
        }
    }
}

impl NsxConfig {
    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Returns a copy with the DHCP profile replaced, as the resync entry point allows.
    pub fn with_dhcp_profile(&self, dhcp_profile_uuid: Option<&str>) -> Self {
        let mut config = self.clone();
        if let Some(uuid) = dhcp_profile_uuid {
            config.dhcp_profile_uuid = Some(uuid.to_string());
        }
        config
    }

    /// Check the settings native DHCP and metadata cannot run without.
    pub fn validate_native_dhcp(&self) -> Result<()> {
        if !self.native_dhcp_metadata {
            return Err(Error::Config(
                "native_dhcp_metadata must be enabled".to_string(),
            ));
        }
        if self.dhcp_agent_notification {
            return Err(Error::Config(
                "dhcp_agent_notification must be disabled when native_dhcp_metadata is enabled"
                    .to_string(),
            ));
        }
        self.dhcp_profile()?;
        self.metadata_proxy()?;
        Ok(())
    }

    /// The configured DHCP profile, or a configuration error if unset.
    pub fn dhcp_profile(&self) -> Result<&str> {
        required(self.dhcp_profile_uuid.as_deref(), "dhcp_profile_uuid")
    }

    /// The configured metadata proxy, or a configuration error if unset.
    pub fn metadata_proxy(&self) -> Result<&str> {
        required(self.metadata_proxy_uuid.as_deref(), "metadata_proxy_uuid")
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!("{} is not defined", name))),
    }
}
