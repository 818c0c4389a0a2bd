//! Read access to the tenant network model owned by the host framework.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Network, Port, Subnet};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Lookups of networks, subnets and ports.
#[async_trait]
pub trait NetworkCatalog: Send + Sync {
    async fn get_network(&self, network_id: &str) -> Result<Option<Network>>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<Option<Subnet>>;

    async fn get_port(&self, port_id: &str) -> Result<Option<Port>>;

    /// All subnets of a network.
    async fn list_subnets(&self, network_id: &str) -> Result<Vec<Subnet>>;

    /// All ports known to the host.
    async fn list_ports(&self) -> Result<Vec<Port>>;
}
