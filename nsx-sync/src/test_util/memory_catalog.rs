//! In-memory [`NetworkCatalog`].

use std::sync::RwLock;

use async_trait::async_trait;

use crate::catalog::{NetworkCatalog, Result};
use crate::model::{Network, Port, Subnet};

#[derive(Default)]
struct Inner {
    networks: Vec<Network>,
    subnets: Vec<Subnet>,
    ports: Vec<Port>,
}

/// Networks, subnets and ports kept in insertion order.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T, &T) -> bool) {
    match items.iter_mut().find(|existing| same(existing, &item)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network(&self, network: Network) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut inner.networks, network, |a, b| a.id == b.id);
    }

    /// Insert or replace a subnet.
    pub fn add_subnet(&self, subnet: Subnet) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut inner.subnets, subnet, |a, b| a.id == b.id);
    }

    /// Insert or replace a port.
    pub fn add_port(&self, port: Port) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut inner.ports, port, |a, b| a.id == b.id);
    }

    pub fn remove_subnet(&self, subnet_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.subnets.retain(|s| s.id != subnet_id);
    }

    pub fn remove_port(&self, port_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.ports.retain(|p| p.id != port_id);
    }
}

#[async_trait]
impl NetworkCatalog for MemoryCatalog {
    async fn get_network(&self, network_id: &str) -> Result<Option<Network>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.networks.iter().find(|n| n.id == network_id).cloned())
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Option<Subnet>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.subnets.iter().find(|s| s.id == subnet_id).cloned())
    }

    async fn list_subnets(&self, network_id: &str) -> Result<Vec<Subnet>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .subnets
            .iter()
            .filter(|s| s.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn get_port(&self, port_id: &str) -> Result<Option<Port>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.ports.iter().find(|p| p.id == port_id).cloned())
    }

    async fn list_ports(&self) -> Result<Vec<Port>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.ports.clone())
    }
}
