//! Tier-0 validation and the tier-0/tier-1 link port pair.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::backend::{CreateRouterPortRequest, LogicalRouterPort, NsxBackend, RouterPortType};
use crate::error::{Error, Result};

/// Edge members a tier-0 cluster needs, and how many a tier-1 link port is placed on.
pub const MIN_EDGE_NODE_NUM: usize = 1;

pub const TIER0_ROUTER_LINK_PORT_NAME: &str = "TIER0-RouterLinkPort";
pub const TIER1_ROUTER_LINK_PORT_NAME: &str = "TIER1-RouterLinkPort";

/// Outcome of a successful tier-0 validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier0Validation {
    pub tier0_id: String,
    pub edge_cluster_id: String,
    pub member_index_list: Vec<u32>,
}

/// Memoized tier-0 validations.
///
/// Entries are never invalidated on their own; call [`Tier0Cache::clear`]
/// when the backend topology is known to have changed.
#[derive(Default)]
pub struct Tier0Cache {
    entries: RwLock<HashMap<String, Tier0Validation>>,
}

impl Tier0Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tier0_id: &str) -> Option<Tier0Validation> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(tier0_id).cloned()
    }

    fn insert(&self, validation: Tier0Validation) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(validation.tier0_id.clone(), validation);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// The two link ports joining a tier-1 router to its tier-0 router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPortPair {
    pub tier0_port: LogicalRouterPort,
    pub tier1_port: LogicalRouterPort,
}

/// Links tenant (tier-1) routers to provider (tier-0) routers.
pub struct RouterLinker {
    backend: Arc<dyn NsxBackend>,
    audit: Arc<AuditLogger>,
}

impl RouterLinker {
    pub fn new(backend: Arc<dyn NsxBackend>, audit: Arc<AuditLogger>) -> Self {
        Self { backend, audit }
    }

    /// Check that a tier-0 router has an edge cluster able to host HA services.
    ///
    /// Results are served from `cache` when present; only successful
    /// validations are cached.
    pub async fn validate_tier0(
        &self,
        cache: &Tier0Cache,
        tier0_id: &str,
    ) -> Result<Tier0Validation> {
        if let Some(cached) = cache.get(tier0_id) {
            debug!(tier0_id, "Tier0 router validation served from cache");
            return Ok(cached);
        }

        let Some(router) = self.backend.get_logical_router(tier0_id).await? else {
            return Err(Error::InvalidInput(format!(
                "Failed to validate tier0 router {} since it is not found at the backend",
                tier0_id
            )));
        };

        let Some(edge_cluster_id) = router.edge_cluster_id.filter(|id| !id.is_empty()) else {
            return Err(Error::InvalidInput(format!(
                "Failed to get edge cluster uuid from tier0 router {} at the backend",
                tier0_id
            )));
        };

        let member_index_list: Vec<u32> = self
            .backend
            .get_edge_cluster(&edge_cluster_id)
            .await?
            .map(|cluster| cluster.members.iter().map(|m| m.member_index).collect())
            .unwrap_or_default();

        if member_index_list.len() < MIN_EDGE_NODE_NUM {
            return Err(Error::InvalidInput(format!(
                "{} edge members found in edge_cluster {}, however we require at least {} \
                 edge nodes in edge cluster for HA use.",
                member_index_list.len(),
                edge_cluster_id,
                MIN_EDGE_NODE_NUM
            )));
        }

        let validation = Tier0Validation {
            tier0_id: tier0_id.to_string(),
            edge_cluster_id,
            member_index_list,
        };
        cache.insert(validation.clone());
        info!(
            tier0_id,
            edge_cluster_id = %validation.edge_cluster_id,
            members = validation.member_index_list.len(),
            "Validated tier0 router"
        );
        Ok(validation)
    }

    /// Create the tier-0 link port, then the tier-1 link port pointing at it.
    ///
    /// The tier-1 port is placed on `MIN_EDGE_NODE_NUM` members picked at
    /// random from `edge_members`. If the second create fails the tier-0 port
    /// is deleted again (best effort) and the create error is returned.
    pub async fn add_router_link_port(
        &self,
        tier1_id: &str,
        tier0_id: &str,
        edge_members: &[u32],
    ) -> Result<LinkPortPair> {
        if edge_members.len() < MIN_EDGE_NODE_NUM {
            return Err(Error::InvalidInput(format!(
                "{} edge members given for tier0 router {}, at least {} required",
                edge_members.len(),
                tier0_id,
                MIN_EDGE_NODE_NUM
            )));
        }

        let tier0_port = self
            .backend
            .create_logical_router_port(&CreateRouterPortRequest {
                logical_router_id: tier0_id.to_string(),
                display_name: TIER0_ROUTER_LINK_PORT_NAME.to_string(),
                resource_type: RouterPortType::Link,
                logical_port_id: None,
                address_groups: None,
                edge_cluster_member_index: None,
            })
            .await?;

        let member_index = sample_edge_members(edge_members);

        let created = self
            .backend
            .create_logical_router_port(&CreateRouterPortRequest {
                logical_router_id: tier1_id.to_string(),
                display_name: TIER1_ROUTER_LINK_PORT_NAME.to_string(),
                resource_type: RouterPortType::Link,
                logical_port_id: Some(tier0_port.id.clone()),
                address_groups: None,
                edge_cluster_member_index: Some(member_index),
            })
            .await;

        let tier1_port = match created {
            Ok(port) => port,
            Err(e) => {
                warn!(
                    tier1_id,
                    tier0_id,
                    tier0_port_id = %tier0_port.id,
                    error = %e,
                    "Failed to create tier1 link port, removing tier0 link port"
                );
                if let Err(cleanup) = self.backend.delete_logical_router_port(&tier0_port.id).await
                {
                    warn!(
                        tier0_port_id = %tier0_port.id,
                        error = %cleanup,
                        "Failed to remove orphaned tier0 link port"
                    );
                }
                return Err(e.into());
            }
        };

        info!(
            tier1_id,
            tier0_id,
            tier0_port_id = %tier0_port.id,
            tier1_port_id = %tier1_port.id,
            "Created router link port pair"
        );
        self.audit
            .link_ports_created(tier1_id, tier0_id, &tier1_port.id);

        Ok(LinkPortPair {
            tier0_port,
            tier1_port,
        })
    }

    /// Validate the tier-0 router and link the tier-1 router to it.
    pub async fn link_tier1_to_tier0(
        &self,
        cache: &Tier0Cache,
        tier1_id: &str,
        tier0_id: &str,
    ) -> Result<LinkPortPair> {
        let validation = self.validate_tier0(cache, tier0_id).await?;
        self.add_router_link_port(tier1_id, tier0_id, &validation.member_index_list)
            .await
    }

    /// Delete the tier-1 link port and its tier-0 peer. Missing ports are not an error.
    pub async fn remove_router_link_port(&self, tier1_id: &str, tier0_id: &str) -> Result<()> {
        let Some(tier1_port) = self
            .backend
            .get_tier1_logical_router_link_port(tier1_id)
            .await?
        else {
            warn!(
                tier1_id,
                "Logical router link port for tier1 router not found at the backend"
            );
            return Ok(());
        };

        self.backend
            .delete_logical_router_port(&tier1_port.id)
            .await?;

        if let Some(tier0_port_id) = tier1_port.linked_logical_router_port_id.as_deref() {
            self.backend.delete_logical_router_port(tier0_port_id).await?;
        } else {
            warn!(
                tier1_id,
                tier1_port_id = %tier1_port.id,
                "Tier1 link port has no linked tier0 port"
            );
        }

        info!(tier1_id, tier0_id, "Removed router link port pair");
        self.audit.link_ports_removed(tier1_id, tier0_id);
        Ok(())
    }
}

/// Pick `MIN_EDGE_NODE_NUM` distinct members for HA placement.
fn sample_edge_members(edge_members: &[u32]) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    edge_members
        .choose_multiple(&mut rng, MIN_EDGE_NODE_NUM)
        .copied()
        .collect()
}
