//! Route advertisement and gateway SNAT for tenant routers.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::info;

use crate::audit::AuditLogger;
use crate::backend::{NatAction, NatRule, NsxBackend};
use crate::error::Result;

/// Priority of the gateway SNAT rule; custom rules with lower numbers win.
pub const GW_SNAT_RULE_PRIORITY: u32 = 1000;

pub struct GatewayConfigurator {
    backend: Arc<dyn NsxBackend>,
    audit: Arc<AuditLogger>,
}

impl GatewayConfigurator {
    pub fn new(backend: Arc<dyn NsxBackend>, audit: Arc<AuditLogger>) -> Self {
        Self { backend, audit }
    }

    pub async fn update_advertisement(
        &self,
        router_id: &str,
        advertise_nat: bool,
        advertise_connected: bool,
    ) -> Result<()> {
        self.backend
            .update_logical_router_advertisement(router_id, advertise_nat, advertise_connected)
            .await?;
        info!(
            router_id,
            advertise_nat, advertise_connected, "Updated route advertisement"
        );
        Ok(())
    }

    /// Translate outbound traffic of the router to `gw_ip`.
    pub async fn add_gw_snat_rule(&self, router_id: &str, gw_ip: IpAddr) -> Result<()> {
        let rule = NatRule {
            action: NatAction::Snat,
            translated_network: gw_ip,
            rule_priority: GW_SNAT_RULE_PRIORITY,
        };
        self.backend.add_nat_rule(router_id, &rule).await?;
        self.audit.snat_rule_added(router_id, gw_ip);
        Ok(())
    }

    /// Remove every rule translating to `gw_ip`, whatever created it.
    pub async fn delete_gw_snat_rule(&self, router_id: &str, gw_ip: IpAddr) -> Result<()> {
        self.backend
            .delete_nat_rule_by_values(router_id, gw_ip)
            .await?;
        self.audit.snat_rule_removed(router_id, gw_ip);
        Ok(())
    }

    pub async fn update_router_edge_cluster(
        &self,
        router_id: &str,
        edge_cluster_id: &str,
    ) -> Result<()> {
        self.backend
            .update_logical_router(router_id, edge_cluster_id)
            .await?;
        info!(router_id, edge_cluster_id, "Moved router to edge cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{Call, FakeBackend};

    fn configurator(backend: &Arc<FakeBackend>) -> GatewayConfigurator {
        GatewayConfigurator::new(backend.clone(), Arc::new(AuditLogger::new_noop()))
    }

    #[tokio::test]
    async fn test_update_advertisement_passes_flags() {
        let backend = Arc::new(FakeBackend::new());
        configurator(&backend)
            .update_advertisement("r1", true, false)
            .await
            .unwrap();

        assert_eq!(
            backend.calls(),
            vec![Call::UpdateAdvertisement {
                router_id: "r1".to_string(),
                advertise_nat_routes: true,
                advertise_connected_routes: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_snat_rule_lifecycle() {
        let backend = Arc::new(FakeBackend::new());
        let gw = configurator(&backend);
        let gw_ip: IpAddr = "172.24.4.10".parse().unwrap();

        gw.add_gw_snat_rule("r1", gw_ip).await.unwrap();
        let rules = backend.nat_rules("r1");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, NatAction::Snat);
        assert_eq!(rules[0].rule_priority, GW_SNAT_RULE_PRIORITY);

        gw.delete_gw_snat_rule("r1", gw_ip).await.unwrap();
        assert!(backend.nat_rules("r1").is_empty());
    }

    #[tokio::test]
    async fn test_delete_snat_removes_all_matching_rules() {
        let backend = Arc::new(FakeBackend::new());
        let gw = configurator(&backend);
        let gw_ip: IpAddr = "172.24.4.10".parse().unwrap();
        let other: IpAddr = "172.24.4.11".parse().unwrap();

        gw.add_gw_snat_rule("r1", gw_ip).await.unwrap();
        gw.add_gw_snat_rule("r1", gw_ip).await.unwrap();
        gw.add_gw_snat_rule("r1", other).await.unwrap();

        gw.delete_gw_snat_rule("r1", gw_ip).await.unwrap();
        let rules = backend.nat_rules("r1");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].translated_network, other);
    }

    #[tokio::test]
    async fn test_update_router_edge_cluster() {
        let backend = Arc::new(FakeBackend::new());
        configurator(&backend)
            .update_router_edge_cluster("r1", "ec-2")
            .await
            .unwrap();
        assert_eq!(
            backend.calls(),
            vec![Call::UpdateRouter {
                router_id: "r1".to_string(),
                edge_cluster_id: "ec-2".to_string(),
            }]
        );
    }
}
