//! Tenant router plumbing: tier-0 links, gateway SNAT and downlink interfaces.

pub mod interface;
pub mod linker;
pub mod nat;

pub use interface::{InterfaceManager, ROUTER_INTF_PORT_NAME};
pub use linker::{LinkPortPair, MIN_EDGE_NODE_NUM, RouterLinker, Tier0Cache, Tier0Validation};
pub use nat::{GW_SNAT_RULE_PRIORITY, GatewayConfigurator};
