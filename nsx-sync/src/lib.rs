//! NSX synchronization core.
//!
//! Links tenant routers to provider routers, manages their gateway NAT and
//! downlink interfaces, and keeps backend DHCP servers and static bindings
//! consistent with tenant networks, subnets and ports.

pub mod audit;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod locks;
pub mod model;
pub mod router;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use error::{Error, Result};
