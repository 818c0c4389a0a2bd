//! Native DHCP and metadata: backend DHCP servers per network and static
//! bindings per compute port address.

pub mod binding;
pub mod reconciler;
pub mod resync;
pub mod server;

pub use binding::{
    BindingAction, BindingTemplate, DesiredBinding, desired_bindings, pair_bindings, plan_port,
    transition,
};
pub use reconciler::{DhcpReconciler, PortBindings};
pub use resync::ResyncReport;
pub use server::build_dhcp_server_config;
