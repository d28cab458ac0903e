//! Peering Manager Daemon - overlay peering reconciliation engine
//!
//! peeringmgrd converges the Linux network stack toward declared peerings:
//! - GRE tunnel lifecycle, with identity persisted into peering Status
//! - Policy routes toward peer pod networks, self-healing duplicates
//! - Node-local VXLAN device and flood list across cluster nodes
//! - nat/filter chain and rule presence via iptables
//! - Readiness gate deciding when routes may be installed

pub mod commands;
pub mod config;
pub mod firewall;
pub mod gate;
pub mod kernel;
pub mod reconciler;
pub mod route_mgr;
pub mod store;
pub mod tables;
pub mod tunnel_mgr;
pub mod types;
pub mod vxlan_mgr;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use config::{Args, DaemonConfig};
pub use firewall::{FirewallMgr, FirewallTool, Iptables, RuleOutcome};
pub use kernel::{IpRoute2, NetKernel};
pub use reconciler::{PeeringReconciler, ReconcileOutcome};
pub use route_mgr::{RouteMgr, RouteOutcome, RouteRequest};
pub use store::{Manifest, MemoryStore, NodeInventory, PeeringStore, StaticInventory};
pub use tunnel_mgr::{LocalEndpoint, TunnelMgr};
pub use types::{NodeInfo, PeeringResource, PeeringSpec, PeeringStatus, ResourceKey};
pub use vxlan_mgr::{VxlanConfig, VxlanMgr, VxlanReport};
