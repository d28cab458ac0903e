//! Daemon configuration
//!
//! Options come from the command line or the process environment. The local
//! node address and the overlay prefix are environment-provided identity:
//! their absence is reported as its own named failure.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use overlaymgr_orch::{Backoff, DispatcherConfig};

use crate::tunnel_mgr::LocalEndpoint;
use crate::vxlan_mgr::VxlanConfig;

/// Overlay peering manager daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "peeringmgrd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Local node name
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Local node address
    #[arg(long, env = "NODE_IP")]
    pub node_ip: Option<String>,

    /// Overlay network prefix (CIDR)
    #[arg(long, env = "OVERLAY_PREFIX")]
    pub overlay_prefix: Option<String>,

    /// Device whose first IPv4 address is the public tunnel address
    #[arg(long, env = "UPLINK_DEVICE")]
    pub uplink_device: Option<String>,

    /// Underlay MTU
    #[arg(long, env = "NODE_MTU", default_value = "1500")]
    pub node_mtu: u32,

    /// Label selector for VXLAN peer nodes
    #[arg(long, env = "NODE_SELECTOR", default_value = "")]
    pub node_selector: String,

    /// Number of reconcile lanes
    #[arg(short = 'w', long, default_value = "4")]
    pub workers: usize,

    /// Periodic full resync interval in seconds (0 disables)
    #[arg(long, default_value = "30")]
    pub resync_secs: u64,

    /// YAML manifest with declared peerings and node inventory
    #[arg(short = 'm', long, env = "PEERING_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub node_name: String,
    pub node_ip: Ipv4Addr,
    pub overlay_prefix: Ipv4Net,
    pub uplink_device: Option<String>,
    pub node_mtu: u32,
    pub node_selector: String,
    pub workers: usize,
    pub resync: Option<Duration>,
    pub manifest: Option<PathBuf>,
}

/// Reads the node address, falling back to `POD_IP`.
fn node_ip_from(args: &Args) -> Option<String> {
    args.node_ip
        .clone()
        .or_else(|| std::env::var("POD_IP").ok())
        .filter(|s| !s.trim().is_empty())
}

impl DaemonConfig {
    pub fn from_args(args: &Args) -> OverlayResult<Self> {
        let raw_ip = node_ip_from(args).ok_or_else(|| OverlayError::AddressUnavailable {
            reason: "NODE_IP is not set".to_string(),
        })?;
        let node_ip: Ipv4Addr =
            raw_ip
                .trim()
                .parse()
                .map_err(|_| OverlayError::AddressUnavailable {
                    reason: format!("malformed node address '{}'", raw_ip),
                })?;

        let raw_prefix = args
            .overlay_prefix
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| OverlayError::OverlayPrefixUnavailable {
                reason: "OVERLAY_PREFIX is not set".to_string(),
            })?;
        let overlay_prefix: Ipv4Net =
            raw_prefix
                .trim()
                .parse()
                .map_err(|_| OverlayError::OverlayPrefixUnavailable {
                    reason: format!("malformed overlay prefix '{}'", raw_prefix),
                })?;

        let node_name = args
            .node_name
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OverlayError::invalid_config("node_name", "NODE_NAME is not set"))?;

        if args.workers == 0 {
            return Err(OverlayError::invalid_config(
                "workers",
                "at least one worker is required",
            ));
        }

        Ok(Self {
            node_name,
            node_ip,
            overlay_prefix: overlay_prefix.trunc(),
            uplink_device: args.uplink_device.clone().filter(|s| !s.is_empty()),
            node_mtu: args.node_mtu,
            node_selector: args.node_selector.clone(),
            workers: args.workers,
            resync: (args.resync_secs > 0).then(|| Duration::from_secs(args.resync_secs)),
            manifest: args.manifest.clone(),
        })
    }

    pub fn local_endpoint(&self) -> LocalEndpoint {
        match &self.uplink_device {
            Some(device) => LocalEndpoint::Device(device.clone()),
            None => LocalEndpoint::Fixed(self.node_ip),
        }
    }

    pub fn vxlan(&self) -> VxlanConfig {
        VxlanConfig {
            node_name: self.node_name.clone(),
            node_ip: self.node_ip,
            overlay_prefix: self.overlay_prefix,
            node_mtu: self.node_mtu,
            uplink: self.uplink_device.clone(),
            node_selector: self.node_selector.clone(),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            lanes: self.workers,
            backoff: Backoff::default(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "peeringmgrd",
            "--node-name",
            "worker-1",
            "--node-ip",
            "10.0.0.11",
            "--overlay-prefix",
            "240.0.0.0/24",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_valid_config() {
        let config = DaemonConfig::from_args(&args(&["--workers", "8"])).unwrap();
        assert_eq!(config.node_ip, "10.0.0.11".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync, Some(Duration::from_secs(30)));
        assert_eq!(
            config.local_endpoint(),
            LocalEndpoint::Fixed("10.0.0.11".parse().unwrap())
        );
        assert_eq!(config.vxlan().node_mtu, 1500);
        assert_eq!(config.dispatcher().lanes, 8);
    }

    #[test]
    fn test_uplink_device_selects_discovery() {
        let config = DaemonConfig::from_args(&args(&["--uplink-device", "eth1"])).unwrap();
        assert_eq!(config.local_endpoint(), LocalEndpoint::Device("eth1".to_string()));
    }

    #[test]
    fn test_malformed_node_ip_is_address_unavailable() {
        let mut a = args(&[]);
        a.node_ip = Some("10.0.0".to_string());
        let err = DaemonConfig::from_args(&a).unwrap_err();
        assert!(matches!(err, OverlayError::AddressUnavailable { .. }));
    }

    #[test]
    fn test_missing_prefix_is_prefix_unavailable() {
        let mut a = args(&[]);
        a.overlay_prefix = None;
        let err = DaemonConfig::from_args(&a).unwrap_err();
        assert!(matches!(err, OverlayError::OverlayPrefixUnavailable { .. }));

        a.overlay_prefix = Some("240.0.0.0/33".to_string());
        let err = DaemonConfig::from_args(&a).unwrap_err();
        assert!(matches!(err, OverlayError::OverlayPrefixUnavailable { .. }));
    }

    #[test]
    fn test_prefix_is_truncated() {
        let mut a = args(&[]);
        a.overlay_prefix = Some("240.0.0.7/24".to_string());
        let config = DaemonConfig::from_args(&a).unwrap();
        assert_eq!(config.overlay_prefix, "240.0.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = DaemonConfig::from_args(&args(&["--workers", "0"])).unwrap_err();
        assert!(err.is_fatal());
    }
}
