//! Overlay (VXLAN) Manager
//!
//! Brings up the node-local VXLAN device once at startup and fills its
//! forwarding database with one placeholder entry per peer VTEP, so that
//! unknown-destination and broadcast frames are replicated to every peer by
//! unicast. The desired entry set is recomputed from the node inventory on
//! every pass.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use tracing::{debug, info};

use crate::kernel::{FdbEntry, NetKernel, VxlanDevice};
use crate::store::NodeInventory;
use crate::tables::vxlan;

/// Smallest IPv4 MTU a link may carry
const MIN_IPV4_MTU: u32 = 68;

/// Overlay address of a node: the overlay network bits combined with the
/// host bits of the node address.
pub fn vtep_address(prefix: Ipv4Net, node_ip: Ipv4Addr) -> Ipv4Addr {
    let network = u32::from(prefix.network());
    let host = u32::from(node_ip) & u32::from(prefix.hostmask());
    Ipv4Addr::from(network | host)
}

/// Node-local VXLAN settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanConfig {
    pub node_name: String,
    pub node_ip: Ipv4Addr,
    pub overlay_prefix: Ipv4Net,
    /// MTU of the underlay; encapsulation overhead is subtracted
    pub node_mtu: u32,
    pub uplink: Option<String>,
    /// Label selector applied to the node inventory
    pub node_selector: String,
}

impl VxlanConfig {
    /// Device MTU after encapsulation overhead.
    pub fn device_mtu(&self) -> OverlayResult<u32> {
        self.node_mtu
            .checked_sub(vxlan::ENCAP_OVERHEAD)
            .filter(|mtu| *mtu >= MIN_IPV4_MTU)
            .ok_or_else(|| {
                OverlayError::invalid_config(
                    "node_mtu",
                    format!(
                        "{} leaves no room for {} bytes of VXLAN overhead",
                        self.node_mtu,
                        vxlan::ENCAP_OVERHEAD
                    ),
                )
            })
    }

    /// Local overlay address with the overlay prefix length.
    pub fn local_vtep(&self) -> OverlayResult<Ipv4Net> {
        let address = vtep_address(self.overlay_prefix, self.node_ip);
        let net = Ipv4Net::new(address, self.overlay_prefix.prefix_len())
            .map_err(|e| OverlayError::invalid_config("overlay_prefix", e.to_string()))?;
        if self.overlay_prefix.prefix_len() < 31
            && (address == self.overlay_prefix.network() || address == self.overlay_prefix.broadcast())
        {
            return Err(OverlayError::invalid_config(
                "overlay_prefix",
                format!(
                    "node address {} maps onto reserved overlay address {}",
                    self.node_ip, address
                ),
            ));
        }
        Ok(net)
    }
}

/// What one population pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanReport {
    pub vtep: Ipv4Net,
    pub device_created: bool,
    /// Peer VTEP underlay addresses, sorted
    pub peers: Vec<Ipv4Addr>,
    pub stale_removed: usize,
}

/// Overlay (VXLAN) Manager
pub struct VxlanMgr {
    kernel: Arc<dyn NetKernel>,
    inventory: Arc<dyn NodeInventory>,
}

impl VxlanMgr {
    pub fn new(kernel: Arc<dyn NetKernel>, inventory: Arc<dyn NodeInventory>) -> Self {
        Self { kernel, inventory }
    }

    /// Peer underlay addresses: physical nodes other than the local one.
    ///
    /// Two peers deriving the same overlay address as the local node is an
    /// [`OverlayError::OverlayAddressCollision`].
    pub async fn peer_vteps(&self, config: &VxlanConfig) -> OverlayResult<Vec<Ipv4Addr>> {
        let nodes = self.inventory.list_nodes(&config.node_selector).await?;
        let local_vtep = vtep_address(config.overlay_prefix, config.node_ip);

        let mut peers = BTreeSet::new();
        let mut claimed: BTreeMap<Ipv4Addr, String> = BTreeMap::new();
        claimed.insert(local_vtep, config.node_name.clone());

        for node in nodes {
            if node.virtual_node {
                debug!(node = %node.name, "Skipping virtual node");
                continue;
            }
            if node.name == config.node_name || node.internal_ip == config.node_ip {
                continue;
            }
            let vtep = vtep_address(config.overlay_prefix, node.internal_ip);
            if let Some(owner) = claimed.get(&vtep) {
                if *owner != node.name {
                    return Err(OverlayError::OverlayAddressCollision {
                        address: vtep,
                        local: owner.clone(),
                        peer: node.name,
                    });
                }
            }
            claimed.insert(vtep, node.name.clone());
            peers.insert(node.internal_ip);
        }
        Ok(peers.into_iter().collect())
    }

    /// Creates and configures the VXLAN device and rebuilds its FDB.
    pub async fn init(&self, config: &VxlanConfig) -> OverlayResult<VxlanReport> {
        let mtu = config.device_mtu()?;
        let vtep = config.local_vtep()?;
        let peers = self.peer_vteps(config).await?;

        let device_created = match self.kernel.link_by_name(vxlan::DEVICE_NAME).await? {
            Some(link) => {
                debug!(link = %link.name, index = link.index, "VXLAN device present");
                false
            }
            None => {
                let link = self
                    .kernel
                    .add_vxlan(&VxlanDevice {
                        name: vxlan::DEVICE_NAME.to_string(),
                        vni: vxlan::VNI,
                        port: vxlan::UDP_PORT,
                        local: config.node_ip,
                        mtu,
                        uplink: config.uplink.clone(),
                    })
                    .await?;
                info!(link = %link.name, index = link.index, vni = vxlan::VNI, "Created VXLAN device");
                true
            }
        };

        self.kernel
            .set_link_up(vxlan::DEVICE_NAME, Some(mtu))
            .await?;
        match self.kernel.add_address(vxlan::DEVICE_NAME, vtep).await {
            Err(e) if !e.is_already_exists() => return Err(e),
            _ => {}
        }

        let stale_removed = self.sync_fdb(&peers).await?;

        info!(
            vtep = %vtep,
            mtu,
            peers = peers.len(),
            stale_removed,
            "VXLAN fabric populated"
        );
        Ok(VxlanReport {
            vtep,
            device_created,
            peers,
            stale_removed,
        })
    }

    /// Drops placeholder entries for departed peers and appends one per peer.
    async fn sync_fdb(&self, peers: &[Ipv4Addr]) -> OverlayResult<usize> {
        let desired: BTreeSet<FdbEntry> = peers.iter().copied().map(FdbEntry::placeholder).collect();

        let mut removed = 0;
        for entry in self.kernel.list_fdb(vxlan::DEVICE_NAME).await? {
            if !entry.is_placeholder() || desired.contains(&entry) {
                continue;
            }
            match self.kernel.delete_fdb(vxlan::DEVICE_NAME, &entry).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        for entry in &desired {
            match self.kernel.append_fdb(vxlan::DEVICE_NAME, entry).await {
                Err(e) if !e.is_already_exists() => return Err(e),
                _ => {}
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKernel;
    use crate::store::StaticInventory;
    use crate::types::NodeInfo;
    use pretty_assertions::assert_eq;

    fn config() -> VxlanConfig {
        VxlanConfig {
            node_name: "worker-1".to_string(),
            node_ip: "10.0.0.11".parse().unwrap(),
            overlay_prefix: "240.0.0.0/24".parse().unwrap(),
            node_mtu: 1500,
            uplink: None,
            node_selector: String::new(),
        }
    }

    fn four_nodes() -> Vec<NodeInfo> {
        vec![
            NodeInfo::new("worker-1", "10.0.0.11".parse().unwrap()),
            NodeInfo::new("worker-2", "10.0.0.12".parse().unwrap()),
            NodeInfo::new("worker-3", "10.0.0.13".parse().unwrap()),
            NodeInfo::new("vk-1", "10.0.0.90".parse().unwrap()).with_virtual(true),
        ]
    }

    fn mgr(kernel: Arc<FakeKernel>, nodes: Vec<NodeInfo>) -> VxlanMgr {
        VxlanMgr::new(kernel, Arc::new(StaticInventory::new(nodes)))
    }

    #[test]
    fn test_vtep_address() {
        let prefix: Ipv4Net = "240.0.0.0/24".parse().unwrap();
        assert_eq!(
            vtep_address(prefix, "10.0.0.11".parse().unwrap()),
            "240.0.0.11".parse::<Ipv4Addr>().unwrap()
        );
        let wide: Ipv4Net = "240.0.0.0/16".parse().unwrap();
        assert_eq!(
            vtep_address(wide, "10.0.3.11".parse().unwrap()),
            "240.0.3.11".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_device_mtu() {
        assert_eq!(config().device_mtu().unwrap(), 1450);
        let mut tiny = config();
        tiny.node_mtu = 40;
        assert!(tiny.device_mtu().unwrap_err().is_fatal());
    }

    #[test]
    fn test_reserved_vtep_rejected() {
        let mut cfg = config();
        cfg.node_ip = "10.0.1.0".parse().unwrap();
        assert!(cfg.local_vtep().is_err());
    }

    #[tokio::test]
    async fn test_fdb_excludes_local_and_virtual_nodes() {
        let kernel = Arc::new(FakeKernel::new());
        let report = mgr(kernel.clone(), four_nodes()).init(&config()).await.unwrap();

        assert!(report.device_created);
        assert_eq!(report.vtep, "240.0.0.11/24".parse::<Ipv4Net>().unwrap());
        let fdb = kernel.fdb(vxlan::DEVICE_NAME);
        assert_eq!(fdb.len(), 2);
        assert!(fdb.iter().all(|e| e.dst != config().node_ip));
        assert!(fdb.iter().all(|e| e.is_placeholder()));

        let link = kernel.link(vxlan::DEVICE_NAME).unwrap();
        assert_eq!(link.mtu, Some(1450));
        assert!(link.up);
    }

    #[tokio::test]
    async fn test_second_pass_removes_departed_peers() {
        let kernel = Arc::new(FakeKernel::new());
        mgr(kernel.clone(), four_nodes()).init(&config()).await.unwrap();

        let mut nodes = four_nodes();
        nodes.retain(|n| n.name != "worker-3");
        let report = mgr(kernel.clone(), nodes).init(&config()).await.unwrap();

        assert!(!report.device_created);
        assert_eq!(report.stale_removed, 1);
        assert_eq!(
            kernel.fdb(vxlan::DEVICE_NAME),
            vec![FdbEntry::placeholder("10.0.0.12".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn test_suffix_collision_detected() {
        let kernel = Arc::new(FakeKernel::new());
        let mut nodes = four_nodes();
        // Same host suffix as worker-1 under a /24 overlay
        nodes.push(NodeInfo::new("worker-9", "10.0.5.11".parse().unwrap()));

        let err = mgr(kernel.clone(), nodes).init(&config()).await.unwrap_err();
        assert!(matches!(err, OverlayError::OverlayAddressCollision { .. }));
        assert_eq!(kernel.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_selector_limits_peers() {
        let kernel = Arc::new(FakeKernel::new());
        let nodes = vec![
            NodeInfo::new("worker-1", "10.0.0.11".parse().unwrap()),
            NodeInfo::new("worker-2", "10.0.0.12".parse().unwrap()).with_label("overlay", "on"),
            NodeInfo::new("worker-3", "10.0.0.13".parse().unwrap()),
        ];
        let mut cfg = config();
        cfg.node_selector = "overlay=on".to_string();

        let report = mgr(kernel, nodes).init(&cfg).await.unwrap();
        assert_eq!(report.peers, vec!["10.0.0.12".parse::<Ipv4Addr>().unwrap()]);
    }
}
