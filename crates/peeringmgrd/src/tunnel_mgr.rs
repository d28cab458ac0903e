//! Tunnel Lifecycle Manager - GRE tunnel install and teardown per peering

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use tracing::{debug, info, warn};

use crate::gate;
use crate::kernel::{GreTunnel, Link, NetKernel, Route};
use crate::route_mgr::{RouteMgr, RouteRequest};
use crate::store::PeeringStore;
use crate::types::*;

/// Where the local public tunnel address comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    /// First IPv4 address of the named uplink device
    Device(String),
    /// Address supplied by the environment
    Fixed(Ipv4Addr),
}

/// Picks the pool member the peer does not use.
pub fn choose_local_private(pool: &[Ipv4Addr], peer: Ipv4Addr) -> OverlayResult<Ipv4Addr> {
    pool.iter()
        .copied()
        .find(|addr| *addr != peer)
        .ok_or(OverlayError::AddressPoolExhausted { peer })
}

/// Tunnel Lifecycle Manager
///
/// Owns the GRE link of every peering. The link identity (index and name)
/// is persisted into the peering Status, which is the only record used to
/// find the link again for teardown.
pub struct TunnelMgr {
    kernel: Arc<dyn NetKernel>,
    store: Arc<dyn PeeringStore>,
    routes: Arc<RouteMgr>,
    endpoint: LocalEndpoint,
}

impl TunnelMgr {
    pub fn new(
        kernel: Arc<dyn NetKernel>,
        store: Arc<dyn PeeringStore>,
        routes: Arc<RouteMgr>,
        endpoint: LocalEndpoint,
    ) -> Self {
        info!(endpoint = ?endpoint, "TunnelMgr initialized");
        Self {
            kernel,
            store,
            routes,
            endpoint,
        }
    }

    /// Discovers this node's public tunnel address.
    pub async fn local_public_ip(&self) -> OverlayResult<Ipv4Addr> {
        match &self.endpoint {
            LocalEndpoint::Fixed(ip) if ip.is_unspecified() => {
                Err(OverlayError::AddressUnavailable {
                    reason: "node address is unspecified".to_string(),
                })
            }
            LocalEndpoint::Fixed(ip) => Ok(*ip),
            LocalEndpoint::Device(device) => {
                let addresses = match self.kernel.link_addresses(device).await {
                    Ok(addresses) => addresses,
                    Err(e) if e.is_not_found() => {
                        return Err(OverlayError::AddressUnavailable {
                            reason: format!("uplink device {} not found", device),
                        })
                    }
                    Err(e) => return Err(e),
                };
                addresses
                    .first()
                    .map(|net| net.addr())
                    .ok_or_else(|| OverlayError::AddressUnavailable {
                        reason: format!("uplink device {} has no IPv4 address", device),
                    })
            }
        }
    }

    /// Installs the tunnel of a peering whose Status is empty and persists
    /// its identity. Returns the resource as stored afterwards.
    ///
    /// A peering that already carries a tunnel identity is returned as is.
    /// If the Status write fails the new link is deleted again.
    pub async fn install(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource> {
        let key = resource.key();
        if resource.status.has_tunnel_identity() {
            debug!(key = %key, "Tunnel identity already persisted");
            return Ok(resource.clone());
        }

        let spec = &resource.spec;
        let local_public = self.local_public_ip().await?;
        let local_private = choose_local_private(&TUNNEL_ADDRESS_POOL, spec.peer_tunnel_private_ip)?;
        let name = tunnel_name_for(&key);

        if let Some(existing) = self.kernel.link_by_name(&name).await? {
            if let Some(owner) = self.link_owner(&key, &existing).await? {
                warn!(key = %key, link = %existing.name, owner = %owner, "Derived tunnel name already in use");
                return Err(OverlayError::TunnelNameCollision {
                    name: existing.name,
                    owner: owner.to_string(),
                });
            }
            // Left over by an install that failed before its Status write
            warn!(key = %key, link = %existing.name, index = existing.index, "Removing unrecorded tunnel link");
            self.delete_link_tolerant(&existing.name).await?;
        }

        let link = self
            .kernel
            .add_gre_tunnel(&GreTunnel {
                name: name.clone(),
                local: local_public,
                remote: spec.peer_gateway_ip,
                ttl: TUNNEL_TTL,
            })
            .await?;
        info!(key = %key, link = %link.name, index = link.index, remote = %spec.peer_gateway_ip, "Created tunnel");

        self.configure_link(&link, local_private, spec.peer_tunnel_private_ip)
            .await?;

        let mut candidate = resource.clone();
        candidate.status.local_tunnel_private_ip = Some(local_private);
        candidate.status.local_tunnel_public_ip = Some(local_public);
        candidate.status.remote_tunnel_private_ip = Some(spec.peer_tunnel_private_ip);
        candidate.status.remote_tunnel_public_ip = Some(spec.peer_gateway_ip);
        candidate.status.tunnel_iface_index = Some(link.index);
        candidate.status.tunnel_iface_name = Some(link.name.clone());

        if gate::is_route_ready(&candidate) {
            if let Some(request) = RouteRequest::for_peering(&candidate) {
                self.routes.converge(&candidate, &request).await?;
            }
        }

        match self.store.update_status(&candidate).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                warn!(key = %key, link = %link.name, error = %e, "Status write failed, deleting tunnel");
                if let Err(cleanup) = self.delete_link_tolerant(&link.name).await {
                    warn!(key = %key, link = %link.name, error = %cleanup, "Failed to delete tunnel");
                }
                self.routes.forget(&key);
                Err(e)
            }
        }
    }

    /// Host address, link up, host route to the peer's tunnel address.
    async fn configure_link(
        &self,
        link: &Link,
        local_private: Ipv4Addr,
        peer_private: Ipv4Addr,
    ) -> OverlayResult<()> {
        match self
            .kernel
            .add_address(&link.name, Ipv4Net::from(local_private))
            .await
        {
            Err(e) if !e.is_already_exists() => return Err(e),
            _ => {}
        }

        self.kernel.set_link_up(&link.name, None).await?;

        let peer_route = Route {
            destination: Ipv4Net::from(peer_private),
            gateway: None,
            link: link.name.clone(),
            onlink: false,
        };
        match self.kernel.add_route(&peer_route).await {
            Err(e) if !e.is_already_exists() => Err(e),
            _ => Ok(()),
        }
    }

    /// Deletes the tunnel recorded in Status. A link that is already gone
    /// counts as success. Returns true if a link was deleted.
    pub async fn teardown(&self, resource: &PeeringResource) -> OverlayResult<bool> {
        let key = resource.key();
        let Some(name) = self.recorded_link(resource).await? else {
            debug!(key = %key, "No recorded tunnel to tear down");
            return Ok(false);
        };

        let deleted = self.delete_link_tolerant(&name).await?;
        info!(key = %key, link = %name, deleted, "Tunnel torn down");
        Ok(deleted)
    }

    /// Tears the tunnel down and then clears the finalizer. On teardown
    /// failure the finalizer stays and the error is returned.
    pub async fn uninstall(&self, resource: &PeeringResource) -> OverlayResult<()> {
        self.teardown(resource).await?;

        if !resource.metadata.has_finalizer(TUNNEL_FINALIZER) {
            return Ok(());
        }
        let mut updated = resource.clone();
        updated.metadata.remove_finalizer(TUNNEL_FINALIZER);
        match self.store.update(&updated).await {
            Ok(_) => {
                info!(key = %resource.key(), "Finalizer cleared");
                Ok(())
            }
            Err(OverlayError::ResourceNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns true if the link recorded in Status still exists.
    pub async fn is_present(&self, resource: &PeeringResource) -> OverlayResult<bool> {
        let status = &resource.status;
        if let Some(index) = status.tunnel_iface_index {
            if let Some(link) = self.kernel.link_by_index(index).await? {
                if status.tunnel_iface_name.as_deref().map_or(true, |n| n == link.name) {
                    return Ok(true);
                }
            }
        }
        match &status.tunnel_iface_name {
            Some(name) => Ok(self.kernel.link_by_name(name).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Resolves the link name to delete from the persisted identity only.
    ///
    /// An index now held by a differently named link was reused after the
    /// tunnel vanished; only the persisted name is tried then.
    async fn recorded_link(&self, resource: &PeeringResource) -> OverlayResult<Option<String>> {
        let status = &resource.status;
        if let Some(index) = status.tunnel_iface_index {
            match self.kernel.link_by_index(index).await? {
                Some(link) if status.tunnel_iface_name.as_deref().map_or(true, |n| n == link.name) => {
                    return Ok(Some(link.name));
                }
                Some(link) => {
                    warn!(key = %resource.key(), index, found = %link.name, "Recorded link index reused");
                }
                None => {}
            }
        }
        Ok(status.tunnel_iface_name.clone())
    }

    /// Another peering whose Status records `link` by name.
    async fn link_owner(&self, key: &ResourceKey, link: &Link) -> OverlayResult<Option<ResourceKey>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|other| (other.key(), other.status.tunnel_iface_name))
            .find(|(other, name)| other != key && name.as_deref() == Some(link.name.as_str()))
            .map(|(other, _)| other))
    }

    async fn delete_link_tolerant(&self, name: &str) -> OverlayResult<bool> {
        match self.kernel.delete_link(name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{sample_peering, FakeKernel, FlakyStore};
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    struct Harness {
        kernel: Arc<FakeKernel>,
        store: Arc<FlakyStore>,
        mgr: TunnelMgr,
    }

    fn harness(endpoint: LocalEndpoint) -> Harness {
        let kernel = Arc::new(FakeKernel::new());
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let routes = Arc::new(RouteMgr::new(kernel.clone()));
        let mgr = TunnelMgr::new(kernel.clone(), store.clone(), routes, endpoint);
        Harness { kernel, store, mgr }
    }

    fn fixed() -> LocalEndpoint {
        LocalEndpoint::Fixed("198.51.100.4".parse().unwrap())
    }

    #[test]
    fn test_choose_local_private() {
        let peer: Ipv4Addr = "192.168.100.1".parse().unwrap();
        assert_eq!(
            choose_local_private(&TUNNEL_ADDRESS_POOL, peer).unwrap(),
            "192.168.100.2".parse::<Ipv4Addr>().unwrap()
        );
        let other: Ipv4Addr = "192.168.100.9".parse().unwrap();
        assert_eq!(
            choose_local_private(&TUNNEL_ADDRESS_POOL, other).unwrap(),
            TUNNEL_ADDRESS_POOL[0]
        );
        let err = choose_local_private(&[peer], peer).unwrap_err();
        assert!(matches!(err, OverlayError::AddressPoolExhausted { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_install_persists_identity() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();

        let stored = h.mgr.install(&created).await.unwrap();
        let status = &stored.status;
        assert_eq!(status.local_tunnel_public_ip, Some("198.51.100.4".parse().unwrap()));
        assert_eq!(status.local_tunnel_private_ip, Some("192.168.100.2".parse().unwrap()));
        assert_eq!(status.remote_tunnel_public_ip, Some(created.spec.peer_gateway_ip));
        let name = status.tunnel_iface_name.clone().unwrap();
        assert_eq!(name, tunnel_name_for(&created.key()));

        let link = h.kernel.link(&name).unwrap();
        assert_eq!(status.tunnel_iface_index, Some(link.index));
        assert!(link.up);
        // Host route to the peer plus the pod route
        assert_eq!(h.kernel.routes_for(&name).len(), 2);
    }

    #[tokio::test]
    async fn test_install_removes_unrecorded_link() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        let name = tunnel_name_for(&created.key());
        let leftover = h.kernel.add_link_with_address(&name, "192.168.100.2/32".parse().unwrap());

        let stored = h.mgr.install(&created).await.unwrap();
        assert_eq!(h.kernel.link_count(), 1);
        assert_ne!(stored.status.tunnel_iface_index, Some(leftover.index));
    }

    #[tokio::test]
    async fn test_install_keeps_link_recorded_by_other_peering() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        let name = tunnel_name_for(&created.key());
        let owned = h.kernel.add_link_with_address(&name, "192.168.100.2/32".parse().unwrap());

        let other = h.store.inner().create(sample_peering("peer-b")).unwrap();
        let mut recorded = other.clone();
        recorded.status.tunnel_iface_name = Some(name.clone());
        recorded.status.tunnel_iface_index = Some(owned.index);
        h.store.update_status(&recorded).await.unwrap();

        let err = h.mgr.install(&created).await.unwrap_err();
        assert!(matches!(err, OverlayError::TunnelNameCollision { ref owner, .. } if owner == "default/peer-b"));
        assert!(err.is_fatal());
        assert_eq!(h.kernel.link(&name).map(|l| l.index), Some(owned.index));
        assert_eq!(h.kernel.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_install_twice_is_idempotent() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();

        let first = h.mgr.install(&created).await.unwrap();
        let second = h.mgr.install(&first).await.unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(h.kernel.link_count(), 1);
    }

    #[tokio::test]
    async fn test_status_write_failure_deletes_link() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        h.store.fail_status_updates(1);

        assert!(h.mgr.install(&created).await.is_err());
        assert_eq!(h.kernel.link_count(), 0);

        // Next attempt succeeds from scratch
        let stored = h.mgr.install(&created).await.unwrap();
        assert!(stored.status.has_tunnel_identity());
        assert_eq!(h.kernel.link_count(), 1);
    }

    #[tokio::test]
    async fn test_device_endpoint_discovery() {
        let h = harness(LocalEndpoint::Device("eth0".to_string()));
        let err = h.mgr.local_public_ip().await.unwrap_err();
        assert!(matches!(err, OverlayError::AddressUnavailable { .. }));

        h.kernel.add_link_with_address("eth0", "198.51.100.9/24".parse().unwrap());
        assert_eq!(
            h.mgr.local_public_ip().await.unwrap(),
            "198.51.100.9".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_unspecified_node_address_unavailable() {
        let h = harness(LocalEndpoint::Fixed(Ipv4Addr::UNSPECIFIED));
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        let err = h.mgr.install(&created).await.unwrap_err();
        assert!(matches!(err, OverlayError::AddressUnavailable { .. }));
        assert_eq!(h.kernel.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_link() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        let stored = h.mgr.install(&created).await.unwrap();

        let name = stored.status.tunnel_iface_name.clone().unwrap();
        h.kernel.remove_link_externally(&name);
        assert!(!h.mgr.is_present(&stored).await.unwrap());
        assert!(!h.mgr.teardown(&stored).await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_skips_reused_index() {
        let h = harness(fixed());
        let created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        let mut stored = h.mgr.install(&created).await.unwrap();

        let other = h.kernel.add_link_with_address("eth1", "10.9.9.9/24".parse().unwrap());
        let name = stored.status.tunnel_iface_name.clone().unwrap();
        h.kernel.remove_link_externally(&name);
        stored.status.tunnel_iface_index = Some(other.index);

        assert!(!h.mgr.teardown(&stored).await.unwrap());
        assert!(h.kernel.link("eth1").is_some());
    }

    #[tokio::test]
    async fn test_uninstall_clears_finalizer_after_teardown() {
        let h = harness(fixed());
        let mut created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        created.metadata.add_finalizer(TUNNEL_FINALIZER);
        let with_finalizer = h.store.update(&created).await.unwrap();
        let stored = h.mgr.install(&with_finalizer).await.unwrap();

        h.store.inner().request_delete(&stored.key()).unwrap();
        let deleting = h.store.get(&stored.key()).await.unwrap();
        h.mgr.uninstall(&deleting).await.unwrap();

        assert_eq!(h.kernel.link_count(), 0);
        assert!(!h.store.inner().contains(&stored.key()));
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_finalizer() {
        let h = harness(fixed());
        let mut created = h.store.inner().create(sample_peering("peer-a")).unwrap();
        created.metadata.add_finalizer(TUNNEL_FINALIZER);
        let with_finalizer = h.store.update(&created).await.unwrap();
        let stored = h.mgr.install(&with_finalizer).await.unwrap();

        h.store.inner().request_delete(&stored.key()).unwrap();
        let deleting = h.store.get(&stored.key()).await.unwrap();
        h.kernel.fail_next("delete_link");

        assert!(h.mgr.uninstall(&deleting).await.is_err());
        let still = h.store.get(&stored.key()).await.unwrap();
        assert!(still.metadata.has_finalizer(TUNNEL_FINALIZER));
        assert_eq!(h.kernel.link_count(), 1);
    }
}
