//! Policy Route Manager
//!
//! Converges the routing table of one egress link towards exactly one route
//! per peering destination. The kernel table is the source of truth; the
//! [`RouteCache`] only remembers what was installed so the route can be
//! removed when the peering disappears.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::gate;
use crate::kernel::{NetKernel, Route};
use crate::types::{PeeringResource, ResourceKey};

/// Process-local shadow of one installed route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCacheEntry {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub link: String,
    pub link_index: u32,
    pub onlink: bool,
}

impl RouteCacheEntry {
    fn to_route(&self) -> Route {
        Route {
            destination: self.destination,
            gateway: self.gateway,
            link: self.link.clone(),
            onlink: self.onlink,
        }
    }
}

/// Route cache keyed by peering identity.
///
/// The lock is never held across a kernel call.
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: Mutex<HashMap<ResourceKey, RouteCacheEntry>>,
}

impl RouteCache {
    pub fn get(&self, key: &ResourceKey) -> Option<RouteCacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: ResourceKey, entry: RouteCacheEntry) {
        self.entries.lock().insert(key, entry);
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<RouteCacheEntry> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Desired route for one peering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub link: String,
    /// Install with the on-link flag (gateway only reachable through `link`)
    pub onlink: bool,
}

impl RouteRequest {
    /// Pod-network route of a peering: via the remote tunnel address,
    /// flagged on-link because tunnel ends share no subnet.
    ///
    /// `None` until Status names the tunnel and the destination is known.
    pub fn for_peering(resource: &PeeringResource) -> Option<Self> {
        Some(Self {
            destination: resource.route_destination()?,
            gateway: Some(resource.status.remote_tunnel_private_ip?),
            link: resource.status.tunnel_iface_name.clone()?,
            onlink: true,
        })
    }

    fn to_route(&self) -> Route {
        Route {
            destination: self.destination,
            gateway: self.gateway,
            link: self.link.clone(),
            onlink: self.onlink,
        }
    }
}

/// What a convergence pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Readiness gate closed; nothing touched
    NotReady,
    /// Desired route already present
    Unchanged,
    /// No route for the destination existed
    Installed,
    /// One differing route was replaced
    Replaced,
    /// Several routes for the destination were replaced by one
    Healed { removed: usize },
}

/// Policy Route Manager
pub struct RouteMgr {
    kernel: Arc<dyn NetKernel>,
    cache: RouteCache,
}

impl RouteMgr {
    pub fn new(kernel: Arc<dyn NetKernel>) -> Self {
        Self {
            kernel,
            cache: RouteCache::default(),
        }
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }

    /// Converges the routes of `request.link` to exactly one route for
    /// `request.destination`.
    ///
    /// A resource failing the readiness gate is not an error: nothing is read
    /// or written and [`RouteOutcome::NotReady`] is returned.
    pub async fn converge(
        &self,
        resource: &PeeringResource,
        request: &RouteRequest,
    ) -> OverlayResult<RouteOutcome> {
        let key = resource.key();
        if !gate::is_route_ready(resource) {
            debug!(
                key = %key,
                missing = gate::missing_field(resource).unwrap_or("unknown"),
                "Peering not route-ready, skipping route convergence"
            );
            return Ok(RouteOutcome::NotReady);
        }

        let link = self
            .kernel
            .link_by_name(&request.link)
            .await?
            .ok_or_else(|| OverlayError::LinkNotFound {
                name: request.link.clone(),
            })?;

        let desired = request.to_route();
        let existing: Vec<Route> = self
            .kernel
            .list_routes(&link.name)
            .await?
            .into_iter()
            .filter(|r| r.destination == desired.destination)
            .collect();

        let outcome = match existing.as_slice() {
            [] => {
                self.kernel.add_route(&desired).await?;
                RouteOutcome::Installed
            }
            [current] if current.same_as(&desired) => RouteOutcome::Unchanged,
            [current] => {
                info!(key = %key, stale = %current, desired = %desired, "Replacing route");
                self.delete_tolerant(current).await?;
                self.kernel.add_route(&desired).await?;
                RouteOutcome::Replaced
            }
            stale => {
                warn!(
                    key = %key,
                    destination = %desired.destination,
                    link = %desired.link,
                    count = stale.len(),
                    "Multiple routes for destination, reinstalling"
                );
                for route in stale {
                    self.delete_tolerant(route).await?;
                }
                self.kernel.add_route(&desired).await?;
                RouteOutcome::Healed {
                    removed: stale.len(),
                }
            }
        };

        self.cache.insert(
            key.clone(),
            RouteCacheEntry {
                destination: desired.destination,
                gateway: desired.gateway,
                link: link.name,
                link_index: link.index,
                onlink: desired.onlink,
            },
        );

        if outcome != RouteOutcome::Unchanged {
            info!(key = %key, route = %desired, outcome = ?outcome, "Route converged");
        }
        Ok(outcome)
    }

    /// Removes the cached route of a peering. Without a cache entry there is
    /// nothing to remove. Returns true if a route was deleted.
    pub async fn remove(&self, key: &ResourceKey) -> OverlayResult<bool> {
        let Some(entry) = self.cache.get(key) else {
            debug!(key = %key, "No cached route");
            return Ok(false);
        };

        let route = entry.to_route();
        let deleted = match self.kernel.delete_route(&route).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        self.cache.remove(key);
        info!(key = %key, route = %route, deleted, "Route removed");
        Ok(deleted)
    }

    /// Drops the cache entry only; used once the egress link itself is gone.
    pub fn forget(&self, key: &ResourceKey) {
        self.cache.remove(key);
    }

    async fn delete_tolerant(&self, route: &Route) -> OverlayResult<()> {
        match self.kernel.delete_route(route).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
