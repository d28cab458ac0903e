//! Peering reconciler - ties the managers to the declared peering lifecycle

use std::sync::Arc;

use async_trait::async_trait;
use overlaymgr_common::{OverlayError, OverlayResult};
use overlaymgr_orch::{Notification, Reconcile, TaskError, TaskResult};
use tracing::{debug, info, warn};

use crate::firewall::{FirewallMgr, FirewallTool};
use crate::gate;
use crate::kernel::NetKernel;
use crate::route_mgr::{RouteMgr, RouteRequest};
use crate::store::PeeringStore;
use crate::tunnel_mgr::{LocalEndpoint, TunnelMgr};
use crate::types::{PeeringResource, ResourceKey, TUNNEL_FINALIZER};

/// What one reconciliation ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Record is gone; any cached route was removed
    Removed,
    /// Deletion finished and the finalizer was cleared
    Finalized,
    /// Tunnel present, routes wait for the readiness gate
    NotReady,
    /// Tunnel, route and firewall rules converged
    Converged,
    /// Duplicate firewall rules were deleted; another pass reinserts them
    FirewallPending,
}

/// Maps the engine's error taxonomy onto dispatcher outcomes.
pub fn to_task_error(err: OverlayError) -> TaskError {
    if err.is_fatal() {
        TaskError::invalid_entry(err.to_string())
    } else if err.is_retryable() {
        TaskError::need_retry(err.to_string())
    } else {
        TaskError::failed(err.to_string())
    }
}

/// Reconciler for declared peerings.
pub struct PeeringReconciler {
    store: Arc<dyn PeeringStore>,
    tunnels: TunnelMgr,
    routes: Arc<RouteMgr>,
    firewall: FirewallMgr,
}

impl PeeringReconciler {
    pub fn new(
        store: Arc<dyn PeeringStore>,
        kernel: Arc<dyn NetKernel>,
        firewall: Arc<dyn FirewallTool>,
        endpoint: LocalEndpoint,
    ) -> Self {
        let routes = Arc::new(RouteMgr::new(kernel.clone()));
        Self {
            tunnels: TunnelMgr::new(kernel, store.clone(), routes.clone(), endpoint),
            store,
            routes,
            firewall: FirewallMgr::new(firewall),
        }
    }

    pub fn routes(&self) -> &RouteMgr {
        &self.routes
    }

    pub fn tunnels(&self) -> &TunnelMgr {
        &self.tunnels
    }

    pub fn firewall(&self) -> &FirewallMgr {
        &self.firewall
    }

    /// Converges kernel state for one peering identity.
    pub async fn reconcile_key(&self, key: &ResourceKey) -> OverlayResult<ReconcileOutcome> {
        let resource = match self.store.get(key).await {
            Ok(resource) => resource,
            Err(OverlayError::ResourceNotFound { .. }) => {
                self.routes.remove(key).await?;
                return Ok(ReconcileOutcome::Removed);
            }
            Err(e) => return Err(e),
        };

        if resource.is_deleting() {
            return self.finalize(&resource).await;
        }

        let resource = self.ensure_finalizer(resource).await?;
        let resource = self.ensure_tunnel(resource).await?;

        if !gate::is_route_ready(&resource) {
            debug!(
                key = %key,
                missing = gate::missing_field(&resource).unwrap_or("unknown"),
                "Waiting for peering status"
            );
            return Ok(ReconcileOutcome::NotReady);
        }

        let request = RouteRequest::for_peering(&resource).ok_or_else(|| {
            OverlayError::internal(format!("route-ready peering {} has no route", key))
        })?;
        self.routes.converge(&resource, &request).await?;

        let rules_converged = self
            .firewall
            .ensure_peering(&request.link, request.destination)
            .await?;
        if !rules_converged {
            return Ok(ReconcileOutcome::FirewallPending);
        }
        Ok(ReconcileOutcome::Converged)
    }

    /// Deletion path: rules, route, tunnel, then the finalizer.
    async fn finalize(&self, resource: &PeeringResource) -> OverlayResult<ReconcileOutcome> {
        let key = resource.key();
        if !resource.metadata.has_finalizer(TUNNEL_FINALIZER) {
            debug!(key = %key, "Deleting peering carries no finalizer");
            return Ok(ReconcileOutcome::Finalized);
        }

        if let Some(request) = RouteRequest::for_peering(resource) {
            self.firewall
                .remove_peering(&request.link, request.destination)
                .await?;
        }
        self.routes.remove(&key).await?;
        self.tunnels.uninstall(resource).await?;

        info!(key = %key, "Peering finalized");
        Ok(ReconcileOutcome::Finalized)
    }

    async fn ensure_finalizer(&self, resource: PeeringResource) -> OverlayResult<PeeringResource> {
        if resource.metadata.has_finalizer(TUNNEL_FINALIZER) {
            return Ok(resource);
        }
        let mut updated = resource;
        updated.metadata.add_finalizer(TUNNEL_FINALIZER);
        let stored = self.store.update(&updated).await?;
        debug!(key = %stored.key(), "Finalizer added");
        Ok(stored)
    }

    /// Installs the tunnel, reinstalling it when the Spec drifted from the
    /// persisted identity or the recorded link vanished.
    async fn ensure_tunnel(&self, resource: PeeringResource) -> OverlayResult<PeeringResource> {
        let key = resource.key();
        let mut resource = resource;

        if resource.status.has_tunnel_identity() {
            let reason = if resource.spec_drifted() {
                Some("peer endpoint changed")
            } else if !self.tunnels.is_present(&resource).await? {
                Some("recorded tunnel link missing")
            } else {
                None
            };

            if let Some(reason) = reason {
                warn!(key = %key, reason, "Reinstalling tunnel");
                if let Some(request) = RouteRequest::for_peering(&resource) {
                    self.firewall
                        .remove_peering(&request.link, request.destination)
                        .await?;
                }
                self.tunnels.teardown(&resource).await?;
                self.routes.forget(&key);
                resource.status.clear_tunnel();
                resource = self.store.update_status(&resource).await?;
            }
        }

        self.tunnels.install(&resource).await
    }
}

#[async_trait]
impl Reconcile for PeeringReconciler {
    fn name(&self) -> &str {
        "peering"
    }

    async fn reconcile(&self, notification: &Notification) -> TaskResult<()> {
        let key = ResourceKey::parse(&notification.key).map_err(to_task_error)?;

        match self.reconcile_key(&key).await.map_err(to_task_error)? {
            ReconcileOutcome::FirewallPending => Err(TaskError::need_retry(
                "duplicate firewall rules removed, reinsert pending",
            )),
            outcome => {
                debug!(key = %key, op = %notification.op, outcome = ?outcome, "Peering reconciled");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{sample_peering, FakeFirewall, FakeKernel};
    use crate::store::MemoryStore;
    use overlaymgr_orch::TaskStatus;

    struct Harness {
        kernel: Arc<FakeKernel>,
        store: Arc<MemoryStore>,
        reconciler: PeeringReconciler,
    }

    fn harness() -> Harness {
        let kernel = Arc::new(FakeKernel::new());
        let store = Arc::new(MemoryStore::new());
        let reconciler = PeeringReconciler::new(
            store.clone(),
            kernel.clone(),
            Arc::new(FakeFirewall::new()),
            LocalEndpoint::Fixed("198.51.100.4".parse().unwrap()),
        );
        Harness {
            kernel,
            store,
            reconciler,
        }
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            to_task_error(OverlayError::AddressPoolExhausted {
                peer: "192.168.100.1".parse().unwrap()
            })
            .to_status(),
            TaskStatus::InvalidEntry
        );
        assert_eq!(
            to_task_error(OverlayError::LinkNotFound {
                name: "gre0".to_string()
            })
            .to_status(),
            TaskStatus::NeedRetry
        );
        assert_eq!(
            to_task_error(OverlayError::internal("boom")).to_status(),
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_first_reconcile_adds_finalizer_and_converges() {
        let h = harness();
        let created = h.store.create(sample_peering("peer-a")).unwrap();

        let outcome = h.reconciler.reconcile_key(&created.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);

        let stored = h.store.get(&created.key()).await.unwrap();
        assert!(stored.metadata.has_finalizer(TUNNEL_FINALIZER));
        assert!(gate::is_route_ready(&stored));
        assert_eq!(h.kernel.link_count(), 1);
        assert_eq!(h.reconciler.routes().cache().len(), 1);
    }

    #[tokio::test]
    async fn test_nat_peering_waits_for_remapped_cidr() {
        let h = harness();
        let mut peering = sample_peering("peer-nat");
        peering.spec.nat_required = true;
        let created = h.store.create(peering).unwrap();

        let outcome = h.reconciler.reconcile_key(&created.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotReady);
        assert!(h.reconciler.routes().cache().is_empty());

        let mut stored = h.store.get(&created.key()).await.unwrap();
        stored.status.remapped_pod_cidr = Some("10.250.1.0/24".parse().unwrap());
        h.store.update_status(&stored).await.unwrap();

        let outcome = h.reconciler.reconcile_key(&created.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);
        let cached = h.reconciler.routes().cache().get(&created.key()).unwrap();
        assert_eq!(cached.destination, "10.250.1.0/24".parse().unwrap());
    }

    #[tokio::test]
    async fn test_missing_record_is_removed() {
        let h = harness();
        let outcome = h
            .reconciler
            .reconcile_key(&ResourceKey::new("default", "gone"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Removed);
    }

    #[tokio::test]
    async fn test_malformed_key_is_invalid_entry() {
        let h = harness();
        let err = h
            .reconciler
            .reconcile(&Notification::changed("a/b/c"))
            .await
            .unwrap_err();
        assert_eq!(err.to_status(), TaskStatus::InvalidEntry);
    }

    #[tokio::test]
    async fn test_spec_change_reinstalls_tunnel() {
        let h = harness();
        let created = h.store.create(sample_peering("peer-a")).unwrap();
        h.reconciler.reconcile_key(&created.key()).await.unwrap();
        let before = h.store.get(&created.key()).await.unwrap();

        let mut spec = before.spec.clone();
        spec.peer_gateway_ip = "203.0.113.99".parse().unwrap();
        h.store.update_spec(&created.key(), spec).unwrap();

        let outcome = h.reconciler.reconcile_key(&created.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);

        let after = h.store.get(&created.key()).await.unwrap();
        assert_eq!(
            after.status.remote_tunnel_public_ip,
            Some("203.0.113.99".parse().unwrap())
        );
        assert_eq!(after.status.tunnel_iface_name, before.status.tunnel_iface_name);
        assert_ne!(after.status.tunnel_iface_index, before.status.tunnel_iface_index);
        assert_eq!(h.kernel.link_count(), 1);
    }

    #[tokio::test]
    async fn test_vanished_link_is_reinstalled() {
        let h = harness();
        let created = h.store.create(sample_peering("peer-a")).unwrap();
        h.reconciler.reconcile_key(&created.key()).await.unwrap();
        let before = h.store.get(&created.key()).await.unwrap();

        let name = before.status.tunnel_iface_name.clone().unwrap();
        h.kernel.remove_link_externally(&name);

        h.reconciler.reconcile_key(&created.key()).await.unwrap();
        assert!(h.kernel.link(&name).is_some());
        assert_eq!(h.kernel.routes_for(&name).len(), 2);
    }
}
