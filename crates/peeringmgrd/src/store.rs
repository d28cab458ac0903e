//! Declared resource store and node inventory
//!
//! The engine reads and writes declared peerings through [`PeeringStore`]
//! and enumerates cluster nodes through [`NodeInventory`]. The in-process
//! implementations here back the daemon's manifest mode and the tests.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use overlaymgr_common::{OverlayError, OverlayResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{NodeInfo, PeeringResource, PeeringSpec, ResourceKey};

/// Declared peering records with optimistic concurrency.
///
/// Writes carry the `resource_version` the caller read; a mismatch is
/// [`OverlayError::Conflict`] and a missing record is
/// [`OverlayError::ResourceNotFound`].
#[async_trait]
pub trait PeeringStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> OverlayResult<PeeringResource>;

    /// All declared peerings, including those marked for deletion.
    async fn list(&self) -> OverlayResult<Vec<PeeringResource>>;

    /// Writes metadata (finalizers). Clearing the last finalizer of a record
    /// marked for deletion removes it.
    async fn update(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource>;

    /// Writes Status only.
    async fn update_status(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource>;
}

/// Cluster node listing.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Nodes matching a label selector ("key" or "key=value"; empty matches all).
    async fn list_nodes(&self, selector: &str) -> OverlayResult<Vec<NodeInfo>>;
}

/// In-process [`PeeringStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ResourceKey, PeeringResource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new peering at version 1.
    pub fn create(&self, mut resource: PeeringResource) -> OverlayResult<PeeringResource> {
        let key = resource.key();
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(OverlayError::already_exists("peering", key.to_string()));
        }
        resource.metadata.resource_version = 1;
        resource.metadata.deletion_requested = false;
        records.insert(key.clone(), resource.clone());
        debug!(key = %key, "Peering created");
        Ok(resource)
    }

    /// Requests deletion. Without finalizers the record goes immediately and
    /// true is returned; otherwise it is only marked.
    pub fn request_delete(&self, key: &ResourceKey) -> OverlayResult<bool> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| OverlayError::ResourceNotFound {
                key: key.to_string(),
            })?;

        if record.metadata.finalizers.is_empty() {
            records.remove(key);
            debug!(key = %key, "Peering removed");
            return Ok(true);
        }
        record.metadata.deletion_requested = true;
        record.metadata.resource_version += 1;
        debug!(key = %key, finalizers = ?record.metadata.finalizers, "Peering marked for deletion");
        Ok(false)
    }

    /// Replaces the Spec, as the negotiation collaborator does.
    pub fn update_spec(&self, key: &ResourceKey, spec: PeeringSpec) -> OverlayResult<PeeringResource> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| OverlayError::ResourceNotFound {
                key: key.to_string(),
            })?;
        record.spec = spec;
        record.metadata.resource_version += 1;
        Ok(record.clone())
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.records.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.records.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn checked<'a>(
        records: &'a mut BTreeMap<ResourceKey, PeeringResource>,
        resource: &PeeringResource,
    ) -> OverlayResult<&'a mut PeeringResource> {
        let key = resource.key();
        let stored = records
            .get_mut(&key)
            .ok_or_else(|| OverlayError::ResourceNotFound {
                key: key.to_string(),
            })?;
        if stored.metadata.resource_version != resource.metadata.resource_version {
            return Err(OverlayError::Conflict {
                key: key.to_string(),
            });
        }
        Ok(stored)
    }
}

#[async_trait]
impl PeeringStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> OverlayResult<PeeringResource> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| OverlayError::ResourceNotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self) -> OverlayResult<Vec<PeeringResource>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn update(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource> {
        let mut records = self.records.write();
        let stored = Self::checked(&mut records, resource)?;

        stored.metadata.finalizers = resource.metadata.finalizers.clone();
        stored.metadata.resource_version += 1;
        let updated = stored.clone();

        if updated.metadata.deletion_requested && updated.metadata.finalizers.is_empty() {
            records.remove(&updated.key());
            info!(key = %updated.key(), "Last finalizer cleared, peering removed");
        }
        Ok(updated)
    }

    async fn update_status(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource> {
        let mut records = self.records.write();
        let stored = Self::checked(&mut records, resource)?;

        stored.status = resource.status.clone();
        stored.metadata.resource_version += 1;
        Ok(stored.clone())
    }
}

/// [`NodeInventory`] over a fixed node list.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    nodes: Vec<NodeInfo>,
}

impl StaticInventory {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeInventory for StaticInventory {
    async fn list_nodes(&self, selector: &str) -> OverlayResult<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.matches_selector(selector))
            .cloned()
            .collect())
    }
}

/// Declared peerings and node inventory loaded from a YAML file.
///
/// ```yaml
/// peerings:
///   - metadata: { namespace: default, name: cluster-b }
///     spec:
///       peerGatewayIp: 203.0.113.7
///       peerTunnelPrivateIp: 192.168.100.1
///       podCidr: 10.245.0.0/16
/// nodes:
///   - { name: worker-1, internalIp: 10.0.0.11 }
///   - { name: vk-1, internalIp: 10.0.0.90, virtual: true }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub peerings: Vec<PeeringResource>,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> OverlayResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| OverlayError::invalid_config("manifest", e.to_string()))
    }

    pub fn load(path: &Path) -> OverlayResult<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            OverlayError::invalid_config("manifest", format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Seeds a store and an inventory from the manifest.
    pub fn into_parts(self) -> OverlayResult<(MemoryStore, StaticInventory)> {
        let store = MemoryStore::new();
        for peering in self.peerings {
            store.create(peering)?;
        }
        Ok((store, StaticInventory::new(self.nodes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TUNNEL_FINALIZER;
    use pretty_assertions::assert_eq;

    fn peering(name: &str) -> PeeringResource {
        PeeringResource::new(
            &ResourceKey::new("default", name),
            PeeringSpec {
                peer_gateway_ip: "203.0.113.7".parse().unwrap(),
                peer_tunnel_private_ip: "192.168.100.1".parse().unwrap(),
                pod_cidr: "10.245.0.0/16".parse().unwrap(),
                nat_required: false,
            },
        )
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(peering("a")).unwrap();

        let mut first = created.clone();
        first.status.tunnel_iface_index = Some(10);
        let updated = store.update_status(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let err = store.update_status(&created).await.unwrap_err();
        assert!(matches!(err, OverlayError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = MemoryStore::new();
        let err = store.get(&ResourceKey::new("default", "x")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.update(&peering("x")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_finalizer_blocks_removal() {
        let store = MemoryStore::new();
        let mut resource = store.create(peering("a")).unwrap();
        resource.metadata.add_finalizer(TUNNEL_FINALIZER);
        store.update(&resource).await.unwrap();

        let key = resource.key();
        assert!(!store.request_delete(&key).unwrap());
        let marked = store.get(&key).await.unwrap();
        assert!(marked.is_deleting());

        let mut cleared = marked.clone();
        cleared.metadata.remove_finalizer(TUNNEL_FINALIZER);
        store.update(&cleared).await.unwrap();
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_delete_without_finalizer_is_immediate() {
        let store = MemoryStore::new();
        let resource = store.create(peering("a")).unwrap();
        assert!(store.request_delete(&resource.key()).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = MemoryStore::new();
        store.create(peering("a")).unwrap();
        assert!(store.create(peering("a")).unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_into_store() {
        let manifest = Manifest::from_yaml(
            r#"
peerings:
  - metadata: { name: cluster-b }
    spec:
      peerGatewayIp: 203.0.113.7
      peerTunnelPrivateIp: 192.168.100.1
      podCidr: 10.245.0.0/16
      natRequired: true
nodes:
  - { name: worker-1, internalIp: 10.0.0.11, labels: { role: gw } }
  - { name: vk-1, internalIp: 10.0.0.90, virtual: true }
"#,
        )
        .unwrap();

        let (store, inventory) = manifest.into_parts().unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        let key = ResourceKey::new("default", "cluster-b");
        let resource = store.get(&key).await.unwrap();
        assert!(resource.spec.nat_required);
        assert_eq!(resource.metadata.resource_version, 1);

        assert_eq!(inventory.list_nodes("").await.unwrap().len(), 2);
        let gw = inventory.list_nodes("role=gw").await.unwrap();
        assert_eq!(gw.len(), 1);
        assert_eq!(gw[0].name, "worker-1");
    }

    #[test]
    fn test_manifest_rejects_malformed_address() {
        let err = Manifest::from_yaml(
            r#"
peerings:
  - metadata: { name: bad }
    spec: { peerGatewayIp: 203.0.113, peerTunnelPrivateIp: 192.168.100.1, podCidr: 10.0.0.0/8 }
"#,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_manifest_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"nodes:\n  - { name: n1, internalIp: 10.0.0.1 }\n")
            .unwrap();
        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.nodes.len(), 1);
        assert!(Manifest::load(Path::new("/nonexistent/manifest.yaml")).is_err());
    }
}
