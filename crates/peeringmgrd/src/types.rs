//! Declared peering resource model and fixed protocol parameters

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use serde::{Deserialize, Serialize};

/// Time-to-live of the encapsulating header; the tunnel is one logical hop
pub const TUNNEL_TTL: u8 = 255;

/// Tunnel private address pool; each end takes the member the peer does not use
pub const TUNNEL_ADDRESS_POOL: [Ipv4Addr; 2] = [
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 100, 2),
];

/// Prefix of tunnel interface names
pub const TUNNEL_NAME_PREFIX: &str = "gre-";

/// Kernel limit on interface name length (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// Finalizer blocking removal of a peering until its tunnel is torn down
pub const TUNNEL_FINALIZER: &str = "peering.overlaymgr.io/tunnel";

/// Namespace assumed for keys without one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource identity ("namespace/name")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses "namespace/name", or a bare "name" in the default namespace.
    pub fn parse(s: &str) -> OverlayResult<Self> {
        let (namespace, name) = s.split_once('/').unwrap_or((DEFAULT_NAMESPACE, s));
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(OverlayError::invalid_config(
                "key",
                format!("Invalid resource key: {}", s),
            ));
        }
        Ok(Self::new(namespace, name))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Derives the tunnel interface name for a peering.
///
/// CRC-32 of "namespace/name", so the name is stable across restarts and
/// toolchains. Distinct keys can still share a name; installers must check
/// ownership before touching an existing link. Only used at install time;
/// teardown always uses the persisted name.
pub fn tunnel_name_for(key: &ResourceKey) -> String {
    let digest: u32 = crc32fast::hash(key.to_string().as_bytes());
    let name = format!("{}{:08x}", TUNNEL_NAME_PREFIX, digest);
    debug_assert!(name.len() <= MAX_IFNAME_LEN);
    name
}

/// Immutable intent produced by the peering negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringSpec {
    /// Peer gateway public address (remote tunnel endpoint)
    pub peer_gateway_ip: Ipv4Addr,
    /// Peer tunnel private address
    pub peer_tunnel_private_ip: Ipv4Addr,
    /// Peer pod network
    pub pod_cidr: Ipv4Net,
    /// Peer pod network overlaps ours and must be reached through a remapped CIDR
    #[serde(default)]
    pub nat_required: bool,
}

/// Status owned by the engine once the peering is admitted.
///
/// This is the only durable record of what was installed in the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_tunnel_private_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_tunnel_public_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_tunnel_private_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_tunnel_public_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_iface_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_iface_name: Option<String>,
    /// Assigned by the address remapping collaborator, only meaningful with NAT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remapped_pod_cidr: Option<Ipv4Net>,
}

impl PeeringStatus {
    /// Returns true if a tunnel interface identity has been persisted.
    pub fn has_tunnel_identity(&self) -> bool {
        self.tunnel_iface_index.is_some() || self.tunnel_iface_name.is_some()
    }

    /// Forgets everything the tunnel install wrote.
    pub fn clear_tunnel(&mut self) {
        self.local_tunnel_private_ip = None;
        self.local_tunnel_public_ip = None;
        self.remote_tunnel_private_ip = None;
        self.remote_tunnel_public_ip = None;
        self.tunnel_iface_index = None;
        self.tunnel_iface_name = None;
    }
}

/// Resource metadata relevant to reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    /// Optimistic concurrency token, bumped by the store on every write
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Soft deletion marker
    #[serde(default)]
    pub deletion_requested: bool,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ResourceMeta {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds `finalizer`; returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes `finalizer`; returns false if it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

/// Declared peering resource: the unit of intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringResource {
    pub metadata: ResourceMeta,
    pub spec: PeeringSpec,
    #[serde(default)]
    pub status: PeeringStatus,
}

impl PeeringResource {
    pub fn new(key: &ResourceKey, spec: PeeringSpec) -> Self {
        Self {
            metadata: ResourceMeta {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                ..Default::default()
            },
            spec,
            status: PeeringStatus::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_requested
    }

    /// Network the peer's pods are reached at from this side.
    ///
    /// With NAT this is the remapped CIDR, which may not be assigned yet.
    pub fn route_destination(&self) -> Option<Ipv4Net> {
        if self.spec.nat_required {
            self.status.remapped_pod_cidr
        } else {
            Some(self.spec.pod_cidr)
        }
    }

    /// Returns true if the Spec no longer matches the tunnel persisted in Status.
    pub fn spec_drifted(&self) -> bool {
        self.status.has_tunnel_identity()
            && (self.status.remote_tunnel_public_ip != Some(self.spec.peer_gateway_ip)
                || self.status.remote_tunnel_private_ip != Some(self.spec.peer_tunnel_private_ip))
    }
}

/// Cluster node as returned by the node inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    /// Internal address reachable from the other nodes
    pub internal_ip: Ipv4Addr,
    /// Marked non-physical (e.g. a virtual kubelet); never a VTEP
    #[serde(default, rename = "virtual")]
    pub virtual_node: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, internal_ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            internal_ip,
            virtual_node: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_virtual(mut self, virtual_node: bool) -> Self {
        self.virtual_node = virtual_node;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Matches "key" (presence) or "key=value" selectors; empty matches all.
    pub fn matches_selector(&self, selector: &str) -> bool {
        if selector.is_empty() {
            return true;
        }
        match selector.split_once('=') {
            Some((k, v)) => self.labels.get(k).is_some_and(|value| value == v),
            None => self.labels.contains_key(selector),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PeeringSpec {
        PeeringSpec {
            peer_gateway_ip: "203.0.113.7".parse().unwrap(),
            peer_tunnel_private_ip: "192.168.100.1".parse().unwrap(),
            pod_cidr: "10.244.0.0/16".parse().unwrap(),
            nat_required: false,
        }
    }

    #[test]
    fn test_resource_key_parse() {
        let key = ResourceKey::parse("tenant-a/peer-b").unwrap();
        assert_eq!(key, ResourceKey::new("tenant-a", "peer-b"));
        assert_eq!(key.to_string(), "tenant-a/peer-b");

        let key = ResourceKey::parse("peer-b").unwrap();
        assert_eq!(key.namespace, "default");

        assert!(ResourceKey::parse("/peer").is_err());
        assert!(ResourceKey::parse("a/b/c").is_err());
    }

    #[test]
    fn test_tunnel_name_fits_ifnamsiz() {
        let key = ResourceKey::new("a-very-long-namespace-name", "a-very-long-peering-name");
        let name = tunnel_name_for(&key);
        assert!(name.starts_with(TUNNEL_NAME_PREFIX));
        assert!(name.len() <= MAX_IFNAME_LEN);
        assert_eq!(name, tunnel_name_for(&key));
        assert_ne!(name, tunnel_name_for(&ResourceKey::new("default", "other")));
    }

    #[test]
    fn test_tunnel_name_is_stable() {
        // CRC-32 (IEEE) of "default/peer-a"
        assert_eq!(tunnel_name_for(&ResourceKey::new("default", "peer-a")), "gre-a1193f09");
        assert_eq!(
            tunnel_name_for(&ResourceKey::parse("peer-a").unwrap()),
            tunnel_name_for(&ResourceKey::new("default", "peer-a"))
        );
    }

    #[test]
    fn test_finalizers() {
        let mut meta = ResourceMeta::default();
        assert!(meta.add_finalizer(TUNNEL_FINALIZER));
        assert!(!meta.add_finalizer(TUNNEL_FINALIZER));
        assert!(meta.has_finalizer(TUNNEL_FINALIZER));
        assert!(meta.remove_finalizer(TUNNEL_FINALIZER));
        assert!(!meta.remove_finalizer(TUNNEL_FINALIZER));
    }

    #[test]
    fn test_route_destination() {
        let key = ResourceKey::new("default", "peer");
        let mut resource = PeeringResource::new(&key, spec());
        assert_eq!(resource.route_destination(), Some("10.244.0.0/16".parse().unwrap()));

        resource.spec.nat_required = true;
        assert_eq!(resource.route_destination(), None);

        resource.status.remapped_pod_cidr = Some("10.250.0.0/16".parse().unwrap());
        assert_eq!(resource.route_destination(), Some("10.250.0.0/16".parse().unwrap()));
    }

    #[test]
    fn test_spec_drift() {
        let key = ResourceKey::new("default", "peer");
        let mut resource = PeeringResource::new(&key, spec());
        assert!(!resource.spec_drifted());

        resource.status.tunnel_iface_index = Some(12);
        resource.status.remote_tunnel_public_ip = Some(resource.spec.peer_gateway_ip);
        resource.status.remote_tunnel_private_ip = Some(resource.spec.peer_tunnel_private_ip);
        assert!(!resource.spec_drifted());

        resource.spec.peer_gateway_ip = "203.0.113.8".parse().unwrap();
        assert!(resource.spec_drifted());
    }

    #[test]
    fn test_status_serde_omits_empty() {
        let status = PeeringStatus {
            tunnel_iface_index: Some(7),
            tunnel_iface_name: Some("gre-0000abcd".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"tunnelIfaceIndex":7,"tunnelIfaceName":"gre-0000abcd"}"#);
    }

    #[test]
    fn test_node_selector() {
        let node = NodeInfo::new("worker-1", "10.0.0.11".parse().unwrap())
            .with_label("overlaymgr.io/vtep", "true");
        assert!(node.matches_selector(""));
        assert!(node.matches_selector("overlaymgr.io/vtep"));
        assert!(node.matches_selector("overlaymgr.io/vtep=true"));
        assert!(!node.matches_selector("overlaymgr.io/vtep=false"));
        assert!(!node.matches_selector("other"));
    }
}
