//! Route readiness gate
//!
//! A peering is route-ready once both tunnel ends are recorded in Status
//! and, when NAT is required, the remapped pod CIDR has been assigned.
//! Not being ready is not an error: route convergence simply does nothing.

use crate::types::PeeringResource;

/// Returns true if routes may be installed for this peering.
pub fn is_route_ready(resource: &PeeringResource) -> bool {
    let status = &resource.status;
    let tunnel_ready = status.local_tunnel_private_ip.is_some()
        && status.local_tunnel_public_ip.is_some()
        && status.remote_tunnel_private_ip.is_some()
        && status.remote_tunnel_public_ip.is_some();

    tunnel_ready && (!resource.spec.nat_required || status.remapped_pod_cidr.is_some())
}

/// Names the first missing Status field, for logging.
pub fn missing_field(resource: &PeeringResource) -> Option<&'static str> {
    let status = &resource.status;
    if status.remote_tunnel_private_ip.is_none() {
        Some("remoteTunnelPrivateIp")
    } else if status.remote_tunnel_public_ip.is_none() {
        Some("remoteTunnelPublicIp")
    } else if status.local_tunnel_private_ip.is_none() {
        Some("localTunnelPrivateIp")
    } else if status.local_tunnel_public_ip.is_none() {
        Some("localTunnelPublicIp")
    } else if resource.spec.nat_required && status.remapped_pod_cidr.is_none() {
        Some("remappedPodCidr")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeeringSpec, ResourceKey};

    fn ready_resource(nat_required: bool) -> PeeringResource {
        let mut r = PeeringResource::new(
            &ResourceKey::new("default", "peer"),
            PeeringSpec {
                peer_gateway_ip: "203.0.113.7".parse().unwrap(),
                peer_tunnel_private_ip: "192.168.100.1".parse().unwrap(),
                pod_cidr: "10.244.0.0/16".parse().unwrap(),
                nat_required,
            },
        );
        r.status.local_tunnel_private_ip = Some("192.168.100.2".parse().unwrap());
        r.status.local_tunnel_public_ip = Some("198.51.100.4".parse().unwrap());
        r.status.remote_tunnel_private_ip = Some("192.168.100.1".parse().unwrap());
        r.status.remote_tunnel_public_ip = Some("203.0.113.7".parse().unwrap());
        r
    }

    #[test]
    fn test_ready_without_nat() {
        let r = ready_resource(false);
        assert!(is_route_ready(&r));
        assert_eq!(missing_field(&r), None);
    }

    #[test]
    fn test_missing_remote_private_ip() {
        let mut r = ready_resource(false);
        r.status.remote_tunnel_private_ip = None;
        assert!(!is_route_ready(&r));
        assert_eq!(missing_field(&r), Some("remoteTunnelPrivateIp"));
    }

    #[test]
    fn test_nat_requires_remapped_cidr() {
        let mut r = ready_resource(true);
        assert!(!is_route_ready(&r));
        assert_eq!(missing_field(&r), Some("remappedPodCidr"));

        r.status.remapped_pod_cidr = Some("10.250.0.0/16".parse().unwrap());
        assert!(is_route_ready(&r));
    }

    #[test]
    fn test_empty_status_not_ready() {
        let mut r = ready_resource(false);
        r.status = Default::default();
        assert!(!is_route_ready(&r));
    }
}
