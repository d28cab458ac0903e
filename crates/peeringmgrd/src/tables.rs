//! Firewall table and chain names, and VXLAN device parameters

/// iptables tables the engine touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FirewallTable {
    Nat,
    Filter,
}

impl FirewallTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallTable::Nat => "nat",
            FirewallTable::Filter => "filter",
        }
    }
}

impl std::fmt::Display for FirewallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in chains the jump rules are inserted into
pub mod builtin_chains {
    pub const POSTROUTING: &str = "POSTROUTING";
    pub const FORWARD: &str = "FORWARD";
}

/// Chains owned by the engine
pub mod overlay_chains {
    /// nat table
    pub const POSTROUTING: &str = "OVERLAY-POSTROUTING";
    /// filter table
    pub const FORWARD: &str = "OVERLAY-FORWARD";
}

/// VXLAN fabric parameters
pub mod vxlan {
    pub const DEVICE_NAME: &str = "vxlan.ovl";
    pub const VNI: u32 = 200;
    pub const UDP_PORT: u16 = 4789;
    /// Outer Ethernet + IPv4 + UDP + VXLAN headers
    pub const ENCAP_OVERHEAD: u32 = 50;
    /// Placeholder hardware address for flood-to-unicast-list entries
    pub const PLACEHOLDER_MAC: &str = "00:00:00:00:00:00";
}
