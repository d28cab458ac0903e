//! Shell command builders for link, route, FDB and firewall operations

use ipnet::Ipv4Net;
use overlaymgr_common::shell;

use crate::kernel::{FdbEntry, GreTunnel, Route, VxlanDevice};
use crate::tables::FirewallTable;

/// Build single link lookup command (JSON output)
pub fn build_link_show_cmd(name: &str) -> String {
    format!("{} -j link show dev {}", shell::IP_CMD, shell::shellquote(name))
}

/// Build full link listing command (JSON output)
pub fn build_link_list_cmd() -> String {
    format!("{} -j link show", shell::IP_CMD)
}

/// Build IPv4 address listing command for one link (JSON output)
pub fn build_addr_show_cmd(name: &str) -> String {
    format!(
        "{} -j -4 addr show dev {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build point-to-point GRE tunnel creation command
pub fn build_add_gre_cmd(tunnel: &GreTunnel) -> String {
    format!(
        "{} link add {} type gre local {} remote {} ttl {}",
        shell::IP_CMD,
        shell::shellquote(&tunnel.name),
        tunnel.local,
        tunnel.remote,
        tunnel.ttl
    )
}

/// Build VXLAN device creation command
///
/// Address learning is disabled; peers are listed explicitly in the FDB.
pub fn build_add_vxlan_cmd(device: &VxlanDevice) -> String {
    let uplink = device
        .uplink
        .as_deref()
        .map(|dev| format!(" dev {}", shell::shellquote(dev)))
        .unwrap_or_default();
    format!(
        "{} link add {} type vxlan id {} dstport {} local {}{} nolearning",
        shell::IP_CMD,
        shell::shellquote(&device.name),
        device.vni,
        device.port,
        device.local,
        uplink
    )
}

/// Build link deletion command
pub fn build_del_link_cmd(name: &str) -> String {
    format!("{} link del dev {}", shell::IP_CMD, shell::shellquote(name))
}

/// Build link bring-up command, optionally setting the MTU
pub fn build_set_link_up_cmd(name: &str, mtu: Option<u32>) -> String {
    match mtu {
        Some(mtu) => format!(
            "{} link set dev {} mtu {} up",
            shell::IP_CMD,
            shell::shellquote(name),
            mtu
        ),
        None => format!(
            "{} link set dev {} up",
            shell::IP_CMD,
            shell::shellquote(name)
        ),
    }
}

/// Build address assignment command
pub fn build_add_addr_cmd(name: &str, address: Ipv4Net) -> String {
    format!(
        "{} addr add {} dev {}",
        shell::IP_CMD,
        shell::shellquote(&address.to_string()),
        shell::shellquote(name)
    )
}

/// Build IPv4 route listing command for one link (JSON output)
pub fn build_route_show_cmd(link: &str) -> String {
    format!(
        "{} -j -4 route show dev {}",
        shell::IP_CMD,
        shell::shellquote(link)
    )
}

fn route_args(route: &Route) -> String {
    let mut args = shell::shellquote(&route.destination.to_string());
    if let Some(gateway) = route.gateway {
        args.push_str(&format!(" via {}", gateway));
    }
    args.push_str(&format!(" dev {}", shell::shellquote(&route.link)));
    args
}

/// Build route add command
///
/// `onlink` lets the gateway be used although no connected subnet covers it.
pub fn build_add_route_cmd(route: &Route) -> String {
    let onlink = if route.onlink { " onlink" } else { "" };
    format!("{} route add {}{}", shell::IP_CMD, route_args(route), onlink)
}

/// Build route delete command
pub fn build_del_route_cmd(route: &Route) -> String {
    format!("{} route del {}", shell::IP_CMD, route_args(route))
}

/// Build FDB listing command (JSON output)
pub fn build_fdb_show_cmd(device: &str) -> String {
    format!(
        "{} -j fdb show dev {}",
        shell::BRIDGE_CMD,
        shell::shellquote(device)
    )
}

/// Build FDB append command
pub fn build_fdb_append_cmd(device: &str, entry: &FdbEntry) -> String {
    format!(
        "{} fdb append {} dev {} dst {}",
        shell::BRIDGE_CMD,
        shell::shellquote(&entry.mac),
        shell::shellquote(device),
        entry.dst
    )
}

/// Build FDB delete command
pub fn build_fdb_del_cmd(device: &str, entry: &FdbEntry) -> String {
    format!(
        "{} fdb del {} dev {} dst {}",
        shell::BRIDGE_CMD,
        shell::shellquote(&entry.mac),
        shell::shellquote(device),
        entry.dst
    )
}

/// Build chain listing command for a whole table
pub fn build_list_chains_cmd(table: FirewallTable) -> String {
    format!("{} -w -t {} -S", shell::IPTABLES_CMD, table)
}

/// Build rule listing command for one chain
pub fn build_list_rules_cmd(table: FirewallTable, chain: &str) -> String {
    format!(
        "{} -w -t {} -S {}",
        shell::IPTABLES_CMD,
        table,
        shell::shellquote(chain)
    )
}

/// Build chain creation command
pub fn build_new_chain_cmd(table: FirewallTable, chain: &str) -> String {
    format!(
        "{} -w -t {} -N {}",
        shell::IPTABLES_CMD,
        table,
        shell::shellquote(chain)
    )
}

/// Build positional rule insert command
///
/// `spec` is passed through unquoted: it is a multi-argument rule
/// specification built from validated addresses and interface names.
pub fn build_insert_rule_cmd(
    table: FirewallTable,
    chain: &str,
    position: u32,
    spec: &str,
) -> String {
    format!(
        "{} -w -t {} -I {} {} {}",
        shell::IPTABLES_CMD,
        table,
        shell::shellquote(chain),
        position,
        spec
    )
}

/// Build rule delete command (removes the first matching occurrence)
pub fn build_delete_rule_cmd(table: FirewallTable, chain: &str, spec: &str) -> String {
    format!(
        "{} -w -t {} -D {} {}",
        shell::IPTABLES_CMD,
        table,
        shell::shellquote(chain),
        spec
    )
}
