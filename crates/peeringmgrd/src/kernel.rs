//! Kernel networking adapter
//!
//! [`NetKernel`] is the narrow contract the managers converge against. The
//! production implementation, [`IpRoute2`], drives `ip -j` and `bridge -j`
//! through a [`CommandRunner`] and parses their JSON output.
//!
//! Every call surfaces "object already absent" as [`OverlayError::NotFound`]
//! and "object already present" as [`OverlayError::AlreadyExists`], separate
//! from genuine failures.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlaymgr_common::shell::{CommandRunner, ExecResult, ShellRunner};
use overlaymgr_common::{OverlayError, OverlayResult};
use serde::Deserialize;
use tracing::debug;

use crate::commands::*;
use crate::tables::vxlan;

/// stderr fragments meaning the target object does not exist
///
/// `ip link show`/`ip addr show` print `Device "X" does not exist.`; the
/// mutating subcommands print `Cannot find device "X"`.
const NOT_FOUND_MARKERS: &[&str] = &[
    "does not exist",
    "Cannot find device",
    "No such process",
    "No such file",
];

/// stderr fragment meaning the object is already present
const EXISTS_MARKER: &str = "File exists";

/// Kernel link as seen by the managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
    pub up: bool,
}

/// IPv4 route bound to one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub link: String,
    /// Gateway is not covered by a connected subnet of `link`
    pub onlink: bool,
}

impl Route {
    /// Compares destination, gateway and link; flags are not part of identity.
    pub fn same_as(&self, other: &Route) -> bool {
        self.destination == other.destination
            && self.gateway == other.gateway
            && self.link == other.link
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        write!(f, " dev {}", self.link)
    }
}

/// VXLAN forwarding-database entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FdbEntry {
    pub mac: String,
    pub dst: Ipv4Addr,
}

impl FdbEntry {
    /// Flood-to-unicast-list entry for one remote VTEP.
    pub fn placeholder(dst: Ipv4Addr) -> Self {
        Self {
            mac: vxlan::PLACEHOLDER_MAC.to_string(),
            dst,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.mac == vxlan::PLACEHOLDER_MAC
    }
}

/// Point-to-point GRE tunnel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreTunnel {
    pub name: String,
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub ttl: u8,
}

/// VXLAN device parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanDevice {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub local: Ipv4Addr,
    pub mtu: u32,
    /// Underlay device, if pinned
    pub uplink: Option<String>,
}

/// Kernel networking operations used by the managers.
#[async_trait]
pub trait NetKernel: Send + Sync {
    /// Looks up a link by name; `None` if absent.
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<Link>>;

    /// Looks up a link by index; `None` if absent.
    async fn link_by_index(&self, index: u32) -> OverlayResult<Option<Link>>;

    /// IPv4 addresses assigned to a link, in kernel order.
    async fn link_addresses(&self, name: &str) -> OverlayResult<Vec<Ipv4Net>>;

    /// Creates a GRE tunnel and returns the new link.
    async fn add_gre_tunnel(&self, tunnel: &GreTunnel) -> OverlayResult<Link>;

    /// Creates a VXLAN device and returns the new link.
    async fn add_vxlan(&self, device: &VxlanDevice) -> OverlayResult<Link>;

    async fn delete_link(&self, name: &str) -> OverlayResult<()>;

    async fn set_link_up(&self, name: &str, mtu: Option<u32>) -> OverlayResult<()>;

    async fn add_address(&self, name: &str, address: Ipv4Net) -> OverlayResult<()>;

    /// IPv4 routes whose egress is `link`.
    async fn list_routes(&self, link: &str) -> OverlayResult<Vec<Route>>;

    async fn add_route(&self, route: &Route) -> OverlayResult<()>;

    async fn delete_route(&self, route: &Route) -> OverlayResult<()>;

    /// FDB entries carrying a remote destination.
    async fn list_fdb(&self, device: &str) -> OverlayResult<Vec<FdbEntry>>;

    async fn append_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()>;

    async fn delete_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()>;
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    flags: Vec<String>,
}

impl From<LinkJson> for Link {
    fn from(j: LinkJson) -> Self {
        Link {
            index: j.ifindex,
            name: j.ifname,
            mtu: j.mtu,
            up: j.flags.iter().any(|f| f == "UP"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FdbJson {
    mac: String,
    #[serde(default)]
    dst: Option<String>,
}

/// Parses `ip`/`bridge` JSON output; empty output is an empty list.
fn parse_json<T: serde::de::DeserializeOwned>(cmd: &str, stdout: &str) -> OverlayResult<Vec<T>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout).map_err(|e| OverlayError::parse(cmd, e.to_string()))
}

/// Parses a route `dst` field: "default", a bare host or a CIDR.
fn parse_route_dst(cmd: &str, dst: &str) -> OverlayResult<Ipv4Net> {
    if dst == "default" {
        return Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|e| OverlayError::parse(cmd, e.to_string()));
    }
    if dst.contains('/') {
        return dst
            .parse()
            .map_err(|e| OverlayError::parse(cmd, format!("bad route dst '{}': {}", dst, e)));
    }
    let host: Ipv4Addr = dst
        .parse()
        .map_err(|e| OverlayError::parse(cmd, format!("bad route dst '{}': {}", dst, e)))?;
    Ok(Ipv4Net::from(host))
}

fn parse_addr(cmd: &str, field: &str, value: &str) -> OverlayResult<Ipv4Addr> {
    value
        .parse()
        .map_err(|e| OverlayError::parse(cmd, format!("bad {} '{}': {}", field, value, e)))
}

/// Maps a finished command onto the NotFound/AlreadyExists/failure taxonomy.
fn check(cmd: &str, result: ExecResult, kind: &'static str, name: &str) -> OverlayResult<String> {
    if result.success() {
        return Ok(result.stdout);
    }
    if result.stderr_contains_any(NOT_FOUND_MARKERS) {
        return Err(OverlayError::not_found(kind, name));
    }
    if result.stderr_contains_any(&[EXISTS_MARKER]) {
        return Err(OverlayError::already_exists(kind, name));
    }
    result.into_stdout(cmd)
}

/// [`NetKernel`] backed by the iproute2 tools.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2<R = ShellRunner> {
    runner: R,
}

impl<R: CommandRunner> IpRoute2<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn run(&self, cmd: &str, kind: &'static str, name: &str) -> OverlayResult<String> {
        let result = self.runner.run(cmd).await?;
        check(cmd, result, kind, name)
    }

    async fn created_link(&self, name: &str) -> OverlayResult<Link> {
        self.link_by_name(name)
            .await?
            .ok_or_else(|| OverlayError::LinkNotFound {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl<R: CommandRunner> NetKernel for IpRoute2<R> {
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<Link>> {
        let cmd = build_link_show_cmd(name);
        let stdout = match self.run(&cmd, "link", name).await {
            Ok(stdout) => stdout,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let links: Vec<LinkJson> = parse_json(&cmd, &stdout)?;
        Ok(links.into_iter().next().map(Link::from))
    }

    async fn link_by_index(&self, index: u32) -> OverlayResult<Option<Link>> {
        let cmd = build_link_list_cmd();
        let stdout = self.run(&cmd, "link", &index.to_string()).await?;
        let links: Vec<LinkJson> = parse_json(&cmd, &stdout)?;
        Ok(links
            .into_iter()
            .find(|l| l.ifindex == index)
            .map(Link::from))
    }

    async fn link_addresses(&self, name: &str) -> OverlayResult<Vec<Ipv4Net>> {
        let cmd = build_addr_show_cmd(name);
        let stdout = self.run(&cmd, "link", name).await?;
        let links: Vec<AddrJson> = parse_json(&cmd, &stdout)?;

        let mut addresses = Vec::new();
        for info in links.into_iter().flat_map(|l| l.addr_info) {
            if info.family.as_deref().is_some_and(|f| f != "inet") {
                continue;
            }
            let Some(local) = info.local else { continue };
            let addr = parse_addr(&cmd, "local", &local)?;
            let net = Ipv4Net::new(addr, info.prefixlen.unwrap_or(32))
                .map_err(|e| OverlayError::parse(&cmd, e.to_string()))?;
            addresses.push(net);
        }
        Ok(addresses)
    }

    async fn add_gre_tunnel(&self, tunnel: &GreTunnel) -> OverlayResult<Link> {
        let cmd = build_add_gre_cmd(tunnel);
        self.run(&cmd, "link", &tunnel.name).await?;
        self.created_link(&tunnel.name).await
    }

    async fn add_vxlan(&self, device: &VxlanDevice) -> OverlayResult<Link> {
        let cmd = build_add_vxlan_cmd(device);
        self.run(&cmd, "link", &device.name).await?;
        self.created_link(&device.name).await
    }

    async fn delete_link(&self, name: &str) -> OverlayResult<()> {
        self.run(&build_del_link_cmd(name), "link", name).await?;
        Ok(())
    }

    async fn set_link_up(&self, name: &str, mtu: Option<u32>) -> OverlayResult<()> {
        self.run(&build_set_link_up_cmd(name, mtu), "link", name)
            .await?;
        Ok(())
    }

    async fn add_address(&self, name: &str, address: Ipv4Net) -> OverlayResult<()> {
        self.run(&build_add_addr_cmd(name, address), "address", &address.to_string())
            .await?;
        Ok(())
    }

    async fn list_routes(&self, link: &str) -> OverlayResult<Vec<Route>> {
        let cmd = build_route_show_cmd(link);
        let stdout = self.run(&cmd, "link", link).await?;
        let routes: Vec<RouteJson> = parse_json(&cmd, &stdout)?;

        routes
            .into_iter()
            .map(|r| {
                Ok(Route {
                    destination: parse_route_dst(&cmd, &r.dst)?,
                    gateway: r
                        .gateway
                        .as_deref()
                        .map(|g| parse_addr(&cmd, "gateway", g))
                        .transpose()?,
                    link: link.to_string(),
                    onlink: r.flags.iter().any(|f| f == "onlink"),
                })
            })
            .collect()
    }

    async fn add_route(&self, route: &Route) -> OverlayResult<()> {
        debug!(route = %route, onlink = route.onlink, "Adding route");
        self.run(&build_add_route_cmd(route), "route", &route.to_string())
            .await?;
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> OverlayResult<()> {
        debug!(route = %route, "Deleting route");
        self.run(&build_del_route_cmd(route), "route", &route.to_string())
            .await?;
        Ok(())
    }

    async fn list_fdb(&self, device: &str) -> OverlayResult<Vec<FdbEntry>> {
        let cmd = build_fdb_show_cmd(device);
        let stdout = self.run(&cmd, "link", device).await?;
        let entries: Vec<FdbJson> = parse_json(&cmd, &stdout)?;

        let mut fdb = Vec::new();
        for entry in entries {
            // Local entries carry no remote destination
            let Some(dst) = entry.dst else { continue };
            fdb.push(FdbEntry {
                mac: entry.mac,
                dst: parse_addr(&cmd, "dst", &dst)?,
            });
        }
        Ok(fdb)
    }

    async fn append_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()> {
        self.run(&build_fdb_append_cmd(device, entry), "fdb entry", &entry.dst.to_string())
            .await?;
        Ok(())
    }

    async fn delete_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()> {
        self.run(&build_fdb_del_cmd(device, entry), "fdb entry", &entry.dst.to_string())
            .await?;
        Ok(())
    }
}
