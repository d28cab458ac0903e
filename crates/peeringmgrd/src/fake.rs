//! In-process fakes for tests
//!
//! [`FakeKernel`] and [`FakeFirewall`] keep kernel and firewall state in
//! memory with the same NotFound/AlreadyExists behavior as the real tools,
//! and record every mutation so tests can assert that nothing was touched.
//! [`FlakyStore`] wraps [`MemoryStore`] and injects Status write failures.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlaymgr_common::{OverlayError, OverlayResult};
use parking_lot::Mutex;

use crate::firewall::FirewallTool;
use crate::kernel::{FdbEntry, GreTunnel, Link, NetKernel, Route, VxlanDevice};
use crate::store::{MemoryStore, PeeringStore};
use crate::tables::FirewallTable;
use crate::types::{PeeringResource, PeeringSpec, ResourceKey};

/// First interface index handed out by [`FakeKernel`]
const FIRST_INDEX: u32 = 10;

/// GRE default MTU over a 1500 byte underlay
const GRE_MTU: u32 = 1476;

fn injected(op: &str) -> OverlayError {
    OverlayError::ShellCommandFailed {
        command: op.to_string(),
        exit_code: 2,
        output: "injected failure".to_string(),
    }
}

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    addresses: Vec<Ipv4Net>,
}

#[derive(Debug, Default)]
struct KernelState {
    next_index: u32,
    links: BTreeMap<String, FakeLink>,
    routes: Vec<Route>,
    fdb: BTreeMap<String, BTreeSet<FdbEntry>>,
    mutations: Vec<String>,
    fail_ops: Vec<String>,
}

impl KernelState {
    fn mutate(&mut self, op: &str, detail: impl std::fmt::Display) -> OverlayResult<()> {
        if let Some(pos) = self.fail_ops.iter().position(|o| o == op) {
            self.fail_ops.remove(pos);
            return Err(injected(op));
        }
        self.mutations.push(format!("{} {}", op, detail));
        Ok(())
    }

    fn new_link(&mut self, name: &str, mtu: Option<u32>) -> Link {
        let link = Link {
            index: self.next_index,
            name: name.to_string(),
            mtu,
            up: false,
        };
        self.next_index += 1;
        self.links.insert(
            name.to_string(),
            FakeLink {
                link: link.clone(),
                addresses: Vec::new(),
            },
        );
        link
    }

    fn link_mut(&mut self, name: &str) -> OverlayResult<&mut FakeLink> {
        self.links
            .get_mut(name)
            .ok_or_else(|| OverlayError::not_found("link", name))
    }

    fn require_link(&self, name: &str) -> OverlayResult<()> {
        if self.links.contains_key(name) {
            Ok(())
        } else {
            Err(OverlayError::not_found("link", name))
        }
    }

    fn drop_link(&mut self, name: &str) {
        self.links.remove(name);
        self.routes.retain(|r| r.link != name);
        self.fdb.remove(name);
    }
}

/// In-memory [`NetKernel`].
#[derive(Debug)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KernelState {
                next_index: FIRST_INDEX,
                ..Default::default()
            }),
        }
    }

    /// Adds a link that is up, without recording a mutation.
    pub fn with_link(self, name: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.new_link(name, Some(GRE_MTU));
            if let Some(l) = state.links.get_mut(name) {
                l.link.up = true;
            }
        }
        self
    }

    /// Adds an up link carrying `address`, without recording a mutation.
    pub fn add_link_with_address(&self, name: &str, address: Ipv4Net) -> Link {
        let mut state = self.state.lock();
        let mut link = state.new_link(name, Some(1500));
        link.up = true;
        if let Some(l) = state.links.get_mut(name) {
            l.link.up = true;
            l.addresses.push(address);
        }
        link
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().links.get(name).map(|l| l.link.clone())
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn addresses(&self, name: &str) -> Vec<Ipv4Net> {
        self.state
            .lock()
            .links
            .get(name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes_for(&self, link: &str) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.link == link)
            .cloned()
            .collect()
    }

    /// Inserts a route bypassing duplicate checks, as a stale or foreign
    /// writer would have left it.
    pub fn insert_route(&self, route: Route) {
        self.state.lock().routes.push(route);
    }

    /// Deletes a link behind the engine's back (reboot, operator).
    pub fn remove_link_externally(&self, name: &str) {
        self.state.lock().drop_link(name);
    }

    pub fn fdb(&self, device: &str) -> Vec<FdbEntry> {
        self.state
            .lock()
            .fdb
            .get(device)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations.len()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    /// Makes the next call of `op` (a [`NetKernel`] method name) fail.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().fail_ops.push(op.to_string());
    }
}

#[async_trait]
impl NetKernel for FakeKernel {
    async fn link_by_name(&self, name: &str) -> OverlayResult<Option<Link>> {
        Ok(self.link(name))
    }

    async fn link_by_index(&self, index: u32) -> OverlayResult<Option<Link>> {
        Ok(self
            .state
            .lock()
            .links
            .values()
            .find(|l| l.link.index == index)
            .map(|l| l.link.clone()))
    }

    async fn link_addresses(&self, name: &str) -> OverlayResult<Vec<Ipv4Net>> {
        let mut state = self.state.lock();
        Ok(state.link_mut(name)?.addresses.clone())
    }

    async fn add_gre_tunnel(&self, tunnel: &GreTunnel) -> OverlayResult<Link> {
        let mut state = self.state.lock();
        if state.links.contains_key(&tunnel.name) {
            return Err(OverlayError::already_exists("link", &tunnel.name));
        }
        state.mutate("add_gre_tunnel", &tunnel.name)?;
        Ok(state.new_link(&tunnel.name, Some(GRE_MTU)))
    }

    async fn add_vxlan(&self, device: &VxlanDevice) -> OverlayResult<Link> {
        let mut state = self.state.lock();
        if state.links.contains_key(&device.name) {
            return Err(OverlayError::already_exists("link", &device.name));
        }
        state.mutate("add_vxlan", &device.name)?;
        Ok(state.new_link(&device.name, Some(device.mtu)))
    }

    async fn delete_link(&self, name: &str) -> OverlayResult<()> {
        let mut state = self.state.lock();
        state.require_link(name)?;
        state.mutate("delete_link", name)?;
        state.drop_link(name);
        Ok(())
    }

    async fn set_link_up(&self, name: &str, mtu: Option<u32>) -> OverlayResult<()> {
        let mut state = self.state.lock();
        state.require_link(name)?;
        state.mutate("set_link_up", name)?;
        let link = state.link_mut(name)?;
        link.link.up = true;
        if mtu.is_some() {
            link.link.mtu = mtu;
        }
        Ok(())
    }

    async fn add_address(&self, name: &str, address: Ipv4Net) -> OverlayResult<()> {
        let mut state = self.state.lock();
        if state.link_mut(name)?.addresses.contains(&address) {
            return Err(OverlayError::already_exists("address", address.to_string()));
        }
        state.mutate("add_address", address)?;
        state.link_mut(name)?.addresses.push(address);
        Ok(())
    }

    async fn list_routes(&self, link: &str) -> OverlayResult<Vec<Route>> {
        self.state.lock().require_link(link)?;
        Ok(self.routes_for(link))
    }

    async fn add_route(&self, route: &Route) -> OverlayResult<()> {
        let mut state = self.state.lock();
        state.require_link(&route.link)?;
        if state
            .routes
            .iter()
            .any(|r| r.destination == route.destination && r.link == route.link)
        {
            return Err(OverlayError::already_exists("route", route.to_string()));
        }
        state.mutate("add_route", route)?;
        state.routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> OverlayResult<()> {
        let mut state = self.state.lock();
        let pos = state
            .routes
            .iter()
            .position(|r| r.same_as(route))
            .ok_or_else(|| OverlayError::not_found("route", route.to_string()))?;
        state.mutate("delete_route", route)?;
        state.routes.remove(pos);
        Ok(())
    }

    async fn list_fdb(&self, device: &str) -> OverlayResult<Vec<FdbEntry>> {
        self.state.lock().require_link(device)?;
        Ok(self.fdb(device))
    }

    async fn append_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()> {
        let mut state = self.state.lock();
        state.require_link(device)?;
        if state.fdb.get(device).is_some_and(|e| e.contains(entry)) {
            return Err(OverlayError::already_exists("fdb entry", entry.dst.to_string()));
        }
        state.mutate("append_fdb", entry.dst)?;
        state
            .fdb
            .entry(device.to_string())
            .or_default()
            .insert(entry.clone());
        Ok(())
    }

    async fn delete_fdb(&self, device: &str, entry: &FdbEntry) -> OverlayResult<()> {
        let mut state = self.state.lock();
        if !state.fdb.get(device).is_some_and(|e| e.contains(entry)) {
            return Err(OverlayError::not_found("fdb entry", entry.dst.to_string()));
        }
        state.mutate("delete_fdb", entry.dst)?;
        if let Some(entries) = state.fdb.get_mut(device) {
            entries.remove(entry);
        }
        Ok(())
    }
}

const BUILTIN_CHAINS: [(FirewallTable, &str); 7] = [
    (FirewallTable::Nat, "PREROUTING"),
    (FirewallTable::Nat, "INPUT"),
    (FirewallTable::Nat, "OUTPUT"),
    (FirewallTable::Nat, "POSTROUTING"),
    (FirewallTable::Filter, "INPUT"),
    (FirewallTable::Filter, "FORWARD"),
    (FirewallTable::Filter, "OUTPUT"),
];

/// In-memory [`FirewallTool`].
///
/// Listing yields to the scheduler first, so unsynchronized
/// list-then-insert sequences interleave under concurrency.
#[derive(Debug)]
pub struct FakeFirewall {
    chains: Mutex<BTreeMap<(FirewallTable, String), Vec<String>>>,
    chain_creates: AtomicUsize,
}

impl Default for FakeFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFirewall {
    pub fn new() -> Self {
        let chains = BUILTIN_CHAINS
            .iter()
            .map(|(table, chain)| ((*table, chain.to_string()), Vec::new()))
            .collect();
        Self {
            chains: Mutex::new(chains),
            chain_creates: AtomicUsize::new(0),
        }
    }

    /// Appends a rule as another component would, creating the chain if needed.
    pub fn push_rule_externally(&self, table: FirewallTable, chain: &str, spec: &str) {
        self.chains
            .lock()
            .entry((table, chain.to_string()))
            .or_default()
            .push(spec.to_string());
    }

    pub fn rules(&self, table: FirewallTable, chain: &str) -> Vec<String> {
        self.chains
            .lock()
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_count(&self, table: FirewallTable, chain: &str) -> usize {
        usize::from(self.chains.lock().contains_key(&(table, chain.to_string())))
    }

    /// Number of successful `new_chain` calls.
    pub fn chain_creates(&self) -> usize {
        self.chain_creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirewallTool for FakeFirewall {
    async fn list_chains(&self, table: FirewallTable) -> OverlayResult<Vec<String>> {
        tokio::task::yield_now().await;
        Ok(self
            .chains
            .lock()
            .keys()
            .filter(|(t, _)| *t == table)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn new_chain(&self, table: FirewallTable, chain: &str) -> OverlayResult<()> {
        let mut chains = self.chains.lock();
        let key = (table, chain.to_string());
        if chains.contains_key(&key) {
            return Err(OverlayError::already_exists("chain", chain));
        }
        chains.insert(key, Vec::new());
        self.chain_creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_rules(&self, table: FirewallTable, chain: &str) -> OverlayResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.chains
            .lock()
            .get(&(table, chain.to_string()))
            .cloned()
            .ok_or_else(|| OverlayError::not_found("chain", chain))
    }

    async fn insert_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        position: u32,
        spec: &str,
    ) -> OverlayResult<()> {
        let mut chains = self.chains.lock();
        let rules = chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| OverlayError::not_found("chain", chain))?;
        let at = (position.max(1) as usize - 1).min(rules.len());
        rules.insert(at, spec.to_string());
        Ok(())
    }

    async fn delete_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        spec: &str,
    ) -> OverlayResult<()> {
        let mut chains = self.chains.lock();
        let rules = chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| OverlayError::not_found("chain", chain))?;
        let pos = rules
            .iter()
            .position(|r| r == spec)
            .ok_or_else(|| OverlayError::not_found("rule", spec))?;
        rules.remove(pos);
        Ok(())
    }
}

/// [`PeeringStore`] over a [`MemoryStore`] that can fail Status writes.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    status_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            status_failures: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fails the next `count` Status writes.
    pub fn fail_status_updates(&self, count: usize) {
        self.status_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeeringStore for FlakyStore {
    async fn get(&self, key: &ResourceKey) -> OverlayResult<PeeringResource> {
        self.inner.get(key).await
    }

    async fn list(&self) -> OverlayResult<Vec<PeeringResource>> {
        self.inner.list().await
    }

    async fn update(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource> {
        self.inner.update(resource).await
    }

    async fn update_status(&self, resource: &PeeringResource) -> OverlayResult<PeeringResource> {
        let fail = self
            .status_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(OverlayError::store("update_status", "injected failure"));
        }
        self.inner.update_status(resource).await
    }
}

/// Peering in the default namespace with an empty Status.
///
/// The peer uses 192.168.100.1, so this side takes 192.168.100.2.
pub fn sample_peering(name: &str) -> PeeringResource {
    PeeringResource::new(
        &ResourceKey::new("default", name),
        PeeringSpec {
            peer_gateway_ip: Ipv4Addr::new(203, 0, 113, 7),
            peer_tunnel_private_ip: Ipv4Addr::new(192, 168, 100, 1),
            pod_cidr: "10.244.1.0/24".parse().expect("valid CIDR literal"),
            nat_required: false,
        },
    )
}

/// [`sample_peering`] with a fully populated Status on link `gre0`.
pub fn ready_peering(name: &str) -> PeeringResource {
    let mut resource = sample_peering(name);
    resource.status.local_tunnel_private_ip = Some(Ipv4Addr::new(192, 168, 100, 2));
    resource.status.local_tunnel_public_ip = Some(Ipv4Addr::new(198, 51, 100, 4));
    resource.status.remote_tunnel_private_ip = Some(Ipv4Addr::new(192, 168, 100, 1));
    resource.status.remote_tunnel_public_ip = Some(Ipv4Addr::new(203, 0, 113, 7));
    resource.status.tunnel_iface_index = Some(FIRST_INDEX);
    resource.status.tunnel_iface_name = Some("gre0".to_string());
    resource
}
