//! Firewall Rule Manager
//!
//! Keeps the overlay chains and their rules present in the nat and filter
//! tables. Rule specifications are compared as literal text in the canonical
//! order `iptables -S` prints them, so callers must build them in that order.
//!
//! Each read-modify-write sequence holds a process-wide lock: the tool's own
//! `-w` lock only covers a single invocation, and two reconciles observing
//! "zero matches" concurrently would otherwise both insert.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use overlaymgr_common::shell::{CommandRunner, ExecResult, ShellRunner};
use overlaymgr_common::{OverlayError, OverlayResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::commands::*;
use crate::tables::{builtin_chains, overlay_chains, FirewallTable};

const NO_CHAIN_MARKER: &str = "No chain/target/match";
const NO_RULE_MARKER: &str = "does a matching rule exist";
const CHAIN_EXISTS_MARKER: &str = "Chain already exists";

/// Firewall tool operations, scoped to one table per call.
#[async_trait]
pub trait FirewallTool: Send + Sync {
    /// Names of every chain in `table`, built-in ones included.
    async fn list_chains(&self, table: FirewallTable) -> OverlayResult<Vec<String>>;

    async fn new_chain(&self, table: FirewallTable, chain: &str) -> OverlayResult<()>;

    /// Rule specifications of `chain` in order, without the `-A <chain>` prefix.
    async fn list_rules(&self, table: FirewallTable, chain: &str) -> OverlayResult<Vec<String>>;

    /// Inserts `spec` at 1-based `position`.
    async fn insert_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        position: u32,
        spec: &str,
    ) -> OverlayResult<()>;

    /// Deletes the first occurrence of `spec`.
    async fn delete_rule(&self, table: FirewallTable, chain: &str, spec: &str)
        -> OverlayResult<()>;
}

/// [`FirewallTool`] backed by `iptables`.
#[derive(Debug, Clone, Default)]
pub struct Iptables<R = ShellRunner> {
    runner: R,
}

impl<R: CommandRunner> Iptables<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn run(&self, cmd: &str, kind: &'static str, name: &str) -> OverlayResult<String> {
        let result: ExecResult = self.runner.run(cmd).await?;
        if result.success() {
            return Ok(result.stdout);
        }
        if result.stderr_contains_any(&[NO_CHAIN_MARKER, NO_RULE_MARKER]) {
            return Err(OverlayError::not_found(kind, name));
        }
        if result.stderr_contains_any(&[CHAIN_EXISTS_MARKER]) {
            return Err(OverlayError::already_exists(kind, name));
        }
        result.into_stdout(cmd)
    }
}

/// Extracts chain names from `-P`/`-N` lines of `iptables -S` output.
fn parse_chains(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("-P") | Some("-N") => words.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// Extracts rule specifications of `chain` from `iptables -S <chain>` output.
fn parse_rules(output: &str, chain: &str) -> Vec<String> {
    let prefix = format!("-A {} ", chain);
    output
        .lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|spec| spec.trim().to_string())
        .collect()
}

#[async_trait]
impl<R: CommandRunner> FirewallTool for Iptables<R> {
    async fn list_chains(&self, table: FirewallTable) -> OverlayResult<Vec<String>> {
        let stdout = self
            .run(&build_list_chains_cmd(table), "table", table.as_str())
            .await?;
        Ok(parse_chains(&stdout))
    }

    async fn new_chain(&self, table: FirewallTable, chain: &str) -> OverlayResult<()> {
        self.run(&build_new_chain_cmd(table, chain), "chain", chain)
            .await?;
        Ok(())
    }

    async fn list_rules(&self, table: FirewallTable, chain: &str) -> OverlayResult<Vec<String>> {
        let stdout = self
            .run(&build_list_rules_cmd(table, chain), "chain", chain)
            .await?;
        Ok(parse_rules(&stdout, chain))
    }

    async fn insert_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        position: u32,
        spec: &str,
    ) -> OverlayResult<()> {
        self.run(
            &build_insert_rule_cmd(table, chain, position, spec),
            "chain",
            chain,
        )
        .await?;
        Ok(())
    }

    async fn delete_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        spec: &str,
    ) -> OverlayResult<()> {
        self.run(&build_delete_rule_cmd(table, chain, spec), "rule", spec)
            .await?;
        Ok(())
    }
}

/// One rule placement: table, chain and literal specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub table: FirewallTable,
    pub chain: &'static str,
    pub spec: String,
}

impl RuleSpec {
    pub fn new(table: FirewallTable, chain: &'static str, spec: impl Into<String>) -> Self {
        Self {
            table,
            chain,
            spec: spec.into(),
        }
    }
}

/// Overlay chains and the built-in chain each one is jumped to from.
pub const OVERLAY_CHAINS: [(FirewallTable, &str, &str); 2] = [
    (
        FirewallTable::Nat,
        builtin_chains::POSTROUTING,
        overlay_chains::POSTROUTING,
    ),
    (
        FirewallTable::Filter,
        builtin_chains::FORWARD,
        overlay_chains::FORWARD,
    ),
];

/// Jump rules from the built-in chains into the overlay chains.
pub fn jump_rules() -> Vec<RuleSpec> {
    OVERLAY_CHAINS
        .iter()
        .map(|(table, builtin, overlay)| RuleSpec::new(*table, builtin, format!("-j {}", overlay)))
        .collect()
}

/// Rules admitting traffic of one peering tunnel.
///
/// The nat rule accepts traffic towards the peer's pods before any later
/// masquerading rule can rewrite it.
pub fn peering_rules(tunnel: &str, destination: Ipv4Net) -> Vec<RuleSpec> {
    vec![
        RuleSpec::new(
            FirewallTable::Filter,
            overlay_chains::FORWARD,
            format!("-i {} -j ACCEPT", tunnel),
        ),
        RuleSpec::new(
            FirewallTable::Filter,
            overlay_chains::FORWARD,
            format!("-o {} -j ACCEPT", tunnel),
        ),
        RuleSpec::new(
            FirewallTable::Nat,
            overlay_chains::POSTROUTING,
            format!("-d {} -o {} -j ACCEPT", destination, tunnel),
        ),
    ]
}

/// Result of one `ensure_rule` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Rule was absent and has been inserted at position one
    Inserted,
    /// Exactly one occurrence was present
    Present,
    /// Duplicates were deleted; the next pass reinserts one
    Deduplicated { removed: usize },
}

/// Firewall Rule Manager
pub struct FirewallMgr {
    tool: Arc<dyn FirewallTool>,
    /// Serializes list-then-mutate sequences
    lock: Mutex<()>,
}

impl FirewallMgr {
    pub fn new(tool: Arc<dyn FirewallTool>) -> Self {
        Self {
            tool,
            lock: Mutex::new(()),
        }
    }

    /// Creates `chain` in `table` unless it exists. Returns true if created.
    pub async fn ensure_chain(&self, table: FirewallTable, chain: &str) -> OverlayResult<bool> {
        let _guard = self.lock.lock().await;

        let chains = self.tool.list_chains(table).await?;
        if chains.iter().any(|c| c == chain) {
            debug!(table = %table, chain, "Chain present");
            return Ok(false);
        }

        match self.tool.new_chain(table, chain).await {
            Ok(()) => {
                info!(table = %table, chain, "Created chain");
                Ok(true)
            }
            // Created by someone outside this process between list and create
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Converges `spec` towards a single occurrence at position one.
    ///
    /// Duplicates are deleted without reinsertion; a second pass is needed
    /// to reach exactly one occurrence.
    pub async fn ensure_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        spec: &str,
    ) -> OverlayResult<RuleOutcome> {
        let _guard = self.lock.lock().await;

        let rules = self.tool.list_rules(table, chain).await?;
        let matches = rules.iter().filter(|r| r.as_str() == spec).count();

        match matches {
            0 => {
                self.tool.insert_rule(table, chain, 1, spec).await?;
                info!(table = %table, chain, spec, "Inserted rule");
                Ok(RuleOutcome::Inserted)
            }
            1 => Ok(RuleOutcome::Present),
            n => {
                warn!(table = %table, chain, spec, count = n, "Duplicate rules, deleting all");
                let removed = self.delete_occurrences(table, chain, spec, n).await?;
                Ok(RuleOutcome::Deduplicated { removed })
            }
        }
    }

    /// Deletes every occurrence of `spec`. A missing chain or rule is success.
    pub async fn remove_rule(
        &self,
        table: FirewallTable,
        chain: &str,
        spec: &str,
    ) -> OverlayResult<usize> {
        let _guard = self.lock.lock().await;

        let rules = match self.tool.list_rules(table, chain).await {
            Ok(rules) => rules,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let matches = rules.iter().filter(|r| r.as_str() == spec).count();
        let removed = self.delete_occurrences(table, chain, spec, matches).await?;
        if removed > 0 {
            info!(table = %table, chain, spec, removed, "Removed rule");
        }
        Ok(removed)
    }

    async fn delete_occurrences(
        &self,
        table: FirewallTable,
        chain: &str,
        spec: &str,
        count: usize,
    ) -> OverlayResult<usize> {
        let mut removed = 0;
        for _ in 0..count {
            match self.tool.delete_rule(table, chain, spec).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Ensures both overlay chains exist and are jumped to.
    pub async fn ensure_overlay_chains(&self) -> OverlayResult<()> {
        for (table, _, overlay) in OVERLAY_CHAINS {
            self.ensure_chain(table, overlay).await?;
        }
        for rule in jump_rules() {
            self.ensure_rule(rule.table, rule.chain, &rule.spec).await?;
        }
        Ok(())
    }

    /// Ensures the per-peering rules for `tunnel`.
    ///
    /// Returns false if any rule needed de-duplication and another pass is due.
    pub async fn ensure_peering(&self, tunnel: &str, destination: Ipv4Net) -> OverlayResult<bool> {
        self.ensure_overlay_chains().await?;

        let mut converged = true;
        for rule in peering_rules(tunnel, destination) {
            let outcome = self.ensure_rule(rule.table, rule.chain, &rule.spec).await?;
            if matches!(outcome, RuleOutcome::Deduplicated { .. }) {
                converged = false;
            }
        }
        Ok(converged)
    }

    /// Removes the per-peering rules; overlay chains and jumps stay.
    pub async fn remove_peering(&self, tunnel: &str, destination: Ipv4Net) -> OverlayResult<()> {
        for rule in peering_rules(tunnel, destination) {
            self.remove_rule(rule.table, rule.chain, &rule.spec).await?;
        }
        Ok(())
    }
}
