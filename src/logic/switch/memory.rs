//! In-Memory Fabric & Binding Directory
//!
//! A switch fabric that applies rule batches to per-switch rule tables and
//! answers statistics requests from settable counters. Used by the tests
//! and by the binary when no real controller is attached.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants::DYNAMIC_TABLE_ID;
use crate::logic::error::{AnalysisError, SwitchError};
use crate::logic::types::{Binding, PortNo, SwitchId, SwitchPort, TableId};
use super::types::{
    FlowMatch, FlowStatsEntry, Instruction, PortStatsEntry, RuleAction, RuleBatch, RuleKind,
    StatsKind, StatsReply,
};
use super::{BindingDirectory, ControlPlane, SwitchRoles};

// ============================================================================
// FABRIC
// ============================================================================

/// Rule as stored in a switch table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstalledRule {
    pub table: TableId,
    pub priority: u16,
    pub matcher: FlowMatchKey,
    pub instructions: Option<Vec<Instruction>>,
    pub packet_count: u64,
}

/// Orderable view of a `FlowMatch`, so rule tables can be compared as sets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowMatchKey(pub String);

impl From<&FlowMatch> for FlowMatchKey {
    fn from(m: &FlowMatch) -> Self {
        FlowMatchKey(format!(
            "in_port={:?},eth_src={:?},eth_type={:?},ipv6_src={:?}",
            m.in_port.map(|p| p.0),
            m.eth_src.map(|mac| mac.to_string()),
            m.eth_type,
            m.ipv6_src
        ))
    }
}

#[derive(Debug, Default)]
struct FabricSwitch {
    ports: Vec<PortNo>,
    rules: Vec<(FlowMatch, InstalledRule)>,
    port_counters: HashMap<PortNo, (u64, u64)>,
    unreachable: bool,
    latency: Duration,
    static_mode: bool,
}

impl FabricSwitch {
    fn apply(&mut self, action: &RuleAction) {
        let matcher = *action.matcher();
        match action.kind() {
            RuleKind::Install => {
                let instructions = action.instructions().map(|i| i.to_vec());
                let existing = self.rules.iter_mut().find(|(m, r)| {
                    *m == matcher && r.table == action.table() && r.priority == action.priority()
                });
                match existing {
                    Some((_, rule)) => {
                        rule.instructions = instructions;
                        rule.packet_count = 0;
                    }
                    None => self.rules.push((
                        matcher,
                        InstalledRule {
                            table: action.table(),
                            priority: action.priority(),
                            matcher: FlowMatchKey::from(&matcher),
                            instructions,
                            packet_count: 0,
                        },
                    )),
                }
            }
            RuleKind::Remove => {
                self.rules
                    .retain(|(m, r)| !(r.table == action.table() && matcher.covers(m)));
            }
            RuleKind::Modify => {
                for (m, rule) in self.rules.iter_mut() {
                    if *m == matcher && rule.table == action.table() {
                        rule.priority = action.priority();
                        rule.instructions = action.instructions().map(|i| i.to_vec());
                    }
                }
            }
        }
    }
}

/// In-memory switch fabric
#[derive(Debug, Default)]
pub struct MemoryFabric {
    switches: RwLock<HashMap<SwitchId, FabricSwitch>>,
    batches_pushed: AtomicU64,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// One switch per bound switch; access ports plus `uplinks` extra ports
    pub fn from_bindings(bindings: &[Binding], uplinks: u32) -> Self {
        let fabric = Self::new();
        let mut per_switch: HashMap<SwitchId, BTreeSet<PortNo>> = HashMap::new();
        for b in bindings {
            per_switch.entry(b.switch_port.switch).or_default().insert(b.switch_port.port);
        }

        for (sw, ports) in per_switch {
            let mut ports: Vec<PortNo> = ports.into_iter().collect();
            let next = ports.last().map(|p| p.0 + 1).unwrap_or(1);
            ports.extend((0..uplinks).map(|i| PortNo(next + i)));
            fabric.add_switch(sw, ports);
        }
        fabric
    }

    pub fn add_switch(&self, switch: SwitchId, ports: Vec<PortNo>) {
        let mut switches = self.switches.write();
        let entry = switches.entry(switch).or_default();
        for &p in &ports {
            entry.port_counters.entry(p).or_insert((0, 0));
        }
        entry.ports = ports;
    }
}

/// Inspection and simulation hooks for tests
#[cfg(test)]
impl MemoryFabric {
    /// Sorted snapshot of every rule of a switch
    pub fn rules(&self, switch: SwitchId) -> Vec<InstalledRule> {
        let switches = self.switches.read();
        let mut rules: Vec<InstalledRule> = switches
            .get(&switch)
            .map(|s| s.rules.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default();
        rules.sort();
        rules
    }

    pub fn rules_in(&self, switch: SwitchId, table: TableId) -> Vec<InstalledRule> {
        self.rules(switch).into_iter().filter(|r| r.table == table).collect()
    }

    pub fn set_port_counters(&self, switch: SwitchId, port: PortNo, rx: u64, tx: u64) {
        if let Some(s) = self.switches.write().get_mut(&switch) {
            s.port_counters.insert(port, (rx, tx));
        }
    }

    /// Set the packet counter of every rule in `table` with exactly `matcher`
    pub fn set_rule_packets(
        &self,
        switch: SwitchId,
        table: TableId,
        matcher: &FlowMatch,
        count: u64,
    ) -> bool {
        let mut switches = self.switches.write();
        let Some(s) = switches.get_mut(&switch) else {
            return false;
        };

        let mut found = false;
        for (m, rule) in s.rules.iter_mut() {
            if m == matcher && rule.table == table {
                rule.packet_count = count;
                found = true;
            }
        }
        found
    }

    pub fn set_unreachable(&self, switch: SwitchId, unreachable: bool) {
        if let Some(s) = self.switches.write().get_mut(&switch) {
            s.unreachable = unreachable;
        }
    }

    pub fn set_latency(&self, switch: SwitchId, latency: Duration) {
        if let Some(s) = self.switches.write().get_mut(&switch) {
            s.latency = latency;
        }
    }

    pub fn is_static_mode(&self, switch: SwitchId) -> bool {
        self.switches.read().get(&switch).map(|s| s.static_mode).unwrap_or(false)
    }

    pub fn batches_pushed(&self) -> u64 {
        self.batches_pushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for MemoryFabric {
    async fn send_stats_request(
        &self,
        switch: SwitchId,
        kind: StatsKind,
    ) -> Result<StatsReply, SwitchError> {
        let latency = self.switches.read()
            .get(&switch)
            .map(|s| s.latency)
            .ok_or(SwitchError::Unreachable(switch))?;

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let switches = self.switches.read();
        let s = switches.get(&switch).ok_or(SwitchError::Unreachable(switch))?;
        if s.unreachable {
            return Err(SwitchError::Unreachable(switch));
        }

        let reply = match kind {
            StatsKind::Flow => StatsReply::Flow(
                s.rules
                    .iter()
                    .filter(|(_, r)| r.table == DYNAMIC_TABLE_ID)
                    .map(|(m, r)| FlowStatsEntry {
                        table: r.table,
                        priority: r.priority,
                        matcher: *m,
                        packet_count: r.packet_count,
                    })
                    .collect(),
            ),
            StatsKind::Port => {
                let mut entries: Vec<PortStatsEntry> = s.port_counters
                    .iter()
                    .map(|(&port, &(rx, tx))| PortStatsEntry { port, rx_packets: rx, tx_packets: tx })
                    .collect();
                entries.sort_by_key(|e| e.port);
                StatsReply::Port(entries)
            }
        };
        Ok(reply)
    }

    async fn push_rule_actions(&self, batch: RuleBatch) -> Result<(), SwitchError> {
        let mut switches = self.switches.write();
        // Whole batch or nothing
        if let Some(unknown) = batch.actions().iter().find(|a| !switches.contains_key(&a.switch())) {
            return Err(SwitchError::Rejected {
                switch: unknown.switch(),
                reason: format!("batch {} targets an unknown switch", batch.id()),
            });
        }
        for action in batch.actions() {
            if let Some(s) = switches.get_mut(&action.switch()) {
                s.apply(action);
            }
        }
        self.batches_pushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enabled_ports(&self, switch: SwitchId) -> Vec<PortNo> {
        self.switches.read().get(&switch).map(|s| s.ports.clone()).unwrap_or_default()
    }

    async fn convert_table(&self, switch: SwitchId, to_static: bool) -> Result<(), SwitchError> {
        let mut switches = self.switches.write();
        let s = switches.get_mut(&switch).ok_or(SwitchError::Unreachable(switch))?;
        s.static_mode = to_static;
        Ok(())
    }
}

// ============================================================================
// BINDING DIRECTORY
// ============================================================================

/// On-disk bindings description used by the binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingFile {
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub static_switches: Vec<SwitchId>,
    #[serde(default)]
    pub fallback_switches: Vec<SwitchId>,
    #[serde(default)]
    pub manual_ports: Vec<SwitchPort>,
}

impl BindingFile {
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn roles(&self) -> SwitchRoles {
        SwitchRoles::from_sets(&self.static_switches, &self.fallback_switches)
    }
}

/// Fixed binding directory. Host numbers follow switch-port order, from 1.
#[derive(Debug, Default)]
pub struct StaticBindings {
    bindings: RwLock<Vec<Binding>>,
    hosts: RwLock<HashMap<SwitchPort, u32>>,
    manual: RwLock<HashSet<SwitchPort>>,
}

impl StaticBindings {
    pub fn new(bindings: Vec<Binding>) -> Self {
        let directory = Self::default();
        directory.replace(bindings);
        directory
    }

    pub fn from_file(file: &BindingFile) -> Self {
        let directory = Self::new(file.bindings.clone());
        for &sp in &file.manual_ports {
            directory.set_manual(sp, true);
        }
        directory
    }

    pub fn replace(&self, bindings: Vec<Binding>) {
        let ports: BTreeSet<SwitchPort> = bindings.iter().map(|b| b.switch_port).collect();
        *self.hosts.write() = ports
            .into_iter()
            .enumerate()
            .map(|(i, sp)| (sp, i as u32 + 1))
            .collect();
        *self.bindings.write() = bindings;
    }

    pub fn set_manual(&self, port: SwitchPort, manual: bool) {
        let mut set = self.manual.write();
        if manual {
            set.insert(port);
        } else {
            set.remove(&port);
        }
    }
}

impl BindingDirectory for StaticBindings {
    fn list_bindings(&self) -> Vec<Binding> {
        self.bindings.read().clone()
    }

    fn host_number_for(&self, port: &SwitchPort) -> Option<u32> {
        self.hosts.read().get(port).copied()
    }

    fn manually_pushed_ports(&self) -> HashSet<SwitchPort> {
        self.manual.read().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================
