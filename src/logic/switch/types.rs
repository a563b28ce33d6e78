//! Switch Control-Plane Types
//!
//! Requests, replies and rule actions exchanged with the switches.
//! Wire encoding belongs to the control-plane implementation.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ETH_TYPE_IPV6;
use crate::logic::types::{Binding, MacAddr, PortNo, SwitchId, SwitchPort, TableId};

// ============================================================================
// STATISTICS
// ============================================================================

/// Kind of statistics request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsKind {
    /// Entries of the dynamic verification table
    Flow,
    /// Per-port rx/tx counters
    Port,
}

impl fmt::Display for StatsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsKind::Flow => write!(f, "FLOW"),
            StatsKind::Port => write!(f, "PORT"),
        }
    }
}

/// One flow-table entry from a flow-stats reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatsEntry {
    pub table: TableId,
    pub priority: u16,
    pub matcher: FlowMatch,
    pub packet_count: u64,
}

/// One port from a port-stats reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatsEntry {
    pub port: PortNo,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// Reply to a statistics request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatsReply {
    Flow(Vec<FlowStatsEntry>),
    Port(Vec<PortStatsEntry>),
}

impl StatsReply {
    pub fn flow_entries(&self) -> &[FlowStatsEntry] {
        match self {
            StatsReply::Flow(entries) => entries,
            StatsReply::Port(_) => &[],
        }
    }

    pub fn port_entries(&self) -> &[PortStatsEntry] {
        match self {
            StatsReply::Port(entries) => entries,
            StatsReply::Flow(_) => &[],
        }
    }
}

// ============================================================================
// MATCH & INSTRUCTIONS
// ============================================================================

/// Exact-match criteria of a rule. `None` fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FlowMatch {
    pub in_port: Option<PortNo>,
    pub eth_src: Option<MacAddr>,
    pub eth_type: Option<u16>,
    pub ipv6_src: Option<Ipv6Addr>,
}

impl FlowMatch {
    /// Catch-all for everything entering `port`
    pub fn in_port(port: PortNo) -> Self {
        Self {
            in_port: Some(port),
            ..Default::default()
        }
    }

    /// Verification match: bound MAC + IPv6 source on the bound ingress port
    pub fn verification(binding: &Binding) -> Self {
        Self {
            in_port: Some(binding.switch_port.port),
            eth_src: Some(binding.mac),
            eth_type: Some(ETH_TYPE_IPV6),
            ipv6_src: Some(binding.address),
        }
    }

    /// Entries carrying the source address count as passed traffic
    pub fn has_source_address(&self) -> bool {
        self.ipv6_src.is_some()
    }

    /// Non-strict containment: every field set here is equal in `other`
    pub fn covers(&self, other: &FlowMatch) -> bool {
        fn field<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            match mine {
                Some(v) => theirs.as_ref() == Some(v),
                None => true,
            }
        }

        field(&self.in_port, &other.in_port)
            && field(&self.eth_src, &other.eth_src)
            && field(&self.eth_type, &other.eth_type)
            && field(&self.ipv6_src, &other.ipv6_src)
    }
}

/// Rule instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instruction {
    GotoTable(TableId),
}

// ============================================================================
// RULE ACTIONS
// ============================================================================

/// Kind of rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Install,
    Remove,
    Modify,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Install => "install",
            RuleKind::Remove => "remove",
            RuleKind::Modify => "modify",
        }
    }
}

/// A single request to a switch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    switch: SwitchId,
    table: TableId,
    matcher: FlowMatch,
    instructions: Option<Vec<Instruction>>,
    priority: u16,
    kind: RuleKind,
}

impl RuleAction {
    pub fn install(
        switch: SwitchId,
        table: TableId,
        matcher: FlowMatch,
        instructions: Option<Vec<Instruction>>,
        priority: u16,
    ) -> Self {
        Self { switch, table, matcher, instructions, priority, kind: RuleKind::Install }
    }

    /// Non-strict delete of every rule covered by `matcher`
    pub fn remove(switch: SwitchId, table: TableId, matcher: FlowMatch) -> Self {
        Self { switch, table, matcher, instructions: None, priority: 0, kind: RuleKind::Remove }
    }

    pub fn modify(
        switch: SwitchId,
        table: TableId,
        matcher: FlowMatch,
        instructions: Option<Vec<Instruction>>,
        priority: u16,
    ) -> Self {
        Self { switch, table, matcher, instructions, priority, kind: RuleKind::Modify }
    }

    pub fn switch(&self) -> SwitchId { self.switch }
    pub fn table(&self) -> TableId { self.table }
    pub fn matcher(&self) -> &FlowMatch { &self.matcher }
    pub fn instructions(&self) -> Option<&[Instruction]> { self.instructions.as_deref() }
    pub fn priority(&self) -> u16 { self.priority }
    pub fn kind(&self) -> RuleKind { self.kind }

    /// Access port this action targets, if the match pins an ingress port
    pub fn target(&self) -> Option<SwitchPort> {
        self.matcher.in_port.map(|port| SwitchPort::new(self.switch, port))
    }
}

/// Rejected push into a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConflict {
    pub port: SwitchPort,
    pub existing: RuleKind,
    pub rejected: RuleKind,
}

impl fmt::Display for RuleConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port {} already targeted by {} in this batch, {} rejected",
            self.port,
            self.existing.as_str(),
            self.rejected.as_str()
        )
    }
}

/// Actions pushed to the control plane in one synchronization pass.
///
/// A port can only be targeted by one action kind per batch.
#[derive(Debug, Clone)]
pub struct RuleBatch {
    id: Uuid,
    actions: Vec<RuleAction>,
    targets: HashMap<SwitchPort, RuleKind>,
}

impl RuleBatch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            actions: Vec::new(),
            targets: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn push(&mut self, action: RuleAction) -> Result<(), RuleConflict> {
        if let Some(port) = action.target() {
            match self.targets.get(&port) {
                Some(&existing) if existing != action.kind() => {
                    return Err(RuleConflict { port, existing, rejected: action.kind() });
                }
                Some(_) => {}
                None => {
                    self.targets.insert(port, action.kind());
                }
            }
        }
        self.actions.push(action);
        Ok(())
    }

    pub fn actions(&self) -> &[RuleAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for RuleBatch {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> Binding {
        Binding {
            switch_port: SwitchPort::new(SwitchId(2), PortNo(1)),
            mac: "00:00:00:00:00:01".parse().unwrap(),
            address: "2001:db8::1".parse().unwrap(),
        }
    }

    #[test]
    fn test_in_port_match_covers_verification() {
        let b = binding();
        let catch_all = FlowMatch::in_port(PortNo(1));
        let verification = FlowMatch::verification(&b);

        assert!(catch_all.covers(&verification));
        assert!(catch_all.covers(&catch_all));
        assert!(!verification.covers(&catch_all));
        assert!(!FlowMatch::in_port(PortNo(2)).covers(&verification));
    }

    #[test]
    fn test_source_address_split() {
        assert!(FlowMatch::verification(&binding()).has_source_address());
        assert!(!FlowMatch::in_port(PortNo(1)).has_source_address());
    }

    #[test]
    fn test_batch_rejects_conflicting_kinds() {
        let sw = SwitchId(2);
        let mut batch = RuleBatch::new();

        batch.push(RuleAction::install(sw, TableId(1), FlowMatch::verification(&binding()), None, 10)).unwrap();
        batch.push(RuleAction::install(sw, TableId(1), FlowMatch::in_port(PortNo(1)), None, 9)).unwrap();

        let err = batch
            .push(RuleAction::remove(sw, TableId(1), FlowMatch::in_port(PortNo(1))))
            .unwrap_err();
        assert_eq!(err.existing, RuleKind::Install);
        assert_eq!(err.rejected, RuleKind::Remove);
        assert_eq!(batch.len(), 2);

        // Other ports are unaffected
        batch.push(RuleAction::remove(sw, TableId(1), FlowMatch::in_port(PortNo(2)))).unwrap();
        assert_eq!(batch.len(), 3);
    }
}
