//! Flow Rule Synchronizer - Đồng bộ rule xác thực xuống switch
//!
//! Turns classifier transitions into rule batches:
//! - install: verification rule at the port's rank + catch-all at rank - 1
//! - remove: delete everything matching the ingress port
//! - reprioritize: rewrite priorities in place
//!
//! One batch per call. A requested port without a binding is logged and
//! skipped; the rest of the batch still goes out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{
    DYNAMIC_TABLE_ID, FLOW_TABLE_ID, RELIABLE_PORT_PRIORITY, RULES_PER_PORT, STATIC_RULE_BASE,
    STATIC_TABLE_ID,
};
use super::classifier::PortClassifier;
use super::error::SwitchError;
use super::health::FlowHealthTracker;
use super::rebalancer::RankTable;
use super::switch::{BindingDirectory, ControlPlane, FlowMatch, Instruction, RuleAction, RuleBatch};
use super::types::{Binding, SwitchId, SwitchPort, SwitchRole, TableId};

// ============================================================================
// RULE ACCOUNTING
// ============================================================================

/// Static and dynamic rule counts per switch
#[derive(Debug, Default)]
pub struct RuleCounts {
    statics: RwLock<HashMap<SwitchId, usize>>,
    dynamics: RwLock<HashMap<SwitchId, usize>>,
}

impl RuleCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static count = base rules + one reliable rule per enabled port
    pub fn init_switch(&self, switch: SwitchId, enabled_ports: usize) {
        self.statics.write().insert(switch, STATIC_RULE_BASE + enabled_ports);
        self.dynamics.write().insert(switch, 0);
    }

    /// Recompute dynamic counts from the ports carrying dynamic rules
    pub fn update_dynamic(&self, verified_per_switch: &HashMap<SwitchId, usize>) {
        let mut dynamics = self.dynamics.write();
        for (sw, count) in dynamics.iter_mut() {
            *count = RULES_PER_PORT * verified_per_switch.get(sw).copied().unwrap_or(0);
        }
    }

    /// Rule count as seen by the admin layer. `None` for fallback switches.
    pub fn rule_count(&self, switch: SwitchId, role: SwitchRole) -> Option<usize> {
        match role {
            SwitchRole::Fallback => None,
            SwitchRole::StaticallyTrusted => Some(self.statics.read().get(&switch).copied().unwrap_or(0)),
            SwitchRole::Managed => Some(self.dynamics.read().get(&switch).copied().unwrap_or(0)),
        }
    }

    pub fn switches(&self) -> Vec<SwitchId> {
        let mut list: Vec<SwitchId> = self.statics.read().keys().copied().collect();
        list.sort();
        list
    }
}

// ============================================================================
// SYNCHRONIZER
// ============================================================================

pub struct FlowRuleSynchronizer {
    plane: Arc<dyn ControlPlane>,
    directory: Arc<dyn BindingDirectory>,
    ranks: Arc<RankTable>,
    health: Arc<FlowHealthTracker>,
    classifier: Arc<PortClassifier>,
}

impl FlowRuleSynchronizer {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        directory: Arc<dyn BindingDirectory>,
        ranks: Arc<RankTable>,
        health: Arc<FlowHealthTracker>,
        classifier: Arc<PortClassifier>,
    ) -> Self {
        Self { plane, directory, ranks, health, classifier }
    }

    /// Bindings of the requested ports; ports without one are logged
    fn bindings_for(&self, ports: &[SwitchPort], op: &str) -> Vec<Binding> {
        let wanted: HashSet<SwitchPort> = ports.iter().copied().collect();
        let found: Vec<Binding> = self.directory
            .list_bindings()
            .into_iter()
            .filter(|b| wanted.contains(&b.switch_port))
            .collect();

        let covered: HashSet<SwitchPort> = found.iter().map(|b| b.switch_port).collect();
        let missing: BTreeSet<&SwitchPort> = wanted.iter().filter(|p| !covered.contains(*p)).collect();
        if !missing.is_empty() {
            log::error!(
                "{}: no binding for {} port(s): {:?}",
                op,
                missing.len(),
                missing.iter().map(|p| p.to_string()).collect::<Vec<_>>()
            );
        }
        found
    }

    async fn push(&self, batch: RuleBatch, op: &str) -> Result<usize, SwitchError> {
        let n = batch.len();
        if n == 0 {
            return Ok(0);
        }
        let id = batch.id();
        self.plane.push_rule_actions(batch).await?;
        log::debug!("{} batch {} pushed ({} actions)", op, id, n);
        Ok(n)
    }

    fn add(batch: &mut RuleBatch, action: RuleAction) {
        if let Err(conflict) = batch.push(action) {
            log::error!("Batch {}: {}", batch.id(), conflict);
        }
    }

    /// Install verification + catch-all rules in the dynamic table
    pub async fn install(&self, ports: &[SwitchPort]) -> Result<usize, SwitchError> {
        if ports.is_empty() {
            return Ok(0);
        }

        let mut batch = RuleBatch::new();
        for b in self.bindings_for(ports, "install") {
            let sp = b.switch_port;
            let rank = self.ranks.get(&sp);
            Self::add(&mut batch, RuleAction::install(
                sp.switch,
                DYNAMIC_TABLE_ID,
                FlowMatch::verification(&b),
                Some(vec![Instruction::GotoTable(FLOW_TABLE_ID)]),
                rank,
            ));
            Self::add(&mut batch, RuleAction::install(
                sp.switch,
                DYNAMIC_TABLE_ID,
                FlowMatch::in_port(sp.port),
                None,
                rank.saturating_sub(1),
            ));
        }
        self.push(batch, "install").await
    }

    /// Remove both rules of every port; once the switch took the batch,
    /// health counters restart unless the port is abnormal
    pub async fn remove(&self, ports: &[SwitchPort]) -> Result<usize, SwitchError> {
        if ports.is_empty() {
            return Ok(0);
        }

        let mut batch = RuleBatch::new();
        let mut restart = Vec::new();
        for &sp in ports {
            Self::add(&mut batch, RuleAction::remove(sp.switch, DYNAMIC_TABLE_ID, FlowMatch::in_port(sp.port)));
            if !self.classifier.is_abnormal(&sp) {
                restart.push(sp);
            }
        }

        let n = self.push(batch, "remove").await?;
        for sp in &restart {
            self.health.reset(sp);
        }
        Ok(n)
    }

    /// Rewrite the priority of the ports' rules in `table`.
    /// Catch-all rules only exist in the dynamic table.
    pub async fn reprioritize(&self, ports: &[SwitchPort], table: TableId) -> Result<usize, SwitchError> {
        if ports.is_empty() {
            return Ok(0);
        }

        let mut batch = RuleBatch::new();
        for b in self.bindings_for(ports, "reprioritize") {
            let sp = b.switch_port;
            let rank = self.ranks.get(&sp);
            if table == DYNAMIC_TABLE_ID {
                Self::add(&mut batch, RuleAction::modify(
                    sp.switch,
                    table,
                    FlowMatch::in_port(sp.port),
                    None,
                    rank.saturating_sub(1),
                ));
            }
            Self::add(&mut batch, RuleAction::modify(
                sp.switch,
                table,
                FlowMatch::verification(&b),
                Some(vec![Instruction::GotoTable(FLOW_TABLE_ID)]),
                rank,
            ));
        }
        self.push(batch, "reprioritize").await
    }

    /// Remove then reinstall, so the rules pick up the current rank
    pub async fn refresh(&self, ports: &[SwitchPort]) -> Result<usize, SwitchError> {
        let removed = self.remove(ports).await?;
        let installed = self.install(ports).await?;
        Ok(removed + installed)
    }

    /// Static pass-through rule for every enabled port that is not an
    /// access port (switch-to-switch links)
    pub async fn install_reliable_ports(
        &self,
        switch: SwitchId,
        access: &HashSet<SwitchPort>,
    ) -> Result<usize, SwitchError> {
        let mut batch = RuleBatch::new();
        for port in self.plane.enabled_ports(switch) {
            if access.contains(&SwitchPort::new(switch, port)) {
                continue;
            }
            log::info!("Reliable port static rule: {}-{}", switch, port);
            Self::add(&mut batch, RuleAction::install(
                switch,
                STATIC_TABLE_ID,
                FlowMatch::in_port(port),
                Some(vec![Instruction::GotoTable(FLOW_TABLE_ID)]),
                RELIABLE_PORT_PRIORITY,
            ));
        }
        self.push(batch, "reliable-ports").await
    }
}

// ============================================================================
// TESTS
// ============================================================================
