//! Switch Module - External Collaborator Seams
//!
//! The engine talks to the network only through these traits:
//! - `ControlPlane`: stats requests + rule pushes to switches
//! - `BindingDirectory`: which MAC/IPv6 sits behind which access port
//! - `SwitchRoles`: admin-maintained role table (read-only to the engine)
//!
//! `memory.rs` provides in-memory implementations for tests and dry runs.

pub mod types;
pub mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::logic::error::SwitchError;
use crate::logic::types::{Binding, PortNo, SwitchId, SwitchPort, SwitchRole};

pub use types::{
    FlowMatch, FlowStatsEntry, Instruction, PortStatsEntry, RuleAction, RuleBatch,
    RuleConflict, RuleKind, StatsKind, StatsReply,
};
pub use memory::{MemoryFabric, StaticBindings};

// ============================================================================
// TRAITS
// ============================================================================

/// Switch control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Send one statistics request and wait for its reply
    async fn send_stats_request(
        &self,
        switch: SwitchId,
        kind: StatsKind,
    ) -> Result<StatsReply, SwitchError>;

    /// Push a batch of rule actions
    async fn push_rule_actions(&self, batch: RuleBatch) -> Result<(), SwitchError>;

    /// Enabled ports of a switch (empty if unknown)
    fn enabled_ports(&self, switch: SwitchId) -> Vec<PortNo>;

    /// Move a switch between static and dynamic verification tables
    async fn convert_table(&self, switch: SwitchId, to_static: bool) -> Result<(), SwitchError>;
}

/// Address-binding directory
pub trait BindingDirectory: Send + Sync {
    /// All active bindings
    fn list_bindings(&self) -> Vec<Binding>;

    /// Host number of the host behind `port`
    fn host_number_for(&self, port: &SwitchPort) -> Option<u32>;

    /// Ports whose verification rules were pushed manually by an operator
    fn manually_pushed_ports(&self) -> HashSet<SwitchPort>;
}

// ============================================================================
// SWITCH ROLES
// ============================================================================

/// Role table, maintained by the topology/admin layer.
///
/// Unknown switches are `Managed`.
#[derive(Debug, Default)]
pub struct SwitchRoles {
    roles: RwLock<HashMap<SwitchId, SwitchRole>>,
}

impl SwitchRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sets(statics: &[SwitchId], fallbacks: &[SwitchId]) -> Self {
        let roles = Self::new();
        for &sw in statics {
            roles.set_role(sw, SwitchRole::StaticallyTrusted);
        }
        for &sw in fallbacks {
            roles.set_role(sw, SwitchRole::Fallback);
        }
        roles
    }

    pub fn role(&self, switch: SwitchId) -> SwitchRole {
        self.roles.read().get(&switch).copied().unwrap_or_default()
    }

    pub fn is_dynamic(&self, switch: SwitchId) -> bool {
        self.role(switch).is_dynamic()
    }

    /// Admin-side update
    pub fn set_role(&self, switch: SwitchId, role: SwitchRole) {
        let mut roles = self.roles.write();
        if role == SwitchRole::Managed {
            roles.remove(&switch);
        } else {
            roles.insert(switch, role);
        }
    }

    pub fn switches_with(&self, role: SwitchRole) -> Vec<SwitchId> {
        let mut list: Vec<SwitchId> = self.roles.read()
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(sw, _)| *sw)
            .collect();
        list.sort();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_default_managed() {
        let roles = SwitchRoles::from_sets(&[SwitchId(1)], &[SwitchId(9)]);
        assert_eq!(roles.role(SwitchId(1)), SwitchRole::StaticallyTrusted);
        assert_eq!(roles.role(SwitchId(9)), SwitchRole::Fallback);
        assert_eq!(roles.role(SwitchId(2)), SwitchRole::Managed);
        assert!(roles.is_dynamic(SwitchId(2)));

        roles.set_role(SwitchId(1), SwitchRole::Managed);
        assert!(roles.is_dynamic(SwitchId(1)));
        assert!(roles.switches_with(SwitchRole::StaticallyTrusted).is_empty());
    }
}
