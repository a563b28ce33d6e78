//! Credit Ledger - Điểm uy tín theo port
//!
//! Bounded reputation per access port. +1 on a good cycle, -2 on a bad one.
//! Ports on statically trusted or fallback switches are never adjusted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::switch::SwitchRoles;
use super::types::SwitchPort;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const CREDIT_MIN: u8 = 0;
pub const CREDIT_MAX: u8 = 47;
pub const CREDIT_DEFAULT: u8 = 24;

const REWARD: u8 = 1;
const PENALTY: u8 = 2;

/// Good cycles required in Observation at credit 0
const MAX_OBSERVATION_STREAK: u32 = 6;

/// Credit points per upward scale level
const LEVEL_WIDTH: u8 = 8;

// ============================================================================
// LEDGER
// ============================================================================

pub struct CreditLedger {
    credits: RwLock<HashMap<SwitchPort, u8>>,
    roles: Arc<SwitchRoles>,
}

impl CreditLedger {
    pub fn new(roles: Arc<SwitchRoles>) -> Self {
        Self {
            credits: RwLock::new(HashMap::new()),
            roles,
        }
    }

    /// Reset every port to the default credit
    pub fn init(&self, ports: &[SwitchPort]) {
        let mut credits = self.credits.write();
        credits.clear();
        for &p in ports {
            credits.insert(p, CREDIT_DEFAULT);
        }
    }

    pub fn get(&self, port: &SwitchPort) -> u8 {
        self.credits.read().get(port).copied().unwrap_or(CREDIT_DEFAULT)
    }

    /// Good cycle. Returns the new credit, or None if the port is exempt.
    pub fn reward(&self, port: SwitchPort) -> Option<u8> {
        if !self.roles.is_dynamic(port.switch) {
            return None;
        }
        let mut credits = self.credits.write();
        let credit = credits.entry(port).or_insert(CREDIT_DEFAULT);
        *credit = credit.saturating_add(REWARD).min(CREDIT_MAX);
        Some(*credit)
    }

    /// Bad cycle. Returns the new credit, or None if the port is exempt.
    pub fn penalize(&self, port: SwitchPort) -> Option<u8> {
        if !self.roles.is_dynamic(port.switch) {
            return None;
        }
        let mut credits = self.credits.write();
        let credit = credits.entry(port).or_insert(CREDIT_DEFAULT);
        *credit = credit.saturating_sub(PENALTY).max(CREDIT_MIN);
        Some(*credit)
    }

    /// Credit on the 0-5 scale reported upward
    pub fn level(&self, port: &SwitchPort) -> u8 {
        self.get(port) / LEVEL_WIDTH
    }

    /// Consecutive good cycles needed to leave Observation
    pub fn observation_threshold(&self, port: &SwitchPort) -> u32 {
        MAX_OBSERVATION_STREAK - self.level(port) as u32
    }

    pub fn snapshot(&self) -> HashMap<SwitchPort, u8> {
        self.credits.read().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================
