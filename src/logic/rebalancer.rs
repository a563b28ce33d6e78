//! Priority Rebalancer
//!
//! Every `period` port-stats cycles, ranks each access port by the packets
//! it received during the period, relative to the busiest port of its
//! switch. Busier ports get higher verification-rule priority.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::constants::BINDING_PRIORITY;
use super::switch::StatsReply;
use super::types::{SwitchId, SwitchPort};

// ============================================================================
// RANK TABLE
// ============================================================================

/// Current verification-rule priority per port
#[derive(Debug, Default)]
pub struct RankTable {
    ranks: RwLock<HashMap<SwitchPort, u16>>,
}

impl RankTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, ports: &[SwitchPort]) {
        let mut ranks = self.ranks.write();
        ranks.clear();
        for &p in ports {
            ranks.insert(p, BINDING_PRIORITY);
        }
    }

    pub fn get(&self, port: &SwitchPort) -> u16 {
        self.ranks.read().get(port).copied().unwrap_or(BINDING_PRIORITY)
    }

    pub fn set(&self, port: SwitchPort, rank: u16) {
        self.ranks.write().insert(port, rank.max(BINDING_PRIORITY));
    }

    pub fn snapshot(&self) -> HashMap<SwitchPort, u16> {
        self.ranks.read().clone()
    }
}

// ============================================================================
// REBALANCER
// ============================================================================

#[derive(Debug)]
struct PeriodState {
    countdown: u32,
    /// rx counter at the start of the current period
    baseline: HashMap<SwitchPort, u64>,
}

pub struct PriorityRebalancer {
    priority_level: AtomicU32,
    period: u32,
    state: Mutex<PeriodState>,
}

impl PriorityRebalancer {
    pub fn new(priority_level: u32, period: u32) -> Self {
        let period = period.max(1);
        Self {
            priority_level: AtomicU32::new(priority_level.max(1)),
            period,
            state: Mutex::new(PeriodState { countdown: period, baseline: HashMap::new() }),
        }
    }

    pub fn priority_level(&self) -> u32 {
        self.priority_level.load(Ordering::SeqCst)
    }

    pub fn set_priority_level(&self, level: u32) {
        self.priority_level.store(level.max(1), Ordering::SeqCst);
        log::info!("Priority level set to {}", level.max(1));
    }

    /// Restart the period
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.countdown = self.period;
        state.baseline.clear();
    }

    /// Feed one port-stats cycle. Returns true at a period boundary,
    /// after `ranks` has been rewritten.
    pub fn on_port_stats(
        &self,
        replies: &HashMap<SwitchId, StatsReply>,
        tracked: &HashSet<SwitchPort>,
        ranks: &RankTable,
    ) -> bool {
        let mut state = self.state.lock();

        for (&sw, reply) in replies {
            for e in reply.port_entries() {
                let sp = SwitchPort::new(sw, e.port);
                if tracked.contains(&sp) {
                    state.baseline.entry(sp).or_insert(e.rx_packets);
                }
            }
        }

        state.countdown = state.countdown.saturating_sub(1);
        if state.countdown > 0 {
            return false;
        }
        state.countdown = self.period;

        let level = self.priority_level() as u64;
        let mut changed = 0usize;

        for (&sw, reply) in replies {
            let received: Vec<(SwitchPort, u64)> = reply
                .port_entries()
                .iter()
                .map(|e| (SwitchPort::new(sw, e.port), e.rx_packets))
                .filter(|(sp, _)| tracked.contains(sp))
                .map(|(sp, rx)| {
                    let base = state.baseline.insert(sp, rx).unwrap_or(rx);
                    (sp, rx.saturating_sub(base))
                })
                .collect();

            let max = received.iter().map(|(_, n)| *n).max().unwrap_or(0);
            if max == 0 {
                continue;
            }

            let divisor = if max / (level * 10) > 1 { max / level } else { 1 };
            if divisor == 1 {
                continue;
            }

            for (sp, n) in received {
                let rank = (n / divisor).max(BINDING_PRIORITY as u64).min(u16::MAX as u64) as u16;
                ranks.set(sp, rank);
                changed += 1;
            }
        }

        log::debug!("Priority rebalance: {} port rank(s) rewritten", changed);
        true
    }
}
