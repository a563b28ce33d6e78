//! Port Classifier - State machine Normal / Observation / Abnormal
//!
//! Membership is a single authoritative map `SwitchPort -> Placement`.
//! The Normal and Abnormal FIFOs are order views kept under the same lock,
//! so a port can never sit in two states or fall out of all of them.
//!
//! # Passes (once per verdict cycle)
//! - `normal_pass`: pick up to `bound` Normal ports for verification
//! - `observation_pass`: release good streaks to Normal, demote bad ports
//! - `abnormal_pass`: move ports with a good verdict back to Observation
//!
//! Every placement remembers the cycle it was last changed in; a pass
//! leaves alone ports another pass already touched in the same cycle.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;

use super::types::{PortState, SwitchId, SwitchPort, Verdict};

// ============================================================================
// TYPES
// ============================================================================

/// Where a port currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Normal {
        since: u64,
    },
    Observation {
        /// Consecutive good cycles seen so far
        good_streak: u32,
        /// Picked from the Normal queue (not demoted from Abnormal)
        polled: bool,
        since: u64,
    },
    Abnormal {
        since: u64,
    },
}

impl Placement {
    pub fn state(&self) -> PortState {
        match self {
            Placement::Normal { .. } => PortState::Normal,
            Placement::Observation { .. } => PortState::Observation,
            Placement::Abnormal { .. } => PortState::Abnormal,
        }
    }

    fn since(&self) -> u64 {
        match *self {
            Placement::Normal { since }
            | Placement::Observation { since, .. }
            | Placement::Abnormal { since } => since,
        }
    }
}

/// Result of an observation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationOutcome {
    /// Back to Normal
    pub released: Vec<SwitchPort>,
    /// Moved to Abnormal
    pub demoted: Vec<SwitchPort>,
}

/// Upward view of membership
#[derive(Debug, Clone, Default, Serialize)]
pub struct MembershipSnapshot {
    pub normal: Vec<SwitchPort>,
    /// Observation ports picked from Normal
    pub polling: Vec<SwitchPort>,
    pub observe: Vec<SwitchPort>,
    pub abnormal: Vec<SwitchPort>,
}

#[derive(Debug, Default)]
struct Membership {
    placements: HashMap<SwitchPort, Placement>,
    normal_order: VecDeque<SwitchPort>,
    abnormal_order: VecDeque<SwitchPort>,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Default)]
pub struct PortClassifier {
    inner: Mutex<Membership>,
}

impl PortClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset membership: every port Normal, in shuffled order
    pub fn init(&self, ports: &[SwitchPort]) {
        let mut order: Vec<SwitchPort> = ports.to_vec();
        order.sort();
        order.dedup();
        order.shuffle(&mut rand::thread_rng());

        let mut m = self.inner.lock();
        m.placements = order.iter().map(|&p| (p, Placement::Normal { since: 0 })).collect();
        m.normal_order = order.into_iter().collect();
        m.abnormal_order.clear();
    }

    /// Dequeue up to `bound` Normal ports into Observation.
    ///
    /// Ports for which `skip` holds are requeued instead. Selection stops
    /// once a full rotation found only skipped ports.
    pub fn normal_pass<F>(&self, cycle: u64, bound: usize, skip: F) -> Vec<SwitchPort>
    where
        F: Fn(&SwitchPort) -> bool,
    {
        let mut m = self.inner.lock();
        let mut selected = Vec::new();
        let mut skipped = 0usize;

        while selected.len() < bound {
            if skipped >= m.normal_order.len() {
                break;
            }
            let Some(port) = m.normal_order.pop_front() else {
                break;
            };

            let touched = m.placements.get(&port).map(|p| p.since() == cycle).unwrap_or(false);
            if touched || skip(&port) {
                m.normal_order.push_back(port);
                skipped += 1;
                continue;
            }

            m.placements.insert(port, Placement::Observation { good_streak: 0, polled: true, since: cycle });
            selected.push(port);
        }

        selected
    }

    /// Judge every Observation port not touched this cycle.
    ///
    /// `threshold` gives the good streak a port needs before release.
    /// `NoData` leaves the port as it is.
    pub fn observation_pass<F>(
        &self,
        cycle: u64,
        verdicts: &HashMap<SwitchPort, Verdict>,
        threshold: F,
    ) -> ObservationOutcome
    where
        F: Fn(&SwitchPort) -> u32,
    {
        let mut m = self.inner.lock();
        let mut outcome = ObservationOutcome::default();

        let mut observed: Vec<(SwitchPort, u32, bool)> = m.placements
            .iter()
            .filter_map(|(sp, p)| match *p {
                Placement::Observation { good_streak, polled, since } if since < cycle => {
                    Some((*sp, good_streak, polled))
                }
                _ => None,
            })
            .collect();
        observed.sort();

        for (port, streak, polled) in observed {
            match verdicts.get(&port).copied().unwrap_or(Verdict::NoData) {
                Verdict::Good if streak >= threshold(&port) => {
                    m.placements.insert(port, Placement::Normal { since: cycle });
                    m.normal_order.push_back(port);
                    outcome.released.push(port);
                }
                Verdict::Good => {
                    m.placements.insert(port, Placement::Observation {
                        good_streak: streak + 1,
                        polled,
                        since: cycle,
                    });
                }
                Verdict::Bad => {
                    m.placements.insert(port, Placement::Abnormal { since: cycle });
                    m.abnormal_order.push_back(port);
                    outcome.demoted.push(port);
                }
                Verdict::NoData => {}
            }
        }

        outcome
    }

    /// Move Abnormal ports with a good verdict back to Observation.
    /// Everything else is requeued in order.
    pub fn abnormal_pass(&self, cycle: u64, verdicts: &HashMap<SwitchPort, Verdict>) -> Vec<SwitchPort> {
        let mut m = self.inner.lock();
        let mut promoted = Vec::new();

        for _ in 0..m.abnormal_order.len() {
            let Some(port) = m.abnormal_order.pop_front() else {
                break;
            };

            let touched = m.placements.get(&port).map(|p| p.since() == cycle).unwrap_or(false);
            let good = verdicts.get(&port) == Some(&Verdict::Good);
            if !touched && good {
                m.placements.insert(port, Placement::Observation { good_streak: 0, polled: false, since: cycle });
                promoted.push(port);
            } else {
                m.abnormal_order.push_back(port);
            }
        }

        promoted
    }

    // ========================================================================
    // VIEWS
    // ========================================================================

    pub fn placement(&self, port: &SwitchPort) -> Option<Placement> {
        self.inner.lock().placements.get(port).copied()
    }

    pub fn state_of(&self, port: &SwitchPort) -> Option<PortState> {
        self.placement(port).map(|p| p.state())
    }

    pub fn is_abnormal(&self, port: &SwitchPort) -> bool {
        self.state_of(port) == Some(PortState::Abnormal)
    }

    /// Tracked ports in `state`; Normal and Abnormal in queue order
    pub fn ports_in(&self, state: PortState) -> Vec<SwitchPort> {
        let m = self.inner.lock();
        match state {
            PortState::Normal => m.normal_order.iter().copied().collect(),
            PortState::Abnormal => m.abnormal_order.iter().copied().collect(),
            PortState::Observation => {
                let mut ports: Vec<SwitchPort> = m.placements
                    .iter()
                    .filter(|(_, p)| p.state() == PortState::Observation)
                    .map(|(sp, _)| *sp)
                    .collect();
                ports.sort();
                ports
            }
        }
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        let m = self.inner.lock();
        let mut snap = MembershipSnapshot {
            normal: m.normal_order.iter().copied().collect(),
            abnormal: m.abnormal_order.iter().copied().collect(),
            ..Default::default()
        };

        for (sp, p) in &m.placements {
            if let Placement::Observation { polled, .. } = p {
                snap.observe.push(*sp);
                if *polled {
                    snap.polling.push(*sp);
                }
            }
        }
        snap.observe.sort();
        snap.polling.sort();
        snap
    }

    /// Ports carrying dynamic rules (Observation + Abnormal) per switch
    pub fn verified_per_switch(&self) -> HashMap<SwitchId, usize> {
        let m = self.inner.lock();
        let mut counts = HashMap::new();
        for (sp, p) in &m.placements {
            if p.state() != PortState::Normal {
                *counts.entry(sp.switch).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn tracked_ports(&self) -> Vec<SwitchPort> {
        let mut ports: Vec<SwitchPort> = self.inner.lock().placements.keys().copied().collect();
        ports.sort();
        ports
    }

    pub fn len(&self) -> usize {
        self.inner.lock().placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order views agree with the authoritative map
    pub fn is_consistent(&self) -> bool {
        let m = self.inner.lock();
        let view_matches = |order: &VecDeque<SwitchPort>, state: PortState| {
            let expected = m.placements.values().filter(|p| p.state() == state).count();
            let mut seen = std::collections::HashSet::new();
            order.len() == expected
                && order.iter().all(|sp| {
                    seen.insert(*sp) && m.placements.get(sp).map(|p| p.state()) == Some(state)
                })
        };

        view_matches(&m.normal_order, PortState::Normal)
            && view_matches(&m.abnormal_order, PortState::Abnormal)
    }
}
