//! Statistics Collector - Thu thập thống kê từ switch
//!
//! Fans out one stats request per switch and waits at most the poll budget.
//! Switches that miss the deadline are left out of that cycle's result.
//! `PortDeltaTable` turns raw rx/tx port counters into per-cycle packet counts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

use crate::constants::PORT_RATE_CORRECTION;
use super::switch::{ControlPlane, PortStatsEntry, StatsKind, StatsReply, SwitchRoles};
use super::types::{SwitchId, SwitchPort};

// ============================================================================
// COLLECTOR
// ============================================================================

pub struct StatisticsCollector {
    plane: Arc<dyn ControlPlane>,
    roles: Arc<SwitchRoles>,
    budget: Duration,
}

impl StatisticsCollector {
    pub fn new(plane: Arc<dyn ControlPlane>, roles: Arc<SwitchRoles>, budget: Duration) -> Self {
        Self { plane, roles, budget }
    }

    /// Request `kind` statistics from every switch in `switches`.
    ///
    /// Flow stats skip statically trusted and fallback switches. Unreachable
    /// or late switches are absent from the returned map.
    pub async fn collect(
        &self,
        switches: &[SwitchId],
        kind: StatsKind,
    ) -> HashMap<SwitchId, StatsReply> {
        let mut tasks = JoinSet::new();
        let mut pending: HashSet<SwitchId> = HashSet::new();

        for &sw in switches {
            if kind == StatsKind::Flow && !self.roles.is_dynamic(sw) {
                continue;
            }
            if !pending.insert(sw) {
                continue;
            }
            let plane = self.plane.clone();
            tasks.spawn(async move { (sw, plane.send_stats_request(sw, kind).await) });
        }

        let deadline = Instant::now() + self.budget;
        let mut replies = HashMap::with_capacity(pending.len());

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((sw, result)))) => {
                    pending.remove(&sw);
                    match result {
                        Ok(reply) => {
                            replies.insert(sw, reply);
                        }
                        Err(e) => log::warn!("{} stats from {} failed: {}", kind, sw, e),
                    }
                }
                Ok(Some(Err(e))) => {
                    log::error!("{} stats request task failed: {}", kind, e);
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    let mut missed: Vec<SwitchId> = pending.iter().copied().collect();
                    missed.sort();
                    log::warn!(
                        "{} stats: {} switch(es) missed the {:?} deadline: {:?}",
                        kind,
                        missed.len(),
                        self.budget,
                        missed.iter().map(|s| s.to_string()).collect::<Vec<_>>()
                    );
                    break;
                }
            }
        }

        log::debug!("{} stats: {} replies", kind, replies.len());
        replies
    }
}

// ============================================================================
// PORT DELTAS
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct PortSample {
    rx_previous: u64,
    tx_previous: u64,
    /// false until the second sample produced a delta
    official: bool,
    in_packets: u64,
    out_packets: u64,
}

/// Per-cycle corrected rx/tx packet counts per port
#[derive(Debug, Default)]
pub struct PortDeltaTable {
    samples: RwLock<HashMap<SwitchPort, PortSample>>,
}

impl PortDeltaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one switch's port counters. The first sample of a port is
    /// tentative and only sets the base.
    pub fn ingest(&self, switch: SwitchId, entries: &[PortStatsEntry]) {
        let mut samples = self.samples.write();
        for e in entries {
            let sp = SwitchPort::new(switch, e.port);
            match samples.get_mut(&sp) {
                Some(s) => {
                    s.in_packets = corrected(e.rx_packets.saturating_sub(s.rx_previous));
                    s.out_packets = corrected(e.tx_packets.saturating_sub(s.tx_previous));
                    s.rx_previous = e.rx_packets;
                    s.tx_previous = e.tx_packets;
                    s.official = true;
                }
                None => {
                    samples.insert(sp, PortSample {
                        rx_previous: e.rx_packets,
                        tx_previous: e.tx_packets,
                        ..Default::default()
                    });
                }
            }
        }
    }

    pub fn in_packets(&self, port: &SwitchPort) -> u64 {
        self.samples.read().get(port).map(|s| s.in_packets).unwrap_or(0)
    }

    pub fn out_packets(&self, port: &SwitchPort) -> u64 {
        self.samples.read().get(port).map(|s| s.out_packets).unwrap_or(0)
    }

    pub fn is_official(&self, port: &SwitchPort) -> bool {
        self.samples.read().get(port).map(|s| s.official).unwrap_or(false)
    }

    /// Egress of the other tracked ports on the same switch
    pub fn sibling_egress<F>(&self, port: &SwitchPort, tracked: F) -> u64
    where
        F: Fn(&SwitchPort) -> bool,
    {
        self.samples.read()
            .iter()
            .filter(|(sp, _)| sp.switch == port.switch && *sp != port && tracked(*sp))
            .map(|(_, s)| s.out_packets)
            .sum()
    }
}

fn corrected(delta: u64) -> u64 {
    (delta as f64 / PORT_RATE_CORRECTION) as u64
}

// ============================================================================
// TESTS
// ============================================================================
