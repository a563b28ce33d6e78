//! Flow Health Tracker - Theo dõi tỷ lệ mất gói
//!
//! Per-port pass/drop accounting from dynamic-table flow stats.
//! Verification entries (source address in the match) count passed packets,
//! catch-all entries count dropped ones. Drives the loss-rate plan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::constants::BINDING_PRIORITY;
use super::credit::CreditLedger;
use super::status_log::{StatusChange, StatusEvent, StatusLog};
use super::switch::{BindingDirectory, FlowStatsEntry};
use super::types::{SwitchId, SwitchPort, Verdict};

// ============================================================================
// COUNTERS
// ============================================================================

/// Pass/drop counters of one port
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlowCounters {
    pub pass_count: u64,
    pub drop_count: u64,
    pub cumulative_pass: u64,
    pub cumulative_drop: u64,
    pub drop_rate: f64,
    pub cumulative_drop_rate: f64,
}

impl FlowCounters {
    /// New cumulative pass value. A lower value means the switch reset its
    /// counters: delta clamps to 0 and the raw value becomes the new base.
    fn apply_pass(&mut self, raw: u64) {
        self.pass_count = raw.saturating_sub(self.cumulative_pass);
        self.cumulative_pass = raw;
        self.recompute();
    }

    fn apply_drop(&mut self, raw: u64) {
        self.drop_count = raw.saturating_sub(self.cumulative_drop);
        self.cumulative_drop = raw;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.drop_rate = ratio(self.drop_count, self.pass_count);
        self.cumulative_drop_rate = ratio(self.cumulative_drop, self.cumulative_pass);
    }

    /// Packets seen this cycle
    pub fn sent(&self) -> u64 {
        self.pass_count + self.drop_count
    }
}

fn ratio(drop: u64, pass: u64) -> f64 {
    let total = drop + pass;
    if total == 0 {
        0.0
    } else {
        drop as f64 / total as f64
    }
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct FlowHealthTracker {
    counters: RwLock<HashMap<SwitchPort, FlowCounters>>,
    /// Epoch of each port's last reset, written under the counters lock
    reset_epochs: RwLock<HashMap<SwitchPort, u64>>,
    epoch: AtomicU64,
    /// true = last logged state was good
    log_flags: RwLock<HashMap<SwitchPort, bool>>,
    loss_rate_threshold: f64,
    drop_count_threshold: u64,
    credit: Arc<CreditLedger>,
    status_log: Arc<StatusLog>,
    directory: Arc<dyn BindingDirectory>,
}

impl FlowHealthTracker {
    pub fn new(
        loss_rate_threshold: f64,
        drop_count_threshold: u64,
        credit: Arc<CreditLedger>,
        status_log: Arc<StatusLog>,
        directory: Arc<dyn BindingDirectory>,
    ) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            reset_epochs: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            log_flags: RwLock::new(HashMap::new()),
            loss_rate_threshold,
            drop_count_threshold,
            credit,
            status_log,
            directory,
        }
    }

    /// Mark every port as good for edge detection
    pub fn init_flags(&self, ports: &[SwitchPort]) {
        let mut flags = self.log_flags.write();
        flags.clear();
        for &p in ports {
            flags.insert(p, true);
        }
    }

    /// Current reset epoch. Read it before requesting flow stats and hand
    /// it to `ingest` with the reply.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Fold one switch's flow-stats entries into the counters.
    ///
    /// Entries of the same port and kind are summed first so a port with
    /// several bindings yields one delta per cycle. Both per-cycle counts of
    /// every port in the reply restart from zero. Ports reset after
    /// `collected_at` are skipped: the reply predates their rule removal.
    pub fn ingest(&self, switch: SwitchId, entries: &[FlowStatsEntry], collected_at: u64) -> usize {
        let min_priority = BINDING_PRIORITY.saturating_sub(1);
        let mut passed: HashMap<SwitchPort, u64> = HashMap::new();
        let mut dropped: HashMap<SwitchPort, u64> = HashMap::new();

        for entry in entries {
            if entry.priority < min_priority {
                continue;
            }
            let Some(port) = entry.matcher.in_port else {
                continue;
            };
            let sp = SwitchPort::new(switch, port);
            let bucket = if entry.matcher.has_source_address() { &mut passed } else { &mut dropped };
            *bucket.entry(sp).or_insert(0) += entry.packet_count;
        }

        let mut counters = self.counters.write();
        let reset_epochs = self.reset_epochs.read();
        let fresh = |sp: &SwitchPort| reset_epochs.get(sp).map_or(true, |&e| e <= collected_at);

        let mut ports: Vec<SwitchPort> = passed.keys().chain(dropped.keys()).copied().collect();
        ports.sort();
        ports.dedup();
        let (touched, stale): (Vec<SwitchPort>, Vec<SwitchPort>) = ports.into_iter().partition(|sp| fresh(sp));
        if !stale.is_empty() {
            log::debug!("Flow stats of {}: {} port(s) reset after collection skipped", switch, stale.len());
        }

        for sp in &touched {
            let c = counters.entry(*sp).or_default();
            c.pass_count = 0;
            c.drop_count = 0;
            if let Some(raw) = passed.get(sp) {
                c.apply_pass(*raw);
            }
            if let Some(raw) = dropped.get(sp) {
                c.apply_drop(*raw);
            }
        }

        touched.len()
    }

    /// Loss-rate verdict for one port, with credit and status-log side effects
    pub fn verdict(&self, port: SwitchPort) -> Verdict {
        let Some(c) = self.counters(&port) else {
            return Verdict::NoData;
        };

        let over_rate = c.drop_rate != 1.0 && c.drop_rate > self.loss_rate_threshold;
        let over_count = c.drop_count > self.drop_count_threshold;

        if over_rate || over_count {
            self.credit.penalize(port);
            self.log_edge(port, &c, false);
            Verdict::Bad
        } else {
            self.credit.reward(port);
            self.log_edge(port, &c, true);
            Verdict::Good
        }
    }

    /// Write a status line only when the logged state flips
    fn log_edge(&self, port: SwitchPort, c: &FlowCounters, good: bool) {
        let previous = self.log_flags.write().insert(port, good).unwrap_or(true);
        if previous == good {
            return;
        }

        let change = if good { StatusChange::Recovered } else { StatusChange::Abnormal };
        let host = self.directory.host_number_for(&port);
        match change {
            StatusChange::Abnormal => log::info!(
                "Port {} (host {:?}) abnormal: drop rate {:.4}, dropped {}",
                port, host, c.drop_rate, c.drop_count
            ),
            StatusChange::Recovered => log::info!("Port {} (host {:?}) recovered", port, host),
        }

        self.status_log.record_or_log(&StatusEvent {
            change,
            host,
            sent: c.sent(),
            drop_rate: c.drop_rate,
            drop_count: c.drop_count,
        });
    }

    /// Zero a port's counters after its rules were removed. Replies
    /// collected before this call no longer apply to the port.
    pub fn reset(&self, port: &SwitchPort) {
        let mut counters = self.counters.write();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.reset_epochs.write().insert(*port, epoch);
        if let Some(c) = counters.get_mut(port) {
            *c = FlowCounters::default();
        }
    }

    pub fn counters(&self, port: &SwitchPort) -> Option<FlowCounters> {
        self.counters.read().get(port).copied()
    }

    /// All counters, highest instantaneous drop rate first
    pub fn all(&self) -> Vec<(SwitchPort, FlowCounters)> {
        let mut list: Vec<(SwitchPort, FlowCounters)> = self.counters.read()
            .iter()
            .map(|(sp, c)| (*sp, *c))
            .collect();
        list.sort_by(|a, b| b.1.drop_rate.total_cmp(&a.1.drop_rate).then(a.0.cmp(&b.0)));
        list
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DYNAMIC_TABLE_ID;
    use crate::logic::switch::{FlowMatch, SwitchRoles, StaticBindings};
    use crate::logic::types::{Binding, PortNo};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        log_path: std::path::PathBuf,
        credit: Arc<CreditLedger>,
        tracker: FlowHealthTracker,
        binding: Binding,
    }

    fn fixture(drop_count_threshold: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("abnormal_log.txt");
        let binding = Binding {
            switch_port: SwitchPort::new(SwitchId(2), PortNo(1)),
            mac: "00:00:00:00:00:01".parse().unwrap(),
            address: "2001:db8::1".parse().unwrap(),
        };

        let credit = Arc::new(CreditLedger::new(Arc::new(SwitchRoles::new())));
        credit.init(&[binding.switch_port]);
        let directory = Arc::new(StaticBindings::new(vec![binding.clone()]));
        let tracker = FlowHealthTracker::new(
            0.018,
            drop_count_threshold,
            credit.clone(),
            Arc::new(StatusLog::new(log_path.clone())),
            directory,
        );
        tracker.init_flags(&[binding.switch_port]);

        Fixture { _dir: dir, log_path, credit, tracker, binding }
    }

    fn entries(b: &Binding, pass: u64, drop: u64) -> Vec<FlowStatsEntry> {
        vec![
            FlowStatsEntry {
                table: DYNAMIC_TABLE_ID,
                priority: 5,
                matcher: FlowMatch::verification(b),
                packet_count: pass,
            },
            FlowStatsEntry {
                table: DYNAMIC_TABLE_ID,
                priority: 4,
                matcher: FlowMatch::in_port(b.switch_port.port),
                packet_count: drop,
            },
        ]
    }

    fn log_lines(f: &Fixture) -> usize {
        std::fs::read_to_string(&f.log_path).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[test]
    fn test_all_drop_cycle_flagged_only_by_count() {
        // 1000/50 -> 1000/70: 20 dropped, nothing passed, rate 1.0
        let f = fixture(100);
        let sp = f.binding.switch_port;
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 1000, 50), f.tracker.epoch());
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 1000, 70), f.tracker.epoch());

        let c = f.tracker.counters(&sp).unwrap();
        assert_eq!(c.pass_count, 0);
        assert_eq!(c.drop_count, 20);
        assert_eq!(c.drop_rate, 1.0);
        assert_eq!(f.tracker.verdict(sp), Verdict::Good);

        let strict = fixture(10);
        strict.tracker.ingest(SwitchId(2), &entries(&strict.binding, 1000, 50), strict.tracker.epoch());
        strict.tracker.ingest(SwitchId(2), &entries(&strict.binding, 1000, 70), strict.tracker.epoch());
        assert_eq!(strict.tracker.verdict(sp), Verdict::Bad);
    }

    #[test]
    fn test_counter_reset_clamps_to_zero() {
        let f = fixture(100);
        let sp = f.binding.switch_port;
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 500, 40), f.tracker.epoch());
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 10, 2), f.tracker.epoch());

        let c = f.tracker.counters(&sp).unwrap();
        assert_eq!(c.pass_count, 0);
        assert_eq!(c.drop_count, 0);
        assert_eq!(c.cumulative_pass, 10);
        assert_eq!(c.cumulative_drop, 2);

        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 30, 2), f.tracker.epoch());
        assert_eq!(f.tracker.counters(&sp).unwrap().pass_count, 20);
    }

    #[test]
    fn test_bad_streak_logs_once_and_costs_two_per_cycle() {
        let f = fixture(100);
        let sp = f.binding.switch_port;
        let mut pass = 0;
        let mut drop = 0;

        for k in 1..=15u8 {
            pass += 100;
            drop += 10;
            f.tracker.ingest(SwitchId(2), &entries(&f.binding, pass, drop), f.tracker.epoch());
            assert_eq!(f.tracker.verdict(sp), Verdict::Bad);
            assert_eq!(f.credit.get(&sp), 24u8.saturating_sub(2 * k));
        }
        assert_eq!(log_lines(&f), 1);

        // Recovery edge logs once more
        for _ in 0..3 {
            pass += 100;
            f.tracker.ingest(SwitchId(2), &entries(&f.binding, pass, drop), f.tracker.epoch());
            assert_eq!(f.tracker.verdict(sp), Verdict::Good);
        }
        assert_eq!(log_lines(&f), 2);
    }

    #[test]
    fn test_unknown_port_has_no_verdict() {
        let f = fixture(100);
        let other = SwitchPort::new(SwitchId(2), PortNo(9));
        assert_eq!(f.tracker.verdict(other), Verdict::NoData);
    }

    #[test]
    fn test_missing_pass_entry_zeroes_pass_count() {
        let f = fixture(100);
        let sp = f.binding.switch_port;
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 100, 10), f.tracker.epoch());
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 200, 10), f.tracker.epoch());
        assert_eq!(f.tracker.counters(&sp).unwrap().pass_count, 100);

        // Only the catch-all entry comes back this cycle
        let drop_only = vec![entries(&f.binding, 0, 20).remove(1)];
        assert_eq!(f.tracker.ingest(SwitchId(2), &drop_only, f.tracker.epoch()), 1);
        let c = f.tracker.counters(&sp).unwrap();
        assert_eq!(c.pass_count, 0);
        assert_eq!(c.drop_count, 10);
        assert_eq!(c.drop_rate, 1.0);
        assert_eq!(c.cumulative_pass, 200);

        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 250, 20), f.tracker.epoch());
        let c = f.tracker.counters(&sp).unwrap();
        assert_eq!(c.pass_count, 50);
        assert_eq!(c.drop_count, 0);
    }

    #[test]
    fn test_reply_collected_before_reset_is_skipped() {
        let f = fixture(100);
        let sp = f.binding.switch_port;
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 500, 5), f.tracker.epoch());

        let collected_at = f.tracker.epoch();
        f.tracker.reset(&sp);
        assert_eq!(f.tracker.ingest(SwitchId(2), &entries(&f.binding, 900, 9), collected_at), 0);
        assert_eq!(f.tracker.counters(&sp), Some(FlowCounters::default()));

        // Rules reinstalled, counting from zero again
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 40, 0), f.tracker.epoch());
        let c = f.tracker.counters(&sp).unwrap();
        assert_eq!(c.pass_count, 40);
        assert_eq!(c.cumulative_pass, 40);
    }

    #[test]
    fn test_low_priority_entries_ignored() {
        let f = fixture(100);
        let entry = FlowStatsEntry {
            table: DYNAMIC_TABLE_ID,
            priority: 1,
            matcher: FlowMatch::in_port(PortNo(1)),
            packet_count: 999,
        };
        assert_eq!(f.tracker.ingest(SwitchId(2), &[entry], 0), 0);
        assert!(f.tracker.counters(&f.binding.switch_port).is_none());
    }

    #[test]
    fn test_reset_and_sorting() {
        let f = fixture(100);
        let sp = f.binding.switch_port;
        f.tracker.ingest(SwitchId(2), &entries(&f.binding, 90, 10), f.tracker.epoch());

        let quiet = Binding {
            switch_port: SwitchPort::new(SwitchId(2), PortNo(2)),
            ..f.binding.clone()
        };
        f.tracker.ingest(SwitchId(2), &entries(&quiet, 100, 0), f.tracker.epoch());

        let all = f.tracker.all();
        assert_eq!(all[0].0, sp);
        assert_eq!(all[1].0, quiet.switch_port);

        f.tracker.reset(&sp);
        assert_eq!(f.tracker.counters(&sp), Some(FlowCounters::default()));
    }
}
