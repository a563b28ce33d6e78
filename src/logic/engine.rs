//! Analysis Engine - Vòng điều khiển phân tích
//!
//! Owns every tracker and drives the periodic tasks:
//! - flow stats: pass/drop counters, loss-rate verdicts
//! - port stats: port deltas, rank rebalancing, traffic verdicts
//! - classifier passes, woken by every verdict publication
//! - membership display + rule accounting, auto table check
//!
//! Only the active plan publishes verdicts. Each publication carries a cycle
//! number; the three classifier passes run once per cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::{
    AUTO_CHECK_DELAY_SECS, AUTO_CHECK_INTERVAL_SECS, DISPLAY_INTERVAL_MS, RULE_COUNT_EVERY_TICKS,
    STATIC_TABLE_ID,
};
use super::classifier::{MembershipSnapshot, PortClassifier};
use super::collector::{PortDeltaTable, StatisticsCollector};
use super::config::AnalysisConfig;
use super::credit::CreditLedger;
use super::error::{AnalysisError, PeakFileError};
use super::health::{FlowCounters, FlowHealthTracker};
use super::rebalancer::{PriorityRebalancer, RankTable};
use super::status_log::StatusLog;
use super::switch::{BindingDirectory, ControlPlane, StatsKind, SwitchRoles};
use super::sync::{FlowRuleSynchronizer, RuleCounts};
use super::traffic::{TrafficHistoryTracker, TrafficSample};
use super::types::{DetectionPlan, PortState, SwitchId, SwitchPort, SwitchRole, Verdict};

// ============================================================================
// TYPES
// ============================================================================

/// Verdicts of one cycle, as published to the classifier passes
#[derive(Debug, Clone, Default)]
pub struct VerdictSet {
    pub cycle: u64,
    pub verdicts: Arc<HashMap<SwitchPort, Verdict>>,
}

#[derive(Debug, Clone, Copy)]
enum ClassifierPass {
    Abnormal,
    Normal,
    Observation,
}

/// Bound access ports and their switches, fixed at network init
#[derive(Debug, Default)]
struct NetworkView {
    access_ports: Vec<SwitchPort>,
    access_set: HashSet<SwitchPort>,
    switches: Vec<SwitchId>,
}

struct StatsTasks {
    stop: watch::Sender<bool>,
    handles: Vec<(StatsKind, JoinHandle<()>)>,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AnalysisEngine {
    config: AnalysisConfig,
    plane: Arc<dyn ControlPlane>,
    directory: Arc<dyn BindingDirectory>,
    roles: Arc<SwitchRoles>,

    collector: StatisticsCollector,
    deltas: PortDeltaTable,
    credit: Arc<CreditLedger>,
    status_log: Arc<StatusLog>,
    health: Arc<FlowHealthTracker>,
    traffic: TrafficHistoryTracker,
    classifier: Arc<PortClassifier>,
    ranks: Arc<RankTable>,
    rebalancer: PriorityRebalancer,
    sync: FlowRuleSynchronizer,
    rule_counts: RuleCounts,

    plan: AtomicU8,
    auto_check: AtomicBool,
    initialized: AtomicBool,
    cycle: AtomicU64,
    verdicts: watch::Sender<VerdictSet>,

    network: RwLock<NetworkView>,
    stats_tasks: Mutex<Option<StatsTasks>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisEngine {
    pub fn new(
        config: AnalysisConfig,
        plane: Arc<dyn ControlPlane>,
        directory: Arc<dyn BindingDirectory>,
        roles: Arc<SwitchRoles>,
    ) -> Arc<Self> {
        let credit = Arc::new(CreditLedger::new(roles.clone()));
        let status_log = Arc::new(StatusLog::new(config.status_log_path.clone()));
        let health = Arc::new(FlowHealthTracker::new(
            config.loss_rate_threshold,
            config.drop_count_threshold,
            credit.clone(),
            status_log.clone(),
            directory.clone(),
        ));
        let traffic = TrafficHistoryTracker::new(
            config.surge_factor,
            config.default_peak,
            config.peak_file_path.clone(),
            directory.clone(),
        );
        let classifier = Arc::new(PortClassifier::new());
        let ranks = Arc::new(RankTable::new());
        let sync = FlowRuleSynchronizer::new(
            plane.clone(),
            directory.clone(),
            ranks.clone(),
            health.clone(),
            classifier.clone(),
        );
        let (verdicts, _) = watch::channel(VerdictSet::default());

        Arc::new(Self {
            collector: StatisticsCollector::new(plane.clone(), roles.clone(), config.poll_budget()),
            deltas: PortDeltaTable::new(),
            rebalancer: PriorityRebalancer::new(config.priority_level, config.rebalance_period),
            rule_counts: RuleCounts::new(),
            plan: AtomicU8::new(config.plan.code()),
            auto_check: AtomicBool::new(config.auto_check),
            initialized: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            verdicts,
            network: RwLock::new(NetworkView::default()),
            stats_tasks: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            credit,
            status_log,
            health,
            traffic,
            classifier,
            ranks,
            sync,
            config,
            plane,
            directory,
            roles,
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Initialization stage: reset every tracker for the bound access ports,
    /// install reliable-port rules, start the background tasks and, when
    /// configured, statistics collection. Returns the number of access ports.
    pub async fn init_network(self: &Arc<Self>) -> Result<usize, AnalysisError> {
        let ports = self.prepare_network().await?;
        self.spawn_background();
        if self.config.enabled {
            self.enable_analysis(true);
        }
        Ok(ports)
    }

    /// Tracker reset + reliable-port rules, without starting any task
    pub(crate) async fn prepare_network(&self) -> Result<usize, AnalysisError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(AnalysisError::AlreadyInitialized);
        }

        let mut ports: Vec<SwitchPort> = self.directory
            .list_bindings()
            .iter()
            .map(|b| b.switch_port)
            .collect();
        ports.sort();
        ports.dedup();

        if ports.is_empty() {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(AnalysisError::NoBindings);
        }

        let mut switches: Vec<SwitchId> = ports.iter().map(|p| p.switch).collect();
        switches.dedup();
        log::info!(
            "Initializing network: {} access port(s) on {} switch(es)",
            ports.len(),
            switches.len()
        );

        self.classifier.init(&ports);
        self.credit.init(&ports);
        self.health.init_flags(&ports);
        self.ranks.init(&ports);
        self.traffic.init(&ports);
        self.rebalancer.reset();

        let access_set: HashSet<SwitchPort> = ports.iter().copied().collect();
        for &sw in &switches {
            let enabled = self.plane.enabled_ports(sw);
            self.rule_counts.init_switch(sw, enabled.len());
            if let Err(e) = self.sync.install_reliable_ports(sw, &access_set).await {
                log::warn!("Reliable port rules for {} not installed: {}", sw, e);
            }
        }

        let count = ports.len();
        *self.network.write() = NetworkView { access_ports: ports, access_set, switches };
        Ok(count)
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.background.lock();
        for pass in [ClassifierPass::Abnormal, ClassifierPass::Normal, ClassifierPass::Observation] {
            let rx = self.verdicts.subscribe();
            tasks.push(tokio::spawn(self.clone().pass_loop(pass, rx)));
        }
        tasks.push(tokio::spawn(self.clone().display_loop()));
        tasks.push(tokio::spawn(self.clone().auto_check_loop()));
    }

    /// Start or stop the two statistics tasks. Returns true if the state
    /// changed.
    pub fn enable_analysis(self: &Arc<Self>, enable: bool) -> bool {
        let mut tasks = self.stats_tasks.lock();
        match (enable, tasks.is_some()) {
            (true, false) => {
                let (stop, rx) = watch::channel(false);
                let handles = vec![
                    (StatsKind::Flow, tokio::spawn(self.clone().stats_loop(StatsKind::Flow, rx.clone()))),
                    (StatsKind::Port, tokio::spawn(self.clone().stats_loop(StatsKind::Port, rx))),
                ];
                *tasks = Some(StatsTasks { stop, handles });
                log::info!("Statistics collection started (every {:?})", self.config.stats_interval());
                true
            }
            (false, true) => {
                if let Some(running) = tasks.take() {
                    self.stop_stats(running);
                }
                true
            }
            _ => false,
        }
    }

    /// Signal the stats tasks and reap them in the background. A task that
    /// does not wind down within the grace period is aborted and logged.
    fn stop_stats(&self, tasks: StatsTasks) {
        let StatsTasks { stop, handles } = tasks;
        if stop.send(true).is_err() {
            log::debug!("Statistics tasks already finished");
        }

        let grace = self.config.stats_interval() + self.config.poll_budget() * 2;
        tokio::spawn(async move {
            for (kind, mut handle) in handles {
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(Ok(())) => log::warn!("{} statistics collection stopped", kind),
                    Ok(Err(e)) => log::error!("{} statistics task failed: {}", kind, e),
                    Err(_) => {
                        handle.abort();
                        log::error!("Could not cancel {} statistics task within {:?}", kind, grace);
                    }
                }
            }
        });
    }

    pub fn is_collecting(&self) -> bool {
        self.stats_tasks.lock().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Stop every task owned by the engine
    pub fn shutdown(&self) {
        if let Some(running) = self.stats_tasks.lock().take() {
            self.stop_stats(running);
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        log::info!("Analysis engine stopped ({} status change(s) recorded)", self.status_log.events_recorded());
    }

    // ========================================================================
    // TASK LOOPS
    // ========================================================================

    async fn stats_loop(self: Arc<Self>, kind: StatsKind, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.config.stats_interval()) => {}
            }
            match kind {
                StatsKind::Flow => {
                    self.run_flow_stats_cycle().await;
                }
                StatsKind::Port => {
                    self.run_port_stats_cycle().await;
                }
            }
        }
    }

    async fn pass_loop(self: Arc<Self>, pass: ClassifierPass, mut rx: watch::Receiver<VerdictSet>) {
        log::debug!("{:?} pass task started", pass);
        while rx.changed().await.is_ok() {
            let set = rx.borrow_and_update().clone();
            match pass {
                ClassifierPass::Abnormal => {
                    self.abnormal_pass(&set);
                }
                ClassifierPass::Normal => self.normal_pass(set.cycle).await,
                ClassifierPass::Observation => self.observation_pass(&set).await,
            }
        }
    }

    async fn display_loop(self: Arc<Self>) {
        let mut tick: u32 = 0;
        loop {
            tokio::time::sleep(Duration::from_millis(DISPLAY_INTERVAL_MS)).await;
            tick = tick.wrapping_add(1);
            self.log_membership();
            if tick % RULE_COUNT_EVERY_TICKS == 0 {
                self.update_rule_counts();
            }
        }
    }

    async fn auto_check_loop(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(AUTO_CHECK_DELAY_SECS)).await;
        loop {
            self.run_auto_check().await;
            tokio::time::sleep(Duration::from_secs(AUTO_CHECK_INTERVAL_SECS)).await;
        }
    }

    // ========================================================================
    // STATISTICS CYCLES
    // ========================================================================

    /// One flow-stats cycle. Publishes loss-rate verdicts when that plan
    /// is active.
    pub async fn run_flow_stats_cycle(&self) -> Option<VerdictSet> {
        let switches = self.network.read().switches.clone();
        let collected_at = self.health.epoch();
        let replies = self.collector.collect(&switches, StatsKind::Flow).await;

        let mut touched = 0;
        for (&sw, reply) in &replies {
            touched += self.health.ingest(sw, reply.flow_entries(), collected_at);
        }
        log::debug!("Flow stats: {} port(s) updated from {} switch(es)", touched, replies.len());

        if self.plan() != DetectionPlan::LossRate {
            return None;
        }

        let verdicts: HashMap<SwitchPort, Verdict> = self.classifier
            .tracked_ports()
            .into_iter()
            .filter(|p| self.roles.is_dynamic(p.switch))
            .map(|p| (p, self.health.verdict(p)))
            .collect();
        Some(self.publish(verdicts))
    }

    /// One port-stats cycle: deltas, rebalancing and, when that plan is
    /// active, traffic verdicts.
    pub async fn run_port_stats_cycle(&self) -> Option<VerdictSet> {
        let (switches, access_set) = {
            let network = self.network.read();
            (network.switches.clone(), network.access_set.clone())
        };
        let replies = self.collector.collect(&switches, StatsKind::Port).await;
        for (&sw, reply) in &replies {
            self.deltas.ingest(sw, reply.port_entries());
        }

        if self.rebalancer.on_port_stats(&replies, &access_set, &self.ranks) {
            let abnormal = self.classifier.ports_in(PortState::Abnormal);
            if !abnormal.is_empty() {
                log::info!("Refreshing rules of {} abnormal port(s) at their new rank", abnormal.len());
                if let Err(e) = self.sync.refresh(&abnormal).await {
                    log::error!("Abnormal port refresh failed: {}", e);
                }
            }
        }

        if self.plan() != DetectionPlan::Traffic {
            return None;
        }

        let verdicts = self.traffic.evaluate(&self.traffic_samples(), |sp| self.roles.is_dynamic(sp.switch));
        Some(self.publish(verdicts))
    }

    fn publish(&self, verdicts: HashMap<SwitchPort, Verdict>) -> VerdictSet {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let set = VerdictSet { cycle, verdicts: Arc::new(verdicts) };
        log::debug!("Cycle {}: {} verdict(s) published", cycle, set.verdicts.len());
        self.verdicts.send_replace(set.clone());
        set
    }

    /// Per-second ingress and sibling egress of every access port on a
    /// managed switch with an official port delta
    fn traffic_samples(&self) -> HashMap<SwitchPort, TrafficSample> {
        let network = self.network.read();
        let secs = self.config.stats_interval_secs.max(1) as f64;

        network.access_ports
            .iter()
            .filter(|p| self.roles.is_dynamic(p.switch) && self.deltas.is_official(p))
            .map(|p| {
                let ingress = self.deltas.in_packets(p) as f64 / secs;
                let sibling = self.deltas.sibling_egress(p, |sp| network.access_set.contains(sp)) as f64 / secs;
                (*p, TrafficSample { ingress, sibling_egress: sibling })
            })
            .collect()
    }

    // ========================================================================
    // CLASSIFIER PASSES
    // ========================================================================

    /// Run the three passes of one cycle in order
    pub async fn run_passes(&self, set: &VerdictSet) {
        self.abnormal_pass(set);
        self.normal_pass(set.cycle).await;
        self.observation_pass(set).await;
    }

    fn dynamic_port_count(&self) -> usize {
        self.network.read()
            .access_ports
            .iter()
            .filter(|p| self.roles.is_dynamic(p.switch))
            .count()
    }

    async fn normal_pass(&self, cycle: u64) {
        let bound = self.dynamic_port_count();
        if bound == 0 {
            return;
        }

        let manual = self.directory.manually_pushed_ports();
        let selected = self.classifier.normal_pass(cycle, bound, |p| {
            manual.contains(p) || !self.roles.is_dynamic(p.switch)
        });
        if selected.is_empty() {
            return;
        }

        log::debug!("Cycle {}: {} port(s) polled from normal", cycle, selected.len());
        if let Err(e) = self.sync.install(&selected).await {
            log::error!("Installing rules for {} polled port(s) failed: {}", selected.len(), e);
        }
    }

    async fn observation_pass(&self, set: &VerdictSet) {
        let outcome = self.classifier.observation_pass(set.cycle, &set.verdicts, |p| {
            self.credit.observation_threshold(p)
        });

        for p in &outcome.demoted {
            log::info!("Port {} ({}) -> abnormal", p, self.host_label(p));
        }
        if outcome.released.is_empty() {
            return;
        }

        // Manually pushed rules belong to the operator
        let manual = self.directory.manually_pushed_ports();
        let release: Vec<SwitchPort> = outcome.released
            .into_iter()
            .filter(|p| !manual.contains(p))
            .collect();

        log::debug!("Cycle {}: {} port(s) back to normal", set.cycle, release.len());
        if let Err(e) = self.sync.remove(&release).await {
            log::error!("Removing rules of {} released port(s) failed: {}", release.len(), e);
        }
    }

    fn abnormal_pass(&self, set: &VerdictSet) -> Vec<SwitchPort> {
        let promoted = self.classifier.abnormal_pass(set.cycle, &set.verdicts);
        for p in &promoted {
            log::info!("Port {} ({}) abnormal -> observation", p, self.host_label(p));
        }
        promoted
    }

    // ========================================================================
    // DISPLAY / ACCOUNTING / TABLE CHECK
    // ========================================================================

    fn host_label(&self, port: &SwitchPort) -> String {
        match self.directory.host_number_for(port) {
            Some(h) => format!("host {}", h),
            None => "no host".to_string(),
        }
    }

    fn hosts_of(&self, ports: &[SwitchPort]) -> String {
        ports
            .iter()
            .map(|p| match self.directory.host_number_for(p) {
                Some(h) => h.to_string(),
                None => p.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn log_membership(&self) {
        if !self.is_initialized() {
            return;
        }
        if !self.classifier.is_consistent() {
            log::error!("Membership order views disagree with the state map");
        }
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let snap = self.classifier.snapshot();
        log::debug!(
            "normal [{}] observe [{}] abnormal [{}]",
            self.hosts_of(&snap.normal),
            self.hosts_of(&snap.observe),
            self.hosts_of(&snap.abnormal)
        );
    }

    /// Dynamic rule count per switch from current membership
    pub fn update_rule_counts(&self) {
        self.rule_counts.update_dynamic(&self.classifier.verified_per_switch());
    }

    /// Convert every statically trusted switch back to dynamic
    /// verification, if auto check is on. Returns the switches converted.
    pub async fn run_auto_check(&self) -> usize {
        if !self.auto_check.load(Ordering::SeqCst) {
            return 0;
        }

        let mut converted = 0;
        for sw in self.roles.switches_with(SwitchRole::StaticallyTrusted) {
            match self.convert_table(sw, false).await {
                Ok(()) => converted += 1,
                Err(e) => log::warn!("Auto check: converting {} failed: {}", sw, e),
            }
        }
        converted
    }

    /// Move a switch between static and dynamic verification. Going
    /// static first rewrites its bindings' priorities in the static table.
    pub async fn convert_table(&self, switch: SwitchId, to_static: bool) -> Result<(), AnalysisError> {
        if to_static {
            let ports: Vec<SwitchPort> = self.network.read()
                .access_ports
                .iter()
                .filter(|p| p.switch == switch)
                .copied()
                .collect();
            self.sync.reprioritize(&ports, STATIC_TABLE_ID).await?;
        }

        self.plane.convert_table(switch, to_static).await?;
        log::info!(
            "Switch {} converted to {} verification",
            switch,
            if to_static { "static" } else { "dynamic" }
        );
        Ok(())
    }

    // ========================================================================
    // ADMIN SURFACE
    // ========================================================================

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn plan(&self) -> DetectionPlan {
        DetectionPlan::from_code(self.plan.load(Ordering::SeqCst)).unwrap_or(DetectionPlan::LossRate)
    }

    pub fn set_plan(&self, plan: DetectionPlan) {
        self.plan.store(plan.code(), Ordering::SeqCst);
        log::info!("Detection plan set to {:?}", plan);
    }

    pub fn set_priority_level(&self, level: u32) {
        self.rebalancer.set_priority_level(level);
    }

    pub fn priority_level(&self) -> u32 {
        self.rebalancer.priority_level()
    }

    pub fn set_auto_check(&self, enabled: bool) {
        self.auto_check.store(enabled, Ordering::SeqCst);
        log::info!("Auto table check {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn auto_check(&self) -> bool {
        self.auto_check.load(Ordering::SeqCst)
    }

    pub fn membership(&self) -> MembershipSnapshot {
        self.classifier.snapshot()
    }

    pub fn state_of(&self, port: &SwitchPort) -> Option<PortState> {
        self.classifier.state_of(port)
    }

    /// Access ports on fallback switches
    pub fn fallback_ports(&self) -> Vec<SwitchPort> {
        self.network.read()
            .access_ports
            .iter()
            .filter(|p| self.roles.role(p.switch) == SwitchRole::Fallback)
            .copied()
            .collect()
    }

    pub fn host_number(&self, port: &SwitchPort) -> Option<u32> {
        self.directory.host_number_for(port)
    }

    pub fn flow_counters(&self) -> Vec<(SwitchPort, FlowCounters)> {
        self.health.all()
    }

    pub fn flow_counters_of(&self, port: &SwitchPort) -> Option<FlowCounters> {
        self.health.counters(port)
    }

    pub fn in_packets(&self, port: &SwitchPort) -> u64 {
        self.deltas.in_packets(port)
    }

    pub fn out_packets(&self, port: &SwitchPort) -> u64 {
        self.deltas.out_packets(port)
    }

    /// Credit level (0-5) by host number
    pub fn hosts_credit(&self) -> BTreeMap<u32, u8> {
        self.credit
            .snapshot()
            .keys()
            .filter_map(|sp| self.directory.host_number_for(sp).map(|h| (h, self.credit.level(sp))))
            .collect()
    }

    pub fn rule_count(&self, switch: SwitchId) -> Option<usize> {
        self.rule_counts.rule_count(switch, self.roles.role(switch))
    }

    pub fn rule_counts(&self) -> BTreeMap<SwitchId, Option<usize>> {
        self.rule_counts
            .switches()
            .into_iter()
            .map(|sw| (sw, self.rule_count(sw)))
            .collect()
    }

    pub fn show_max_traffic(&self) -> BTreeMap<u32, f64> {
        self.traffic.show_max_traffic(&self.traffic_samples())
    }

    pub fn update_max_traffic(&self) -> Result<BTreeMap<u32, f64>, PeakFileError> {
        self.traffic.update_max_traffic(&self.traffic_samples())
    }

    pub fn show_out_flow(&self) -> BTreeMap<u32, f64> {
        self.traffic.show_out_flow(&self.traffic_samples())
    }

    pub fn update_out_flow(&self) -> BTreeMap<u32, f64> {
        self.traffic.update_out_flow(&self.traffic_samples())
    }

    pub fn status_log_path(&self) -> &Path {
        self.status_log.path()
    }
}

// ============================================================================
// TESTS
// ============================================================================
