//! Admin Commands - API cho tầng quản trị
//!
//! Upward surface over a shared `AnalysisEngine`: membership, counters,
//! credit, rule counts, plan and traffic-history administration.
//! Every command returns `Result<_, String>` so any transport can wrap it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::logic::engine::AnalysisEngine;
use crate::logic::error::AnalysisError;
use crate::logic::health::FlowCounters;
use crate::logic::types::{DetectionPlan, PortNo, SwitchId, SwitchPort};

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Port-set membership, each set as a comma-separated `switch-port` list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSetView {
    pub normal: String,
    /// Observation ports picked from the Normal queue
    pub polling: String,
    /// Observation ports coming back from Abnormal
    pub observe: String,
    pub abnormal: String,
    /// Access ports on fallback switches
    pub none: String,
}

/// Pass/drop counters of one port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowCountersView {
    pub switch_port: String,
    pub host: Option<u32>,
    pub pass_count: u64,
    pub drop_count: u64,
    pub cumulative_pass: u64,
    pub cumulative_drop: u64,
    pub drop_rate: f64,
    pub cumulative_drop_rate: f64,
}

/// Active detection plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    pub code: u8,
    pub plan: DetectionPlan,
}

fn join_ports(ports: &[SwitchPort]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

fn counters_view(engine: &AnalysisEngine, port: SwitchPort, c: FlowCounters) -> FlowCountersView {
    FlowCountersView {
        switch_port: port.to_string(),
        host: engine.host_number(&port),
        pass_count: c.pass_count,
        drop_count: c.drop_count,
        cumulative_pass: c.cumulative_pass,
        cumulative_drop: c.cumulative_drop,
        drop_rate: c.drop_rate,
        cumulative_drop_rate: c.cumulative_drop_rate,
    }
}

fn switch_port(switch: u64, port: u32) -> SwitchPort {
    SwitchPort::new(SwitchId(switch), PortNo(port))
}

fn plan_view(plan: DetectionPlan) -> PlanView {
    PlanView { code: plan.code(), plan }
}

// ============================================================================
// MEMBERSHIP & COUNTERS
// ============================================================================

/// Lấy tập port theo trạng thái
pub async fn get_port_set(engine: &Arc<AnalysisEngine>) -> Result<PortSetView, String> {
    let snap = engine.membership();
    let observe: Vec<SwitchPort> = snap.observe
        .iter()
        .filter(|p| !snap.polling.contains(p))
        .copied()
        .collect();

    Ok(PortSetView {
        normal: join_ports(&snap.normal),
        polling: join_ports(&snap.polling),
        observe: join_ports(&observe),
        abnormal: join_ports(&snap.abnormal),
        none: join_ports(&engine.fallback_ports()),
    })
}

/// All flow counters, highest drop rate first
pub async fn get_all_flow_counters(engine: &Arc<AnalysisEngine>) -> Result<Vec<FlowCountersView>, String> {
    Ok(engine
        .flow_counters()
        .into_iter()
        .map(|(sp, c)| counters_view(engine, sp, c))
        .collect())
}

pub async fn get_flow_counters(
    engine: &Arc<AnalysisEngine>,
    switch: u64,
    port: u32,
) -> Result<Option<FlowCountersView>, String> {
    let sp = switch_port(switch, port);
    Ok(engine.flow_counters_of(&sp).map(|c| counters_view(engine, sp, c)))
}

/// Corrected ingress packets of the last port-stats cycle
pub async fn get_in_packets(engine: &Arc<AnalysisEngine>, switch: u64, port: u32) -> Result<u64, String> {
    Ok(engine.in_packets(&switch_port(switch, port)))
}

pub async fn get_out_packets(engine: &Arc<AnalysisEngine>, switch: u64, port: u32) -> Result<u64, String> {
    Ok(engine.out_packets(&switch_port(switch, port)))
}

/// Điểm uy tín theo host (thang 0-5)
pub async fn get_hosts_credit(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<u32, u8>, String> {
    Ok(engine.hosts_credit())
}

// ============================================================================
// RULE ACCOUNTING
// ============================================================================

/// Rule count per switch; -1 for fallback switches
pub async fn get_rule_counts(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<String, i64>, String> {
    Ok(engine
        .rule_counts()
        .into_iter()
        .map(|(sw, count)| (sw.to_string(), count.map(|n| n as i64).unwrap_or(-1)))
        .collect())
}

pub async fn get_rule_count(engine: &Arc<AnalysisEngine>, switch: u64) -> Result<i64, String> {
    Ok(engine.rule_count(SwitchId(switch)).map(|n| n as i64).unwrap_or(-1))
}

// ============================================================================
// CONTROL
// ============================================================================

/// Chuyển phương án phát hiện (1 = loss rate, 2 = traffic)
pub async fn change_plan(engine: &Arc<AnalysisEngine>, code: u8) -> Result<PlanView, String> {
    let plan = DetectionPlan::from_code(code).ok_or_else(|| format!("Unknown plan code: {}", code))?;
    engine.set_plan(plan);
    Ok(plan_view(plan))
}

pub async fn get_plan(engine: &Arc<AnalysisEngine>) -> Result<PlanView, String> {
    Ok(plan_view(engine.plan()))
}

pub async fn set_priority_level(engine: &Arc<AnalysisEngine>, level: u32) -> Result<u32, String> {
    if level == 0 {
        return Err("Priority level must be at least 1".to_string());
    }
    engine.set_priority_level(level);
    Ok(engine.priority_level())
}

pub async fn set_auto_check(engine: &Arc<AnalysisEngine>, enabled: bool) -> Result<bool, String> {
    engine.set_auto_check(enabled);
    Ok(engine.auto_check())
}

/// Bật/tắt thu thập thống kê. Returns whether collection is running.
pub async fn enable_analysis(engine: &Arc<AnalysisEngine>, enabled: bool) -> Result<bool, String> {
    if !engine.is_initialized() {
        return Err(AnalysisError::NotInitialized.to_string());
    }
    engine.enable_analysis(enabled);
    Ok(engine.is_collecting())
}

/// Khởi tạo mạng. Returns the number of tracked access ports.
pub async fn init_network(engine: &Arc<AnalysisEngine>) -> Result<usize, String> {
    engine.init_network().await.map_err(|e| e.to_string())
}

// ============================================================================
// TRAFFIC HISTORY
// ============================================================================

pub async fn show_max_traffic(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<u32, f64>, String> {
    Ok(engine.show_max_traffic())
}

/// Raise peaks to current ingress and write the snapshot
pub async fn update_max_traffic(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<u32, f64>, String> {
    engine.update_max_traffic().map_err(|e| e.to_string())
}

pub async fn show_out_flow(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<u32, f64>, String> {
    Ok(engine.show_out_flow())
}

pub async fn update_out_flow(engine: &Arc<AnalysisEngine>) -> Result<BTreeMap<u32, f64>, String> {
    Ok(engine.update_out_flow())
}

pub async fn get_status_log_path(engine: &Arc<AnalysisEngine>) -> Result<String, String> {
    Ok(engine.status_log_path().display().to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::AnalysisConfig;
    use crate::logic::switch::{MemoryFabric, StaticBindings, SwitchRoles};
    use crate::logic::types::{Binding, MacAddr};
    use tempfile::TempDir;

    /// Switch 2 managed (two hosts), switch 3 fallback (one host)
    fn engine(dir: &TempDir) -> Arc<AnalysisEngine> {
        let bindings: Vec<Binding> = [(2, 1), (2, 2), (3, 1)]
            .iter()
            .map(|&(sw, p)| Binding {
                switch_port: switch_port(sw, p),
                mac: MacAddr([0, 0, 0, 0, sw as u8, p as u8]),
                address: format!("2001:db8::{}:{}", sw, p).parse().unwrap(),
            })
            .collect();

        let config = AnalysisConfig {
            enabled: false,
            plan: DetectionPlan::LossRate,
            ..AnalysisConfig::default()
        }
        .with_data_dir(dir.path());

        AnalysisEngine::new(
            config,
            Arc::new(MemoryFabric::from_bindings(&bindings, 1)),
            Arc::new(StaticBindings::new(bindings)),
            Arc::new(SwitchRoles::from_sets(&[], &[SwitchId(3)])),
        )
    }

    #[test]
    fn test_change_plan_by_code() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        assert!(tokio_test::block_on(change_plan(&engine, 9)).is_err());
        let view = tokio_test::block_on(change_plan(&engine, 2)).unwrap();
        assert_eq!(view.plan, DetectionPlan::Traffic);
        assert_eq!(tokio_test::block_on(get_plan(&engine)).unwrap().code, 2);
    }

    #[test]
    fn test_enable_requires_init() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let err = tokio_test::block_on(enable_analysis(&engine, true)).unwrap_err();
        assert!(err.contains("not initialized"));
    }

    #[test]
    fn test_priority_level_zero_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(tokio_test::block_on(set_priority_level(&engine, 0)).is_err());
        assert_eq!(tokio_test::block_on(set_priority_level(&engine, 48)).unwrap(), 48);
    }

    #[tokio::test]
    async fn test_views_after_init() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert_eq!(init_network(&engine).await.unwrap(), 3);

        let sets = get_port_set(&engine).await.unwrap();
        assert_eq!(sets.normal.split(',').count(), 3);
        assert!(sets.polling.is_empty());
        assert!(sets.abnormal.is_empty());
        assert_eq!(sets.none, switch_port(3, 1).to_string());

        assert_eq!(get_rule_count(&engine, 2).await.unwrap(), 0);
        assert_eq!(get_rule_count(&engine, 3).await.unwrap(), -1);
        let counts = get_rule_counts(&engine).await.unwrap();
        assert_eq!(counts[&SwitchId(3).to_string()], -1);

        let credit = get_hosts_credit(&engine).await.unwrap();
        assert_eq!(credit.len(), 3);
        assert!(credit.values().all(|&c| c == 3));

        assert!(get_flow_counters(&engine, 2, 1).await.unwrap().is_none());
        assert_eq!(get_in_packets(&engine, 2, 1).await.unwrap(), 0);
        assert_eq!(get_out_packets(&engine, 3, 1).await.unwrap(), 0);
        assert!(get_all_flow_counters(&engine).await.unwrap().is_empty());
        assert!(get_status_log_path(&engine).await.unwrap().ends_with("abnormal_log.txt"));

        assert!(enable_analysis(&engine, true).await.unwrap());
        assert!(!enable_analysis(&engine, false).await.unwrap());
        engine.shutdown();
    }
}
