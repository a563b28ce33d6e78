//! Analysis Configuration
//!
//! Thresholds, cadences and file locations. Every field reads an
//! environment variable and falls back to the documented default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::APP_NAME;
use super::types::DetectionPlan;

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Start statistics collection right after network init
    pub enabled: bool,
    /// Detection plan active at startup
    pub plan: DetectionPlan,
    /// Statistics cycle length in seconds
    pub stats_interval_secs: u64,
    /// Drop rate above which a port is abnormal (rate 1.0 excluded)
    pub loss_rate_threshold: f64,
    /// Dropped packets per cycle above which a port is abnormal
    pub drop_count_threshold: u64,
    /// Scaling level for priority rebalancing
    pub priority_level: u32,
    /// Port-stats cycles per rebalancing period
    pub rebalance_period: u32,
    /// Peak assigned to every host when the snapshot is unusable
    pub default_peak: f64,
    /// Sibling egress surge factor that legitimizes an ingress spike
    pub surge_factor: f64,
    /// Length of one polling round (ms)
    pub poll_round_ms: u64,
    /// Polling rounds before outstanding requests are abandoned
    pub poll_rounds: u32,
    /// Append-only status-change log
    pub status_log_path: PathBuf,
    /// Peak-traffic snapshot shared with the peer process
    pub peak_file_path: PathBuf,
    /// Periodically convert static switches back to dynamic verification
    pub auto_check: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            enabled: env_flag("SAVI_ENABLED", true),
            plan: std::env::var("SAVI_PLAN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DetectionPlan::LossRate),
            stats_interval_secs: env_parse("SAVI_STATS_INTERVAL_SECS", 1).max(1),
            loss_rate_threshold: env_parse("SAVI_LOSS_RATE_THRESHOLD", 0.018),
            drop_count_threshold: env_parse("SAVI_DROP_COUNT_THRESHOLD", 100),
            priority_level: env_parse("SAVI_PRIORITY_LEVEL", 96).max(1),
            rebalance_period: env_parse("SAVI_REBALANCE_PERIOD", 20).max(1),
            default_peak: env_parse("SAVI_DEFAULT_PEAK", 100.0),
            surge_factor: env_parse("SAVI_SURGE_FACTOR", 1.3),
            poll_round_ms: env_parse("SAVI_POLL_ROUND_MS", 500),
            poll_rounds: env_parse("SAVI_POLL_ROUNDS", 2).max(1),
            status_log_path: std::env::var("SAVI_STATUS_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("abnormal_log.txt")),
            peak_file_path: std::env::var("SAVI_PEAK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("max_traffic.txt")),
            auto_check: env_flag("SAVI_AUTO_CHECK", false),
        }
    }
}

impl AnalysisConfig {
    /// Statistics cycle length
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Total time a statistics fan-out may wait for replies
    pub fn poll_budget(&self) -> Duration {
        Duration::from_millis(self.poll_round_ms * self.poll_rounds as u64)
    }

    /// Same config with both files placed in `dir`
    pub fn with_data_dir(mut self, dir: &std::path::Path) -> Self {
        self.status_log_path = dir.join("abnormal_log.txt");
        self.peak_file_path = dir.join("max_traffic.txt");
        self
    }
}

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|s| s.to_lowercase() != "false" && s != "0")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert!(config.stats_interval_secs >= 1);
        assert!(config.poll_rounds >= 1);
        assert!(config.priority_level >= 1);
    }

    #[test]
    fn test_poll_budget() {
        let config = AnalysisConfig {
            poll_round_ms: 500,
            poll_rounds: 2,
            ..AnalysisConfig::default()
        };
        assert_eq!(config.poll_budget(), Duration::from_millis(1000));
    }

    #[test]
    fn test_with_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig::default().with_data_dir(dir.path());
        assert!(config.status_log_path.starts_with(dir.path()));
        assert!(config.peak_file_path.starts_with(dir.path()));
    }
}
