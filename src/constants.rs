//! Central Configuration Constants
//!
//! Single source of truth for flow-table layout, rule priorities and
//! scheduling cadences. Tunable thresholds live in `logic::config`.

use crate::logic::types::TableId;

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name (also the data directory name)
pub const APP_NAME: &str = "savi-analysis";

// ============================================
// Flow tables
// ============================================

/// Static verification rules and reliable-port rules
pub const STATIC_TABLE_ID: TableId = TableId(0);

/// Dynamic verification rules (installed/removed by the classifier)
pub const DYNAMIC_TABLE_ID: TableId = TableId(1);

/// Forwarding table, target of every verification rule
pub const FLOW_TABLE_ID: TableId = TableId(2);

// ============================================
// Priorities
// ============================================

/// Priority of the reliable (switch-to-switch) port rules
pub const RELIABLE_PORT_PRIORITY: u16 = 5;

/// Lowest rank a verification rule may have; the catch-all sits one below
pub const BINDING_PRIORITY: u16 = 5;

/// Static rules every switch carries before any reliable-port rule
pub const STATIC_RULE_BASE: usize = 5;

/// Rules per verified port (verification + catch-all)
pub const RULES_PER_PORT: usize = 2;

/// EtherType matched by verification rules
pub const ETH_TYPE_IPV6: u16 = 0x86DD;

// ============================================
// Port counters
// ============================================

/// Port-stats deltas are scaled by 1/0.7 to compensate the sampling window
pub const PORT_RATE_CORRECTION: f64 = 0.7;

// ============================================
// Scheduling
// ============================================

/// Membership display / rule accounting tick (ms)
pub const DISPLAY_INTERVAL_MS: u64 = 500;

/// Dynamic rule counts are recomputed every N display ticks
pub const RULE_COUNT_EVERY_TICKS: u32 = 2;

/// Delay before the first auto table check (secs)
pub const AUTO_CHECK_DELAY_SECS: u64 = 60;

/// Auto table check interval (secs)
pub const AUTO_CHECK_INTERVAL_SECS: u64 = 20;
