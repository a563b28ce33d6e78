//! Logic Module - Phân tích lưu lượng & đồng bộ rule
//!
//! - `collector` / `health` / `traffic`: statistics and per-port verdicts
//! - `classifier` / `credit`: trust state machine with credit hysteresis
//! - `sync` / `rebalancer`: verification rules and their priorities
//! - `engine`: owns all of the above and schedules the periodic tasks

// Shared types
pub mod types;
pub mod error;
pub mod config;

// External seams
pub mod switch;

// Trackers
pub mod credit;
pub mod status_log;
pub mod health;
pub mod collector;
pub mod traffic;

// Classification & rules
pub mod classifier;
pub mod rebalancer;
pub mod sync;

pub mod engine;
