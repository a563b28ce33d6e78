//! API Module
//!
//! - commands.rs: admin/query commands over a shared `AnalysisEngine`

pub mod commands;

pub use commands::*;
