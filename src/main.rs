//! SAVI Analysis - Main Entry Point
//!
//! Loads the bindings file, builds the in-memory fabric and runs the
//! analysis engine until Ctrl+C.

mod api;
mod logic;
pub mod constants;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use logic::config::{default_data_dir, AnalysisConfig};
use logic::engine::AnalysisEngine;
use logic::switch::memory::BindingFile;
use logic::switch::{MemoryFabric, StaticBindings};

/// Extra switch-to-switch ports given to every fabric switch
const FABRIC_UPLINKS: u32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting {} v{}...", constants::APP_NAME, constants::APP_VERSION);

    let config = AnalysisConfig::default();
    log::info!(
        "Plan {:?}, stats every {:?}, status log {:?}, peak file {:?}",
        config.plan,
        config.stats_interval(),
        config.status_log_path,
        config.peak_file_path
    );

    let bindings_path = std::env::var("SAVI_BINDINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_data_dir().join("bindings.json"));
    let file = BindingFile::load(&bindings_path)
        .with_context(|| format!("loading bindings from {:?}", bindings_path))?;
    log::info!("Loaded {} binding(s) from {:?}", file.bindings.len(), bindings_path);

    let fabric = Arc::new(MemoryFabric::from_bindings(&file.bindings, FABRIC_UPLINKS));
    let directory = Arc::new(StaticBindings::from_file(&file));
    let roles = Arc::new(file.roles());
    let engine = AnalysisEngine::new(config, fabric, directory, roles);

    let ports = api::init_network(&engine).await.map_err(anyhow::Error::msg)?;
    log::info!("Analysis engine running: {} access port(s)", ports);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    log::info!("Shutdown requested");
    engine.shutdown();
    Ok(())
}
