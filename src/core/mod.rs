pub mod activity;
pub mod affinity;
pub mod agent;
pub mod audit;
pub mod broker;
pub mod executor;
pub mod info;
pub mod job;
pub mod ledger;
pub mod lifecycle;
pub mod steal;
pub mod transport;

use std::path::PathBuf;

/// A global core index. Each agent owns the contiguous range
/// `[core_offset, core_offset + total_cores)`.
pub type CoreIndex = u32;

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "\
{}
Authors: {author}",
        env!("CARGO_PKG_VERSION")
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("corebroker"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("corebroker"))
}
