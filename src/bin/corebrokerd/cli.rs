use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use corebroker::config::ControllerConfig;

#[derive(Debug, Parser)]
#[command(name = "corebrokerd", author, version = corebroker::core::version(), about = "Cluster-wide CPU core broker")]
#[command(styles=corebroker::utils::STYLES)]
pub struct CoreBrokerd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Milliseconds between scheduling passes
    #[arg(long, value_name = "MS")]
    pub sched_interval_ms: Option<u64>,

    /// Never steal a job below this many cores
    #[arg(long, value_name = "N")]
    pub min_cores_per_job: Option<u32>,

    /// Free cores direct admission leaves untouched per agent
    #[arg(long, value_name = "N")]
    pub reserve_buffer: Option<u32>,

    /// SQLite file for the allocation audit trail
    #[arg(long, value_name = "PATH")]
    pub audit_db: Option<PathBuf>,

    /// Do not write an audit trail
    #[arg(long)]
    pub no_audit: bool,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

impl CoreBrokerd {
    /// CLI flags override config file values.
    pub fn apply(&self, config: &mut ControllerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.sched_interval_ms {
            config.sched_interval_ms = ms;
        }
        if let Some(n) = self.min_cores_per_job {
            config.min_cores_per_job = n;
        }
        if let Some(n) = self.reserve_buffer {
            config.reserve_buffer = n;
        }
        if let Some(path) = &self.audit_db {
            config.audit_db = Some(path.clone());
        }
        if self.no_audit {
            config.no_audit = true;
        }
    }
}
