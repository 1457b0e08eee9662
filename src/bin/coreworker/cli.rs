use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use corebroker::config::WorkerConfig;

#[derive(Debug, Parser)]
#[command(name = "coreworker", author, version = corebroker::core::version(), about = "Launch jobs under core-broker control")]
#[command(styles=corebroker::utils::STYLES)]
pub struct CoreWorker {
    /// Job file with one or more job versions
    #[arg(default_value = "jobs.json")]
    pub jobs: PathBuf,

    /// Job version to run (default: one picked at random)
    #[arg(short = 'j', long = "job-version", value_name = "NAME")]
    pub job_version: Option<String>,

    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Controller base URL, e.g. http://10.0.0.1:5000
    #[arg(long, value_name = "URL")]
    pub controller: Option<String>,

    /// Shared directory for start markers
    #[arg(long, value_name = "DIR")]
    pub start_dir: Option<PathBuf>,

    /// Seconds to wait for an allocation before giving up on a job
    #[arg(long, value_name = "SECS")]
    pub alloc_wait_timeout: Option<u64>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

impl CoreWorker {
    /// CLI flags override config file values.
    pub fn apply(&self, config: &mut WorkerConfig) {
        if let Some(url) = &self.controller {
            config.controller_url = url.clone();
        }
        if let Some(dir) = &self.start_dir {
            config.start_dir = dir.clone();
        }
        if let Some(secs) = self.alloc_wait_timeout {
            config.alloc_wait_timeout_secs = secs;
        }
    }
}
