use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use corebroker::config::AgentConfig;

#[derive(Debug, Parser)]
#[command(name = "coreagent", author, version = corebroker::core::version(), about = "Per-machine CPU affinity agent")]
#[command(styles=corebroker::utils::STYLES)]
pub struct CoreAgent {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Name to register under (defaults to the hostname)
    #[arg(long)]
    pub name: Option<String>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host advertised to the controller (defaults to the outbound IP)
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Number of cores managed by this agent
    #[arg(long)]
    pub total_cores: Option<u32>,

    /// First global core index owned by this agent
    #[arg(long)]
    pub core_offset: Option<u32>,

    /// Bind cores relative to the offset instead of as global CPU ids
    #[arg(long)]
    pub local_cpu_ids: bool,

    /// Controller base URL, e.g. http://10.0.0.1:5000
    #[arg(long, value_name = "URL")]
    pub controller: Option<String>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

impl CoreAgent {
    /// CLI flags override config file values.
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = Some(host.clone());
        }
        if let Some(total) = self.total_cores {
            config.total_cores = Some(total);
        }
        if let Some(offset) = self.core_offset {
            config.core_offset = offset;
        }
        if self.local_cpu_ids {
            config.local_cpu_ids = true;
        }
        if let Some(url) = &self.controller {
            config.controller_url = url.clone();
        }
    }
}
