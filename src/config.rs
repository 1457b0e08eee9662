use crate::core::get_config_dir;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_controller_port")]
    pub port: u16,
    /// Interval between scheduling passes
    #[serde(default = "default_sched_interval_ms")]
    pub sched_interval_ms: u64,
    /// Timeout of every call into an agent
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// No steal shrinks a job below this many cores (at least 1)
    #[serde(default = "default_min_cores_per_job")]
    pub min_cores_per_job: u32,
    /// Free cores left untouched by direct admission
    #[serde(default)]
    pub reserve_buffer: u32,
    #[serde(default = "default_activity_capacity")]
    pub activity_capacity: usize,
    /// SQLite audit trail; defaults to `<data_dir>/alloc_log.db`
    #[serde(default)]
    pub audit_db: Option<PathBuf>,
    /// Disable the audit trail entirely
    #[serde(default)]
    pub no_audit: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_controller_port(),
            sched_interval_ms: default_sched_interval_ms(),
            agent_timeout_secs: default_agent_timeout_secs(),
            min_cores_per_job: default_min_cores_per_job(),
            reserve_buffer: 0,
            activity_capacity: default_activity_capacity(),
            audit_db: None,
            no_audit: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentConfig {
    /// Name under which the agent registers; defaults to the hostname
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    /// Host put into the advertised endpoint; defaults to the outbound IP
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// Cores managed by this agent; defaults to every CPU of the machine
    #[serde(default)]
    pub total_cores: Option<u32>,
    /// First global core index owned by this agent
    #[serde(default)]
    pub core_offset: u32,
    /// Bind `core - core_offset` instead of the global index
    #[serde(default)]
    pub local_cpu_ids: bool,
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_sample_window_ms")]
    pub sample_window_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: default_bind_host(),
            port: default_agent_port(),
            advertise_host: None,
            total_cores: None,
            core_offset: 0,
            local_cpu_ids: false,
            controller_url: default_controller_url(),
            heartbeat_secs: default_heartbeat_secs(),
            sample_window_ms: default_sample_window_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    /// Shared directory for start markers
    #[serde(default = "default_start_dir")]
    pub start_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_alloc_wait_timeout_secs")]
    pub alloc_wait_timeout_secs: u64,
    #[serde(default = "default_complete_timeout_secs")]
    pub complete_timeout_secs: u64,
    #[serde(default = "default_failure_grace_secs")]
    pub failure_grace_secs: u64,
    /// Delay between launching consecutive jobs
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            controller_url: default_controller_url(),
            start_dir: default_start_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            alloc_wait_timeout_secs: default_alloc_wait_timeout_secs(),
            complete_timeout_secs: default_complete_timeout_secs(),
            failure_grace_secs: default_failure_grace_secs(),
            stagger_ms: default_stagger_ms(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_controller_port() -> u16 {
    5000
}

fn default_agent_port() -> u16 {
    5001
}

fn default_sched_interval_ms() -> u64 {
    1000
}

fn default_agent_timeout_secs() -> u64 {
    6
}

fn default_min_cores_per_job() -> u32 {
    1
}

fn default_activity_capacity() -> usize {
    400
}

fn default_controller_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_sample_window_ms() -> u64 {
    100
}

fn default_start_dir() -> PathBuf {
    std::env::temp_dir().join("corebroker-starts")
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_alloc_wait_timeout_secs() -> u64 {
    180
}

fn default_complete_timeout_secs() -> u64 {
    10
}

fn default_failure_grace_secs() -> u64 {
    8
}

fn default_stagger_ms() -> u64 {
    100
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let files = config_files(get_config_dir().ok().as_deref(), config_path);
    load_from(&files)
}

/// Existing config files, lowest precedence first: the default file, then
/// the one given on the command line.
fn config_files(config_dir: Option<&Path>, config_path: Option<&PathBuf>) -> Vec<PathBuf> {
    let mut config_vec = vec![];

    // Default config file
    if let Some(default_config_path) = config_dir.map(|d| d.join("corebroker.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    config_vec
}

fn load_from(config_vec: &[PathBuf]) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("COREBROKER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
