use super::CoreIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use strum::{Display, EnumIter};

/// Identifies one allocation: a job running on a specific agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub agent: String,
    pub job: String,
}

impl JobKey {
    pub fn new(agent: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            job: job.into(),
        }
    }
}

/// Rendered as `agent|job`, the key format used by the summary projection.
impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.agent, self.job)
    }
}

/// A job as observed by its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: String,
    pub pid: i32,
    pub cores: Vec<CoreIndex>,
    pub cpu_percent: f64,
}

/// Monotonic ticket identifying a queued request inside the ledger.
pub type Ticket = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    #[serde(skip)]
    pub ticket: Ticket,
    pub vm: String,
    pub job: String,
    pub pid: i32,
    pub need: u32,
    /// Enqueue time, seconds since the Unix epoch.
    pub ts: f64,
}

impl PendingRequest {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.vm.clone(), self.job.clone())
    }
}

pub fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Worker-side lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum JobPhase {
    Spawned,
    Requested,
    Queued,
    Allocated,
    Running,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        match (self, next) {
            (Spawned, Requested) => true,
            (Requested, Allocated | Queued) => true,
            (Queued, Allocated) => true,
            (Allocated, Running) => true,
            (Running, Completed) => true,
            // A queued job whose process exits before admission is reported
            // complete without ever running.
            (Queued, Completed) => true,
            (Spawned | Requested | Queued | Allocated, Failed) => true,
            _ => false,
        }
    }
}

/// One job the worker should launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub agent: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Program and arguments, executed once the start gate opens.
    pub command: Vec<String>,
}

fn default_cores() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVersion {
    pub version: String,
    pub jobs: Vec<JobSpec>,
}

/// The worker's `jobs.json`: alternative job sets, one chosen per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub versions: Vec<JobVersion>,
}

impl JobFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        let file: JobFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse job file {}", path.display()))?;
        if file.versions.is_empty() {
            anyhow::bail!("Job file {} has no versions", path.display());
        }
        Ok(file)
    }

    pub fn choose<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Option<&JobVersion> {
        use rand::seq::IndexedRandom;
        self.versions.choose(rng)
    }

    pub fn find(&self, version: &str) -> Option<&JobVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}
