use super::job::JobStatus;
use super::CoreIndex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::SystemTime;

/// A machine exposing core-binding operations for a contiguous range of
/// global core indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub name: String,
    pub endpoint: String,
    pub total_cores: u32,
    pub core_offset: CoreIndex,
    pub last_seen: SystemTime,
}

impl Agent {
    pub fn cores(&self) -> Range<CoreIndex> {
        self.core_offset..self.core_offset.saturating_add(self.total_cores)
    }

    pub fn owns(&self, core: CoreIndex) -> bool {
        self.cores().contains(&core)
    }

    pub fn overlaps(&self, other: &Range<CoreIndex>) -> bool {
        let own = self.cores();
        own.start < other.end && other.start < own.end
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// Payload of the controller's `register` operation.
///
/// Heartbeats may omit the capacity fields; a first registration must carry
/// all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub vm_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub total_cores: Option<u32>,
    #[serde(default)]
    pub core_offset: Option<CoreIndex>,
}

/// Response body of the agent's `status` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub vm: String,
    pub total_cores: u32,
    pub offset: CoreIndex,
    pub jobs: Vec<JobStatus>,
}

impl AgentStatus {
    pub fn job(&self, name: &str) -> Option<&JobStatus> {
        self.jobs.iter().find(|j| j.job == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub job: String,
    pub pid: i32,
    pub cores: Vec<CoreIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub job: String,
    #[serde(default)]
    pub keep_cores: Vec<CoreIndex>,
}

/// Shared response shape of the agent's `allocate` and `release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityResponse {
    pub ok: bool,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub cores: Vec<CoreIndex>,
    #[serde(default)]
    pub error: Option<String>,
}
