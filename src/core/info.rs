use super::job::{JobKey, JobStatus, PendingRequest};
use super::CoreIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    pub total_cores: u32,
    pub offset: CoreIndex,
    pub endpoint: String,
    /// Last registration or heartbeat, seconds since the Unix epoch.
    pub last_seen: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingView {
    pub vm: String,
    pub job: String,
    pub pid: i32,
    pub need: u32,
    pub ts: f64,
}

impl From<&PendingRequest> for PendingView {
    fn from(r: &PendingRequest) -> Self {
        Self {
            vm: r.vm.clone(),
            job: r.job.clone(),
            pid: r.pid,
            need: r.need,
            ts: r.ts,
        }
    }
}

/// Read-only snapshot of the controller state.
///
/// `core_map` and `allocations` use string keys (`"12"`, `"vm1|train"`) so the
/// snapshot serializes to plain JSON objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub agents: BTreeMap<String, AgentView>,
    /// Owner of every known core; cores held by an in-flight admission show
    /// up as `null` here and are listed in `reserved`.
    pub core_map: BTreeMap<String, Option<(String, String)>>,
    pub allocations: BTreeMap<String, Vec<CoreIndex>>,
    pub pending: Vec<PendingView>,
    #[serde(default)]
    pub reserved: Vec<CoreIndex>,
    pub activity: Vec<String>,
    /// Per-agent job status; empty unless live data was requested.
    #[serde(default)]
    pub live_jobs: BTreeMap<String, Vec<JobStatus>>,
}

impl Summary {
    pub fn allocation(&self, agent: &str, job: &str) -> Option<&[CoreIndex]> {
        self.allocations
            .get(&JobKey::new(agent, job).to_string())
            .map(Vec::as_slice)
    }

    pub fn is_allocated(&self, agent: &str, job: &str) -> bool {
        self.allocation(agent, job).is_some_and(|c| !c.is_empty())
    }

    pub fn is_pending(&self, agent: &str, job: &str) -> bool {
        self.pending.iter().any(|p| p.vm == agent && p.job == job)
    }
}

/// Body of the controller's `request` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRequest {
    pub vm: String,
    pub job: String,
    pub pid: i32,
    pub cores_requested: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Allocated,
    StolenAllocated,
    Error,
}

impl RequestStatus {
    /// Whether the response already carries an allocation.
    pub fn is_allocated(&self) -> bool {
        matches!(self, RequestStatus::Allocated | RequestStatus::StolenAllocated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResponse {
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of the controller's `complete` operation. The pid is accepted but
/// not used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub vm: String,
    pub job: String,
    #[serde(default)]
    pub pid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub ok: bool,
    #[serde(default)]
    pub freed: Vec<CoreIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
