//! Worker-side job lifecycle: spawn gated, request cores, open the gate once
//! admitted, report completion.

use super::info::{
    CompleteRequest, CompleteResponse, CoreRequest, RequestResponse, RequestStatus, Summary,
};
use super::job::{JobPhase, JobSpec};
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Waits for `$COREBROKER_START_DIR/start_$$` before exec-ing the command.
const GATE_SCRIPT: &str =
    r#"m="$COREBROKER_START_DIR/start_$$"; while [ ! -e "$m" ]; do sleep 0.25; done; exec "$@""#;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerCallError {
    #[error("controller unreachable: {0}")]
    Unreachable(String),

    #[error("controller rejected the call ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid controller response: {0}")]
    Decode(String),
}

/// The controller operations a worker needs.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn request(&self, req: &CoreRequest) -> Result<RequestResponse, ControllerCallError>;

    async fn summary(&self, live: bool) -> Result<Summary, ControllerCallError>;

    async fn complete(&self, req: &CompleteRequest)
        -> Result<CompleteResponse, ControllerCallError>;
}

/// A child process held back until its start marker appears.
pub struct GatedProcess {
    child: tokio::process::Child,
    pid: i32,
    marker: PathBuf,
}

impl GatedProcess {
    pub fn spawn(start_dir: &Path, command: &[String]) -> anyhow::Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Empty command");
        }
        std::fs::create_dir_all(start_dir)
            .with_context(|| format!("Failed to create start dir {}", start_dir.display()))?;

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(GATE_SCRIPT)
            .arg("sh")
            .args(command)
            .env("COREBROKER_START_DIR", start_dir)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to spawn {command:?}"))?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .context("Spawned process has no pid")?;

        let process = Self {
            child,
            pid,
            marker: start_dir.join(format!("start_{pid}")),
        };
        // A marker left behind by an earlier process with the same pid
        // would release this one too early.
        process.remove_marker();
        Ok(process)
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn open_gate(&self) -> std::io::Result<()> {
        std::fs::File::create(&self.marker).map(|_| ())
    }

    pub fn remove_marker(&self) {
        match std::fs::remove_file(&self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {e}", self.marker.display()),
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the process group and reap the child.
    pub async fn kill(&mut self) -> std::io::Result<ExitStatus> {
        // SAFETY: kill(2) with a negative pid signals the group we created.
        unsafe {
            libc::kill(-self.pid, libc::SIGKILL);
        }
        let _ = self.child.start_kill();
        self.child.wait().await
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub start_dir: PathBuf,
    pub poll_interval: Duration,
    pub alloc_wait_timeout: Duration,
    pub failure_grace: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            start_dir: std::env::temp_dir().join("corebroker-starts"),
            poll_interval: Duration::from_millis(1500),
            alloc_wait_timeout: Duration::from_secs(180),
            failure_grace: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    pub pid: i32,
    /// Every phase the job went through, ending in a final one.
    pub phases: Vec<JobPhase>,
    pub exit_code: Option<i32>,
}

impl JobOutcome {
    pub fn phase(&self) -> JobPhase {
        self.phases.last().copied().unwrap_or(JobPhase::Spawned)
    }
}

struct PhaseTrack {
    job: String,
    phases: Vec<JobPhase>,
}

impl PhaseTrack {
    fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            phases: vec![JobPhase::Spawned],
        }
    }

    fn advance(&mut self, next: JobPhase) {
        let current = self.phases.last().copied().unwrap_or(JobPhase::Spawned);
        debug_assert!(
            current.can_transition_to(next),
            "invalid transition {current} -> {next}"
        );
        tracing::debug!(job = %self.job, "{current} -> {next}");
        self.phases.push(next);
    }
}

enum QueueEvent {
    Allocated,
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
}

/// Drives one job through its lifecycle against a controller.
pub struct LifecycleDriver {
    api: Arc<dyn ControllerApi>,
    settings: DriverSettings,
}

impl LifecycleDriver {
    pub fn new(api: Arc<dyn ControllerApi>, settings: DriverSettings) -> Self {
        Self { api, settings }
    }

    pub async fn drive(&self, spec: &JobSpec) -> anyhow::Result<JobOutcome> {
        let mut process = GatedProcess::spawn(&self.settings.start_dir, &spec.command)?;
        let pid = process.pid();
        let mut track = PhaseTrack::new(&spec.name);
        tracing::info!(
            job = %spec.name,
            pid,
            agent = %spec.agent,
            cores = spec.cores,
            "Spawned job"
        );

        track.advance(JobPhase::Requested);
        let request = CoreRequest {
            vm: spec.agent.clone(),
            job: spec.name.clone(),
            pid,
            cores_requested: spec.cores,
        };
        let response = match self.api.request(&request).await {
            Ok(resp) if resp.status != RequestStatus::Error => resp,
            Ok(resp) => {
                let message = resp.message.unwrap_or_default();
                tracing::error!(job = %spec.name, "Request rejected: {message}");
                return Ok(self.fail_unadmitted(spec, process, track).await);
            }
            Err(e) => {
                tracing::error!(job = %spec.name, "Request failed: {e}");
                return Ok(self.fail_unadmitted(spec, process, track).await);
            }
        };

        if response.status.is_allocated() {
            track.advance(JobPhase::Allocated);
        } else {
            track.advance(JobPhase::Queued);
            match self.wait_for_allocation(spec, &mut process).await {
                QueueEvent::Allocated => track.advance(JobPhase::Allocated),
                QueueEvent::Exited(status) => {
                    tracing::info!(job = %spec.name, "Exited before admission");
                    track.advance(JobPhase::Completed);
                    self.report_complete(spec, pid).await;
                    process.remove_marker();
                    return Ok(self.outcome(spec, pid, track, status.ok()));
                }
                QueueEvent::TimedOut => {
                    tracing::warn!(
                        job = %spec.name,
                        "No allocation after {:?}, killing",
                        self.settings.alloc_wait_timeout
                    );
                    track.advance(JobPhase::Failed);
                    let status = process.kill().await.ok();
                    self.report_complete(spec, pid).await;
                    process.remove_marker();
                    return Ok(self.outcome(spec, pid, track, status));
                }
            }
        }

        if let Err(e) = process.open_gate() {
            tracing::error!(
                job = %spec.name,
                "Failed to open start gate {}: {e}",
                process.marker().display()
            );
            track.advance(JobPhase::Failed);
            let status = process.kill().await.ok();
            self.report_complete(spec, pid).await;
            process.remove_marker();
            return Ok(self.outcome(spec, pid, track, status));
        }
        track.advance(JobPhase::Running);
        tracing::info!(job = %spec.name, pid, "Started job");

        let status = process.wait().await.ok();
        track.advance(JobPhase::Completed);
        tracing::info!(job = %spec.name, pid, ?status, "Job finished");
        self.report_complete(spec, pid).await;
        process.remove_marker();
        Ok(self.outcome(spec, pid, track, status))
    }

    async fn wait_for_allocation(&self, spec: &JobSpec, process: &mut GatedProcess) -> QueueEvent {
        let deadline = tokio::time::sleep(self.settings.alloc_wait_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = process.wait() => return QueueEvent::Exited(status),
                _ = &mut deadline => return QueueEvent::TimedOut,
                _ = poll.tick() => {
                    match self.api.summary(false).await {
                        Ok(summary) if summary.is_allocated(&spec.agent, &spec.name) => {
                            return QueueEvent::Allocated;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(job = %spec.name, "Summary poll failed: {e}"),
                    }
                }
            }
        }
    }

    async fn fail_unadmitted(
        &self,
        spec: &JobSpec,
        mut process: GatedProcess,
        mut track: PhaseTrack,
    ) -> JobOutcome {
        track.advance(JobPhase::Failed);
        let pid = process.pid();
        let status = match tokio::time::timeout(self.settings.failure_grace, process.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => process.kill().await.ok(),
        };
        self.report_complete(spec, pid).await;
        process.remove_marker();
        self.outcome(spec, pid, track, status)
    }

    async fn report_complete(&self, spec: &JobSpec, pid: i32) {
        let req = CompleteRequest {
            vm: spec.agent.clone(),
            job: spec.name.clone(),
            pid: Some(pid),
        };
        match self.api.complete(&req).await {
            Ok(resp) if resp.ok => {
                tracing::info!(job = %spec.name, freed = ?resp.freed, "Reported completion")
            }
            Ok(resp) => tracing::debug!(
                job = %spec.name,
                "Completion not applied: {}",
                resp.message.unwrap_or_default()
            ),
            Err(e) => tracing::warn!(job = %spec.name, "Failed to report completion: {e}"),
        }
    }

    fn outcome(
        &self,
        spec: &JobSpec,
        pid: i32,
        track: PhaseTrack,
        status: Option<ExitStatus>,
    ) -> JobOutcome {
        JobOutcome {
            job: spec.name.clone(),
            pid,
            phases: track.phases,
            exit_code: status.and_then(|s| s.code()),
        }
    }
}
