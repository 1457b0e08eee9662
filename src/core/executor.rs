//! Per-machine affinity executor used by the agent.

use super::affinity::{Affinity, CpuSampler};
use super::agent::AgentStatus;
use super::job::JobStatus;
use super::CoreIndex;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("failed to bind pid {pid}: {message}")]
    Bind { pid: i32, message: String },

    #[error("job not found: {0}")]
    JobNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedJob {
    pid: i32,
    cores: Vec<CoreIndex>,
}

/// Applies affinity masks for the jobs of one agent and reports their CPU
/// utilisation. Core indices at this boundary are global and are bound as
/// CPU ids unchanged, so agents sharing a host split its CPUs by offset.
/// With `local_cpu_ids` the agent's offset is subtracted first.
pub struct AgentExecutor {
    name: String,
    total_cores: u32,
    core_offset: CoreIndex,
    local_cpu_ids: bool,
    affinity: Box<dyn Affinity>,
    sampler: Box<dyn CpuSampler>,
    jobs: Mutex<BTreeMap<String, TrackedJob>>,
    window: Duration,
}

impl AgentExecutor {
    pub fn new(
        name: impl Into<String>,
        total_cores: u32,
        core_offset: CoreIndex,
        affinity: Box<dyn Affinity>,
        sampler: Box<dyn CpuSampler>,
    ) -> Self {
        Self {
            name: name.into(),
            total_cores,
            core_offset,
            local_cpu_ids: false,
            affinity,
            sampler,
            jobs: Mutex::new(BTreeMap::new()),
            window: Duration::from_millis(100),
        }
    }

    pub fn with_sample_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Bind `core - core_offset` instead of the global index, for machines
    /// that host a single agent whose range does not start at 0.
    pub fn with_local_cpu_ids(mut self, local: bool) -> Self {
        self.local_cpu_ids = local;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_cores(&self) -> u32 {
        self.total_cores
    }

    pub fn core_offset(&self) -> CoreIndex {
        self.core_offset
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TrackedJob>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn to_cpus(&self, pid: i32, cores: &[CoreIndex]) -> Result<Vec<usize>, ExecutorError> {
        cores
            .iter()
            .map(|g| {
                g.checked_sub(self.core_offset)
                    .filter(|local| *local < self.total_cores)
                    .map(|local| {
                        if self.local_cpu_ids {
                            local as usize
                        } else {
                            *g as usize
                        }
                    })
                    .ok_or_else(|| ExecutorError::Bind {
                        pid,
                        message: format!(
                            "core {g} outside {}..{}",
                            self.core_offset,
                            self.core_offset + self.total_cores
                        ),
                    })
            })
            .collect()
    }

    /// Pin `pid` to exactly `cores` and track it under `job`.
    pub fn allocate(
        &self,
        job: &str,
        pid: i32,
        cores: &[CoreIndex],
    ) -> Result<Vec<CoreIndex>, ExecutorError> {
        if pid <= 0 {
            return Err(ExecutorError::Bind {
                pid,
                message: "invalid pid".to_string(),
            });
        }
        if cores.is_empty() {
            return Err(ExecutorError::Bind {
                pid,
                message: "no cores given".to_string(),
            });
        }
        let cpus = self.to_cpus(pid, cores)?;
        self.affinity
            .bind(pid, &cpus)
            .map_err(|e| ExecutorError::Bind {
                pid,
                message: e.to_string(),
            })?;

        let mut cores = cores.to_vec();
        cores.sort_unstable();
        cores.dedup();
        tracing::info!(job, pid, ?cores, "Bound job");
        self.tracked().insert(
            job.to_string(),
            TrackedJob {
                pid,
                cores: cores.clone(),
            },
        );
        Ok(cores)
    }

    /// Narrow `job` to `keep`, or reset its mask and stop tracking it when
    /// `keep` is empty.
    pub fn release(&self, job: &str, keep: &[CoreIndex]) -> Result<Vec<CoreIndex>, ExecutorError> {
        let pid = self
            .tracked()
            .get(job)
            .map(|t| t.pid)
            .ok_or_else(|| ExecutorError::JobNotFound(job.to_string()))?;

        if keep.is_empty() {
            self.affinity
                .unbind(pid)
                .map_err(|e| ExecutorError::Bind {
                    pid,
                    message: e.to_string(),
                })?;
            self.tracked().remove(job);
            tracing::info!(job, pid, "Released job");
            return Ok(Vec::new());
        }

        let cpus = self.to_cpus(pid, keep)?;
        self.affinity
            .bind(pid, &cpus)
            .map_err(|e| ExecutorError::Bind {
                pid,
                message: e.to_string(),
            })?;

        let mut cores = keep.to_vec();
        cores.sort_unstable();
        cores.dedup();
        if let Some(tracked) = self.tracked().get_mut(job) {
            tracked.cores = cores.clone();
        }
        tracing::info!(job, pid, ?cores, "Narrowed job");
        Ok(cores)
    }

    /// Sample CPU utilisation of every tracked job over one window.
    ///
    /// Utilisation is relative to a single CPU, so a job busy on three cores
    /// reports about 300. Vanished processes report 0.
    pub async fn status(&self) -> AgentStatus {
        let snapshot: Vec<(String, TrackedJob)> = self
            .tracked()
            .iter()
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect();

        let before: Vec<Option<Duration>> = snapshot
            .iter()
            .map(|(_, t)| self.sampler.cpu_time(t.pid))
            .collect();
        let started = tokio::time::Instant::now();
        if !snapshot.is_empty() {
            tokio::time::sleep(self.window).await;
        }
        let elapsed = started.elapsed().as_secs_f64();

        let jobs = snapshot
            .into_iter()
            .zip(before)
            .map(|((job, tracked), before)| {
                let after = self.sampler.cpu_time(tracked.pid);
                let cpu_percent = match (before, after) {
                    (Some(b), Some(a)) if elapsed > 0.0 => {
                        a.saturating_sub(b).as_secs_f64() / elapsed * 100.0
                    }
                    _ => 0.0,
                };
                JobStatus {
                    job,
                    pid: tracked.pid,
                    cores: tracked.cores,
                    cpu_percent,
                }
            })
            .collect();

        AgentStatus {
            vm: self.name.clone(),
            total_cores: self.total_cores,
            offset: self.core_offset,
            jobs,
        }
    }
}
