//! Victim selection for conservative core stealing.

use super::job::{JobKey, JobStatus};
use serde::{Deserialize, Serialize};

/// Tuning knobs of the admission and stealing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealPolicy {
    /// No steal may shrink an allocation below this many cores.
    pub min_cores_per_job: u32,
    /// Free cores that direct admission leaves untouched on an agent.
    pub reserve_buffer: u32,
}

impl Default for StealPolicy {
    fn default() -> Self {
        Self {
            min_cores_per_job: 1,
            reserve_buffer: 0,
        }
    }
}

/// Estimate how many of `allocated` cores a job is actually using.
///
/// The result is `round(cpu_percent / 100 * allocated)` clamped to
/// `[1, allocated]`, with ties rounded to even. Negative or non-finite
/// utilisation counts as idle.
pub fn estimate_used_cores(cpu_percent: f64, allocated: u32) -> u32 {
    if allocated == 0 {
        return 0;
    }
    let cpu_percent = if cpu_percent.is_finite() {
        cpu_percent.max(0.0)
    } else {
        0.0
    };
    let estimate = (cpu_percent / 100.0 * f64::from(allocated)).round_ties_even();
    // Saturating float-to-int cast keeps absurd percentages at u32::MAX.
    (estimate as u32).clamp(1, allocated)
}

/// A running job that can give up one core.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: JobKey,
    pub pid: i32,
    pub allocated: u32,
    pub spare: u32,
}

/// Build the victim list for one attempt, least-utilised job first.
///
/// `allocated` reports the ledger's view of each job's allocation size;
/// jobs the ledger does not know about report 0 and are never candidates.
pub fn rank_candidates<F>(
    agent: &str,
    jobs: &[JobStatus],
    allocated: F,
    policy: StealPolicy,
) -> Vec<Candidate>
where
    F: Fn(&JobKey) -> u32,
{
    let mut candidates: Vec<Candidate> = jobs
        .iter()
        .filter_map(|status| {
            let key = JobKey::new(agent, status.job.clone());
            let allocated = allocated(&key);
            if allocated <= policy.min_cores_per_job {
                return None;
            }
            let used = estimate_used_cores(status.cpu_percent, allocated);
            let spare = allocated - used;
            (spare >= 1 && allocated - 1 >= policy.min_cores_per_job).then_some(Candidate {
                key,
                pid: status.pid,
                allocated,
                spare,
            })
        })
        .collect();

    // Stable: equal spare keeps the agent's reporting order.
    candidates.sort_by(|a, b| b.spare.cmp(&a.spare));
    candidates
}
