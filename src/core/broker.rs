//! Controller service: owns the ledger and runs the scheduling loop.
//!
//! Every agent call happens with the ledger lock released. A pass reserves
//! cores under the lock, performs the binds, then re-acquires the lock to
//! confirm or roll back.

use super::activity::ActivityLog;
use super::agent::{Agent, AllocateRequest, Registration, ReleaseRequest};
use super::audit::{AuditAction, AuditLog};
use super::info::Summary;
use super::job::{JobKey, Ticket};
use super::ledger::{AdmissionPlan, Attempt, Ledger, LedgerError, Steal};
use super::steal::StealPolicy;
use super::transport::AgentTransport;
use super::CoreIndex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify};

/// Entries of the activity log included in a summary.
const SUMMARY_ACTIVITY: usize = 200;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub policy: StealPolicy,
    pub activity_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            policy: StealPolicy::default(),
            activity_capacity: 400,
        }
    }
}

struct BrokerState {
    ledger: Ledger,
    activity: ActivityLog,
}

/// Result of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        key: JobKey,
        cores: Vec<CoreIndex>,
        stolen: usize,
    },
    /// Still queued; retried on the next pass.
    Waiting,
    Dropped,
    Gone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub admitted: Vec<JobKey>,
    pub stolen: usize,
    pub waiting: usize,
    pub dropped: usize,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    transport: Arc<dyn AgentTransport>,
    audit: Option<AuditLog>,
    notify: Notify,
}

impl Broker {
    pub fn new(transport: Arc<dyn AgentTransport>, settings: BrokerSettings) -> Self {
        let mut policy = settings.policy;
        if policy.min_cores_per_job == 0 {
            tracing::warn!("min_cores_per_job must be at least 1, using 1");
            policy.min_cores_per_job = 1;
        }
        Self {
            state: Mutex::new(BrokerState {
                ledger: Ledger::new(policy),
                activity: ActivityLog::new(settings.activity_capacity),
            }),
            transport,
            audit: None,
            notify: Notify::new(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit(&self, action: AuditAction, detail: impl Into<String>) {
        if let Some(audit) = &self.audit {
            audit.record(action, detail);
        }
    }

    pub async fn flush_audit(&self) {
        if let Some(audit) = &self.audit {
            audit.flush().await;
        }
    }

    /// Register an agent or refresh its heartbeat.
    pub async fn register(&self, reg: Registration) -> Result<bool, LedgerError> {
        let name = reg.vm_name.clone();
        let mut state = self.state.lock().await;
        let created = state.ledger.register(reg, SystemTime::now())?;

        if created {
            if let Some(agent) = state.ledger.agent(&name) {
                let range = agent.cores();
                let message = format!(
                    "Registered {name} at {} with cores {}..{}",
                    agent.endpoint, range.start, range.end
                );
                tracing::info!("{message}");
                self.audit(
                    AuditAction::Register,
                    format!("{name} {}..{}", range.start, range.end),
                );
                state.activity.push(message);
            }
        } else {
            tracing::debug!(agent = %name, "Heartbeat");
        }
        Ok(created)
    }

    /// Queue a request and wake the scheduling loop.
    pub async fn request(
        &self,
        vm: &str,
        job: &str,
        pid: i32,
        need: u32,
    ) -> Result<Ticket, LedgerError> {
        let ticket = {
            let mut state = self.state.lock().await;
            let ticket = state
                .ledger
                .enqueue(vm, job, pid, need, SystemTime::now())?;
            let key = JobKey::new(vm, job);
            tracing::info!(%key, pid, need, "Queued request");
            self.audit(AuditAction::Queue, format!("{key} pid={pid} need={need}"));
            state
                .activity
                .push(format!("Queued {key} (pid {pid}) for {need} cores"));
            ticket
        };
        self.notify.notify_one();
        Ok(ticket)
    }

    /// Free the cores of a finished job and clear its affinity on the agent.
    pub async fn complete(&self, vm: &str, job: &str) -> Result<Vec<CoreIndex>, LedgerError> {
        let key = JobKey::new(vm, job);
        let (agent, freed) = {
            let mut state = self.state.lock().await;
            let (agent, freed) = state.ledger.complete(&key)?;
            tracing::info!(%key, ?freed, "Completed job");
            self.audit(AuditAction::Complete, format!("{key} freed={freed:?}"));
            state
                .activity
                .push(format!("Completed {key}, freed {freed:?}"));
            (agent, freed)
        };

        let release = ReleaseRequest {
            job: job.to_string(),
            keep_cores: Vec::new(),
        };
        if let Err(e) = self.transport.release(&agent, &release).await {
            tracing::warn!(%key, "Failed to clear affinity after completion: {e}");
        }
        Ok(freed)
    }

    /// Snapshot of the ledger; with `live` the agents are asked for their
    /// current job status.
    pub async fn summary(&self, live: bool) -> Summary {
        let (mut summary, agents) = {
            let state = self.state.lock().await;
            let mut summary = state.ledger.project();
            summary.activity = state.activity.recent(SUMMARY_ACTIVITY);
            let agents: Vec<Agent> = state.ledger.agents().cloned().collect();
            (summary, agents)
        };

        if live {
            for agent in agents {
                match self.transport.status(&agent).await {
                    Ok(status) => {
                        summary.live_jobs.insert(agent.name.clone(), status.jobs);
                    }
                    Err(e) => {
                        tracing::debug!("Skipping live status: {e}");
                        summary.live_jobs.insert(agent.name.clone(), Vec::new());
                    }
                }
            }
        }
        summary
    }

    /// One scheduling pass over the queue, oldest request first.
    pub async fn run_pass(&self) -> PassReport {
        let tickets = self.state.lock().await.ledger.pending_tickets();
        let mut report = PassReport::default();

        for ticket in tickets {
            match self.admit(ticket).await {
                Admission::Admitted { key, stolen, .. } => {
                    report.admitted.push(key);
                    report.stolen += stolen;
                }
                Admission::Waiting => report.waiting += 1,
                Admission::Dropped => report.dropped += 1,
                Admission::Gone => {}
            }
        }
        report
    }

    /// Try to admit one queued request, stealing if needed.
    pub async fn admit(&self, ticket: Ticket) -> Admission {
        let attempt = {
            let mut state = self.state.lock().await;
            let attempt = state.ledger.begin_admission(ticket);
            if let Attempt::Dropped(request) = &attempt {
                let key = request.key();
                tracing::warn!(%key, "Dropping request for unknown agent");
                self.audit(AuditAction::Drop, format!("{key} unknown agent"));
                state
                    .activity
                    .push(format!("Dropped {key}: unknown agent"));
            }
            attempt
        };

        match attempt {
            Attempt::Gone => Admission::Gone,
            Attempt::Dropped(_) => Admission::Dropped,
            Attempt::Deferred => Admission::Waiting,
            Attempt::Direct(plan) => self.bind(plan, Vec::new()).await,
            Attempt::Steal { request, agent } => {
                let status = match self.transport.status(&agent).await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(
                            key = %request.key(),
                            "Cannot steal, agent status failed: {e}"
                        );
                        return Admission::Waiting;
                    }
                };

                let plan = self
                    .state
                    .lock()
                    .await
                    .ledger
                    .plan_steal(ticket, &status.jobs);
                match plan {
                    Some(plan) => self.take_victim_cores(plan).await,
                    None => {
                        tracing::debug!(
                            key = %request.key(),
                            need = request.need,
                            "Not enough cores, waiting"
                        );
                        Admission::Waiting
                    }
                }
            }
        }
    }

    /// The victim's cores as the agent currently binds them, minus the stolen
    /// one. Falls back to the ledger's view when the agent does not report
    /// the victim or reports nothing else.
    async fn live_keep(&self, agent: &Agent, steal: &Steal) -> Vec<CoreIndex> {
        let live = match self.transport.status(agent).await {
            Ok(status) => status.job(&steal.victim.job).map(|job| job.cores.clone()),
            Err(e) => {
                tracing::debug!(victim = %steal.victim, "Live cores unavailable: {e}");
                None
            }
        };
        let mut keep: Vec<CoreIndex> = live
            .unwrap_or_default()
            .into_iter()
            .filter(|g| *g != steal.core)
            .collect();
        if keep.is_empty() {
            return steal.keep.clone();
        }
        keep.sort_unstable();
        keep.dedup();
        if keep != steal.keep {
            tracing::debug!(
                victim = %steal.victim,
                ?keep,
                ledger = ?steal.keep,
                "Agent view differs"
            );
        }
        keep
    }

    /// Narrow every victim of `plan` on the agent, then bind the requester.
    async fn take_victim_cores(&self, plan: AdmissionPlan) -> Admission {
        let mut narrowed = Vec::with_capacity(plan.steals.len());

        for steal in &plan.steals {
            let keep = self.live_keep(&plan.agent, steal).await;
            let release = ReleaseRequest {
                job: steal.victim.job.clone(),
                keep_cores: keep.clone(),
            };
            match self.transport.release(&plan.agent, &release).await {
                Ok(_) => narrowed.push(Steal {
                    keep,
                    ..steal.clone()
                }),
                Err(e) => {
                    tracing::warn!(victim = %steal.victim, core = steal.core, "Steal failed: {e}");
                    self.roll_back(&plan, narrowed).await;
                    return Admission::Waiting;
                }
            }
        }

        self.bind(plan, narrowed).await
    }

    async fn bind(&self, plan: AdmissionPlan, narrowed: Vec<Steal>) -> Admission {
        let key = plan.request.key();
        let allocate = AllocateRequest {
            job: plan.request.job.clone(),
            pid: plan.request.pid,
            cores: plan.bind.clone(),
        };

        if let Err(e) = self.transport.allocate(&plan.agent, &allocate).await {
            tracing::warn!(%key, cores = ?plan.bind, "Bind failed: {e}");
            self.roll_back(&plan, narrowed).await;
            return Admission::Waiting;
        }

        let mut state = self.state.lock().await;
        if !state.ledger.confirm_admission(&plan) {
            tracing::warn!(%key, "Reservation lost before confirmation");
            state.ledger.abort_admission(plan.ticket());
            return Admission::Waiting;
        }

        for steal in &plan.steals {
            let message = format!("Stole core {} from {} for {key}", steal.core, steal.victim);
            tracing::info!("{message}");
            self.audit(
                AuditAction::Steal,
                format!("{} core={} -> {key}", steal.victim, steal.core),
            );
            state.activity.push(message);
        }
        tracing::info!(%key, cores = ?plan.cores, "Assigned cores");
        self.audit(AuditAction::Assign, format!("{key} -> {:?}", plan.cores));
        state
            .activity
            .push(format!("Assigned {:?} to {key}", plan.cores));

        Admission::Admitted {
            key,
            cores: plan.cores.clone(),
            stolen: plan.steals.len(),
        }
    }

    /// Undo a failed admission: re-bind victims that were already narrowed,
    /// give the stolen cores back and free whatever is still reserved.
    async fn roll_back(&self, plan: &AdmissionPlan, narrowed: Vec<Steal>) {
        let mut lost = Vec::new();
        for steal in narrowed {
            let mut cores = steal.keep.clone();
            cores.push(steal.core);
            cores.sort_unstable();
            let allocate = AllocateRequest {
                job: steal.victim.job.clone(),
                pid: steal.pid,
                cores,
            };
            if let Err(e) = self.transport.allocate(&plan.agent, &allocate).await {
                tracing::warn!(victim = %steal.victim, "Could not restore stolen core: {e}");
                lost.push(steal);
            }
        }

        let ticket = plan.ticket();
        let mut state = self.state.lock().await;
        let restorable = plan
            .steals
            .iter()
            .filter(|s| !lost.iter().any(|l| l.victim == s.victim && l.core == s.core));
        for steal in restorable {
            if state.ledger.restore_victim(ticket, steal) {
                self.audit(
                    AuditAction::Restore,
                    format!("{} core={}", steal.victim, steal.core),
                );
                state
                    .activity
                    .push(format!("Restored core {} to {}", steal.core, steal.victim));
            }
        }
        let released = state.ledger.abort_admission(ticket);
        if !released.is_empty() {
            tracing::debug!(ticket, ?released, "Released reservation");
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Scheduling loop: one pass per tick, or sooner when a request arrives.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {
                    tracing::debug!("Scheduler triggered by request");
                }
            }

            let report = self.run_pass().await;
            if !report.admitted.is_empty() || report.dropped > 0 {
                tracing::debug!(
                    admitted = report.admitted.len(),
                    stolen = report.stolen,
                    waiting = report.waiting,
                    dropped = report.dropped,
                    "Scheduling pass finished"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AgentStatus;
    use crate::core::job::JobStatus;
    use crate::core::transport::AgentCallError;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Allocate(String, Vec<CoreIndex>),
        Release(String, Vec<CoreIndex>),
    }

    /// In-memory agents: `status` replays the configured utilisation,
    /// `allocate` and `release` are recorded and may be told to fail.
    #[derive(Default)]
    struct FakeAgents {
        cpu: StdMutex<HashMap<String, f64>>,
        bound: StdMutex<HashMap<String, (i32, Vec<CoreIndex>)>>,
        failing_allocs: StdMutex<HashSet<String>>,
        failing_releases: StdMutex<HashSet<String>>,
        down: StdMutex<bool>,
        calls: StdMutex<Vec<Call>>,
    }

    impl FakeAgents {
        fn set_cpu(&self, job: &str, percent: f64) {
            self.cpu.lock().unwrap().insert(job.to_string(), percent);
        }

        fn fail_allocate(&self, job: &str) {
            self.failing_allocs.lock().unwrap().insert(job.to_string());
        }

        fn fail_release(&self, job: &str) {
            self.failing_releases.lock().unwrap().insert(job.to_string());
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn bound(&self, job: &str) -> Option<Vec<CoreIndex>> {
            self.bound.lock().unwrap().get(job).map(|(_, c)| c.clone())
        }

        fn set_bound(&self, job: &str, pid: i32, cores: Vec<CoreIndex>) {
            self.bound
                .lock()
                .unwrap()
                .insert(job.to_string(), (pid, cores));
        }

        fn unreachable(agent: &Agent) -> AgentCallError {
            AgentCallError::Unreachable {
                agent: agent.name.clone(),
                message: "connection refused".into(),
            }
        }
    }

    #[async_trait]
    impl AgentTransport for FakeAgents {
        async fn status(&self, agent: &Agent) -> Result<AgentStatus, AgentCallError> {
            if *self.down.lock().unwrap() {
                return Err(Self::unreachable(agent));
            }
            let cpu = self.cpu.lock().unwrap();
            let jobs = self
                .bound
                .lock()
                .unwrap()
                .iter()
                .map(|(job, (pid, cores))| JobStatus {
                    job: job.clone(),
                    pid: *pid,
                    cores: cores.clone(),
                    cpu_percent: cpu.get(job).copied().unwrap_or(100.0),
                })
                .collect();
            Ok(AgentStatus {
                vm: agent.name.clone(),
                total_cores: agent.total_cores,
                offset: agent.core_offset,
                jobs,
            })
        }

        async fn allocate(
            &self,
            agent: &Agent,
            req: &AllocateRequest,
        ) -> Result<Vec<CoreIndex>, AgentCallError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Allocate(req.job.clone(), req.cores.clone()));
            if self.failing_allocs.lock().unwrap().contains(&req.job) {
                return Err(AgentCallError::Rejected {
                    agent: agent.name.clone(),
                    status: 500,
                    message: "No such process".into(),
                });
            }
            self.bound
                .lock()
                .unwrap()
                .insert(req.job.clone(), (req.pid, req.cores.clone()));
            Ok(req.cores.clone())
        }

        async fn release(
            &self,
            agent: &Agent,
            req: &ReleaseRequest,
        ) -> Result<Vec<CoreIndex>, AgentCallError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Release(req.job.clone(), req.keep_cores.clone()));
            if self.failing_releases.lock().unwrap().contains(&req.job) {
                return Err(Self::unreachable(agent));
            }
            let mut bound = self.bound.lock().unwrap();
            if req.keep_cores.is_empty() {
                bound.remove(&req.job);
            } else if let Some(entry) = bound.get_mut(&req.job) {
                entry.1 = req.keep_cores.clone();
            }
            Ok(req.keep_cores.clone())
        }
    }

    fn registration(name: &str, offset: u32, total: u32) -> Registration {
        Registration {
            vm_name: name.to_string(),
            endpoint: Some(format!("http://{name}:5001")),
            total_cores: Some(total),
            core_offset: Some(offset),
        }
    }

    async fn broker_with_vm1() -> (Arc<FakeAgents>, Broker) {
        let agents = Arc::new(FakeAgents::default());
        let broker = Broker::new(agents.clone(), BrokerSettings::default());
        assert!(broker.register(registration("vm1", 0, 4)).await.unwrap());
        (agents, broker)
    }

    #[tokio::test]
    async fn test_direct_admission() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();

        let report = broker.run_pass().await;
        assert_eq!(report.admitted, vec![JobKey::new("vm1", "train")]);
        assert_eq!(report.stolen, 0);

        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2, 3][..]));
        assert!(summary.pending.is_empty());
        assert!(summary.live_jobs.is_empty());
        assert_eq!(
            agents.calls(),
            vec![Call::Allocate("train".into(), vec![0, 1, 2, 3])]
        );
    }

    #[tokio::test]
    async fn test_steal_from_half_busy_job() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        agents.set_cpu("train", 50.0);
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        let report = broker.run_pass().await;
        assert_eq!(report.admitted, vec![JobKey::new("vm1", "infer")]);
        assert_eq!(report.stolen, 1);

        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2][..]));
        assert_eq!(summary.allocation("vm1", "infer"), Some(&[3][..]));
        assert_eq!(
            summary.core_map["3"],
            Some(("vm1".to_string(), "infer".to_string()))
        );
        assert_eq!(agents.bound("train"), Some(vec![0, 1, 2]));
        assert_eq!(agents.bound("infer"), Some(vec![3]));
        assert!(summary.activity[0].contains("Assigned [3] to vm1|infer"));
    }

    #[tokio::test]
    async fn test_steal_narrows_to_live_cores() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        // The agent lost core 0 for train behind the ledger's back.
        agents.set_bound("train", 100, vec![1, 2, 3]);
        agents.set_cpu("train", 0.0);
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        assert_eq!(broker.run_pass().await.stolen, 1);

        assert!(agents
            .calls()
            .contains(&Call::Release("train".into(), vec![1, 2])));
        assert_eq!(agents.bound("train"), Some(vec![1, 2]));
        assert_eq!(agents.bound("infer"), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_failed_bind_restores_live_cores() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        agents.set_bound("train", 100, vec![1, 2, 3]);
        agents.set_cpu("train", 0.0);
        agents.fail_allocate("infer");
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        broker.run_pass().await;

        assert_eq!(agents.bound("train"), Some(vec![1, 2, 3]));
        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2, 3][..]));
        assert!(summary.reserved.is_empty());
    }

    #[tokio::test]
    async fn test_busy_job_is_not_a_victim() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        agents.set_cpu("train", 100.0);
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        let report = broker.run_pass().await;
        assert!(report.admitted.is_empty());
        assert_eq!(report.waiting, 1);
        assert_eq!(
            broker.summary(false).await.allocation("vm1", "train"),
            Some(&[0, 1, 2, 3][..])
        );
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected() {
        let (_agents, broker) = broker_with_vm1().await;
        let before = broker.summary(false).await;

        assert_eq!(
            broker.request("vm9", "train", 1, 2).await,
            Err(LedgerError::UnknownAgent("vm9".into()))
        );
        let after = broker.summary(false).await;
        assert!(after.pending.is_empty());
        assert_eq!(before.core_map, after.core_map);
        assert_eq!(before.allocations, after.allocations);
    }

    #[tokio::test]
    async fn test_complete_twice() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 2).await.unwrap();
        broker.run_pass().await;

        assert_eq!(broker.complete("vm1", "train").await.unwrap(), vec![0, 1]);
        let snapshot = broker.summary(false).await;
        assert_eq!(
            broker.complete("vm1", "train").await,
            Err(LedgerError::NotAllocated(JobKey::new("vm1", "train")))
        );
        let again = broker.summary(false).await;
        assert_eq!(snapshot.core_map, again.core_map);
        assert_eq!(snapshot.allocations, again.allocations);

        let releases: Vec<_> = agents
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Release(..)))
            .collect();
        assert_eq!(releases, vec![Call::Release("train".into(), vec![])]);
    }

    #[tokio::test]
    async fn test_failed_bind_restores_victim() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        agents.set_cpu("train", 0.0);
        agents.fail_allocate("infer");
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        let report = broker.run_pass().await;
        assert!(report.admitted.is_empty());

        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2, 3][..]));
        assert!(summary.is_pending("vm1", "infer"));
        assert!(summary.reserved.is_empty());
        assert_eq!(agents.bound("train"), Some(vec![0, 1, 2, 3]));
        assert!(agents
            .calls()
            .contains(&Call::Allocate("train".into(), vec![0, 1, 2, 3])));
    }

    #[tokio::test]
    async fn test_failed_release_keeps_victim() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        agents.set_cpu("train", 0.0);
        agents.fail_release("train");
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        broker.run_pass().await;

        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "train"), Some(&[0, 1, 2, 3][..]));
        assert!(summary.is_pending("vm1", "infer"));
        assert!(!agents
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Allocate(job, _) if job == "infer")));
    }

    #[tokio::test]
    async fn test_unreachable_agent_keeps_request_queued() {
        let (agents, broker) = broker_with_vm1().await;
        broker.request("vm1", "train", 100, 4).await.unwrap();
        broker.run_pass().await;

        *agents.down.lock().unwrap() = true;
        broker.request("vm1", "infer", 200, 1).await.unwrap();
        assert_eq!(broker.run_pass().await.waiting, 1);

        *agents.down.lock().unwrap() = false;
        agents.set_cpu("train", 0.0);
        assert_eq!(broker.run_pass().await.stolen, 1);
    }

    #[tokio::test]
    async fn test_unsatisfiable_requests_accumulate() {
        let (_agents, broker) = broker_with_vm1().await;
        for i in 0..10 {
            broker
                .request("vm1", &format!("huge{i}"), 100 + i, 64)
                .await
                .unwrap();
            broker.run_pass().await;
        }
        assert_eq!(broker.summary(false).await.pending.len(), 10);
    }

    #[tokio::test]
    async fn test_summary_live_jobs() {
        let (agents, broker) = broker_with_vm1().await;
        broker.register(registration("vm2", 4, 4)).await.unwrap();
        broker.request("vm1", "train", 100, 2).await.unwrap();
        broker.run_pass().await;
        agents.set_cpu("train", 25.0);

        let summary = broker.summary(true).await;
        assert_eq!(summary.agents.len(), 2);
        assert_eq!(summary.agents["vm2"].offset, 4);
        let live = &summary.live_jobs["vm1"];
        assert_eq!(live[0].job, "train");
        assert_eq!(live[0].cpu_percent, 25.0);
        assert!(summary.activity[0].contains("Assigned"));
    }

    #[tokio::test]
    async fn test_zero_floor_is_raised() {
        let agents = Arc::new(FakeAgents::default());
        let settings = BrokerSettings {
            policy: StealPolicy {
                min_cores_per_job: 0,
                reserve_buffer: 0,
            },
            ..Default::default()
        };
        let broker = Broker::new(agents.clone(), settings);
        broker.register(registration("vm1", 0, 1)).await.unwrap();
        broker.request("vm1", "only", 100, 1).await.unwrap();
        broker.run_pass().await;

        agents.set_cpu("only", 0.0);
        broker.request("vm1", "thief", 200, 1).await.unwrap();
        broker.run_pass().await;
        let summary = broker.summary(false).await;
        assert_eq!(summary.allocation("vm1", "only"), Some(&[0][..]));
        assert!(summary.is_pending("vm1", "thief"));
    }

    #[tokio::test]
    async fn test_request_wakes_scheduler() {
        let (_agents, broker) = broker_with_vm1().await;
        let broker = Arc::new(broker);
        let loop_handle = tokio::spawn(Arc::clone(&broker).run(Duration::from_secs(3600)));

        // Let the loop consume its immediate first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.request("vm1", "train", 100, 2).await.unwrap();

        let admitted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if broker.summary(false).await.is_allocated("vm1", "train") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        loop_handle.abort();
        assert!(admitted.is_ok());
    }
}
