//! Global core ownership ledger.
//!
//! The ledger is a plain aggregate with no I/O. The broker holds it behind a
//! single lock and drives admissions in three steps: plan and reserve cores
//! (`begin_admission` / `plan_steal`), talk to agents with the lock released,
//! then `confirm_admission` or roll back with `restore_victim` and
//! `abort_admission`. A reserved core belongs to no job, so readers never see
//! half-applied plans.

use super::agent::{Agent, Registration};
use super::info::{AgentView, PendingView, Summary};
use super::job::{unix_seconds, JobKey, JobStatus, PendingRequest, Ticket};
use super::steal::{rank_candidates, StealPolicy};
use super::CoreIndex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("not allocated: {0}")]
    NotAllocated(JobKey),

    #[error("agent {0} must register with endpoint, total_cores and core_offset")]
    IncompleteRegistration(String),

    #[error("core range {start}..{end} of agent {agent} overlaps agent {other}")]
    RangeConflict {
        agent: String,
        other: String,
        start: CoreIndex,
        end: CoreIndex,
    },

    #[error("agent {agent} cannot give up core {core}: it is in use")]
    CoreInUse { agent: String, core: CoreIndex },

    #[error("request for {0} must ask for at least one core")]
    EmptyRequest(JobKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreState {
    Free,
    /// Held by an in-flight admission; owned by no job.
    Reserved(Ticket),
    Bound(JobKey),
}

/// One core taken from a running job for a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Steal {
    pub victim: JobKey,
    pub pid: i32,
    pub core: CoreIndex,
    /// The victim's cores once `core` is gone.
    pub keep: Vec<CoreIndex>,
}

/// Cores reserved for a pending request, waiting for the agent to bind them.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    pub request: PendingRequest,
    pub agent: Agent,
    /// Cores reserved for the request, ascending.
    pub cores: Vec<CoreIndex>,
    /// Cores among `cores` that still have to be taken from their victims.
    pub steals: Vec<Steal>,
    /// The job's full mask once admitted: `cores` plus anything it already
    /// holds.
    pub bind: Vec<CoreIndex>,
}

impl AdmissionPlan {
    pub fn ticket(&self) -> Ticket {
        self.request.ticket
    }
}

/// First step of admitting one pending request.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// The request is no longer queued.
    Gone,
    /// The request named an agent the ledger does not know; it was dropped.
    Dropped(PendingRequest),
    /// Enough free cores: they are reserved and ready to bind.
    Direct(AdmissionPlan),
    /// Not enough free cores; the caller should gather job status and try
    /// `plan_steal`.
    Steal { request: PendingRequest, agent: Agent },
    /// Enough free cores exist but direct admission is held back by the
    /// reserve buffer; nothing to steal.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    agents: BTreeMap<String, Agent>,
    core_map: BTreeMap<CoreIndex, CoreState>,
    allocations: BTreeMap<JobKey, BTreeSet<CoreIndex>>,
    /// Originally requested core count per job. Recorded as a restore
    /// target; nothing grows an allocation back towards it yet.
    requested: HashMap<JobKey, u32>,
    pending: VecDeque<PendingRequest>,
    next_ticket: Ticket,
    policy: StealPolicy,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(StealPolicy::default())
    }
}

impl Ledger {
    pub fn new(policy: StealPolicy) -> Self {
        Self {
            agents: BTreeMap::new(),
            core_map: BTreeMap::new(),
            allocations: BTreeMap::new(),
            requested: HashMap::new(),
            pending: VecDeque::new(),
            next_ticket: 1,
            policy,
        }
    }

    pub fn policy(&self) -> StealPolicy {
        self.policy
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn allocation(&self, key: &JobKey) -> Option<&BTreeSet<CoreIndex>> {
        self.allocations.get(key)
    }

    pub fn allocated_count(&self, key: &JobKey) -> u32 {
        self.allocations.get(key).map_or(0, |c| c.len() as u32)
    }

    pub fn core_state(&self, core: CoreIndex) -> Option<&CoreState> {
        self.core_map.get(&core)
    }

    pub fn requested(&self, key: &JobKey) -> Option<u32> {
        self.requested.get(key).copied()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_tickets(&self) -> Vec<Ticket> {
        self.pending.iter().map(|r| r.ticket).collect()
    }

    /// Free cores of `agent`, lowest index first.
    pub fn free_cores(&self, agent: &Agent) -> Vec<CoreIndex> {
        agent
            .cores()
            .filter(|g| matches!(self.core_map.get(g), Some(CoreState::Free)))
            .collect()
    }

    pub fn reserved_for(&self, ticket: Ticket) -> Vec<CoreIndex> {
        self.core_map
            .iter()
            .filter(|(_, state)| **state == CoreState::Reserved(ticket))
            .map(|(g, _)| *g)
            .collect()
    }

    /// Upsert an agent. Returns `true` if the agent was new.
    ///
    /// Every index of the agent's range that the ledger has not seen yet is
    /// seeded as free; indices already bound keep their owner. A range change
    /// may only drop cores that are free, and those leave the core map.
    pub fn register(&mut self, reg: Registration, now: SystemTime) -> Result<bool, LedgerError> {
        let existing = self.agents.get(&reg.vm_name);
        let created = existing.is_none();

        let agent = match existing {
            Some(agent) => Agent {
                name: agent.name.clone(),
                endpoint: reg.endpoint.unwrap_or_else(|| agent.endpoint.clone()),
                total_cores: reg.total_cores.unwrap_or(agent.total_cores),
                core_offset: reg.core_offset.unwrap_or(agent.core_offset),
                last_seen: now,
            },
            None => match (reg.endpoint, reg.total_cores, reg.core_offset) {
                (Some(endpoint), Some(total_cores), Some(core_offset)) => Agent {
                    name: reg.vm_name.clone(),
                    endpoint,
                    total_cores,
                    core_offset,
                    last_seen: now,
                },
                _ => return Err(LedgerError::IncompleteRegistration(reg.vm_name)),
            },
        };

        let range = agent.cores();
        if let Some(other) = self
            .agents
            .values()
            .find(|other| other.name != agent.name && other.overlaps(&range))
        {
            return Err(LedgerError::RangeConflict {
                agent: agent.name.clone(),
                other: other.name.clone(),
                start: range.start,
                end: range.end,
            });
        }

        let previous = self.agents.get(&agent.name).map(Agent::cores);
        let dropped: Vec<CoreIndex> = previous
            .into_iter()
            .flatten()
            .filter(|g| !range.contains(g))
            .collect();
        if let Some(&core) = dropped
            .iter()
            .find(|g| !matches!(self.core_map.get(*g), Some(CoreState::Free) | None))
        {
            return Err(LedgerError::CoreInUse {
                agent: agent.name.clone(),
                core,
            });
        }
        for g in &dropped {
            self.core_map.remove(g);
        }

        for g in range {
            self.core_map.entry(g).or_insert(CoreState::Free);
        }
        self.agents.insert(agent.name.clone(), agent);
        self.check_invariants();
        Ok(created)
    }

    /// Queue a request for `need` cores on `vm`.
    pub fn enqueue(
        &mut self,
        vm: &str,
        job: &str,
        pid: i32,
        need: u32,
        now: SystemTime,
    ) -> Result<Ticket, LedgerError> {
        if !self.agents.contains_key(vm) {
            return Err(LedgerError::UnknownAgent(vm.to_string()));
        }
        let key = JobKey::new(vm, job);
        if need == 0 {
            return Err(LedgerError::EmptyRequest(key));
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending.push_back(PendingRequest {
            ticket,
            vm: vm.to_string(),
            job: job.to_string(),
            pid,
            need,
            ts: unix_seconds(now),
        });
        self.requested.insert(key, need);
        Ok(ticket)
    }

    /// Drop the allocation of a finished job and free its cores.
    ///
    /// Returns the owning agent (so the caller can clear the affinity) and the
    /// freed cores. Fails without side effects if nothing is allocated.
    pub fn complete(&mut self, key: &JobKey) -> Result<(Agent, Vec<CoreIndex>), LedgerError> {
        let agent = self
            .agents
            .get(&key.agent)
            .cloned()
            .ok_or_else(|| LedgerError::NotAllocated(key.clone()))?;
        let cores = self
            .allocations
            .remove(key)
            .ok_or_else(|| LedgerError::NotAllocated(key.clone()))?;

        for g in &cores {
            self.core_map.insert(*g, CoreState::Free);
        }
        self.requested.remove(key);
        self.check_invariants();
        Ok((agent, cores.into_iter().collect()))
    }

    /// Start admitting the request behind `ticket`.
    pub fn begin_admission(&mut self, ticket: Ticket) -> Attempt {
        let Some(pos) = self.pending.iter().position(|r| r.ticket == ticket) else {
            return Attempt::Gone;
        };
        let request = self.pending[pos].clone();

        let Some(agent) = self.agents.get(&request.vm).cloned() else {
            self.pending.remove(pos);
            return Attempt::Dropped(request);
        };

        let free = self.free_cores(&agent);
        let need = request.need as usize;
        if free.len() >= need + self.policy.reserve_buffer as usize {
            let cores: Vec<CoreIndex> = free.into_iter().take(need).collect();
            self.reserve(ticket, &cores);
            return Attempt::Direct(self.plan(request, agent, cores, Vec::new()));
        }

        if free.len() < need {
            Attempt::Steal { request, agent }
        } else {
            Attempt::Deferred
        }
    }

    /// Plan a steal for `ticket` from the live status of its agent's jobs.
    ///
    /// Each victim gives up exactly one core, its highest-index one, so a
    /// single attempt never takes more than one core from any job. On success
    /// the agent's free cores and every stolen core are reserved for the
    /// request and the victims' allocations shrink. Returns `None` without
    /// touching the ledger if not enough cores can be assembled.
    pub fn plan_steal(&mut self, ticket: Ticket, jobs: &[JobStatus]) -> Option<AdmissionPlan> {
        let request = self.pending.iter().find(|r| r.ticket == ticket)?.clone();
        let agent = self.agents.get(&request.vm)?.clone();

        let free = self.free_cores(&agent);
        let mut remaining = (request.need as usize).checked_sub(free.len())?;
        if remaining == 0 {
            return None;
        }

        let mut candidates = rank_candidates(
            &agent.name,
            jobs,
            |key| self.allocated_count(key),
            self.policy,
        )
        .into_iter();

        let mut steals = Vec::new();
        while remaining > 0 {
            let candidate = candidates.next()?;
            if steals.iter().any(|s: &Steal| s.victim == candidate.key) {
                continue;
            }
            let Some(current) = self.allocations.get(&candidate.key) else {
                continue;
            };
            let Some(&core) = current.iter().next_back() else {
                continue;
            };
            let keep = current.iter().copied().filter(|g| *g != core).collect();
            steals.push(Steal {
                victim: candidate.key,
                pid: candidate.pid,
                core,
                keep,
            });
            remaining -= 1;
        }

        for steal in &steals {
            if let Some(cores) = self.allocations.get_mut(&steal.victim) {
                cores.remove(&steal.core);
            }
        }
        let mut cores = free;
        cores.extend(steals.iter().map(|s| s.core));
        cores.sort_unstable();
        self.reserve(ticket, &cores);

        Some(self.plan(request, agent, cores, steals))
    }

    fn plan(
        &self,
        request: PendingRequest,
        agent: Agent,
        cores: Vec<CoreIndex>,
        steals: Vec<Steal>,
    ) -> AdmissionPlan {
        let mut bind: BTreeSet<CoreIndex> = cores.iter().copied().collect();
        if let Some(held) = self.allocations.get(&request.key()) {
            bind.extend(held.iter().copied());
        }
        AdmissionPlan {
            request,
            agent,
            cores,
            steals,
            bind: bind.into_iter().collect(),
        }
    }

    /// Give a reserved core back to the job it was stolen from.
    ///
    /// Returns `false` if the victim completed meanwhile; the core then stays
    /// reserved and is freed by `abort_admission`.
    pub fn restore_victim(&mut self, ticket: Ticket, steal: &Steal) -> bool {
        if self.core_map.get(&steal.core) != Some(&CoreState::Reserved(ticket)) {
            return false;
        }
        let Some(cores) = self.allocations.get_mut(&steal.victim) else {
            return false;
        };
        cores.insert(steal.core);
        self.core_map
            .insert(steal.core, CoreState::Bound(steal.victim.clone()));
        self.check_invariants();
        true
    }

    /// Bind the reserved cores of `plan` to its job and dequeue the request.
    ///
    /// Returns `false`, changing nothing, if the reservation no longer holds.
    pub fn confirm_admission(&mut self, plan: &AdmissionPlan) -> bool {
        let ticket = plan.ticket();
        let held = plan
            .cores
            .iter()
            .all(|g| self.core_map.get(g) == Some(&CoreState::Reserved(ticket)));
        let Some(pos) = self.pending.iter().position(|r| r.ticket == ticket) else {
            return false;
        };
        if !held {
            return false;
        }

        let key = plan.request.key();
        for g in &plan.cores {
            self.core_map.insert(*g, CoreState::Bound(key.clone()));
        }
        let cores = self.allocations.entry(key.clone()).or_default();
        cores.extend(plan.cores.iter().copied());
        let granted = cores.len() as u32;
        self.requested.entry(key).or_insert(granted);
        self.pending.remove(pos);
        self.check_invariants();
        true
    }

    /// Free every core still reserved for `ticket`. The request stays queued.
    pub fn abort_admission(&mut self, ticket: Ticket) -> Vec<CoreIndex> {
        let released = self.reserved_for(ticket);
        for g in &released {
            self.core_map.insert(*g, CoreState::Free);
        }
        released
    }

    fn reserve(&mut self, ticket: Ticket, cores: &[CoreIndex]) {
        for g in cores {
            self.core_map.insert(*g, CoreState::Reserved(ticket));
        }
        self.check_invariants();
    }

    /// Read-only projection used by the summary endpoint. Activity and live
    /// jobs are filled in by the caller.
    pub fn project(&self) -> Summary {
        let agents = self
            .agents
            .values()
            .map(|a| {
                (
                    a.name.clone(),
                    AgentView {
                        total_cores: a.total_cores,
                        offset: a.core_offset,
                        endpoint: a.endpoint.clone(),
                        last_seen: unix_seconds(a.last_seen),
                    },
                )
            })
            .collect();

        let core_map = self
            .core_map
            .iter()
            .map(|(g, state)| {
                let owner = match state {
                    CoreState::Bound(key) => Some((key.agent.clone(), key.job.clone())),
                    CoreState::Free | CoreState::Reserved(_) => None,
                };
                (g.to_string(), owner)
            })
            .collect();

        let allocations = self
            .allocations
            .iter()
            .map(|(key, cores)| (key.to_string(), cores.iter().copied().collect()))
            .collect();

        let pending = self.pending.iter().map(PendingView::from).collect();

        let reserved = self
            .core_map
            .iter()
            .filter(|(_, s)| matches!(s, CoreState::Reserved(_)))
            .map(|(g, _)| *g)
            .collect();

        Summary {
            agents,
            core_map,
            allocations,
            pending,
            reserved,
            activity: Vec::new(),
            live_jobs: BTreeMap::new(),
        }
    }

    /// Verify the ownership invariants:
    /// - a core is bound to a job iff it is in that job's allocation,
    /// - allocated cores lie in the owning agent's range,
    /// - no agent has more cores allocated than it owns.
    pub fn validate(&self) -> Result<(), String> {
        for (g, state) in &self.core_map {
            if let CoreState::Bound(key) = state {
                if !self.allocations.get(key).is_some_and(|c| c.contains(g)) {
                    return Err(format!("core {g} bound to {key} but not in its allocation"));
                }
            }
        }

        let mut per_agent: HashMap<&str, usize> = HashMap::new();
        for (key, cores) in &self.allocations {
            let agent = self
                .agents
                .get(&key.agent)
                .ok_or_else(|| format!("allocation {key} on unknown agent"))?;
            for g in cores {
                if self.core_map.get(g) != Some(&CoreState::Bound(key.clone())) {
                    return Err(format!("core {g} allocated to {key} but not bound to it"));
                }
                if !agent.owns(*g) {
                    return Err(format!("core {g} allocated to {key} outside agent range"));
                }
            }
            *per_agent.entry(key.agent.as_str()).or_default() += cores.len();
        }

        for (name, count) in per_agent {
            let total = self.agents.get(name).map_or(0, |a| a.total_cores as usize);
            if count > total {
                return Err(format!("agent {name} has {count} cores allocated of {total}"));
            }
        }
        Ok(())
    }

    #[inline]
    fn check_invariants(&self) {
        debug_assert_eq!(self.validate(), Ok(()), "ledger invariant violated");
    }
}
