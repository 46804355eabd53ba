use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use taskhive_core::{Agent, AgentStatus, Task, TaskPriority};
use tracing::debug;
use uuid::Uuid;

/// Baseline execution time (seconds) used to normalize agent speed.
const SPEED_BASELINE_SECS: f64 = 300.0;

/// Load variance above which the adaptive policy prefers least-loaded.
const ADAPTIVE_VARIANCE_THRESHOLD: f64 = 2.0;

/// Utilization variance above which rebalancing is flagged (25% std dev).
const REBALANCE_VARIANCE_THRESHOLD: f64 = 0.0625;
/// Max utilization above which rebalancing is flagged.
const REBALANCE_MAX_UTILIZATION: f64 = 0.9;
/// An agent above this utilization counts as overloaded.
const OVERLOADED_UTILIZATION: f64 = 0.8;
/// An agent below this utilization counts as underloaded.
const UNDERLOADED_UTILIZATION: f64 = 0.5;

/// Cap on retained assignment-history entries.
const HISTORY_CAP: usize = 256;

/// Agent selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Fair rotation among eligible agents.
    RoundRobin,
    /// Minimum `current_load` wins.
    LeastLoaded,
    /// Roulette sample weighted by performance × spare capacity.
    WeightedRoundRobin,
    /// Deterministic scoring of capability fit, load, and success rate.
    CapabilityBased,
    /// Deterministic scoring of cached performance, load, and speed.
    PerformanceBased,
    /// Picks one of the above per call based on task urgency and load
    /// variance.
    #[default]
    Adaptive,
}

/// Cached per-agent load metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoadMetrics {
    /// Tasks currently in flight.
    pub current_load: u32,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: u32,
    /// Load as a fraction of capacity.
    pub utilization: f64,
    /// Cached performance score in `[0, 1]`-ish range.
    pub performance_score: f64,
    /// Total tasks this balancer has assigned to the agent.
    pub tasks_assigned: u64,
    /// When the metrics were last refreshed.
    pub updated_at: DateTime<Utc>,
}

impl AgentLoadMetrics {
    fn from_agent(agent: &Agent) -> Self {
        Self {
            current_load: agent.current_load,
            max_concurrent_tasks: agent.max_concurrent_tasks,
            utilization: agent.load_ratio(),
            performance_score: agent.success_rate
                * speed_score(agent.average_execution_time_secs),
            tasks_assigned: 0,
            updated_at: Utc::now(),
        }
    }
}

/// One recorded task→agent selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// The task that was assigned.
    pub task_id: Uuid,
    /// The agent it went to.
    pub agent_id: Uuid,
    /// The strategy that made the pick.
    pub strategy: BalancingStrategy,
    /// When.
    pub at: DateTime<Utc>,
}

/// A slot transfer suggested by [`LoadBalancer::rebalance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTransfer {
    /// Agent to take work from.
    pub from: Uuid,
    /// Agent to give work to.
    pub to: Uuid,
    /// Number of task slots to move.
    pub slots: u32,
}

/// Output of a rebalancing evaluation. A plan only — nothing is migrated by
/// the balancer itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    /// Whether rebalancing is warranted at all.
    pub needed: bool,
    /// Human-readable trigger reasons.
    pub reasons: Vec<String>,
    /// Suggested slot transfers.
    pub transfers: Vec<SlotTransfer>,
}

/// Selects the best agent for a task among several strategies and can
/// produce full task→agent distributions or a rebalancing plan.
///
/// The balancer only ever reads agent records; it never mutates the
/// registry. Candidates are pre-filtered so no strategy can choose an agent
/// at or over capacity.
pub struct LoadBalancer {
    strategy: BalancingStrategy,
    /// Rotation counters keyed by the sorted candidate-ID set, so rotation
    /// state is stable across calls with the same pool.
    rotation: Mutex<HashMap<String, usize>>,
    metrics: RwLock<HashMap<Uuid, AgentLoadMetrics>>,
    history: Mutex<VecDeque<AssignmentRecord>>,
}

impl LoadBalancer {
    /// Create a balancer with the adaptive default strategy.
    pub fn new() -> Self {
        Self::with_strategy(BalancingStrategy::default())
    }

    /// Create a balancer with a fixed strategy.
    pub fn with_strategy(strategy: BalancingStrategy) -> Self {
        Self {
            strategy,
            rotation: Mutex::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    /// Select the best agent for the task, or `None` when no candidate is
    /// eligible. Eligibility: idle status, spare capacity, and a capability
    /// match when the task requires one.
    pub fn select_agent(&self, task: &Task, agents: &[Agent]) -> Option<Uuid> {
        let candidates = Self::eligible(task, agents);
        if candidates.is_empty() {
            return None;
        }
        let strategy = self.resolve_strategy(task, &candidates);
        let chosen = match strategy {
            BalancingStrategy::RoundRobin => self.pick_round_robin(&candidates),
            BalancingStrategy::LeastLoaded => Self::pick_least_loaded(&candidates),
            BalancingStrategy::WeightedRoundRobin => self.pick_weighted(&candidates),
            BalancingStrategy::CapabilityBased => Self::pick_capability(task, &candidates),
            BalancingStrategy::PerformanceBased => self.pick_performance(&candidates),
            // resolve_strategy never returns Adaptive.
            BalancingStrategy::Adaptive => Self::pick_least_loaded(&candidates),
        }?;
        debug!(task_id = %task.id, agent_id = %chosen, ?strategy, "selected agent");
        self.record_assignment(task.id, chosen, strategy);
        Some(chosen)
    }

    /// Distribute a batch of tasks over the agents, respecting capacity by
    /// simulating load as assignments accumulate. Tasks with no eligible
    /// agent are left out of the map.
    pub fn distribute_tasks(
        &self,
        tasks: &[Task],
        agents: &[Agent],
    ) -> HashMap<Uuid, Vec<Uuid>> {
        let mut pool: Vec<Agent> = agents.to_vec();
        let mut plan: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in tasks {
            let Some(agent_id) = self.select_agent(task, &pool) else {
                debug!(task_id = %task.id, "no eligible agent for task in distribution");
                continue;
            };
            plan.entry(agent_id).or_default().push(task.id);
            if let Some(agent) = pool.iter_mut().find(|a| a.id == agent_id) {
                agent.current_load += 1;
                if !agent.has_capacity() {
                    agent.status = AgentStatus::Busy;
                }
            }
        }
        plan
    }

    /// Evaluate whether the agents' utilization warrants rebalancing and, if
    /// so, suggest slot transfers from overloaded toward underloaded agents.
    pub fn rebalance(&self, agents: &[Agent]) -> RebalancePlan {
        let utils: Vec<(Uuid, f64)> = agents.iter().map(|a| (a.id, a.load_ratio())).collect();
        let mut reasons = Vec::new();
        if utils.is_empty() {
            return RebalancePlan {
                needed: false,
                reasons,
                transfers: Vec::new(),
            };
        }

        let mean = utils.iter().map(|(_, u)| u).sum::<f64>() / utils.len() as f64;
        let variance = utils
            .iter()
            .map(|(_, u)| (u - mean).powi(2))
            .sum::<f64>()
            / utils.len() as f64;
        let max = utils.iter().map(|(_, u)| *u).fold(0.0, f64::max);
        let overloaded: Vec<Uuid> = utils
            .iter()
            .filter(|(_, u)| *u > OVERLOADED_UTILIZATION)
            .map(|(id, _)| *id)
            .collect();
        let underloaded: Vec<Uuid> = utils
            .iter()
            .filter(|(_, u)| *u < UNDERLOADED_UTILIZATION)
            .map(|(id, _)| *id)
            .collect();

        if variance > REBALANCE_VARIANCE_THRESHOLD {
            reasons.push(format!("utilization variance {variance:.3} exceeds threshold"));
        }
        if max > REBALANCE_MAX_UTILIZATION {
            reasons.push(format!("max utilization {max:.2} exceeds 0.90"));
        }
        if !overloaded.is_empty() && !underloaded.is_empty() {
            reasons.push(format!(
                "{} overloaded vs {} underloaded agents",
                overloaded.len(),
                underloaded.len()
            ));
        }

        let needed = !reasons.is_empty();
        let transfers = if needed {
            Self::plan_transfers(agents)
        } else {
            Vec::new()
        };
        RebalancePlan {
            needed,
            reasons,
            transfers,
        }
    }

    /// Move one slot at a time from the most to the least utilized agent
    /// until the spread collapses or the receiver runs out of capacity.
    fn plan_transfers(agents: &[Agent]) -> Vec<SlotTransfer> {
        let mut working: Vec<Agent> = agents.to_vec();
        let mut moves: HashMap<(Uuid, Uuid), u32> = HashMap::new();

        loop {
            working.sort_by(|a, b| b.load_ratio().total_cmp(&a.load_ratio()));
            let (head, tail) = match (working.first(), working.last()) {
                (Some(h), Some(t)) if h.id != t.id => (h.id, t.id),
                _ => break,
            };
            let donor = working.iter().find(|a| a.id == head).map(|a| a.load_ratio());
            let recv = working.iter().find(|a| a.id == tail);
            let recv_ok = recv.is_some_and(Agent::has_capacity);
            let spread_wide = donor.zip(recv.map(Agent::load_ratio)).is_some_and(|(d, r)| {
                d > OVERLOADED_UTILIZATION && r < UNDERLOADED_UTILIZATION
            });
            if !recv_ok || !spread_wide {
                break;
            }
            for agent in working.iter_mut() {
                if agent.id == head {
                    agent.current_load = agent.current_load.saturating_sub(1);
                } else if agent.id == tail {
                    agent.current_load += 1;
                }
            }
            *moves.entry((head, tail)).or_insert(0) += 1;
        }

        moves
            .into_iter()
            .map(|((from, to), slots)| SlotTransfer { from, to, slots })
            .collect()
    }

    /// The cached metrics for an agent, if any.
    pub fn load_metrics(&self, agent_id: Uuid) -> Option<AgentLoadMetrics> {
        self.metrics.read().get(&agent_id).cloned()
    }

    /// Replace the cached metrics for an agent.
    pub fn update_agent_metrics(&self, agent_id: Uuid, metrics: AgentLoadMetrics) {
        self.metrics.write().insert(agent_id, metrics);
    }

    /// Refresh the cached metrics from a live agent record, preserving the
    /// assignment counter.
    pub fn refresh_metrics(&self, agent: &Agent) {
        let mut metrics = self.metrics.write();
        let assigned = metrics.get(&agent.id).map_or(0, |m| m.tasks_assigned);
        let mut fresh = AgentLoadMetrics::from_agent(agent);
        fresh.tasks_assigned = assigned;
        metrics.insert(agent.id, fresh);
    }

    /// Drop cached state for an unregistered agent.
    pub fn forget_agent(&self, agent_id: Uuid) {
        self.metrics.write().remove(&agent_id);
    }

    /// Recent task→agent selections, oldest first.
    pub fn assignment_history(&self) -> Vec<AssignmentRecord> {
        self.history.lock().iter().cloned().collect()
    }

    // --- strategy internals ---

    fn eligible<'a>(task: &Task, agents: &'a [Agent]) -> Vec<&'a Agent> {
        agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| a.has_capacity())
            .filter(|a| match &task.agent_type {
                Some(required) => a.can_handle(required),
                None => true,
            })
            .collect()
    }

    /// Map the adaptive policy to a concrete strategy for this call.
    fn resolve_strategy(&self, task: &Task, candidates: &[&Agent]) -> BalancingStrategy {
        if self.strategy != BalancingStrategy::Adaptive {
            return self.strategy;
        }
        if task.priority >= TaskPriority::Urgent {
            return BalancingStrategy::PerformanceBased;
        }
        if candidates.len() == 1 {
            return BalancingStrategy::RoundRobin;
        }
        let loads: Vec<f64> = candidates.iter().map(|a| f64::from(a.current_load)).collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let variance =
            loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;
        if variance > ADAPTIVE_VARIANCE_THRESHOLD {
            BalancingStrategy::LeastLoaded
        } else {
            BalancingStrategy::CapabilityBased
        }
    }

    fn pick_round_robin(&self, candidates: &[&Agent]) -> Option<Uuid> {
        let mut sorted: Vec<&Agent> = candidates.to_vec();
        sorted.sort_by_key(|a| a.id);
        let key = sorted
            .iter()
            .map(|a| a.id.to_string())
            .collect::<Vec<_>>()
            .join("+");
        let mut rotation = self.rotation.lock();
        let counter = rotation.entry(key).or_insert(0);
        let idx = *counter % sorted.len();
        *counter = counter.wrapping_add(1);
        sorted.get(idx).map(|a| a.id)
    }

    fn pick_least_loaded(candidates: &[&Agent]) -> Option<Uuid> {
        candidates
            .iter()
            .min_by_key(|a| a.current_load)
            .map(|a| a.id)
    }

    fn pick_weighted(&self, candidates: &[&Agent]) -> Option<Uuid> {
        let metrics = self.metrics.read();
        let weights: Vec<f64> = candidates
            .iter()
            .map(|a| {
                let performance = metrics
                    .get(&a.id)
                    .map_or(a.success_rate, |m| m.performance_score)
                    .max(0.0);
                (performance * (1.0 - a.load_ratio())).max(0.0)
            })
            .collect();
        drop(metrics);

        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return candidates.first().map(|a| a.id);
        }
        // Cumulative-weight roulette.
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (agent, weight) in candidates.iter().zip(&weights) {
            if roll < *weight {
                return Some(agent.id);
            }
            roll -= weight;
        }
        candidates.last().map(|a| a.id)
    }

    fn pick_capability(task: &Task, candidates: &[&Agent]) -> Option<Uuid> {
        let score = |agent: &Agent| -> f64 {
            let fit = match &task.agent_type {
                Some(required) if agent.supports_task_type(required) => 10.0,
                Some(required) if agent.can_handle(required) => 5.0,
                Some(_) => 0.0,
                None => 0.0,
            };
            fit - 3.0 * agent.load_ratio() + 2.0 * agent.success_rate
        };
        // Strict > keeps the earliest of tied candidates (list order).
        let mut best: Option<(&Agent, f64)> = None;
        for agent in candidates {
            let s = score(agent);
            if best.is_none_or(|(_, b)| s > b) {
                best = Some((agent, s));
            }
        }
        best.map(|(a, _)| a.id)
    }

    fn pick_performance(&self, candidates: &[&Agent]) -> Option<Uuid> {
        let metrics = self.metrics.read();
        let score = |agent: &Agent| -> f64 {
            let cached = metrics
                .get(&agent.id)
                .map_or(1.0, |m| m.performance_score.max(0.0));
            let load_factor = (1.0 - agent.load_ratio()).max(0.1);
            cached
                * load_factor
                * agent.success_rate
                * speed_score(agent.average_execution_time_secs)
        };
        let mut best: Option<(&Agent, f64)> = None;
        for agent in candidates {
            let s = score(agent);
            if best.is_none_or(|(_, b)| s > b) {
                best = Some((agent, s));
            }
        }
        best.map(|(a, _)| a.id)
    }

    fn record_assignment(&self, task_id: Uuid, agent_id: Uuid, strategy: BalancingStrategy) {
        {
            let mut metrics = self.metrics.write();
            if let Some(m) = metrics.get_mut(&agent_id) {
                m.tasks_assigned += 1;
            }
        }
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(AssignmentRecord {
            task_id,
            agent_id,
            strategy,
            at: Utc::now(),
        });
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized speed in `(0, 1]`: faster-than-baseline agents approach 1.
fn speed_score(avg_execution_secs: f64) -> f64 {
    SPEED_BASELINE_SECS / (SPEED_BASELINE_SECS + avg_execution_secs.max(0.0))
}
