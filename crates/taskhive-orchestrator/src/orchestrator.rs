use crate::balancer::{BalancingStrategy, LoadBalancer};
use crate::engine::{EngineConfig, EngineMetrics, ExecutionEngine};
use crate::error_handler::{ErrorCategory, ErrorHandler, EscalationHook};
use crate::priority::{EscalationRecord, PriorityManager};
use crate::registry::AgentRegistry;
use crate::scheduler::TaskScheduler;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskhive_core::{
    Agent, AgentStatus, Capability, HiveError, HiveResult, Task, TaskDependency, TaskExecutor,
    TaskPriority, TaskResult, TaskStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Poll interval for completion waits.
const WAIT_POLL_MS: u64 = 50;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global concurrency ceiling for the execution engine.
    pub max_concurrent_tasks: usize,
    /// Default per-task timeout when a task carries none.
    pub default_timeout_secs: u64,
    /// How often the dispatch loop drains the queue.
    pub dispatch_interval_ms: u64,
    /// How often the auto-escalation sweep runs.
    pub escalation_interval_secs: u64,
    /// How often agent health is checked.
    pub health_check_interval_secs: u64,
    /// Inactivity window after which an agent is marked unavailable.
    pub agent_stale_threshold_secs: i64,
    /// Queue capacity (immediate + deferred tasks).
    pub queue_max_size: usize,
    /// Agent selection strategy.
    pub balancing_strategy: BalancingStrategy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            default_timeout_secs: 300,
            dispatch_interval_ms: 25,
            escalation_interval_secs: 60,
            health_check_interval_secs: 30,
            agent_stale_threshold_secs: 300,
            queue_max_size: 10_000,
            balancing_strategy: BalancingStrategy::Adaptive,
        }
    }
}

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Constructed, accepting agent registrations but not tasks.
    NotStarted,
    /// Background loops running, accepting tasks.
    Running,
    /// Stopped for good; a new orchestrator must be built to continue.
    ShutDown,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestratorState::NotStarted => "not_started",
            OrchestratorState::Running => "running",
            OrchestratorState::ShutDown => "shut_down",
        };
        write!(f, "{s}")
    }
}

/// Condensed per-agent view for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    /// Agent ID.
    pub id: Uuid,
    /// Agent name.
    pub name: String,
    /// Availability status.
    pub status: AgentStatus,
    /// Tasks in flight.
    pub current_load: u32,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: u32,
    /// Rolling success ratio.
    pub success_rate: f64,
}

/// Point-in-time view of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Lifecycle state.
    pub state: OrchestratorState,
    /// Total tasks known to the scheduler.
    pub total_tasks: usize,
    /// Task counts keyed by status name.
    pub tasks_by_status: HashMap<String, usize>,
    /// Tasks waiting in the queue.
    pub queued_tasks: usize,
    /// Queued task counts keyed by priority name.
    pub queued_by_priority: HashMap<String, usize>,
    /// Registered agents.
    pub agents: Vec<AgentSummary>,
    /// Execution counters.
    pub engine: EngineMetrics,
    /// Failure counts per error category.
    pub error_counts: HashMap<ErrorCategory, u64>,
    /// Most recent task→agent assignments, oldest first.
    pub recent_assignments: Vec<crate::balancer::AssignmentRecord>,
    /// Blocked tasks whose dependencies can never be satisfied. They stay
    /// BLOCKED until explicitly cancelled.
    pub permanently_blocked: Vec<Uuid>,
}

impl SystemStatus {
    /// Render the status as a JSON value.
    pub fn to_json(&self) -> HiveResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The façade over queueing, dependencies, priorities, balancing, and
/// execution.
///
/// Lifecycle is strictly `NotStarted -> Running -> ShutDown`; both
/// transitions are idempotent. The orchestrator owns three background loops
/// (dispatch, escalation sweep, agent health) tied to a root cancellation
/// token. Internal locks are never held across await points.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: RwLock<OrchestratorState>,
    scheduler: Mutex<TaskScheduler>,
    priorities: Mutex<PriorityManager>,
    balancer: LoadBalancer,
    registry: AgentRegistry,
    engine: Arc<ExecutionEngine>,
    errors: ErrorHandler,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(OrchestratorConfig::default())
    }

    /// Build an orchestrator with the given configuration.
    pub fn with_config(config: OrchestratorConfig) -> Arc<Self> {
        let engine = Arc::new(ExecutionEngine::new(EngineConfig {
            max_concurrent: config.max_concurrent_tasks,
            default_timeout_secs: config.default_timeout_secs,
        }));
        let queue = crate::task_queue::PriorityTaskQueue::with_max_size(config.queue_max_size);
        Arc::new(Self {
            balancer: LoadBalancer::with_strategy(config.balancing_strategy),
            config,
            state: RwLock::new(OrchestratorState::NotStarted),
            scheduler: Mutex::new(TaskScheduler::with_queue(queue)),
            priorities: Mutex::new(PriorityManager::new()),
            registry: AgentRegistry::new(),
            engine,
            errors: ErrorHandler::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    /// Start the background loops. Idempotent while running; fails after
    /// shutdown.
    pub fn start(self: &Arc<Self>) -> HiveResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                OrchestratorState::Running => return Ok(()),
                OrchestratorState::ShutDown => {
                    return Err(HiveError::Orchestrator(
                        "orchestrator has been shut down".into(),
                    ))
                }
                OrchestratorState::NotStarted => *state = OrchestratorState::Running,
            }
        }
        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            strategy = ?self.config.balancing_strategy,
            "orchestrator started"
        );
        self.spawn_dispatch_loop();
        self.spawn_escalation_loop();
        self.spawn_health_loop();
        Ok(())
    }

    /// Stop everything: running tasks are cancelled, loops exit, and further
    /// submissions fail. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == OrchestratorState::ShutDown {
                return;
            }
            *state = OrchestratorState::ShutDown;
        }
        info!("orchestrator shutting down");
        self.shutdown.cancel();
        self.engine.stop();
    }

    /// Register an agent together with the executor that runs its tasks.
    pub fn register_agent(
        &self,
        agent: Agent,
        executor: Arc<dyn TaskExecutor>,
    ) -> HiveResult<Uuid> {
        let agent_id = agent.id;
        self.registry.register(agent.clone())?;
        self.engine.register_executor(agent_id, executor);
        self.balancer.refresh_metrics(&agent);
        Ok(agent_id)
    }

    /// Remove an agent. Its in-flight tasks finish normally.
    pub fn unregister_agent(&self, agent_id: Uuid) -> bool {
        let removed = self.registry.unregister(agent_id).is_some();
        if removed {
            self.engine.unregister_executor(agent_id);
            self.balancer.forget_agent(agent_id);
        }
        removed
    }

    /// Submit a task for execution. Unpinned tasks get a computed priority
    /// on the way in. Fails unless the orchestrator is running.
    pub fn submit(&self, mut task: Task) -> HiveResult<Uuid> {
        if self.state() != OrchestratorState::Running {
            return Err(HiveError::Orchestrator(format!(
                "cannot submit tasks while {}",
                self.state()
            )));
        }
        self.priorities.lock().assign_priority(&mut task);
        let id = self.scheduler.lock().schedule(task)?;
        debug!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Submit a task with extra dependency edges beyond those it carries.
    pub fn submit_with_dependencies(
        &self,
        mut task: Task,
        dependencies: Vec<TaskDependency>,
    ) -> HiveResult<Uuid> {
        task.dependencies.extend(dependencies);
        self.submit(task)
    }

    /// Cancel a task wherever it currently lives. Queued and blocked tasks
    /// are cancelled immediately; running tasks are signalled and report
    /// back as cancelled. Returns `false` when the task is unknown or
    /// already terminal.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        if self.scheduler.lock().cancel(task_id) {
            return true;
        }
        self.engine.cancel_task(task_id)
    }

    /// Manually pin a task to a new priority.
    pub fn update_priority(&self, task_id: Uuid, priority: TaskPriority) -> bool {
        let mut scheduler = self.scheduler.lock();
        let Some(mut task) = scheduler.task(task_id) else {
            return false;
        };
        self.priorities.lock().update_priority(&mut task, priority);
        scheduler.apply_priority(task_id, priority, true)
    }

    /// Pause dispatch of new task executions. Returns `false` if already
    /// paused.
    pub fn pause(&self) -> bool {
        self.engine.pause()
    }

    /// Resume dispatch. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.engine.resume()
    }

    /// Pause one in-flight task at its next controlled yield point and mark
    /// it PAUSED. Returns `false` when the task is not under engine control
    /// or already paused.
    pub fn pause_task(&self, task_id: Uuid) -> bool {
        if !self.engine.pause_task(task_id) {
            return false;
        }
        self.scheduler.lock().mark_paused(task_id, true);
        true
    }

    /// Resume a task paused with [`Orchestrator::pause_task`].
    pub fn resume_task(&self, task_id: Uuid) -> bool {
        if !self.engine.resume_task(task_id) {
            return false;
        }
        self.scheduler.lock().mark_paused(task_id, false);
        true
    }

    /// The escalation audit trail recorded for a task, oldest first.
    pub fn escalation_history(&self, task_id: Uuid) -> Vec<EscalationRecord> {
        self.priorities.lock().escalation_history(task_id)
    }

    /// Snapshot of a task.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.scheduler.lock().task(task_id)
    }

    /// Block until the task reaches a terminal status, up to `timeout`.
    pub async fn wait_for_completion(
        &self,
        task_id: Uuid,
        timeout: Duration,
    ) -> HiveResult<TaskResult> {
        let poll = async {
            loop {
                {
                    let scheduler = self.scheduler.lock();
                    match scheduler.task(task_id) {
                        None => {
                            return Err(HiveError::Orchestrator(format!(
                                "unknown task {task_id}"
                            )))
                        }
                        Some(task) if task.status.is_terminal() => {
                            // Cancelled-before-start tasks have no engine result.
                            return Ok(task.result.unwrap_or_else(|| {
                                let at = task.completed_at.unwrap_or_else(chrono::Utc::now);
                                TaskResult::failure(
                                    task_id,
                                    task.status,
                                    format!("task {}", task.status),
                                    task.started_at.unwrap_or(at),
                                    at,
                                )
                            }));
                        }
                        Some(_) => {}
                    }
                }
                tokio::time::sleep(Duration::from_millis(WAIT_POLL_MS)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| HiveError::Timeout(format!("task {task_id} did not finish in time")))?
    }

    /// Block until every submitted task is terminal, up to `timeout`.
    ///
    /// Permanently blocked tasks never become terminal on their own (see
    /// [`SystemStatus::permanently_blocked`]); cancel them first or this
    /// wait times out.
    pub async fn wait_for_all(&self, timeout: Duration) -> HiveResult<()> {
        let poll = async {
            loop {
                if self.scheduler.lock().all_terminal() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(WAIT_POLL_MS)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| HiveError::Timeout("tasks did not finish in time".into()))
    }

    /// Install a callback for high and critical severity failures.
    pub fn on_escalation(&self, hook: EscalationHook) {
        self.errors.on_escalation(hook);
    }

    /// Typed snapshot of the whole system.
    pub fn system_status(&self) -> SystemStatus {
        let (total, by_status, queued, by_priority, permanently_blocked) = {
            let scheduler = self.scheduler.lock();
            let counts = scheduler.status_counts();
            let by_status = counts
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            let by_priority = scheduler
                .priority_breakdown()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            (
                scheduler.tasks().len(),
                by_status,
                scheduler.queued_len(),
                by_priority,
                scheduler.permanently_blocked(),
            )
        };
        let agents = self
            .registry
            .list()
            .into_iter()
            .map(|a| AgentSummary {
                id: a.id,
                name: a.name,
                status: a.status,
                current_load: a.current_load,
                max_concurrent_tasks: a.max_concurrent_tasks,
                success_rate: a.success_rate,
            })
            .collect();
        SystemStatus {
            state: self.state(),
            total_tasks: total,
            tasks_by_status: by_status,
            queued_tasks: queued,
            queued_by_priority: by_priority,
            agents,
            engine: self.engine.metrics(),
            error_counts: self.errors.error_stats(),
            recent_assignments: {
                let mut history = self.balancer.assignment_history();
                let keep = history.len().saturating_sub(20);
                history.drain(..keep);
                history
            },
            permanently_blocked,
        }
    }

    // --- background loops ---

    fn spawn_dispatch_loop(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                orchestrator.config.dispatch_interval_ms.max(1),
            ));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = orchestrator.shutdown.cancelled() => break,
                    _ = tick.tick() => orchestrator.dispatch_pending(),
                }
            }
            debug!("dispatch loop exited");
        });
    }

    /// Drain the queue as far as current agent capacity allows. Each
    /// dispatched task runs on its own spawned future.
    fn dispatch_pending(self: &Arc<Self>) {
        loop {
            let available = self.registry.available(None);
            if available.is_empty() {
                return;
            }
            let capabilities: Vec<Capability> = available
                .iter()
                .flat_map(|a| {
                    std::iter::once(a.agent_type.clone())
                        .chain(a.capabilities.iter().cloned())
                        .chain(a.supported_task_types.iter().cloned())
                })
                .collect();

            let dispatched = {
                let mut scheduler = self.scheduler.lock();
                let Some(task) = scheduler.next_ready(Some(&capabilities)) else {
                    return;
                };
                match self.balancer.select_agent(&task, &available) {
                    Some(agent_id) => match self.registry.increment_load(agent_id) {
                        Ok(()) => {
                            if let Err(err) = scheduler.mark_running(task.id) {
                                warn!(task_id = %task.id, error = %err, "dispatch lost its task");
                                self.registry.decrement_load(agent_id);
                                None
                            } else {
                                Some((task, agent_id))
                            }
                        }
                        Err(err) => {
                            debug!(agent_id = %agent_id, error = %err, "agent filled up, requeueing");
                            scheduler.requeue(task);
                            None
                        }
                    },
                    None => {
                        scheduler.requeue(task);
                        None
                    }
                }
            };
            let Some((task, agent_id)) = dispatched else {
                return;
            };

            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.run_dispatched(task, agent_id).await;
            });
        }
    }

    /// Execute one dispatched task and feed its outcome back through the
    /// scheduler, registry, balancer, and error handler.
    async fn run_dispatched(&self, task: Task, agent_id: Uuid) {
        let outcome = self.engine.execute_task(&task, agent_id).await;
        self.registry.decrement_load(agent_id);

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                let now = chrono::Utc::now();
                TaskResult::failure(task.id, TaskStatus::Failed, err.to_string(), now, now)
            }
        };

        self.registry.record_outcome(
            agent_id,
            result.is_success(),
            result.execution_time_secs,
        );
        if let Some(agent) = self.registry.get(agent_id) {
            self.balancer.refresh_metrics(&agent);
        }

        if result.status == TaskStatus::Failed {
            let error = HiveError::Execution(
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "task failed".into()),
            );
            let report = self.errors.handle(&task, &error);
            let mut scheduler = self.scheduler.lock();
            if report.retry_recommended && scheduler.retry(task.id, report.retry_delay_secs) {
                return;
            }
            if let Err(err) = scheduler.mark_finished(task.id, result) {
                warn!(task_id = %task.id, error = %err, "failed to record task result");
            }
        } else if let Err(err) = self.scheduler.lock().mark_finished(task.id, result) {
            warn!(task_id = %task.id, error = %err, "failed to record task result");
        }
    }

    fn spawn_escalation_loop(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(
                orchestrator.config.escalation_interval_secs.max(1),
            ));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = orchestrator.shutdown.cancelled() => break,
                    _ = tick.tick() => orchestrator.run_escalation_sweep(),
                }
            }
        });
    }

    /// One pass of the auto-escalation policy over all live tasks.
    fn run_escalation_sweep(&self) {
        let mut scheduler = self.scheduler.lock();
        let mut tasks = scheduler.tasks();
        let escalated = self.priorities.lock().auto_escalate_tasks(&mut tasks);
        if escalated.is_empty() {
            return;
        }
        for task in tasks {
            if escalated.contains(&task.id) {
                scheduler.apply_priority(task.id, task.priority, false);
            }
        }
        info!(count = escalated.len(), "auto-escalated task priorities");
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(
                orchestrator.config.health_check_interval_secs.max(1),
            ));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = orchestrator.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let stale = orchestrator
                            .registry
                            .mark_stale(orchestrator.config.agent_stale_threshold_secs);
                        if !stale.is_empty() {
                            warn!(count = stale.len(), "agents went stale");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(
            &self,
            task: &Task,
        ) -> HiveResult<HashMap<String, serde_json::Value>> {
            let mut out = HashMap::new();
            out.insert("name".to_string(), serde_json::json!(task.name));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let orchestrator = Orchestrator::new();
        assert_eq!(orchestrator.state(), OrchestratorState::NotStarted);

        orchestrator.start().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        // Idempotent start.
        orchestrator.start().unwrap();

        orchestrator.shutdown();
        assert_eq!(orchestrator.state(), OrchestratorState::ShutDown);
        // Idempotent shutdown; restart refused.
        orchestrator.shutdown();
        assert!(orchestrator.start().is_err());
    }

    #[tokio::test]
    async fn test_submit_requires_running() {
        let orchestrator = Orchestrator::new();
        assert!(orchestrator.submit(Task::new("early")).is_err());

        orchestrator.start().unwrap();
        orchestrator.submit(Task::new("ok")).unwrap();

        orchestrator.shutdown();
        assert!(orchestrator.submit(Task::new("late")).is_err());
    }

    #[tokio::test]
    async fn test_unpinned_priority_assigned_on_submit() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();

        let pinned = Task::new("pinned").with_priority(TaskPriority::Low);
        let pinned_id = orchestrator.submit(pinned).unwrap();
        assert_eq!(
            orchestrator.task(pinned_id).unwrap().priority,
            TaskPriority::Low
        );

        let deadline = chrono::Utc::now() + chrono::Duration::minutes(10);
        let hot = Task::new("deadline soon")
            .with_context_value("deadline", serde_json::json!(deadline.to_rfc3339()));
        let hot_id = orchestrator.submit(hot).unwrap();
        // An imminent deadline pushes the computed priority above default.
        assert!(orchestrator.task(hot_id).unwrap().priority > TaskPriority::Low);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();
        assert!(!orchestrator.cancel(Uuid::new_v4()));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_update_priority() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();
        let id = orchestrator.submit(Task::new("bump me")).unwrap();
        assert!(orchestrator.update_priority(id, TaskPriority::Critical));
        let task = orchestrator.task(id).unwrap();
        assert_eq!(task.priority, TaskPriority::Critical);
        assert!(!orchestrator.update_priority(Uuid::new_v4(), TaskPriority::Low));
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_escalation_history_retrievable() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();

        let mut task = Task::new("forgotten");
        task.created_at = chrono::Utc::now() - chrono::Duration::hours(25);
        let id = orchestrator.submit(task).unwrap();

        orchestrator.run_escalation_sweep();
        let history = orchestrator.escalation_history(id);
        assert_eq!(history.len(), 1);
        assert!(history[0].reason.contains("maximum age"));
        assert!(history[0].to > history[0].from);
        // Unknown tasks have no trail.
        assert!(orchestrator.escalation_history(Uuid::new_v4()).is_empty());
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_status_reports_permanently_blocked() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();

        let a = orchestrator.submit(Task::new("a")).unwrap();
        let b = orchestrator.submit(Task::new("b").depends_on(a)).unwrap();
        assert!(orchestrator.cancel(a));

        // b is stuck BLOCKED, not cancelled.
        assert_eq!(orchestrator.task(b).unwrap().status, TaskStatus::Blocked);
        assert_eq!(orchestrator.system_status().permanently_blocked, vec![b]);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_register_and_unregister_agent() {
        let orchestrator = Orchestrator::new();
        let agent = Agent::new("worker", "code");
        let id = orchestrator
            .register_agent(agent.clone(), Arc::new(EchoExecutor))
            .unwrap();
        assert!(orchestrator
            .register_agent(agent, Arc::new(EchoExecutor))
            .is_err());
        assert!(orchestrator.unregister_agent(id));
        assert!(!orchestrator.unregister_agent(id));
    }

    #[tokio::test]
    async fn test_system_status_shape() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_agent(Agent::new("worker", "code"), Arc::new(EchoExecutor))
            .unwrap();
        orchestrator.start().unwrap();
        orchestrator.pause();
        orchestrator
            .submit(Task::new("queued").with_priority(TaskPriority::High))
            .unwrap();

        let status = orchestrator.system_status();
        assert_eq!(status.state, OrchestratorState::Running);
        assert_eq!(status.total_tasks, 1);
        assert_eq!(status.agents.len(), 1);
        let json = status.to_json().unwrap();
        assert_eq!(json["state"], serde_json::json!("running"));
        assert!(json["queued_by_priority"].is_object());
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task_errors() {
        let orchestrator = Orchestrator::new();
        orchestrator.start().unwrap();
        let err = orchestrator
            .wait_for_completion(Uuid::new_v4(), Duration::from_millis(100))
            .await;
        assert!(err.is_err());
        orchestrator.shutdown();
    }
}
