use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskhive_core::{
    ExecutionPlan, HiveError, HiveResult, Task, TaskExecutor, TaskResult, TaskStatus,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global ceiling on concurrently executing tasks.
    pub max_concurrent: usize,
    /// Timeout applied to tasks that carry no explicit budget.
    pub default_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_timeout_secs: 300,
        }
    }
}

/// Point-in-time snapshot of execution counters.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EngineMetrics {
    /// Total tasks that finished (any terminal status).
    pub total_executed: u64,
    /// Tasks that completed successfully.
    pub successes: u64,
    /// Tasks that failed or timed out.
    pub failures: u64,
    /// Tasks that were cancelled mid-flight.
    pub cancellations: u64,
    /// Incremental mean of execution time in seconds.
    pub average_execution_secs: f64,
    /// Highest observed concurrent execution count.
    pub peak_concurrent: usize,
    /// Tasks executing right now.
    pub currently_running: usize,
}

/// Control handles for one execution under engine control.
struct RunningTask {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Runs tasks through registered [`TaskExecutor`]s with bounded concurrency,
/// per-task cancellation, and pause/resume control.
///
/// Concurrency is gated by a semaphore sized from
/// [`EngineConfig::max_concurrent`]. Every execution owns its own pause
/// signal in addition to the engine-wide one; both take effect at the
/// defined yield point before the executor starts, and an executor already
/// in flight runs to completion. Cancellation drops the executor future at
/// its next await point.
pub struct ExecutionEngine {
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    executors: RwLock<HashMap<Uuid, Arc<dyn TaskExecutor>>>,
    running: Mutex<HashMap<Uuid, RunningTask>>,
    pause_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    metrics: Mutex<EngineMetrics>,
}

impl ExecutionEngine {
    /// Create an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            executors: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            pause_tx,
            shutdown: CancellationToken::new(),
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    /// Register the executor that runs tasks assigned to `agent_id`.
    pub fn register_executor(&self, agent_id: Uuid, executor: Arc<dyn TaskExecutor>) {
        self.executors.write().insert(agent_id, executor);
    }

    /// Remove the executor for an agent.
    pub fn unregister_executor(&self, agent_id: Uuid) {
        self.executors.write().remove(&agent_id);
    }

    /// Execute one task on the given agent's executor and return its result.
    ///
    /// The returned result is terminal: completed, failed (including
    /// timeout), or cancelled. Errors are reserved for engine-level problems
    /// such as a missing executor or shutdown.
    pub async fn execute_task(&self, task: &Task, agent_id: Uuid) -> HiveResult<TaskResult> {
        if self.shutdown.is_cancelled() {
            return Err(HiveError::Execution("engine is stopped".into()));
        }
        let executor = self
            .executors
            .read()
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| {
                HiveError::Execution(format!("no executor registered for agent {agent_id}"))
            })?;

        // Control handles go in before admission so the task can be paused
        // or cancelled while it waits for a permit.
        let token = self.shutdown.child_token();
        let (task_pause, _) = watch::channel(false);
        self.running.lock().insert(
            task.id,
            RunningTask {
                cancel: token.clone(),
                pause: task_pause.clone(),
            },
        );

        let admitted = tokio::select! {
            () = token.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => Some(permit),
        };
        let permit = match admitted {
            Some(Ok(permit)) => permit,
            Some(Err(_)) => {
                self.running.lock().remove(&task.id);
                return Err(HiveError::Execution("engine is stopped".into()));
            }
            None => {
                self.running.lock().remove(&task.id);
                self.metrics.lock().cancellations += 1;
                info!(task_id = %task.id, "task cancelled while awaiting admission");
                let now = Utc::now();
                return Ok(TaskResult::failure(
                    task.id,
                    TaskStatus::Cancelled,
                    "cancelled before start",
                    now,
                    now,
                ));
            }
        };

        // Pause gates: engine-wide first, then this task's own signal. New
        // work waits here; running work is unaffected.
        self.wait_for_gate(&self.pause_tx, &token).await;
        self.wait_for_gate(&task_pause, &token).await;

        {
            let mut metrics = self.metrics.lock();
            metrics.currently_running += 1;
            metrics.peak_concurrent = metrics.peak_concurrent.max(metrics.currently_running);
        }

        let started_at = Utc::now();
        let budget = Duration::from_secs(
            task.timeout_secs.unwrap_or(self.config.default_timeout_secs),
        );
        debug!(task_id = %task.id, agent_id = %agent_id, timeout_secs = budget.as_secs(), "executing task");

        let result = tokio::select! {
            () = token.cancelled() => {
                info!(task_id = %task.id, "task cancelled during execution");
                TaskResult::failure(
                    task.id,
                    TaskStatus::Cancelled,
                    "cancelled during execution",
                    started_at,
                    Utc::now(),
                )
            }
            outcome = tokio::time::timeout(budget, executor.execute(task)) => {
                match outcome {
                    Ok(Ok(data)) => TaskResult::success(task.id, data, started_at, Utc::now()),
                    Ok(Err(err)) => TaskResult::failure(
                        task.id,
                        TaskStatus::Failed,
                        err.to_string(),
                        started_at,
                        Utc::now(),
                    ),
                    Err(_) => {
                        warn!(task_id = %task.id, budget_secs = budget.as_secs(), "task timed out");
                        TaskResult::failure(
                            task.id,
                            TaskStatus::Failed,
                            format!("timed out after {}s", budget.as_secs()),
                            started_at,
                            Utc::now(),
                        )
                    }
                }
            }
        };

        self.running.lock().remove(&task.id);
        {
            let mut metrics = self.metrics.lock();
            metrics.currently_running -= 1;
            metrics.total_executed += 1;
            match result.status {
                TaskStatus::Completed => metrics.successes += 1,
                TaskStatus::Cancelled => metrics.cancellations += 1,
                _ => metrics.failures += 1,
            }
            let n = metrics.total_executed as f64;
            metrics.average_execution_secs +=
                (result.execution_time_secs - metrics.average_execution_secs) / n;
        }
        drop(permit);
        Ok(result)
    }

    /// Execute a batch concurrently, joined at the end. `assignments` maps
    /// task ID to agent ID; unassigned tasks fail without executing. Result
    /// order is not guaranteed to match input order.
    pub async fn execute_parallel(
        self: &Arc<Self>,
        tasks: Vec<Task>,
        assignments: &HashMap<Uuid, Uuid>,
    ) -> Vec<TaskResult> {
        let mut set = JoinSet::new();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let Some(&agent_id) = assignments.get(&task.id) else {
                let now = Utc::now();
                results.push(TaskResult::failure(
                    task.id,
                    TaskStatus::Failed,
                    "no agent assigned",
                    now,
                    now,
                ));
                continue;
            };
            let engine = Arc::clone(self);
            set.spawn(async move {
                let task_id = task.id;
                match engine.execute_task(&task, agent_id).await {
                    Ok(result) => result,
                    Err(err) => {
                        let now = Utc::now();
                        TaskResult::failure(task_id, TaskStatus::Failed, err.to_string(), now, now)
                    }
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "execution task panicked or was aborted"),
            }
        }
        results
    }

    /// Execute a batch one task at a time, in order. A task carrying the
    /// `fail_fast` context flag that fails causes the remainder of the batch
    /// to be skipped with cancelled results.
    pub async fn execute_sequential(
        &self,
        tasks: Vec<Task>,
        assignments: &HashMap<Uuid, Uuid>,
    ) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut iter = tasks.into_iter();
        while let Some(task) = iter.next() {
            let now = Utc::now();
            let result = match assignments.get(&task.id) {
                Some(&agent_id) => match self.execute_task(&task, agent_id).await {
                    Ok(result) => result,
                    Err(err) => TaskResult::failure(
                        task.id,
                        TaskStatus::Failed,
                        err.to_string(),
                        now,
                        Utc::now(),
                    ),
                },
                None => TaskResult::failure(task.id, TaskStatus::Failed, "no agent assigned", now, now),
            };
            let abort = !result.is_success() && task.context_flag("fail_fast");
            results.push(result);
            if abort {
                warn!(task_id = %task.id, "fail-fast task failed, skipping remainder of batch");
                for skipped in iter.by_ref() {
                    let now = Utc::now();
                    results.push(TaskResult::failure(
                        skipped.id,
                        TaskStatus::Cancelled,
                        "skipped after fail-fast failure",
                        now,
                        now,
                    ));
                }
                break;
            }
        }
        results
    }

    /// Execute a dependency-ordered plan stage by stage: each parallel group
    /// is joined before the next begins. A failed task carrying the
    /// `critical` context flag aborts the remaining stages with cancelled
    /// results.
    pub async fn execute_pipeline(
        self: &Arc<Self>,
        plan: &ExecutionPlan,
        assignments: &HashMap<Uuid, Uuid>,
    ) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(plan.tasks.len());
        let mut aborted = false;
        for (stage, group) in plan.parallel_groups.iter().enumerate() {
            let stage_tasks: Vec<Task> = group
                .iter()
                .filter_map(|id| plan.task(*id).cloned())
                .collect();
            if aborted {
                let now = Utc::now();
                for task in &stage_tasks {
                    results.push(TaskResult::failure(
                        task.id,
                        TaskStatus::Cancelled,
                        "pipeline aborted by earlier critical failure",
                        now,
                        now,
                    ));
                }
                continue;
            }
            debug!(stage, tasks = stage_tasks.len(), "running pipeline stage");
            let stage_results = self.execute_parallel(stage_tasks, assignments).await;
            for result in &stage_results {
                if !result.is_success()
                    && plan.task(result.task_id).is_some_and(|t| t.context_flag("critical"))
                {
                    warn!(task_id = %result.task_id, stage, "critical pipeline task failed, aborting");
                    aborted = true;
                }
            }
            results.extend(stage_results);
        }
        results
    }

    /// Cancel a task under engine control. Returns `false` when the task is
    /// not currently under engine control (queued and finished tasks are
    /// handled upstream).
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        match self.running.lock().get(&task_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the given task is under engine control right now (awaiting
    /// admission, paused, or executing).
    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.lock().contains_key(&task_id)
    }

    /// Pause one task at its next controlled yield point; an executor
    /// already past the admission gate runs to completion. Returns `false`
    /// when the task is not under engine control or is already paused.
    pub fn pause_task(&self, task_id: Uuid) -> bool {
        let running = self.running.lock();
        let Some(handle) = running.get(&task_id) else {
            return false;
        };
        let was_paused = *handle.pause.borrow();
        handle.pause.send_replace(true);
        if !was_paused {
            info!(task_id = %task_id, "task paused");
        }
        !was_paused
    }

    /// Resume a task paused with [`ExecutionEngine::pause_task`]. Returns
    /// `false` when the task is not under engine control or not paused.
    pub fn resume_task(&self, task_id: Uuid) -> bool {
        let running = self.running.lock();
        let Some(handle) = running.get(&task_id) else {
            return false;
        };
        let was_paused = *handle.pause.borrow();
        handle.pause.send_replace(false);
        if was_paused {
            info!(task_id = %task_id, "task resumed");
        }
        was_paused
    }

    /// Whether the given task is flagged paused.
    pub fn is_task_paused(&self, task_id: Uuid) -> bool {
        self.running
            .lock()
            .get(&task_id)
            .is_some_and(|handle| *handle.pause.borrow())
    }

    /// Suspend dispatch of new tasks. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        let was_paused = *self.pause_tx.borrow();
        if !was_paused {
            info!("execution paused");
        }
        self.pause_tx.send_replace(true);
        !was_paused
    }

    /// Resume dispatch. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        let was_paused = *self.pause_tx.borrow();
        if was_paused {
            info!("execution resumed");
        }
        self.pause_tx.send_replace(false);
        was_paused
    }

    /// Whether the engine is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Stop the engine: cancels all running tasks and rejects new work.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("execution engine stopping");
        }
        self.shutdown.cancel();
        // Child tokens observe the parent cancel; the map drains as tasks
        // finish.
    }

    /// Current execution counters.
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.lock().clone()
    }

    /// Wait until `gate` reads false. Cancellation breaks the wait so a
    /// paused task can still be torn down.
    async fn wait_for_gate(&self, gate: &watch::Sender<bool>, cancel: &CancellationToken) {
        let mut rx = gate.subscribe();
        while *rx.borrow_and_update() {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
