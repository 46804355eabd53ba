use crate::dependency::DependencyManager;
use crate::task_queue::PriorityTaskQueue;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use taskhive_core::{Capability, HiveError, HiveResult, Task, TaskPriority, TaskResult, TaskStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns the task store and wires the priority queue to the dependency graph.
///
/// All lifecycle transitions flow through here so the queue, the graph's
/// status cache, and the task records never disagree. The scheduler is a
/// plain struct; the orchestrator wraps it in a lock and never holds that
/// lock across await points.
pub struct TaskScheduler {
    tasks: HashMap<Uuid, Task>,
    queue: PriorityTaskQueue,
    deps: DependencyManager,
}

impl TaskScheduler {
    /// Create an empty scheduler with the default queue capacity.
    pub fn new() -> Self {
        Self::with_queue(PriorityTaskQueue::new())
    }

    /// Create a scheduler around a pre-configured queue.
    pub fn with_queue(queue: PriorityTaskQueue) -> Self {
        Self {
            tasks: HashMap::new(),
            queue,
            deps: DependencyManager::new(),
        }
    }

    /// Admit a task: register its dependency edges, then queue it or park it
    /// as blocked. Returns the task ID.
    ///
    /// Fails on duplicate IDs, self- or cyclic dependencies, and a full
    /// queue. On a dependency error nothing is left behind.
    pub fn schedule(&mut self, mut task: Task) -> HiveResult<Uuid> {
        if self.tasks.contains_key(&task.id) {
            return Err(HiveError::Scheduling(format!(
                "task {} is already scheduled",
                task.id
            )));
        }
        for dep in task.dependencies.clone() {
            if let Err(err) = self.deps.add_dependency(task.id, dep) {
                self.deps.remove_task(task.id);
                return Err(err);
            }
        }

        let id = task.id;
        if self.deps.is_ready(id) {
            task.status = TaskStatus::Queued;
            self.deps.set_status(id, TaskStatus::Queued);
            if !self.queue.enqueue(task.clone()) {
                self.deps.remove_task(id);
                return Err(HiveError::Queue("queue is full".into()));
            }
            debug!(task_id = %id, priority = %task.priority, "task queued");
        } else {
            task.status = TaskStatus::Blocked;
            self.deps.set_status(id, TaskStatus::Blocked);
            debug!(task_id = %id, deps = task.dependencies.len(), "task blocked on dependencies");
        }
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Dequeue the best ready task for the given capabilities.
    ///
    /// A task whose dependencies regressed (a resource dependency's task
    /// started running) is skipped in place: it keeps its original score and
    /// sequence, so the skip costs it no queue position.
    pub fn next_ready(&mut self, capabilities: Option<&[Capability]>) -> Option<Task> {
        let deps = &self.deps;
        self.queue
            .dequeue_where(capabilities, |task| deps.is_ready(task.id))
    }

    /// The next `n` dispatchable tasks in dequeue order, without removing
    /// them. Tasks whose dependencies regressed are filtered out.
    pub fn ready_tasks(&mut self, n: usize) -> Vec<Task> {
        let candidates = self.queue.peek(n.saturating_mul(2).max(n));
        candidates
            .into_iter()
            .filter(|t| self.deps.is_ready(t.id))
            .take(n)
            .collect()
    }

    /// Put a dispatched-but-unassignable task back in the queue.
    pub fn requeue(&mut self, task: Task) {
        if !self.queue.enqueue(task) {
            warn!("requeue dropped: queue is full");
        }
    }

    /// Transition a task to running.
    pub fn mark_running(&mut self, task_id: Uuid) -> HiveResult<()> {
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.deps.set_status(task_id, TaskStatus::Running);
        Ok(())
    }

    /// Flip an in-flight task between RUNNING and PAUSED. Returns `false`
    /// when the task is not in the matching state.
    pub fn mark_paused(&mut self, task_id: Uuid, paused: bool) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        let next = match (task.status, paused) {
            (TaskStatus::Running, true) => TaskStatus::Paused,
            (TaskStatus::Paused, false) => TaskStatus::Running,
            _ => return false,
        };
        task.status = next;
        self.deps.set_status(task_id, next);
        true
    }

    /// Record a terminal result and re-evaluate dependents.
    pub fn mark_finished(&mut self, task_id: Uuid, result: TaskResult) -> HiveResult<()> {
        let status = result.status;
        {
            let task = self.task_mut(task_id)?;
            task.status = status;
            task.completed_at = Some(result.completed_at);
            task.actual_duration_secs = Some(result.execution_time_secs);
            if let Some(data) = &result.result_data {
                task.output.clone_from(data);
            }
            task.result = Some(result);
        }
        self.deps.set_status(task_id, status);
        info!(task_id = %task_id, status = %status, "task finished");
        self.reevaluate_dependents(task_id);
        Ok(())
    }

    /// Cancel a task that has not finished. Returns `false` when the task is
    /// unknown, already terminal, or currently executing (in-flight tasks,
    /// paused ones included, are cancelled through the engine, which reports
    /// back via [`TaskScheduler::mark_finished`]).
    pub fn cancel(&mut self, task_id: Uuid) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status.is_terminal()
            || matches!(task.status, TaskStatus::Running | TaskStatus::Paused)
        {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.queue.remove(task_id);
        self.deps.set_status(task_id, TaskStatus::Cancelled);
        info!(task_id = %task_id, "task cancelled before execution");
        self.reevaluate_dependents(task_id);
        true
    }

    /// Re-admit a failed task with a retry delay. Returns `false` when the
    /// retry budget is exhausted or the task is unknown.
    pub fn retry(&mut self, task_id: Uuid, delay_secs: u64) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.retry_count >= task.max_retries {
            return false;
        }
        task.retry_count += 1;
        task.status = TaskStatus::Queued;
        task.result = None;
        task.started_at = None;
        task.completed_at = None;
        task.scheduled_at = Some(Utc::now() + Duration::seconds(delay_secs as i64));
        let clone = task.clone();
        let attempt = task.retry_count;
        let max = task.max_retries;
        self.deps.set_status(task_id, TaskStatus::Queued);
        if self.queue.enqueue(clone) {
            info!(task_id = %task_id, attempt, max, delay_secs, "task scheduled for retry");
            true
        } else {
            warn!(task_id = %task_id, "retry dropped: queue is full");
            false
        }
    }

    /// When a task reaches a terminal status, promote blocked dependents
    /// that became ready. Dependents whose edges can never be satisfied stay
    /// BLOCKED — they are never auto-resolved, only reported (see
    /// [`TaskScheduler::permanently_blocked`]) and cleared by an explicit
    /// cancel.
    fn reevaluate_dependents(&mut self, task_id: Uuid) {
        for dependent in self.deps.dependents(task_id) {
            let Some(status) = self.tasks.get(&dependent).map(|t| t.status) else {
                continue;
            };
            if status != TaskStatus::Blocked {
                continue;
            }
            if self.deps.is_permanently_blocked(dependent) {
                warn!(task_id = %dependent, upstream = %task_id, "dependency unsatisfiable; task is permanently blocked");
            } else if self.deps.is_ready(dependent) {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.status = TaskStatus::Queued;
                    let clone = task.clone();
                    self.deps.set_status(dependent, TaskStatus::Queued);
                    if self.queue.enqueue(clone) {
                        debug!(task_id = %dependent, "blocked task promoted to queue");
                    } else {
                        task.status = TaskStatus::Blocked;
                        self.deps.set_status(dependent, TaskStatus::Blocked);
                        warn!(task_id = %dependent, "promotion deferred: queue is full");
                    }
                }
            }
        }
    }

    /// Apply a priority change to the stored task and, when it is still
    /// queued, re-enqueue it so its dispatch score reflects the new level.
    /// `pin` marks the change as a manual override.
    pub fn apply_priority(
        &mut self,
        task_id: Uuid,
        priority: TaskPriority,
        pin: bool,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        task.priority = priority;
        if pin {
            task.priority_pinned = true;
        }
        let clone = task.clone();
        if self.queue.remove(task_id) && !self.queue.enqueue(clone) {
            warn!(task_id = %task_id, "re-enqueue after priority change failed");
        }
        true
    }

    /// Snapshot of a task.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.get(&task_id).cloned()
    }

    /// Status of a task, if known.
    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks.get(&task_id).map(|t| t.status)
    }

    /// Snapshot of all tasks.
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    /// Mutable access for priority recalculation sweeps. The closure must
    /// not change lifecycle status.
    pub fn for_each_task_mut(&mut self, mut f: impl FnMut(&mut Task)) {
        for task in self.tasks.values_mut() {
            f(task);
        }
    }

    /// Count of tasks per lifecycle status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Whether every scheduled task has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Blocked tasks with at least one dependency whose edge can never be
    /// satisfied. These stay BLOCKED until explicitly cancelled.
    pub fn permanently_blocked(&self) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Blocked && self.deps.is_permanently_blocked(t.id)
            })
            .map(|t| t.id)
            .collect()
    }

    /// Number of tasks waiting in the queue (deferred included).
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Count of queued tasks per priority, for status reporting.
    pub fn priority_breakdown(&self) -> HashMap<taskhive_core::TaskPriority, usize> {
        self.queue.priority_breakdown()
    }

    /// Access the dependency graph (read-only helpers).
    pub fn dependencies(&self) -> &DependencyManager {
        &self.deps
    }

    fn task_mut(&mut self, task_id: Uuid) -> HiveResult<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| HiveError::Scheduling(format!("unknown task {task_id}")))
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use taskhive_core::{DependencyCondition, TaskDependency};

    fn finished_ok(task_id: Uuid) -> TaskResult {
        let now = Utc::now();
        TaskResult::success(task_id, StdHashMap::new(), now, now)
    }

    fn finished_err(task_id: Uuid) -> TaskResult {
        let now = Utc::now();
        TaskResult::failure(task_id, TaskStatus::Failed, "boom", now, now)
    }

    #[test]
    fn test_schedule_ready_task_is_queued() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.schedule(Task::new("solo")).unwrap();
        assert_eq!(scheduler.status(id), Some(TaskStatus::Queued));
        assert_eq!(scheduler.queued_len(), 1);
    }

    #[test]
    fn test_schedule_duplicate_fails() {
        let mut scheduler = TaskScheduler::new();
        let task = Task::new("dup");
        scheduler.schedule(task.clone()).unwrap();
        assert!(scheduler.schedule(task).is_err());
    }

    #[test]
    fn test_schedule_self_dependency_fails() {
        let mut scheduler = TaskScheduler::new();
        let mut task = Task::new("narcissist");
        let id = task.id;
        task.dependencies.push(TaskDependency::completion(id));
        assert!(scheduler.schedule(task).is_err());
        assert!(scheduler.task(id).is_none());
    }

    #[test]
    fn test_dependent_blocked_until_completion() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("a")).unwrap();
        let b = scheduler.schedule(Task::new("b").depends_on(a)).unwrap();
        assert_eq!(scheduler.status(b), Some(TaskStatus::Blocked));

        let dispatched = scheduler.next_ready(None).unwrap();
        assert_eq!(dispatched.id, a);
        scheduler.mark_running(a).unwrap();
        scheduler.mark_finished(a, finished_ok(a)).unwrap();
        assert_eq!(scheduler.status(b), Some(TaskStatus::Queued));
        assert_eq!(scheduler.next_ready(None).unwrap().id, b);
    }

    #[test]
    fn test_failed_dependency_blocks_dependents_permanently() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("a")).unwrap();
        let b = scheduler.schedule(Task::new("b").depends_on(a)).unwrap();
        let c = scheduler.schedule(Task::new("c").depends_on(b)).unwrap();

        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(a).unwrap();
        scheduler.mark_finished(a, finished_err(a)).unwrap();

        // b and c stay BLOCKED; nothing is auto-cancelled.
        assert_eq!(scheduler.status(b), Some(TaskStatus::Blocked));
        assert_eq!(scheduler.status(c), Some(TaskStatus::Blocked));
        // Only b is reported: c's own dependency (b) is not terminal.
        assert_eq!(scheduler.permanently_blocked(), vec![b]);
        assert!(scheduler.next_ready(None).is_none());

        // An explicit cancel is the way out, and it propagates the report.
        assert!(scheduler.cancel(b));
        assert_eq!(scheduler.status(c), Some(TaskStatus::Blocked));
        assert_eq!(scheduler.permanently_blocked(), vec![c]);
    }

    #[test]
    fn test_cancelled_dependency_blocks_dependent_forever() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("a")).unwrap();
        let b = scheduler.schedule(Task::new("b").depends_on(a)).unwrap();

        assert!(scheduler.cancel(a));
        assert_eq!(scheduler.status(b), Some(TaskStatus::Blocked));
        // b never reaches the queue, and stays reported as unrunnable.
        assert!(scheduler.next_ready(None).is_none());
        assert_eq!(scheduler.permanently_blocked(), vec![b]);
        assert!(!scheduler.all_terminal());
    }

    #[test]
    fn test_failure_condition_dependency_runs_on_failure() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("a")).unwrap();
        let cleanup = Task::new("cleanup").with_dependency(
            TaskDependency::completion(a).with_condition(DependencyCondition::Failure),
        );
        let c = scheduler.schedule(cleanup).unwrap();
        assert_eq!(scheduler.status(c), Some(TaskStatus::Blocked));

        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(a).unwrap();
        scheduler.mark_finished(a, finished_err(a)).unwrap();
        assert_eq!(scheduler.status(c), Some(TaskStatus::Queued));
    }

    #[test]
    fn test_cancel_semantics() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.schedule(Task::new("victim")).unwrap();
        assert!(scheduler.cancel(id));
        // Second cancel is a no-op.
        assert!(!scheduler.cancel(id));
        // Unknown task.
        assert!(!scheduler.cancel(Uuid::new_v4()));
        // Cancelled task is no longer dequeued.
        assert!(scheduler.next_ready(None).is_none());
    }

    #[test]
    fn test_cancel_running_task_is_refused() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.schedule(Task::new("busy")).unwrap();
        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(id).unwrap();
        assert!(!scheduler.cancel(id));
    }

    #[test]
    fn test_retry_respects_budget() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler
            .schedule(Task::new("flaky").with_max_retries(1))
            .unwrap();
        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(id).unwrap();
        scheduler.mark_finished(id, finished_err(id)).unwrap();

        assert!(scheduler.retry(id, 0));
        assert_eq!(scheduler.status(id), Some(TaskStatus::Queued));
        assert_eq!(scheduler.task(id).unwrap().retry_count, 1);

        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(id).unwrap();
        scheduler.mark_finished(id, finished_err(id)).unwrap();
        assert!(!scheduler.retry(id, 0));
    }

    #[test]
    fn test_next_ready_skips_resource_conflict() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("holder")).unwrap();
        let b = scheduler
            .schedule(Task::new("waiter").with_dependency(TaskDependency::resource(a)))
            .unwrap();

        // Both are queued (resource deps do not block admission while the
        // holder is not running).
        assert_eq!(scheduler.status(b), Some(TaskStatus::Queued));

        let first = scheduler.next_ready(None).unwrap();
        assert_eq!(first.id, a);
        scheduler.mark_running(a).unwrap();

        // While a runs, b is dequeue-skipped, not lost.
        assert!(scheduler.next_ready(None).is_none());
        assert_eq!(scheduler.queued_len(), 1);

        scheduler.mark_finished(a, finished_ok(a)).unwrap();
        let second = scheduler.next_ready(None).unwrap();
        assert_eq!(second.id, b);
    }

    #[test]
    fn test_skipped_task_keeps_queue_position() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("holder")).unwrap();
        let b = scheduler
            .schedule(Task::new("waiter").with_dependency(TaskDependency::resource(a)))
            .unwrap();
        let c = scheduler.schedule(Task::new("bystander")).unwrap();
        let d = scheduler.schedule(Task::new("latecomer")).unwrap();

        assert_eq!(scheduler.next_ready(None).unwrap().id, a);
        scheduler.mark_running(a).unwrap();
        // b is skipped while the holder runs; c dispatches around it.
        assert_eq!(scheduler.next_ready(None).unwrap().id, c);

        scheduler.mark_finished(a, finished_ok(a)).unwrap();
        // The skip must not cost b its FIFO position ahead of d.
        assert_eq!(scheduler.next_ready(None).unwrap().id, b);
        assert_eq!(scheduler.next_ready(None).unwrap().id, d);
    }

    #[test]
    fn test_mark_paused_roundtrip() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.schedule(Task::new("steady")).unwrap();
        // Only a running task can be paused.
        assert!(!scheduler.mark_paused(id, true));

        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(id).unwrap();
        assert!(scheduler.mark_paused(id, true));
        assert_eq!(scheduler.status(id), Some(TaskStatus::Paused));
        // Paused tasks are cancelled through the engine, not here.
        assert!(!scheduler.cancel(id));
        assert!(scheduler.mark_paused(id, false));
        assert_eq!(scheduler.status(id), Some(TaskStatus::Running));
    }

    #[test]
    fn test_status_counts() {
        let mut scheduler = TaskScheduler::new();
        let a = scheduler.schedule(Task::new("a")).unwrap();
        scheduler.schedule(Task::new("b").depends_on(a)).unwrap();
        let counts = scheduler.status_counts();
        assert_eq!(counts.get(&TaskStatus::Queued), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Blocked), Some(&1));
        assert!(!scheduler.all_terminal());
    }

    #[test]
    fn test_finished_result_recorded_on_task() {
        let mut scheduler = TaskScheduler::new();
        let id = scheduler.schedule(Task::new("worker")).unwrap();
        scheduler.next_ready(None).unwrap();
        scheduler.mark_running(id).unwrap();

        let now = Utc::now();
        let mut data = StdHashMap::new();
        data.insert("answer".to_string(), serde_json::json!(42));
        scheduler
            .mark_finished(id, TaskResult::success(id, data, now, now))
            .unwrap();

        let task = scheduler.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output.get("answer"), Some(&serde_json::json!(42)));
        assert!(task.result.is_some());
        assert!(task.completed_at.is_some());
    }
}
