use crate::agent::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Status of a task in the orchestration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the caller, not yet scheduled.
    Pending,
    /// All dependencies satisfied, waiting in the queue for dispatch.
    Queued,
    /// One or more dependencies unmet.
    Blocked,
    /// Currently executing on an agent.
    Running,
    /// Execution suspended, resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error (including timeout).
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Static task priority, ordinal 1 (lowest) to 5 (highest).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work, ordinal 1.
    Low,
    /// Default priority, ordinal 2.
    #[default]
    Normal,
    /// Elevated, ordinal 3.
    High,
    /// Deadline-driven, ordinal 4.
    Urgent,
    /// Must run as soon as possible, ordinal 5.
    Critical,
}

impl TaskPriority {
    /// The ordinal value (1–5) used by scoring formulas.
    pub fn ordinal(&self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
            TaskPriority::Critical => 5,
        }
    }

    /// Map an ordinal (1–5) back to a priority. Out-of-range values clamp.
    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 | 1 => TaskPriority::Low,
            2 => TaskPriority::Normal,
            3 => TaskPriority::High,
            4 => TaskPriority::Urgent,
            _ => TaskPriority::Critical,
        }
    }

    /// The next-higher priority, saturating at [`TaskPriority::Critical`].
    pub fn escalated(&self) -> Self {
        Self::from_ordinal(self.ordinal().saturating_add(1))
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
            TaskPriority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// How a batch containing this task should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One at a time, in order.
    #[default]
    Sequential,
    /// All at once, joined at the end.
    Parallel,
    /// Staged groups of parallel tasks.
    Pipeline,
    /// Gated on a context condition.
    Conditional,
}

/// The kind of relationship a dependency edge expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// The dependency task must have completed successfully.
    Completion,
    /// The dependency task must have produced output (completed successfully).
    Data,
    /// The dependency task must not be running (mutual exclusion).
    Resource,
}

/// An additional gate evaluated against the dependency task's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyCondition {
    /// Satisfied only by [`TaskStatus::Completed`].
    Success,
    /// Satisfied only by [`TaskStatus::Failed`].
    Failure,
    /// Satisfied by any terminal status.
    Completion,
}

/// A directed dependency edge from one task to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// The task this edge points at (must finish/yield first).
    pub depends_on: Uuid,
    /// The relationship kind.
    pub kind: DependencyKind,
    /// Optional extra gate on the dependency's terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<DependencyCondition>,
}

impl TaskDependency {
    /// A plain completion dependency on the given task.
    pub fn completion(depends_on: Uuid) -> Self {
        Self {
            depends_on,
            kind: DependencyKind::Completion,
            condition: None,
        }
    }

    /// A data dependency on the given task.
    pub fn data(depends_on: Uuid) -> Self {
        Self {
            depends_on,
            kind: DependencyKind::Data,
            condition: None,
        }
    }

    /// A resource (mutual-exclusion) dependency on the given task.
    pub fn resource(depends_on: Uuid) -> Self {
        Self {
            depends_on,
            kind: DependencyKind::Resource,
            condition: None,
        }
    }

    /// Attach a status condition to this edge.
    pub fn with_condition(mut self, condition: DependencyCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Static priority (mutable; may be escalated).
    pub priority: TaskPriority,
    /// When true the priority was set manually and automatic
    /// assignment must not overwrite it.
    #[serde(default)]
    pub priority_pinned: bool,
    /// Required agent capability. `None` means any agent may run it.
    #[serde(default)]
    pub agent_type: Option<Capability>,
    /// Preferred execution mode for batch APIs.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Dependency edges. Must never (transitively) include the task itself.
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    /// Parent task if this is a sub-task. Advisory: the parent does not own
    /// this task's lifecycle.
    #[serde(default)]
    pub parent_task: Option<Uuid>,
    /// Sub-tasks spawned under this task (advisory).
    #[serde(default)]
    pub subtasks: Vec<Uuid>,
    /// Opaque input payload.
    #[serde(default)]
    pub input: HashMap<String, serde_json::Value>,
    /// Opaque output payload, filled on completion.
    #[serde(default)]
    pub output: HashMap<String, serde_json::Value>,
    /// Opaque execution context (deadline, fail_fast, critical, ...).
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Earliest dispatch time. A future value defers the task.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When execution began.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock execution budget in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Number of retries already attempted.
    #[serde(default)]
    pub retry_count: u32,
    /// Maximum retries before the task is failed permanently.
    #[serde(default)]
    pub max_retries: u32,
    /// Caller-estimated duration, used by priority scoring.
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    /// Measured duration, filled on completion.
    #[serde(default)]
    pub actual_duration_secs: Option<f64>,
    /// Final result, set exactly once at terminal state.
    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl Task {
    /// Create a new pending task with default priority.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            priority_pinned: false,
            agent_type: None,
            execution_mode: ExecutionMode::default(),
            dependencies: Vec::new(),
            parent_task: None,
            subtasks: Vec::new(),
            input: HashMap::new(),
            output: HashMap::new(),
            context: HashMap::new(),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            timeout_secs: None,
            retry_count: 0,
            max_retries: 0,
            estimated_duration_secs: None,
            actual_duration_secs: None,
            result: None,
        }
    }

    /// Pin the task to an explicit priority (exempt from automatic assignment).
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self.priority_pinned = true;
        self
    }

    /// Require an agent with the given capability.
    pub fn with_agent_type(mut self, capability: impl Into<Capability>) -> Self {
        self.agent_type = Some(capability.into());
        self
    }

    /// Set the execution mode hint.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Add a completion dependency on another task.
    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.dependencies.push(TaskDependency::completion(task_id));
        self
    }

    /// Add an explicit dependency edge.
    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set the opaque input payload.
    pub fn with_input(mut self, input: HashMap<String, serde_json::Value>) -> Self {
        self.input = input;
        self
    }

    /// Insert a single context entry.
    pub fn with_context_value(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Set the wall-clock execution budget.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the caller's duration estimate.
    pub fn with_estimated_duration_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Defer dispatch until the given time.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Mark as a sub-task of the given parent (advisory).
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_task = Some(parent);
        self
    }

    /// Whether this task has a direct dependency edge on `task_id`.
    pub fn depends_directly_on(&self, task_id: Uuid) -> bool {
        self.dependencies.iter().any(|d| d.depends_on == task_id)
    }

    /// Read a boolean flag from the execution context (absent == false).
    pub fn context_flag(&self, key: &str) -> bool {
        self.context.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Parse an RFC 3339 `deadline` entry from the context, if present.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.context
            .get("deadline")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Age of the task since creation, in whole seconds.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Whether `scheduled_at` defers this task past `now`.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }
}

/// Immutable outcome of a task, created once at terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: Uuid,
    /// Terminal status (completed, failed, or cancelled).
    pub status: TaskStatus,
    /// Output payload. Mutually exclusive with `error_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<HashMap<String, serde_json::Value>>,
    /// Failure description. Mutually exclusive with `result_data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When the terminal status was reached.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock execution time in seconds.
    pub execution_time_secs: f64,
}

impl TaskResult {
    /// Build a successful result.
    pub fn success(
        task_id: Uuid,
        result_data: HashMap<String, serde_json::Value>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result_data: Some(result_data),
            error_message: None,
            started_at,
            completed_at,
            execution_time_secs: duration_secs(started_at, completed_at),
        }
    }

    /// Build a failed result with the given terminal status.
    ///
    /// `status` must be [`TaskStatus::Failed`] or [`TaskStatus::Cancelled`];
    /// anything else is coerced to `Failed`.
    pub fn failure(
        task_id: Uuid,
        status: TaskStatus,
        error_message: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let status = if matches!(status, TaskStatus::Cancelled) {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id,
            status,
            result_data: None,
            error_message: Some(error_message.into()),
            started_at,
            completed_at,
            execution_time_secs: duration_secs(started_at, completed_at),
        }
    }

    /// Whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

fn duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// A precomputed ordering of a task batch into parallel-safe stages.
///
/// `parallel_groups` are ordered so that no task in an earlier group depends
/// on a task in a later group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The tasks covered by the plan.
    pub tasks: Vec<Task>,
    /// Flattened topological order of all task IDs.
    pub execution_order: Vec<Uuid>,
    /// Stages of task IDs that may run concurrently.
    pub parallel_groups: Vec<Vec<Uuid>>,
}

impl ExecutionPlan {
    /// Look up a task in the plan by ID.
    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
