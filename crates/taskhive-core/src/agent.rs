use crate::error::HiveResult;
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A capability tag modeled as a small value object.
///
/// Matching is deterministic: two capabilities match when they are equal, or
/// when one is a dot-separated prefix of the other (`code` matches
/// `code.rust` and vice versa, but not `barcode`). This replaces ad hoc
/// substring containment with an explicit hierarchical rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    /// Create a capability from a tag string.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic match: exact equality or hierarchical dot-prefix.
    pub fn matches(&self, other: &Capability) -> bool {
        if self.0 == other.0 {
            return true;
        }
        is_segment_prefix(&self.0, &other.0) || is_segment_prefix(&other.0, &self.0)
    }
}

fn is_segment_prefix(prefix: &str, full: &str) -> bool {
    full.len() > prefix.len()
        && full.starts_with(prefix)
        && full.as_bytes()[prefix.len()] == b'.'
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Availability status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered and accepting work.
    #[default]
    Idle,
    /// Running at least one task.
    Busy,
    /// Last execution errored; still registered.
    Error,
    /// No recent activity; excluded from selection until it re-registers
    /// activity.
    Unavailable,
}

/// A capability-bearing executor entity that tasks are assigned to.
///
/// The registry owns these records; the load balancer reads them and the
/// orchestrator mutates load and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Primary capability tag of this agent.
    pub agent_type: Capability,
    /// Availability status.
    pub status: AgentStatus,
    /// Additional capability tags.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Task types this agent explicitly supports.
    #[serde(default)]
    pub supported_task_types: Vec<Capability>,
    /// Tasks currently in flight. Invariant: never exceeds
    /// `max_concurrent_tasks`.
    pub current_load: u32,
    /// Concurrency ceiling for this agent.
    pub max_concurrent_tasks: u32,
    /// Rolling success ratio in `[0, 1]`.
    pub success_rate: f64,
    /// Exponentially weighted average execution time in seconds.
    pub average_execution_time_secs: f64,
    /// Completed task count (successes).
    #[serde(default)]
    pub completed_tasks: u64,
    /// Failed task count.
    #[serde(default)]
    pub failed_tasks: u64,
    /// Last time the agent showed any activity.
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    /// Create an idle agent with the given primary capability.
    pub fn new(name: impl Into<String>, agent_type: impl Into<Capability>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Idle,
            capabilities: Vec::new(),
            supported_task_types: Vec::new(),
            current_load: 0,
            max_concurrent_tasks: 1,
            success_rate: 1.0,
            average_execution_time_secs: 0.0,
            completed_tasks: 0,
            failed_tasks: 0,
            last_activity: Utc::now(),
        }
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Add an explicitly supported task type.
    pub fn with_supported_task_type(mut self, task_type: impl Into<Capability>) -> Self {
        self.supported_task_types.push(task_type.into());
        self
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Whether the agent can accept another task right now.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }

    /// Current load as a fraction of capacity, in `[0, 1]`.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrent_tasks)
    }

    /// Whether any of this agent's tags matches the required capability.
    pub fn can_handle(&self, required: &Capability) -> bool {
        self.agent_type.matches(required)
            || self.capabilities.iter().any(|c| c.matches(required))
            || self.supported_task_types.iter().any(|c| c.matches(required))
    }

    /// Whether this agent explicitly supports the given task type
    /// (stronger signal than a generic capability match).
    pub fn supports_task_type(&self, task_type: &Capability) -> bool {
        self.agent_type.matches(task_type)
            || self.supported_task_types.iter().any(|c| c.matches(task_type))
    }

    /// Record the outcome of an execution: updates counters, the rolling
    /// success rate, and the EWMA execution time (0.8/0.2 blend).
    pub fn record_outcome(&mut self, success: bool, execution_secs: f64) {
        if success {
            self.completed_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        let total = self.completed_tasks + self.failed_tasks;
        if total > 0 {
            self.success_rate = self.completed_tasks as f64 / total as f64;
        }
        if self.average_execution_time_secs == 0.0 {
            self.average_execution_time_secs = execution_secs;
        } else {
            self.average_execution_time_secs =
                self.average_execution_time_secs * 0.8 + execution_secs * 0.2;
        }
        self.last_activity = Utc::now();
    }

    /// Record non-execution activity (registration, heartbeat).
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// The uniform execution capability the engine invokes.
///
/// Implementations turn a task's input into output; how is opaque to the
/// orchestrator. The engine races the returned future against the task's
/// cancellation signal and may drop it at any await point, so
/// implementations must be cancel-safe.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute the task and return its output payload.
    async fn execute(&self, task: &Task) -> HiveResult<HashMap<String, serde_json::Value>>;
}
