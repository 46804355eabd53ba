use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskhive_core::{Task, TaskPriority};
use tracing::{debug, info};
use uuid::Uuid;

/// Score thresholds mapping a dynamic score to a priority ordinal.
const CRITICAL_THRESHOLD: f64 = 4.0;
const URGENT_THRESHOLD: f64 = 3.0;
const HIGH_THRESHOLD: f64 = 2.0;
const NORMAL_THRESHOLD: f64 = 1.0;

/// Cap on the total escalation bonus added to a dynamic score.
const MAX_ESCALATION_BONUS: f64 = 2.0;

/// Relative weights of the priority factors. Normalized to sum 1 before use,
/// so callers can supply any positive values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeights {
    /// Weight of the task-age factor (bounded 0–3).
    pub age: f64,
    /// Weight of deadline proximity (bounded 0–5).
    pub deadline: f64,
    /// Weight of the retry-count factor (bounded 0–3).
    pub retries: f64,
    /// Weight of the static user priority (1–5).
    pub static_priority: f64,
    /// Weight of the estimated-duration factor (−0.5–2, rewards short tasks).
    pub duration: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            age: 0.15,
            deadline: 0.25,
            retries: 0.10,
            static_priority: 0.35,
            duration: 0.15,
        }
    }
}

impl PriorityWeights {
    fn total(&self) -> f64 {
        self.age + self.deadline + self.retries + self.static_priority + self.duration
    }
}

/// Thresholds controlling automatic escalation sweeps.
#[derive(Debug, Clone)]
pub struct AutoEscalationConfig {
    /// Tasks older than this are escalated.
    pub max_age: Duration,
    /// Tasks with a deadline inside this window are escalated while still
    /// below URGENT.
    pub deadline_window: Duration,
    /// Tasks with more retries than this are escalated.
    pub retry_threshold: u32,
}

impl Default for AutoEscalationConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(24),
            deadline_window: Duration::hours(1),
            retry_threshold: 2,
        }
    }
}

/// A timestamped, reasoned record of one priority escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// When the escalation happened.
    pub at: DateTime<Utc>,
    /// Why (audit trail).
    pub reason: String,
    /// Priority before.
    pub from: TaskPriority,
    /// Priority after.
    pub to: TaskPriority,
}

/// Computes dynamic priority scores from weighted factor rules and manages
/// manual and automatic escalation with an audit trail.
pub struct PriorityManager {
    weights: PriorityWeights,
    config: AutoEscalationConfig,
    escalations: HashMap<Uuid, Vec<EscalationRecord>>,
}

impl PriorityManager {
    /// Create a manager with default weights and escalation thresholds.
    pub fn new() -> Self {
        Self {
            weights: PriorityWeights::default(),
            config: AutoEscalationConfig::default(),
            escalations: HashMap::new(),
        }
    }

    /// Override the factor weights.
    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Override the auto-escalation thresholds.
    pub fn with_auto_escalation(mut self, config: AutoEscalationConfig) -> Self {
        self.config = config;
        self
    }

    /// Assign a computed priority to the task unless the caller pinned one
    /// manually — manual overrides are always preserved.
    pub fn assign_priority(&self, task: &mut Task) {
        if task.priority_pinned {
            return;
        }
        let score = self.calculate_dynamic_priority(task);
        let assigned = Self::priority_for_score(score);
        debug!(task_id = %task.id, score, priority = %assigned, "assigned priority");
        task.priority = assigned;
    }

    /// Manually set a task's priority, pinning it against recomputation.
    pub fn update_priority(&self, task: &mut Task, new_priority: TaskPriority) {
        task.priority = new_priority;
        task.priority_pinned = true;
    }

    /// Sort tasks by dynamic score, highest first. Stable, so equal scores
    /// keep their input order.
    pub fn sort_by_priority(&self, tasks: &mut [Task]) {
        let now = Utc::now();
        tasks.sort_by(|a, b| {
            self.score_at(b, now).total_cmp(&self.score_at(a, now))
        });
    }

    /// Escalate a task one priority level with a reasoned audit record.
    /// Returns `false` if the task is already at CRITICAL.
    pub fn escalate_priority(&mut self, task: &mut Task, reason: impl Into<String>) -> bool {
        if task.priority == TaskPriority::Critical {
            return false;
        }
        let from = task.priority;
        let to = from.escalated();
        task.priority = to;
        let reason = reason.into();
        info!(task_id = %task.id, %from, %to, reason = %reason, "escalating task priority");
        self.escalations.entry(task.id).or_default().push(EscalationRecord {
            at: Utc::now(),
            reason,
            from,
            to,
        });
        true
    }

    /// The dynamic priority score for a task: normalized weighted factor sum
    /// plus an escalation bonus. Deterministic for identical inputs and
    /// weights.
    pub fn calculate_dynamic_priority(&self, task: &Task) -> f64 {
        self.score_at(task, Utc::now())
    }

    fn score_at(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        let total = self.weights.total();
        if total <= 0.0 {
            return f64::from(task.priority.ordinal());
        }
        let weighted = self.weights.age * Self::age_factor(task, now)
            + self.weights.deadline * Self::deadline_factor(task, now)
            + self.weights.retries * Self::retry_factor(task)
            + self.weights.static_priority * f64::from(task.priority.ordinal())
            + self.weights.duration * Self::duration_factor(task);
        weighted / total + self.escalation_bonus(task.id, now)
    }

    /// Age factor, 0–3, as a step function over hours since creation.
    fn age_factor(task: &Task, now: DateTime<Utc>) -> f64 {
        let hours = task.age_secs(now).max(0) as f64 / 3600.0;
        if hours >= 12.0 {
            3.0
        } else if hours >= 4.0 {
            2.0
        } else if hours >= 1.0 {
            1.0
        } else {
            0.0
        }
    }

    /// Deadline proximity factor, 0–5. Overdue tasks score the maximum.
    fn deadline_factor(task: &Task, now: DateTime<Utc>) -> f64 {
        let Some(deadline) = task.deadline() else {
            return 0.0;
        };
        let remaining = deadline - now;
        if remaining <= Duration::zero() {
            5.0
        } else if remaining <= Duration::hours(1) {
            4.0
        } else if remaining <= Duration::hours(6) {
            3.0
        } else if remaining <= Duration::hours(24) {
            2.0
        } else if remaining <= Duration::hours(72) {
            1.0
        } else {
            0.0
        }
    }

    /// Retry factor, 0–3, linear in retry count.
    fn retry_factor(task: &Task) -> f64 {
        f64::from(task.retry_count).min(3.0)
    }

    /// Estimated-duration factor, −0.5–2. Short tasks are rewarded; very
    /// long ones slightly penalized. Unknown durations are neutral.
    fn duration_factor(task: &Task) -> f64 {
        let Some(secs) = task.estimated_duration_secs else {
            return 0.0;
        };
        if secs < 60 {
            2.0
        } else if secs < 300 {
            1.5
        } else if secs < 1800 {
            1.0
        } else if secs < 3600 {
            0.5
        } else if secs < 7200 {
            0.0
        } else {
            -0.5
        }
    }

    /// Escalation bonus: 0.5 per historical escalation (capped at 1.5), plus
    /// 0.5 if any escalation happened within the last hour; total capped at
    /// 2.0.
    fn escalation_bonus(&self, task_id: Uuid, now: DateTime<Utc>) -> f64 {
        let Some(records) = self.escalations.get(&task_id) else {
            return 0.0;
        };
        let history = (records.len() as f64 * 0.5).min(1.5);
        let recent = records
            .iter()
            .any(|r| now - r.at <= Duration::hours(1));
        let bonus = history + if recent { 0.5 } else { 0.0 };
        bonus.min(MAX_ESCALATION_BONUS)
    }

    /// Fixed score→ordinal thresholds.
    fn priority_for_score(score: f64) -> TaskPriority {
        if score >= CRITICAL_THRESHOLD {
            TaskPriority::Critical
        } else if score >= URGENT_THRESHOLD {
            TaskPriority::Urgent
        } else if score >= HIGH_THRESHOLD {
            TaskPriority::High
        } else if score >= NORMAL_THRESHOLD {
            TaskPriority::Normal
        } else {
            TaskPriority::Low
        }
    }

    /// Sweep a set of tasks and escalate any that are stale (too old), have
    /// an imminent deadline while still below URGENT, or have retried more
    /// than the threshold. Returns the IDs that were escalated.
    pub fn auto_escalate_tasks(&mut self, tasks: &mut [Task]) -> Vec<Uuid> {
        let now = Utc::now();
        let mut escalated = Vec::new();
        for task in tasks.iter_mut() {
            if task.status.is_terminal() {
                continue;
            }
            let reason = if now - task.created_at > self.config.max_age {
                Some("exceeded maximum age")
            } else if task.priority < TaskPriority::Urgent
                && task
                    .deadline()
                    .is_some_and(|d| d - now <= self.config.deadline_window)
            {
                Some("deadline imminent")
            } else if task.retry_count > self.config.retry_threshold {
                Some("excessive retries")
            } else {
                None
            };
            if let Some(reason) = reason {
                if self.escalate_priority(task, reason) {
                    escalated.push(task.id);
                }
            }
        }
        escalated
    }

    /// The audit trail of escalations for a task.
    pub fn escalation_history(&self, task_id: Uuid) -> Vec<EscalationRecord> {
        self.escalations.get(&task_id).cloned().unwrap_or_default()
    }

    /// Drop escalation records for a task (on removal).
    pub fn forget(&mut self, task_id: Uuid) {
        self.escalations.remove(&task_id);
    }
}

impl Default for PriorityManager {
    fn default() -> Self {
        Self::new()
    }
}
