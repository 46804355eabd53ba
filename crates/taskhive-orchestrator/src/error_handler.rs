use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskhive_core::{HiveError, Task, TaskPriority};
use tracing::{error, warn};
use uuid::Uuid;

/// Ceiling on backoff delays once a ladder is exhausted.
const MAX_BACKOFF_SECS: u64 = 300;

/// Coarse failure category used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connectivity problems; usually transient.
    Network,
    /// The task exceeded its execution budget.
    Timeout,
    /// Bad input or configuration; retrying cannot help.
    Validation,
    /// Out of memory, disk, quota, or agents.
    Resource,
    /// Authentication or permission failures.
    Authorization,
    /// The executor itself reported a failure.
    Execution,
    /// A dependency made the task unrunnable.
    Dependency,
    /// Nothing matched.
    Unknown,
}

/// How urgently a failure needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Routine, self-healing.
    Low,
    /// Worth watching.
    Medium,
    /// Needs intervention soon; triggers escalation.
    High,
    /// Stop-the-line; never retried automatically.
    Critical,
}

/// Maps an error to a category. The default implementation matches keywords
/// in the rendered message; callers with structured errors can plug in their
/// own.
pub trait ErrorClassifier: Send + Sync {
    /// Categorize the error.
    fn classify(&self, error: &HiveError) -> ErrorCategory;
}

/// Keyword-based classifier over the error display string.
#[derive(Debug, Default)]
pub struct KeywordClassifier;

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, error: &HiveError) -> ErrorCategory {
        match error {
            HiveError::Timeout(_) => return ErrorCategory::Timeout,
            HiveError::Dependency(_) => return ErrorCategory::Dependency,
            HiveError::Io(_) => return ErrorCategory::Resource,
            _ => {}
        }
        let message = error.to_string().to_lowercase();
        const RULES: &[(&str, ErrorCategory)] = &[
            ("connection", ErrorCategory::Network),
            ("network", ErrorCategory::Network),
            ("unreachable", ErrorCategory::Network),
            ("refused", ErrorCategory::Network),
            ("timed out", ErrorCategory::Timeout),
            ("timeout", ErrorCategory::Timeout),
            ("deadline", ErrorCategory::Timeout),
            ("invalid", ErrorCategory::Validation),
            ("malformed", ErrorCategory::Validation),
            ("missing field", ErrorCategory::Validation),
            ("parse", ErrorCategory::Validation),
            ("out of memory", ErrorCategory::Resource),
            ("disk full", ErrorCategory::Resource),
            ("quota", ErrorCategory::Resource),
            ("exhausted", ErrorCategory::Resource),
            ("unauthorized", ErrorCategory::Authorization),
            ("forbidden", ErrorCategory::Authorization),
            ("permission", ErrorCategory::Authorization),
            ("credential", ErrorCategory::Authorization),
        ];
        for (needle, category) in RULES {
            if message.contains(needle) {
                return *category;
            }
        }
        if matches!(error, HiveError::Execution(_)) {
            ErrorCategory::Execution
        } else {
            ErrorCategory::Unknown
        }
    }
}

/// Retry behavior for one error category: a fixed delay ladder, then
/// exponential backoff capped at five minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Automatic retries allowed for this category.
    pub max_retries: u32,
    /// Delay before attempt N (zero-based index into the ladder).
    pub delays_secs: Vec<u64>,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays_secs: Vec::new(),
        }
    }

    /// Delay before the given retry attempt (zero-based).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        if let Some(&delay) = self.delays_secs.get(attempt as usize) {
            return delay;
        }
        let base = self.delays_secs.last().copied().unwrap_or(1);
        let extra = attempt.saturating_sub(self.delays_secs.len() as u32) + 1;
        base.saturating_mul(1u64 << extra.min(16)).min(MAX_BACKOFF_SECS)
    }
}

/// The handler's verdict on one failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// The failed task.
    pub task_id: Uuid,
    /// Assigned category.
    pub category: ErrorCategory,
    /// Assigned severity.
    pub severity: ErrorSeverity,
    /// Rendered error message.
    pub message: String,
    /// Whether an automatic retry should be attempted.
    pub retry_recommended: bool,
    /// Delay before that retry, when recommended.
    pub retry_delay_secs: u64,
    /// When the failure was handled.
    pub at: DateTime<Utc>,
}

/// Callback invoked for high and critical severity reports.
pub type EscalationHook = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Classifies task failures, decides on retries, and escalates what cannot
/// be retried away.
pub struct ErrorHandler {
    classifier: Box<dyn ErrorClassifier>,
    policies: HashMap<ErrorCategory, RetryPolicy>,
    escalation: Mutex<Option<EscalationHook>>,
    counts: Mutex<HashMap<ErrorCategory, u64>>,
}

impl ErrorHandler {
    /// Create a handler with the keyword classifier and default policies.
    pub fn new() -> Self {
        Self::with_classifier(Box::new(KeywordClassifier))
    }

    /// Create a handler around a custom classifier.
    pub fn with_classifier(classifier: Box<dyn ErrorClassifier>) -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorCategory::Network,
            RetryPolicy {
                max_retries: 3,
                delays_secs: vec![1, 5, 15],
            },
        );
        policies.insert(
            ErrorCategory::Timeout,
            RetryPolicy {
                max_retries: 2,
                delays_secs: vec![5, 30],
            },
        );
        policies.insert(
            ErrorCategory::Execution,
            RetryPolicy {
                max_retries: 3,
                delays_secs: vec![2, 10, 60],
            },
        );
        policies.insert(
            ErrorCategory::Unknown,
            RetryPolicy {
                max_retries: 1,
                delays_secs: vec![10],
            },
        );
        policies.insert(ErrorCategory::Validation, RetryPolicy::none());
        policies.insert(ErrorCategory::Authorization, RetryPolicy::none());
        policies.insert(ErrorCategory::Resource, RetryPolicy::none());
        policies.insert(ErrorCategory::Dependency, RetryPolicy::none());
        Self {
            classifier,
            policies,
            escalation: Mutex::new(None),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry policy for a category.
    pub fn set_policy(&mut self, category: ErrorCategory, policy: RetryPolicy) {
        self.policies.insert(category, policy);
    }

    /// Install the escalation callback.
    pub fn on_escalation(&self, hook: EscalationHook) {
        *self.escalation.lock() = Some(hook);
    }

    /// Handle a task failure: classify, grade severity, decide whether the
    /// orchestrator should retry, and fire the escalation hook for
    /// high-severity reports.
    pub fn handle(&self, task: &Task, err: &HiveError) -> ErrorReport {
        let category = self.classifier.classify(err);
        let severity = Self::severity(task, category);
        *self.counts.lock().entry(category).or_insert(0) += 1;

        let policy = self
            .policies
            .get(&category)
            .cloned()
            .unwrap_or_else(RetryPolicy::none);
        let retries_left =
            task.retry_count < policy.max_retries && task.retry_count < task.max_retries;
        let retry_recommended = retries_left && severity < ErrorSeverity::Critical;
        let retry_delay_secs = if retry_recommended {
            policy.delay_for(task.retry_count)
        } else {
            0
        };

        let report = ErrorReport {
            task_id: task.id,
            category,
            severity,
            message: err.to_string(),
            retry_recommended,
            retry_delay_secs,
            at: Utc::now(),
        };

        match severity {
            ErrorSeverity::Critical => {
                error!(task_id = %task.id, ?category, message = %report.message, "critical task failure")
            }
            ErrorSeverity::High => {
                warn!(task_id = %task.id, ?category, message = %report.message, "task failure")
            }
            _ => {}
        }
        if severity >= ErrorSeverity::High {
            if let Some(hook) = self.escalation.lock().clone() {
                hook(&report);
            }
        }
        report
    }

    /// Failure counts per category since startup.
    pub fn error_stats(&self) -> HashMap<ErrorCategory, u64> {
        self.counts.lock().clone()
    }

    /// Severity rules: authorization and resource failures are always
    /// critical; failures of high-priority tasks or repeatedly retried tasks
    /// are high; the rest grade by category.
    fn severity(task: &Task, category: ErrorCategory) -> ErrorSeverity {
        if matches!(
            category,
            ErrorCategory::Authorization | ErrorCategory::Resource
        ) {
            return ErrorSeverity::Critical;
        }
        if task.priority >= TaskPriority::High || task.retry_count >= 3 {
            return ErrorSeverity::High;
        }
        match category {
            ErrorCategory::Validation => ErrorSeverity::Low,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Execution => {
                ErrorSeverity::Medium
            }
            ErrorCategory::Dependency | ErrorCategory::Unknown => ErrorSeverity::Medium,
            // Handled above.
            ErrorCategory::Authorization | ErrorCategory::Resource => ErrorSeverity::Critical,
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}
