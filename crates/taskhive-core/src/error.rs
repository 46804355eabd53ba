use thiserror::Error;

/// Top-level error type for the taskhive engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, Error)]
pub enum HiveError {
    /// An error from the task queue (e.g. capacity exhausted).
    #[error("Queue error: {0}")]
    Queue(String),

    /// An error from the dependency graph (self-dependency, cycle).
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// An error during task scheduling or readiness evaluation.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// An error from the load balancer (no eligible agent, bad metrics).
    #[error("Balancer error: {0}")]
    Balancer(String),

    /// An error raised while executing a task against an agent.
    #[error("Execution error: {0}")]
    Execution(String),

    /// An error from an agent implementation itself.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from the orchestrator façade (lifecycle, registration).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A deadline or wait expired before the operation finished.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`HiveError`].
pub type HiveResult<T> = Result<T, HiveError>;
