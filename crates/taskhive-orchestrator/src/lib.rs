//! Subagent orchestration engine with priority queueing, dependency
//! resolution, load balancing, and controllable parallel execution.
//!
//! Tasks are submitted to the [`Orchestrator`], scored and queued by the
//! [`PriorityTaskQueue`], gated by the [`DependencyManager`], matched to
//! agents by the [`LoadBalancer`], and run by the [`ExecutionEngine`] with
//! pause, resume, and cancellation control. Failures flow through the
//! [`ErrorHandler`], which decides between retry and escalation.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level façade tying all subsystems together.
//! - [`PriorityTaskQueue`] — Score-ordered, bounded holding area for tasks.
//! - [`DependencyManager`] — Cycle-safe task dependency graph.
//! - [`PriorityManager`] — Weighted dynamic priority scoring and escalation.
//! - [`LoadBalancer`] — Multi-strategy agent selection and rebalancing.
//! - [`ExecutionEngine`] — Bounded-concurrency task runner.
//! - [`AgentRegistry`] — Canonical store of registered agents.
//! - [`ErrorHandler`] — Failure classification, retry policy, escalation.

/// Multi-strategy agent selection and load rebalancing.
pub mod balancer;
/// Cycle-safe dependency graph and execution planning.
pub mod dependency;
/// Bounded-concurrency execution engine with pause and cancellation.
pub mod engine;
/// Failure classification, retry policies, and escalation.
pub mod error_handler;
/// Orchestrator façade and lifecycle.
pub mod orchestrator;
/// Dynamic priority scoring and automatic escalation.
pub mod priority;
/// Registered agent store and load accounting.
pub mod registry;
/// Task store wiring the queue to the dependency graph.
pub mod scheduler;
/// Score-ordered bounded task queue.
pub mod task_queue;

pub use balancer::{
    AgentLoadMetrics, AssignmentRecord, BalancingStrategy, LoadBalancer, RebalancePlan,
    SlotTransfer,
};
pub use dependency::DependencyManager;
pub use engine::{EngineConfig, EngineMetrics, ExecutionEngine};
pub use error_handler::{
    ErrorCategory, ErrorClassifier, ErrorHandler, ErrorReport, ErrorSeverity, EscalationHook,
    KeywordClassifier, RetryPolicy,
};
pub use orchestrator::{
    AgentSummary, Orchestrator, OrchestratorConfig, OrchestratorState, SystemStatus,
};
pub use priority::{
    AutoEscalationConfig, EscalationRecord, PriorityManager, PriorityWeights,
};
pub use registry::AgentRegistry;
pub use scheduler::TaskScheduler;
pub use task_queue::PriorityTaskQueue;
