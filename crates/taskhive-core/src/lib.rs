//! Core types and error definitions for the taskhive orchestration engine.
//!
//! This crate provides the domain model shared across all taskhive crates:
//! tasks and their lifecycle, agents and capability matching, results, and
//! the unified error type.
//!
//! # Main types
//!
//! - [`HiveError`] — Unified error enum for all taskhive subsystems.
//! - [`HiveResult`] — Convenience alias for `Result<T, HiveError>`.
//! - [`Task`] — A unit of work with identity, priority, and dependencies.
//! - [`TaskResult`] — Immutable terminal outcome of a task.
//! - [`Agent`] — A capability-bearing executor entity.
//! - [`TaskExecutor`] — The async capability the execution engine invokes.

/// Agent model, capability tags, and the executor trait.
pub mod agent;
/// Error types.
pub mod error;
/// Task model, statuses, dependencies, results, and execution plans.
pub mod task;

pub use agent::{Agent, AgentStatus, Capability, TaskExecutor};
pub use error::{HiveError, HiveResult};
pub use task::{
    DependencyCondition, DependencyKind, ExecutionMode, ExecutionPlan, Task, TaskDependency,
    TaskPriority, TaskResult, TaskStatus,
};
