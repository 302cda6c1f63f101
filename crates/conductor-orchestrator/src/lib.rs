//! Agent orchestration engine: message bus, workflow state, registry, retries, and monitoring.
//!
//! Agents register with a stable id and a set of accepted message types. The
//! [`Orchestrator`] validates each inbound [`MessageObject`](conductor_core::MessageObject),
//! routes it through the [`MessageBus`] to one agent or a broadcast set, records
//! one task per dispatch in the [`WorkflowStateManager`], and applies the
//! [`RetryPolicy`] to classified failures.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Composition root; `send_message`, `register_agent`, `get_workflow_state`.
//! - [`MessageBus`]: Validates, resolves routes, and dispatches to agent handlers.
//! - [`WorkflowStateManager`]: Workflow table with the task state machine.
//! - [`AgentRegistry`] / [`Agent`]: Agent contract and per-agent runtime state.
//! - [`ErrorClassifier`] / [`RetryPolicy`]: Failure classification and retry decisions.
//! - [`PerformanceMonitor`]: Request timing and outcome counters.

/// Message routing and dispatch.
pub mod bus;
/// Engine configuration.
pub mod config;
/// The orchestrator composition root.
pub mod engine;
/// Request performance monitoring.
pub mod monitor;
/// Agent contract and registry.
pub mod registry;
/// Error classification and retry policy.
pub mod retry;
/// Shared state records (workflows, tasks, agents, metrics).
pub mod types;
/// Workflow and task state table.
pub mod workflow;

pub use bus::{Delivery, MessageBus, Route};
pub use config::OrchestratorConfig;
pub use engine::{AgentDetails, DispatchReport, Orchestrator, TaskReport};
pub use monitor::PerformanceMonitor;
pub use registry::{Agent, AgentDescriptor, AgentHealth, AgentRegistry, AgentSummary};
pub use retry::{ErrorClassifier, RetryPolicy};
pub use types::{
    AgentState, AgentStatus, AgentTimingStats, ErrorContext, ErrorLogEntry, ErrorType,
    FailedRequest, PerformanceMetrics, RetryStrategy, TaskState, TaskStatus, WorkflowMetadata,
    WorkflowState, WorkflowStatus,
};
pub use workflow::{TaskUpdate, WorkflowStateManager};
