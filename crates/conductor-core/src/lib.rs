//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor crates:
//! the unified error enum and the typed message envelope that agents exchange.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`MessageObject`]: The typed envelope routed by the message bus.
//! - [`MessageType`]: Closed set of message kinds accepted by the bus.
//! - [`MessageResponse`]: What an agent hands back after handling a message.

/// Message envelope, message kinds, and priorities.
pub mod message;

pub use message::{MessageMetadata, MessageObject, MessageResponse, MessageType, Priority};

// --- Error types ---

/// Top-level error type for the Conductor engine.
///
/// Agents return these from their handlers as well; the variant chosen is what
/// the error classifier uses to decide whether a task is retried.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A message or lookup referenced an agent id that is not registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A lookup referenced a workflow id that has never been seen.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A task id is unknown to the workflow table.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A state-machine transition was rejected (terminal workflow, illegal task move).
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Malformed or missing input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A recoverable infrastructure hiccup (network, timeout, overload).
    #[error("Transient error: {0}")]
    Transient(String),

    /// An agent-declared domain failure.
    #[error("Business logic error: {0}")]
    BusinessLogic(String),

    /// An unclassified failure raised by an agent handler.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A failure inside the engine itself (registry, bus, state table).
    #[error("Internal error: {0}")]
    Internal(String),

    /// The orchestrator has not finished initialization.
    #[error("Orchestrator not ready")]
    NotReady,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

impl ConductorError {
    /// Returns true for errors that reference an unknown workflow, task or agent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ConductorError::AgentNotFound(_)
                | ConductorError::WorkflowNotFound(_)
                | ConductorError::TaskNotFound(_)
        )
    }
}
