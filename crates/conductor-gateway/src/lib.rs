//! HTTP gateway for the Conductor orchestrator.
//!
//! [`GatewayServer::build`] returns an axum [`Router`](axum::Router) that turns
//! JSON requests into [`MessageObject`](conductor_core::MessageObject)s and
//! exposes workflow, agent, and metrics reads.

/// REST handlers under `/api`.
pub mod api;
/// Router assembly and shared state.
pub mod server;

pub use api::{ApiError, SendMessageRequest};
pub use server::{AppState, GatewayServer};
