use crate::api;
use axum::{extract::State, routing::get, Json, Router};
use conductor_orchestrator::Orchestrator;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    /// Engine behind every route.
    pub orchestrator: Arc<Orchestrator>,
}

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router for an orchestrator.
    ///
    /// The orchestrator is not initialized here; until it is, the message,
    /// state, and metrics endpoints answer 503.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        let state = Arc::new(AppState { orchestrator });

        Router::new()
            .nest("/api", api::routes())
            .route("/health", get(health_handler))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "conductor",
        "ready": state.orchestrator.is_ready(),
    }))
}
