use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conductor_core::{ConductorError, MessageObject, MessageType, Priority};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/message", post(send_message_handler))
        .route("/state/{workflow_id}", get(workflow_state_handler))
        .route("/agent/{agent_id}", get(agent_handler))
        .route("/metrics", get(metrics_handler))
}

/// Body of `POST /api/message`.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation error rather than a generic parse failure.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Wire name of the message type, e.g. `"TASK_REQUEST"`.
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub workflow_id: Option<String>,
    pub source_agent_id: Option<String>,
    /// Omit to broadcast.
    pub target_agent_id: Option<String>,
    /// Required; JSON `null` is rejected.
    pub payload: Option<serde_json::Value>,
    /// Name (`"HIGH"`) or level (`2`).
    pub priority: Option<serde_json::Value>,
    pub retry_count: Option<u32>,
    pub parent_message_id: Option<Uuid>,
}

impl SendMessageRequest {
    /// Build a message with a fresh id, rejecting missing or invalid fields.
    pub fn into_message(self) -> Result<MessageObject, ConductorError> {
        let message_type: MessageType = required(self.message_type, "type")?.parse()?;
        let workflow_id = required(self.workflow_id, "workflowId")?;
        let source_agent_id = required(self.source_agent_id, "sourceAgentId")?;
        let payload = match self.payload {
            Some(p) if !p.is_null() => p,
            _ => {
                return Err(ConductorError::Validation(
                    "payload is required".to_string(),
                ))
            }
        };

        let mut message = MessageObject::new(message_type, workflow_id, source_agent_id, payload);
        message.target_agent_id = self.target_agent_id;
        if let Some(priority) = self.priority {
            message.metadata.priority = parse_priority(&priority)?;
        }
        if let Some(retry_count) = self.retry_count {
            message.metadata.retry_count = retry_count;
        }
        message.metadata.parent_message_id = self.parent_message_id;

        message.validate()?;
        Ok(message)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ConductorError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConductorError::Validation(format!("{field} is required"))),
    }
}

fn parse_priority(value: &serde_json::Value) -> Result<Priority, ConductorError> {
    match value {
        serde_json::Value::String(s) => Priority::parse(s),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|level| u8::try_from(level).ok())
            .ok_or_else(|| ConductorError::Validation(format!("Invalid priority level: {n}")))
            .and_then(Priority::try_from),
        other => Err(ConductorError::Validation(format!(
            "Invalid priority: {other}"
        ))),
    }
}

/// A failure rendered as `{success: false, error}` with a matching status code.
///
/// Failures that happened after a workflow was created also carry
/// `messageId` and `workflowId`, so the failed task can be looked up.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Rendered as `error`.
    pub message: String,
    /// Message that was being processed, if any.
    pub message_id: Option<Uuid>,
    /// Workflow holding the failed task, if one was created.
    pub workflow_id: Option<String>,
}

impl ApiError {
    /// A 400 with the given message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            message_id: None,
            workflow_id: None,
        }
    }

    /// Point the error at the message and workflow it came from.
    pub fn with_workflow(mut self, message_id: Uuid, workflow_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id);
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        let status = match &err {
            ConductorError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            ConductorError::Validation(_) | ConductorError::Json(_) => StatusCode::BAD_REQUEST,
            ConductorError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            message_id: None,
            workflow_id: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({"success": false, "error": self.message});
        if let Some(message_id) = self.message_id {
            body["messageId"] = json!(message_id);
        }
        if let Some(workflow_id) = self.workflow_id {
            body["workflowId"] = json!(workflow_id);
        }
        (self.status, Json(body)).into_response()
    }
}

async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.orchestrator.is_ready() {
        return Err(ConductorError::NotReady.into());
    }
    let Json(request) = body.inspect_err(|e| warn!(error = %e, "Rejected request body"))?;
    let message = request.into_message()?;
    let message_id = message.id;
    let workflow_id = message.workflow_id.clone();

    let report = match state.orchestrator.send_message(message).await {
        Ok(report) => report,
        Err(e) => {
            let err = ApiError::from(e);
            // Rejected before routing: there is no workflow to point at.
            return Err(if state.orchestrator.workflows().contains(&workflow_id) {
                err.with_workflow(message_id, workflow_id)
            } else {
                err
            });
        }
    };

    Ok(Json(json!({
        "success": true,
        "messageId": report.message_id,
        "workflowId": report.workflow_id,
        "tasks": report.tasks,
    })))
}

async fn workflow_state_handler(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow = state.orchestrator.get_workflow_state(&workflow_id)?;
    Ok(Json(json!({
        "success": true,
        "workflow": {
            "id": workflow.id,
            "status": workflow.status,
            "tasks": workflow.tasks_in_order(),
            "sharedData": workflow.shared_data,
            "metadata": workflow.metadata,
        },
    })))
}

async fn agent_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = state.orchestrator.agent_details(&agent_id).await?;
    Ok(Json(json!({"success": true, "agent": agent})))
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics = state.orchestrator.get_metrics().await?;
    Ok(Json(json!({"success": true, "metrics": metrics})))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn valid_request() -> SendMessageRequest {
        SendMessageRequest {
            message_type: Some("TASK_REQUEST".into()),
            workflow_id: Some("wf-1".into()),
            source_agent_id: Some("ui".into()),
            target_agent_id: Some("agent-a".into()),
            payload: Some(json!({"q": "x"})),
            ..Default::default()
        }
    }

    #[test]
    fn test_into_message() {
        let parent = Uuid::new_v4();
        let request = SendMessageRequest {
            priority: Some(json!("HIGH")),
            retry_count: Some(1),
            parent_message_id: Some(parent),
            ..valid_request()
        };
        let msg = request.into_message().unwrap();
        assert_eq!(msg.message_type, MessageType::TaskRequest);
        assert_eq!(msg.target_agent_id.as_deref(), Some("agent-a"));
        assert_eq!(msg.metadata.priority, Priority::High);
        assert_eq!(msg.metadata.retry_count, 1);
        assert_eq!(msg.metadata.parent_message_id, Some(parent));
    }

    #[test]
    fn test_numeric_priority() {
        let request = SendMessageRequest {
            priority: Some(json!(3)),
            ..valid_request()
        };
        assert_eq!(
            request.into_message().unwrap().metadata.priority,
            Priority::Critical
        );

        let request = SendMessageRequest {
            priority: Some(json!(7)),
            ..valid_request()
        };
        assert!(matches!(
            request.into_message(),
            Err(ConductorError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let cases = [
            SendMessageRequest {
                message_type: None,
                ..valid_request()
            },
            SendMessageRequest {
                workflow_id: Some(" ".into()),
                ..valid_request()
            },
            SendMessageRequest {
                source_agent_id: None,
                ..valid_request()
            },
            SendMessageRequest {
                payload: Some(serde_json::Value::Null),
                ..valid_request()
            },
            SendMessageRequest {
                message_type: Some("SHOUT".into()),
                ..valid_request()
            },
        ];
        for request in cases {
            assert!(matches!(
                request.into_message(),
                Err(ConductorError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: ConductorError| ApiError::from(e).status;
        assert_eq!(status(ConductorError::NotReady), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(ConductorError::AgentNotFound("a".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ConductorError::WorkflowNotFound("w".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ConductorError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(ConductorError::InvalidTransition("terminal".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(ConductorError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_carries_workflow() {
        let id = Uuid::new_v4();
        let response = ApiError::from(ConductorError::BusinessLogic("no match".into()))
            .with_workflow(id, "wf-9")
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["workflowId"], "wf-9");
        assert_eq!(body["messageId"], id.to_string());

        let response = ApiError::bad_request("bad").into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("workflowId").is_none());
    }
}
