#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. HTTP-shaped JSON deserializes into a MessageObject
// ---------------------------------------------------------------------------

#[test]
fn message_from_wire_json() {
    let parent = Uuid::new_v4();
    let raw = json!({
        "id": Uuid::new_v4(),
        "type": "TASK_REQUEST",
        "workflowId": "wf-1",
        "sourceAgentId": "ui",
        "targetAgentId": "agent-a",
        "payload": {"q": "x"},
        "metadata": {
            "timestamp": "2024-01-01T00:00:00Z",
            "priority": "CRITICAL",
            "retryCount": 2,
            "parentMessageId": parent
        }
    });

    let msg: MessageObject = serde_json::from_value(raw).unwrap();
    assert_eq!(msg.message_type, MessageType::TaskRequest);
    assert_eq!(msg.workflow_id, "wf-1");
    assert_eq!(msg.target_agent_id.as_deref(), Some("agent-a"));
    assert_eq!(msg.payload["q"], "x");
    assert_eq!(msg.metadata.priority, Priority::Critical);
    assert_eq!(msg.metadata.retry_count, 2);
    assert_eq!(msg.metadata.parent_message_id, Some(parent));
    assert!(msg.validate().is_ok());
}

// ---------------------------------------------------------------------------
// 2. Metadata is optional on the wire; a missing target means broadcast
// ---------------------------------------------------------------------------

#[test]
fn message_defaults_when_fields_omitted() {
    let raw = json!({
        "id": Uuid::new_v4(),
        "type": "HEALTH_CHECK",
        "workflowId": "wf-2",
        "sourceAgentId": "monitor",
        "payload": {}
    });

    let msg: MessageObject = serde_json::from_value(raw).unwrap();
    assert!(msg.is_broadcast());
    assert_eq!(msg.metadata.priority, Priority::Normal);
    assert_eq!(msg.metadata.retry_count, 0);
    assert!(msg.metadata.parent_message_id.is_none());
}

// ---------------------------------------------------------------------------
// 3. Every enumerated type parses from its wire name
// ---------------------------------------------------------------------------

#[test]
fn all_message_types_roundtrip_through_names() {
    for t in MessageType::ALL {
        let parsed: MessageType = t.as_str().parse().unwrap();
        assert_eq!(parsed, t);
    }
}

// ---------------------------------------------------------------------------
// 4. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = ConductorError::AgentNotFound("agent-x".to_string());
    assert_eq!(err.to_string(), "Agent not found: agent-x");
    assert!(err.is_not_found());

    let err = ConductorError::WorkflowNotFound("wf-9".to_string());
    assert_eq!(err.to_string(), "Workflow not found: wf-9");
    assert!(err.is_not_found());

    let err = ConductorError::InvalidTransition("workflow is terminal".to_string());
    assert_eq!(err.to_string(), "Invalid transition: workflow is terminal");
    assert!(!err.is_not_found());

    assert_eq!(ConductorError::NotReady.to_string(), "Orchestrator not ready");

    let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
    let err: ConductorError = json_err.into();
    assert!(matches!(err, ConductorError::Json(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 5. Result alias works with `?`
// ---------------------------------------------------------------------------

fn parse_type(raw: &str) -> ConductorResult<MessageType> {
    let t: MessageType = raw.parse()?;
    Ok(t)
}

#[test]
fn result_alias_propagates() {
    assert!(parse_type("STATE_UPDATE").is_ok());
    assert!(matches!(
        parse_type("BOGUS"),
        Err(ConductorError::Validation(_))
    ));
}
