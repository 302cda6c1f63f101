use crate::{ConductorError, ConductorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The closed set of message kinds the bus accepts.
///
/// Wire names are the upper-snake-case strings (`"TASK_REQUEST"`, ...). Anything
/// else is rejected by [`MessageType::from_str`] before a message can be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Ask an agent to perform work.
    TaskRequest,
    /// An agent's answer to a previous request.
    TaskResponse,
    /// Work handed from one agent to another.
    TaskDelegation,
    /// A change in shared workflow state.
    StateUpdate,
    /// An error report.
    Error,
    /// Liveness probe.
    HealthCheck,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [MessageType; 6] = [
        MessageType::TaskRequest,
        MessageType::TaskResponse,
        MessageType::TaskDelegation,
        MessageType::StateUpdate,
        MessageType::Error,
        MessageType::HealthCheck,
    ];

    /// The wire name of this message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskResponse => "TASK_RESPONSE",
            MessageType::TaskDelegation => "TASK_DELEGATION",
            MessageType::StateUpdate => "STATE_UPDATE",
            MessageType::Error => "ERROR",
            MessageType::HealthCheck => "HEALTH_CHECK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConductorError::Validation(format!("Invalid message type: {s}")))
    }
}

/// Delivery priority. Numeric levels are fixed: LOW=0 … CRITICAL=3.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Priority {
    /// Background work; may wait behind everything else.
    Low = 0,
    /// The default level.
    #[default]
    Normal = 1,
    /// Ahead of normal traffic.
    High = 2,
    /// Operator-facing or recovery traffic.
    Critical = 3,
}

impl Priority {
    /// Numeric level of this priority.
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Parse a priority from either its name (`"HIGH"`, case-insensitive) or its level (`"2"`).
    pub fn parse(s: &str) -> ConductorResult<Self> {
        if let Ok(level) = s.parse::<u8>() {
            return Priority::try_from(level);
        }
        match s.to_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(ConductorError::Validation(format!(
                "Invalid priority: {other}"
            ))),
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = ConductorError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Critical),
            other => Err(ConductorError::Validation(format!(
                "Invalid priority level: {other}"
            ))),
        }
    }
}

/// Envelope metadata carried by every [`MessageObject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    /// How many times this message has been re-dispatched.
    #[serde(default)]
    pub retry_count: u32,
    /// The message whose handling produced this one, for delegations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<Uuid>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            priority: Priority::Normal,
            retry_count: 0,
            parent_message_id: None,
        }
    }
}

/// The typed envelope routed by the bus between a source and a target.
///
/// A `None` target means broadcast: every agent accepting `message_type` receives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageObject {
    /// Unique for the lifetime of the process (v4 UUID).
    pub id: Uuid,
    /// Serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Workflow the message belongs to. Created on first reference.
    pub workflow_id: String,
    /// Sender. Need not be a registered agent (e.g. `"ui"`).
    pub source_agent_id: String,
    /// Recipient, or `None` for broadcast.
    #[serde(default)]
    pub target_agent_id: Option<String>,
    /// Opaque to the bus. JSON `null` counts as missing.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl MessageObject {
    /// Creates a broadcast message with a fresh id and default metadata.
    pub fn new(
        message_type: MessageType,
        workflow_id: impl Into<String>,
        source_agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            workflow_id: workflow_id.into(),
            source_agent_id: source_agent_id.into(),
            target_agent_id: None,
            payload,
            metadata: MessageMetadata::default(),
        }
    }

    /// Address the message to a single agent.
    pub fn to(mut self, target_agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(target_agent_id.into());
        self
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Mark this message as spawned while handling `parent_message_id`.
    pub fn with_parent(mut self, parent_message_id: Uuid) -> Self {
        self.metadata.parent_message_id = Some(parent_message_id);
        self
    }

    /// Set the retry counter carried in the metadata.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.metadata.retry_count = retry_count;
        self
    }

    /// True when no target is set.
    pub fn is_broadcast(&self) -> bool {
        self.target_agent_id.is_none()
    }

    /// Check the fields the bus requires before routing.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(ConductorError::Validation(
                "workflowId is required".to_string(),
            ));
        }
        if self.source_agent_id.trim().is_empty() {
            return Err(ConductorError::Validation(
                "sourceAgentId is required".to_string(),
            ));
        }
        if self.payload.is_null() {
            return Err(ConductorError::Validation("payload is required".to_string()));
        }
        if let Some(target) = &self.target_agent_id {
            if target.trim().is_empty() {
                return Err(ConductorError::Validation(
                    "targetAgentId must not be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// What an agent returns after handling a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Output recorded on the task when it completes.
    pub data: serde_json::Value,
    /// Follow-up messages the orchestrator publishes as child tasks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegations: Vec<MessageObject>,
}

impl MessageResponse {
    /// A response with `data` and no delegations.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            delegations: Vec::new(),
        }
    }

    /// Attach a follow-up message to be dispatched within the same workflow.
    pub fn delegate(mut self, message: MessageObject) -> Self {
        self.delegations.push(message);
        self
    }
}
