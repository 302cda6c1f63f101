use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorResult, MessageObject, MessageResponse, MessageType};
use conductor_orchestrator::{Agent, AgentDescriptor};

/// Built-in agent that answers HEALTH_CHECK broadcasts with its uptime.
pub struct HeartbeatAgent {
    descriptor: AgentDescriptor,
    started_at: DateTime<Utc>,
}

impl HeartbeatAgent {
    pub const ID: &'static str = "heartbeat";

    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new(Self::ID, "Heartbeat")
                .with_capability("health")
                .with_message_types([MessageType::HealthCheck]),
            started_at: Utc::now(),
        }
    }
}

impl Default for HeartbeatAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for HeartbeatAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn handle(&self, message: &MessageObject) -> ConductorResult<MessageResponse> {
        let uptime = Utc::now() - self.started_at;
        Ok(MessageResponse::new(serde_json::json!({
            "alive": true,
            "uptimeSeconds": uptime.num_seconds(),
            "requestedBy": message.source_agent_id,
        })))
    }
}
