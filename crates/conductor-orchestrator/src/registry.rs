use crate::bus::Route;
use crate::types::{AgentState, AgentStatus, ErrorLogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorError, ConductorResult, MessageObject, MessageResponse, MessageType,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Static description of an agent: identity and what it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    /// Stable routing key. Must be unique within a registry.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form capability tags. A tag equal to a message type's wire name
    /// also makes the agent accept that type.
    pub capabilities: Vec<String>,
    /// Message types this agent accepts on broadcast and targeted delivery.
    pub supported_message_types: Vec<MessageType>,
    /// Opaque agent settings, copied into the agent's runtime state.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl AgentDescriptor {
    /// A descriptor with no capabilities and no accepted message types.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: Vec::new(),
            supported_message_types: Vec::new(),
            configuration: serde_json::Value::Null,
        }
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Accept the given message types in addition to any already listed.
    pub fn with_message_types(mut self, types: impl IntoIterator<Item = MessageType>) -> Self {
        self.supported_message_types.extend(types);
        self
    }

    /// Attach agent configuration.
    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Whether a message of type `message_type` may be routed to this agent.
    pub fn accepts(&self, message_type: MessageType) -> bool {
        self.supported_message_types.contains(&message_type)
            || self.capabilities.iter().any(|c| c == message_type.as_str())
    }
}

/// Contract every agent implements.
///
/// `handle` is the only suspension point the engine awaits on; an `Err` is
/// classified by the error classifier to decide whether the task is retried.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identity and accepted message types. Must not change after registration.
    fn descriptor(&self) -> &AgentDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    fn supported_message_types(&self) -> Vec<MessageType> {
        self.descriptor().supported_message_types.clone()
    }

    /// Called once at registration; the agent becomes READY when this returns `Ok`.
    async fn initialize(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Process one message. Calls for the same agent never overlap.
    async fn handle(&self, message: &MessageObject) -> ConductorResult<MessageResponse>;

    /// Release resources. The agent is not routed to afterwards.
    async fn shutdown(&self) -> ConductorResult<()> {
        Ok(())
    }
}

/// Listing entry for a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub supported_message_types: Vec<MessageType>,
    pub status: AgentStatus,
}

/// Result of a health probe against one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub status: AgentStatus,
    /// READY or BUSY.
    pub healthy: bool,
    /// Messages currently inside the handler.
    pub in_flight: usize,
    pub last_health_check: DateTime<Utc>,
}

struct AgentEntry {
    agent: Arc<dyn Agent>,
    state: AgentState,
    logs: VecDeque<ErrorLogEntry>,
    /// Serializes deliveries to this agent in arrival order.
    lane: Arc<Mutex<()>>,
}

/// Central registry of agents and their runtime state.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    max_log_entries: usize,
}

impl AgentRegistry {
    /// An empty registry keeping at most `max_log_entries` error log entries per agent.
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            max_log_entries,
        }
    }

    /// Register an agent and run its initialization.
    ///
    /// The agent is visible as INITIALIZING while `initialize` runs and turns
    /// READY afterwards. A failed initialization removes it again.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> ConductorResult<()> {
        let descriptor = agent.descriptor().clone();
        if descriptor.id.trim().is_empty() {
            return Err(ConductorError::Validation(
                "agent id must not be empty".to_string(),
            ));
        }

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&descriptor.id) {
                return Err(ConductorError::Validation(format!(
                    "agent already registered: {}",
                    descriptor.id
                )));
            }
            agents.insert(
                descriptor.id.clone(),
                AgentEntry {
                    agent: Arc::clone(&agent),
                    state: AgentState::new(&descriptor.id, descriptor.configuration.clone()),
                    logs: VecDeque::new(),
                    lane: Arc::new(Mutex::new(())),
                },
            );
        }

        if let Err(e) = agent.initialize().await {
            warn!(agent_id = %descriptor.id, error = %e, "Agent initialization failed");
            self.agents.write().await.remove(&descriptor.id);
            return Err(e);
        }

        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&descriptor.id) {
            entry.state.status = AgentStatus::Ready;
        }
        info!(
            agent_id = %descriptor.id,
            name = %descriptor.name,
            types = ?descriptor.supported_message_types,
            "Registered agent"
        );
        Ok(())
    }

    /// Remove an agent from the registry without shutting it down.
    pub async fn deregister_agent(&self, agent_id: &str) -> ConductorResult<Arc<dyn Agent>> {
        let entry = self
            .agents
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))?;
        info!(agent_id = %agent_id, "Deregistered agent");
        Ok(entry.agent)
    }

    /// Shut an agent down. It stays listed with status SHUTDOWN but is no longer routed to.
    pub async fn shutdown_agent(&self, agent_id: &str) -> ConductorResult<()> {
        let agent = {
            let agents = self.agents.read().await;
            let entry = agents
                .get(agent_id)
                .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))?;
            if entry.state.status == AgentStatus::Shutdown {
                return Ok(());
            }
            Arc::clone(&entry.agent)
        };

        let result = agent.shutdown().await;
        if let Err(e) = &result {
            warn!(agent_id = %agent_id, error = %e, "Agent shutdown reported an error");
        }

        if let Some(entry) = self.agents.write().await.get_mut(agent_id) {
            entry.state.status = AgentStatus::Shutdown;
        }
        info!(agent_id = %agent_id, "Agent shut down");
        result
    }

    /// Shut down every registered agent. Errors are logged, not returned.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.shutdown_agent(&id).await;
        }
    }

    /// Snapshot of an agent's runtime state.
    pub async fn get_agent_state(&self, agent_id: &str) -> ConductorResult<AgentState> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.state.clone())
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))
    }

    /// The descriptor an agent registered with.
    pub async fn descriptor(&self, agent_id: &str) -> ConductorResult<AgentDescriptor> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.agent.descriptor().clone())
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))
    }

    /// All registered agents, sorted by id.
    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let agents = self.agents.read().await;
        let mut list: Vec<AgentSummary> = agents
            .values()
            .map(|e| {
                let d = e.agent.descriptor();
                AgentSummary {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    capabilities: d.capabilities.clone(),
                    supported_message_types: d.supported_message_types.clone(),
                    status: e.state.status,
                }
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Number of registered agents, shut-down ones included.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Route to a single agent. Unknown, initializing, and shut-down agents are
    /// not routable.
    pub(crate) async fn resolve(&self, agent_id: &str) -> ConductorResult<Route> {
        let agents = self.agents.read().await;
        match agents.get(agent_id) {
            Some(entry) if entry.state.status.is_routable() => Ok(Route {
                agent_id: agent_id.to_string(),
                agent: Arc::clone(&entry.agent),
                lane: Arc::clone(&entry.lane),
            }),
            _ => Err(ConductorError::AgentNotFound(agent_id.to_string())),
        }
    }

    /// Routes to every routable agent accepting `message_type`, sorted by id.
    pub(crate) async fn resolve_accepting(&self, message_type: MessageType) -> Vec<Route> {
        let agents = self.agents.read().await;
        let mut routes: Vec<Route> = agents
            .iter()
            .filter(|(_, e)| e.state.status.is_routable())
            .filter(|(_, e)| e.agent.descriptor().accepts(message_type))
            .map(|(id, e)| Route {
                agent_id: id.clone(),
                agent: Arc::clone(&e.agent),
                lane: Arc::clone(&e.lane),
            })
            .collect();
        routes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        routes
    }

    /// Mark a task as in flight on the agent.
    ///
    /// INITIALIZING and SHUTDOWN are owned by the lifecycle and never
    /// overwritten by dispatch bookkeeping.
    pub async fn begin_dispatch(&self, agent_id: &str, task_id: Uuid) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.state.current_tasks.insert(task_id);
            if entry.state.status.is_routable() {
                entry.state.status = AgentStatus::Busy;
            }
        }
    }

    /// Record the outcome of a dispatch. A failure leaves the agent in ERROR.
    pub async fn finish_dispatch(
        &self,
        agent_id: &str,
        task_id: Uuid,
        success: bool,
        elapsed_ms: f64,
    ) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            let state = &mut entry.state;
            state.current_tasks.remove(&task_id);
            if success {
                state.completed_tasks += 1;
            } else {
                state.failed_tasks += 1;
            }
            state.record_processing_time(elapsed_ms);

            state.status = match state.status {
                status @ (AgentStatus::Initializing | AgentStatus::Shutdown) => status,
                _ if !success => AgentStatus::Error,
                _ if state.current_tasks.is_empty() => AgentStatus::Ready,
                _ => AgentStatus::Busy,
            };
        }
    }

    /// Append an error log entry, discarding the oldest beyond the retention limit.
    pub async fn record_error(&self, agent_id: &str, entry: ErrorLogEntry) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.logs.push_back(entry);
            while agent.logs.len() > self.max_log_entries {
                agent.logs.pop_front();
            }
        }
    }

    /// Error log entries for an agent, oldest first.
    pub async fn agent_logs(&self, agent_id: &str) -> ConductorResult<Vec<ErrorLogEntry>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|e| e.logs.iter().cloned().collect())
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))
    }

    /// Probe an agent's health and stamp `last_health_check`.
    pub async fn health(&self, agent_id: &str) -> ConductorResult<AgentHealth> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::AgentNotFound(agent_id.to_string()))?;
        let now = Utc::now();
        entry.state.last_health_check = Some(now);
        Ok(AgentHealth {
            status: entry.state.status,
            healthy: matches!(entry.state.status, AgentStatus::Ready | AgentStatus::Busy),
            in_flight: entry.state.current_tasks.len(),
            last_health_check: now,
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{ErrorContext, ErrorType, RetryStrategy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    struct StaticAgent {
        descriptor: AgentDescriptor,
        shut_down: AtomicBool,
        fail_init: bool,
    }

    impl StaticAgent {
        fn new(id: &str, types: &[MessageType]) -> Arc<Self> {
            Arc::new(Self {
                descriptor: AgentDescriptor::new(id, format!("{id} agent"))
                    .with_message_types(types.iter().copied()),
                shut_down: AtomicBool::new(false),
                fail_init: false,
            })
        }
    }

    #[async_trait]
    impl Agent for StaticAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn initialize(&self) -> ConductorResult<()> {
            if self.fail_init {
                return Err(ConductorError::Internal("no model loaded".into()));
            }
            Ok(())
        }

        async fn handle(&self, _message: &MessageObject) -> ConductorResult<MessageResponse> {
            Ok(MessageResponse::default())
        }

        async fn shutdown(&self) -> ConductorResult<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Agent whose `initialize` blocks until released.
    struct SlowStartAgent {
        descriptor: AgentDescriptor,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Agent for SlowStartAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn initialize(&self) -> ConductorResult<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn handle(&self, _message: &MessageObject) -> ConductorResult<MessageResponse> {
            Ok(MessageResponse::default())
        }
    }

    fn log_entry(message: &str) -> ErrorLogEntry {
        ErrorLogEntry {
            timestamp: Utc::now(),
            error_type: ErrorType::BusinessLogic,
            message: message.to_string(),
            stack: None,
            context: ErrorContext {
                workflow_id: "wf".into(),
                agent_id: "a".into(),
                operation: "handle".into(),
                timestamp: Utc::now(),
            },
            retry_strategy: RetryStrategy {
                should_retry: false,
                max_retries: 0,
            },
        }
    }

    #[test]
    fn test_descriptor_accepts() {
        let d = AgentDescriptor::new("a", "A")
            .with_message_types([MessageType::TaskRequest])
            .with_capability("HEALTH_CHECK")
            .with_capability("faq-search");
        assert!(d.accepts(MessageType::TaskRequest));
        assert!(d.accepts(MessageType::HealthCheck));
        assert!(!d.accepts(MessageType::StateUpdate));
    }

    #[tokio::test]
    async fn test_register_sets_ready() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("a", &[MessageType::TaskRequest]))
            .await
            .unwrap();
        let state = registry.get_agent_state("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Ready);
        assert!(state.current_tasks.is_empty());
        assert_eq!(registry.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        let err = registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_initialization_removes_agent() {
        let registry = AgentRegistry::default();
        let agent = Arc::new(StaticAgent {
            descriptor: AgentDescriptor::new("broken", "Broken"),
            shut_down: AtomicBool::new(false),
            fail_init: true,
        });
        assert!(registry.register_agent(agent).await.is_err());
        assert!(matches!(
            registry.get_agent_state("broken").await,
            Err(ConductorError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_initializing_agent_not_routable() {
        let registry = Arc::new(AgentRegistry::default());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let agent = Arc::new(SlowStartAgent {
            descriptor: AgentDescriptor::new("slow", "Slow")
                .with_message_types([MessageType::HealthCheck]),
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        let registering = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.register_agent(agent).await })
        };
        started.notified().await;

        assert_eq!(
            registry.get_agent_state("slow").await.unwrap().status,
            AgentStatus::Initializing
        );
        assert!(registry.resolve("slow").await.is_err());
        assert!(registry
            .resolve_accepting(MessageType::HealthCheck)
            .await
            .is_empty());

        // Bookkeeping does not promote an agent that is still starting.
        let t = Uuid::new_v4();
        registry.begin_dispatch("slow", t).await;
        registry.finish_dispatch("slow", t, true, 1.0).await;
        assert_eq!(
            registry.get_agent_state("slow").await.unwrap().status,
            AgentStatus::Initializing
        );

        release.notify_one();
        registering.await.unwrap().unwrap();
        assert_eq!(
            registry.get_agent_state("slow").await.unwrap().status,
            AgentStatus::Ready
        );
        assert_eq!(
            registry
                .resolve_accepting(MessageType::HealthCheck)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let registry = AgentRegistry::default();
        assert!(matches!(
            registry.get_agent_state("ghost").await,
            Err(ConductorError::AgentNotFound(_))
        ));
        assert!(registry.resolve("ghost").await.is_err());
        assert!(registry.deregister_agent("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_bookkeeping() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        registry.begin_dispatch("a", t1).await;
        registry.begin_dispatch("a", t2).await;
        let state = registry.get_agent_state("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Busy);
        assert_eq!(state.current_tasks.len(), 2);

        registry.finish_dispatch("a", t1, true, 10.0).await;
        assert_eq!(
            registry.get_agent_state("a").await.unwrap().status,
            AgentStatus::Busy
        );

        registry.finish_dispatch("a", t2, true, 30.0).await;
        let state = registry.get_agent_state("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Ready);
        assert_eq!(state.completed_tasks, 2);
        assert!((state.average_processing_time - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_dispatch_sets_error() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        let t = Uuid::new_v4();
        registry.begin_dispatch("a", t).await;
        registry.finish_dispatch("a", t, false, 5.0).await;
        let state = registry.get_agent_state("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.failed_tasks, 1);
        assert!(!registry.health("a").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_shutdown_stops_routing() {
        let registry = AgentRegistry::default();
        let agent = StaticAgent::new("a", &[MessageType::HealthCheck]);
        registry
            .register_agent(Arc::clone(&agent) as Arc<dyn Agent>)
            .await
            .unwrap();
        assert_eq!(
            registry
                .resolve_accepting(MessageType::HealthCheck)
                .await
                .len(),
            1
        );

        registry.shutdown_agent("a").await.unwrap();
        assert!(agent.shut_down.load(Ordering::SeqCst));
        assert_eq!(
            registry.get_agent_state("a").await.unwrap().status,
            AgentStatus::Shutdown
        );
        assert!(registry.resolve("a").await.is_err());
        assert!(registry
            .resolve_accepting(MessageType::HealthCheck)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_resolve_accepting_sorted() {
        let registry = AgentRegistry::default();
        for id in ["c", "a", "b"] {
            registry
                .register_agent(StaticAgent::new(id, &[MessageType::StateUpdate]))
                .await
                .unwrap();
        }
        registry
            .register_agent(StaticAgent::new("z", &[MessageType::TaskRequest]))
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .resolve_accepting(MessageType::StateUpdate)
            .await
            .into_iter()
            .map(|r| r.agent_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_error_log_retention() {
        let registry = AgentRegistry::new(2);
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        registry.record_error("a", log_entry("first")).await;
        registry.record_error("a", log_entry("second")).await;
        registry.record_error("a", log_entry("third")).await;

        let logs = registry.agent_logs("a").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "second");
        assert_eq!(logs[1].message, "third");
    }

    #[tokio::test]
    async fn test_health_stamps_check_time() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        assert!(registry
            .get_agent_state("a")
            .await
            .unwrap()
            .last_health_check
            .is_none());

        let health = registry.health("a").await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.status, AgentStatus::Ready);
        assert_eq!(
            registry
                .get_agent_state("a")
                .await
                .unwrap()
                .last_health_check,
            Some(health.last_health_check)
        );
    }

    #[tokio::test]
    async fn test_list_agents() {
        let registry = AgentRegistry::default();
        registry
            .register_agent(StaticAgent::new("b", &[MessageType::TaskRequest]))
            .await
            .unwrap();
        registry
            .register_agent(StaticAgent::new("a", &[]))
            .await
            .unwrap();
        let list = registry.list_agents().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[1].name, "b agent");
        assert_eq!(list[1].supported_message_types, vec![MessageType::TaskRequest]);
    }
}
