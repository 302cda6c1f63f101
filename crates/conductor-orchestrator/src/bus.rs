use crate::registry::{Agent, AgentRegistry};
use conductor_core::{ConductorError, ConductorResult, MessageObject, MessageResponse};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// One resolved destination for a message.
#[derive(Clone)]
pub struct Route {
    /// Id of the resolved agent.
    pub agent_id: String,
    pub agent: Arc<dyn Agent>,
    pub(crate) lane: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// Outcome of handing one message to one agent.
#[derive(Debug)]
pub struct Delivery {
    pub agent_id: String,
    /// What the handler returned. A panic shows up as `Internal`.
    pub result: ConductorResult<MessageResponse>,
    /// Wall time spent inside the handler.
    pub elapsed: Duration,
}

/// Routes messages to a single target or to every accepting agent.
///
/// Deliveries to the same agent pass through that agent's lane, a fair
/// mutex, so they reach the handler in the order they were dispatched.
/// Different agents run concurrently.
#[derive(Clone)]
pub struct MessageBus {
    registry: Arc<AgentRegistry>,
}

impl MessageBus {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Reject a message before it enters the bus.
    pub fn validate(&self, message: &MessageObject) -> ConductorResult<()> {
        message.validate()
    }

    /// Resolve the routing set for a message.
    ///
    /// A targeted message resolves to exactly one agent or fails with
    /// `AgentNotFound`. A broadcast resolves to every routable agent that
    /// accepts the message type, which may be none.
    pub async fn route(&self, message: &MessageObject) -> ConductorResult<Vec<Route>> {
        match message.target_agent_id.as_deref() {
            Some(target) => Ok(vec![self.registry.resolve(target).await?]),
            None => {
                let routes = self.registry.resolve_accepting(message.message_type).await;
                if routes.is_empty() {
                    warn!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        "Broadcast has no accepting agents"
                    );
                }
                Ok(routes)
            }
        }
    }

    /// Hand `message` to the agent behind `route`, bookkeeping the dispatch as `task_id`.
    ///
    /// A panicking handler is reported as an internal error.
    pub async fn dispatch(
        &self,
        route: &Route,
        message: &MessageObject,
        task_id: Uuid,
    ) -> Delivery {
        let _lane = route.lane.lock().await;
        self.registry.begin_dispatch(&route.agent_id, task_id).await;
        debug!(
            agent_id = %route.agent_id,
            message_id = %message.id,
            task_id = %task_id,
            "Dispatching message"
        );

        let started = Instant::now();
        let result = AssertUnwindSafe(route.agent.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ConductorError::Internal(format!(
                    "agent {} panicked while handling message {}",
                    route.agent_id, message.id
                )))
            });
        let elapsed = started.elapsed();

        self.registry
            .finish_dispatch(
                &route.agent_id,
                task_id,
                result.is_ok(),
                elapsed.as_secs_f64() * 1000.0,
            )
            .await;

        Delivery {
            agent_id: route.agent_id.clone(),
            result,
            elapsed,
        }
    }

    /// Validate, route, and deliver a message without workflow bookkeeping.
    pub async fn publish(&self, message: &MessageObject) -> ConductorResult<Vec<Delivery>> {
        self.validate(message)?;
        let routes = self.route(message).await?;
        let deliveries = routes
            .iter()
            .map(|route| self.dispatch(route, message, Uuid::new_v4()));
        Ok(join_all(deliveries).await)
    }
}
