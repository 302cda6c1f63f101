use crate::bus::{MessageBus, Route};
use crate::config::OrchestratorConfig;
use crate::monitor::PerformanceMonitor;
use crate::registry::{Agent, AgentHealth, AgentRegistry, AgentSummary};
use crate::retry::ErrorClassifier;
use crate::types::{
    AgentState, ErrorContext, ErrorLogEntry, ErrorType, PerformanceMetrics, TaskState, TaskStatus,
    WorkflowState, WorkflowStatus,
};
use crate::workflow::{TaskUpdate, WorkflowStateManager};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, MessageObject, MessageType};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Final state of one task touched by a `send_message` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: Uuid,
    pub agent_id: String,
    pub status: TaskStatus,
    /// Re-dispatches before the task settled.
    pub retry_count: u32,
    /// Set when the task came from a delegation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classification of the final failure, when the task FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    /// The workflow turned terminal while the agent was working; its result was dropped.
    pub discarded: bool,
}

impl TaskReport {
    fn from_state(task: &TaskState, error_type: Option<ErrorType>, discarded: bool) -> Self {
        Self {
            task_id: task.id,
            agent_id: task.agent_id.clone(),
            status: task.status,
            retry_count: task.retry_count,
            parent_task_id: task.parent_task_id,
            output: task.output.clone(),
            error: task.error.clone(),
            error_type,
            discarded,
        }
    }
}

/// Everything that happened for one inbound message, delegations included.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub message_id: Uuid,
    pub workflow_id: String,
    /// Each task is followed by its delegated descendants.
    pub tasks: Vec<TaskReport>,
}

impl DispatchReport {
    /// True when no task ended FAILED.
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.status != TaskStatus::Failed)
    }

    /// Tasks that ended FAILED.
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    /// Tasks created directly for the inbound message, not through delegation.
    pub fn root_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.parent_task_id.is_none())
    }
}

/// Payload describing one agent for inspection endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetails {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub supported_message_types: Vec<MessageType>,
    pub state: AgentState,
    pub health: AgentHealth,
    pub logs: Vec<ErrorLogEntry>,
}

/// Reports for a task and its delegated descendants, plus the task's own
/// terminal error when it ended FAILED.
struct TaskRun {
    reports: Vec<TaskReport>,
    error: Option<ConductorError>,
}

/// The composition root: owns the registry, bus, workflow table, and monitor.
///
/// Constructed once at startup and shared by reference (typically in an
/// `Arc`). Messages are rejected with `NotReady` until [`initialize`](Self::initialize)
/// has run.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    bus: MessageBus,
    workflows: WorkflowStateManager,
    monitor: PerformanceMonitor,
    classifier: ErrorClassifier,
    ready: AtomicBool,
}

impl Orchestrator {
    /// Build an orchestrator. It rejects messages until [`initialize`](Self::initialize).
    pub fn new(config: OrchestratorConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new(config.max_error_log_entries));
        Self {
            bus: MessageBus::new(Arc::clone(&registry)),
            registry,
            workflows: WorkflowStateManager::with_max_retries(config.retry.max_retries),
            monitor: PerformanceMonitor::with_capacity(config.max_recent_failures),
            classifier: ErrorClassifier::new(),
            ready: AtomicBool::new(false),
            config,
        }
    }

    /// Mark the orchestrator ready to accept messages.
    pub async fn initialize(&self) -> ConductorResult<()> {
        if self.ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let agents = self.registry.agent_count().await;
        info!(
            agents,
            max_retries = self.config.retry.max_retries,
            "Orchestrator initialized"
        );
        Ok(())
    }

    /// Stop accepting messages and shut every agent down.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.registry.shutdown_all().await;
        info!("Orchestrator shut down");
    }

    /// True between `initialize` and `shutdown`.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> ConductorResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ConductorError::NotReady)
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The workflow table. Retry bounds are enforced here too.
    pub fn workflows(&self) -> &WorkflowStateManager {
        &self.workflows
    }

    /// Register and initialize an agent. Allowed before and after `initialize`.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> ConductorResult<()> {
        self.registry.register_agent(agent).await
    }

    /// Remove an agent without calling its `shutdown`.
    pub async fn deregister_agent(&self, agent_id: &str) -> ConductorResult<()> {
        self.registry.deregister_agent(agent_id).await.map(|_| ())
    }

    /// Validate, route, and process one message to completion.
    ///
    /// One task is created per resolved agent. A targeted message whose task
    /// ends FAILED returns the agent's error; broadcasts report failures per
    /// task in the returned [`DispatchReport`].
    pub async fn send_message(&self, message: MessageObject) -> ConductorResult<DispatchReport> {
        self.ensure_ready()?;

        let request_id = message.id.to_string();
        self.monitor
            .start_request(&request_id, Some("send_message"))
            .await;

        let result = self.process(message).await;

        match &result {
            Ok(report) => {
                let first_error = report.failed_tasks().find_map(|t| t.error.as_deref());
                self.monitor
                    .end_request(&request_id, report.is_success(), first_error)
                    .await;
            }
            Err(e) => {
                let error_text = e.to_string();
                self.monitor
                    .end_request(&request_id, false, Some(&error_text))
                    .await;
            }
        }
        result
    }

    async fn process(&self, message: MessageObject) -> ConductorResult<DispatchReport> {
        if let Err(e) = self.bus.validate(&message) {
            warn!(message_id = %message.id, error = %e, "Rejected message");
            return Err(e);
        }
        let routes = self.bus.route(&message).await?;

        self.workflows
            .ensure_workflow(&message.workflow_id, &message.source_agent_id);
        if self.workflows.is_terminal(&message.workflow_id)? {
            return Err(ConductorError::InvalidTransition(format!(
                "workflow {} is terminal",
                message.workflow_id
            )));
        }

        info!(
            message_id = %message.id,
            workflow_id = %message.workflow_id,
            message_type = %message.message_type,
            targets = routes.len(),
            "Processing message"
        );

        let mut runs = Vec::with_capacity(routes.len());
        for route in routes {
            let task_id = self.workflows.create_task(
                &message.workflow_id,
                &route.agent_id,
                message.payload.clone(),
            )?;
            runs.push(self.run_task(route, message.clone(), task_id, 0));
        }
        let runs = join_all(runs).await;

        let mut tasks = Vec::new();
        let mut first_error = None;
        for run in runs {
            tasks.extend(run.reports);
            if first_error.is_none() {
                first_error = run.error;
            }
        }

        if !message.is_broadcast() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(DispatchReport {
            message_id: message.id,
            workflow_id: message.workflow_id,
            tasks,
        })
    }

    /// Drive one task to a terminal state, retrying TRANSIENT failures and
    /// following delegations. Boxed because delegations recurse.
    fn run_task(
        &self,
        route: Route,
        mut message: MessageObject,
        task_id: Uuid,
        depth: u32,
    ) -> BoxFuture<'_, TaskRun> {
        async move {
            let agent_id = route.agent_id.clone();
            let workflow_id = message.workflow_id.clone();
            let mut retries = 0u32;

            loop {
                if self
                    .workflows
                    .transition_task(task_id, TaskStatus::InProgress, TaskUpdate::none())
                    .is_err()
                {
                    return self.discarded(task_id, &agent_id, &workflow_id);
                }

                let delivery = self.bus.dispatch(&route, &message, task_id).await;
                self.monitor
                    .record_agent_time(&agent_id, delivery.elapsed)
                    .await;

                if self.workflows.is_terminal(&workflow_id).unwrap_or(true) {
                    return self.discarded(task_id, &agent_id, &workflow_id);
                }

                let err = match delivery.result {
                    Ok(response) => {
                        let task = match self.workflows.transition_task(
                            task_id,
                            TaskStatus::Completed,
                            TaskUpdate::output(response.data),
                        ) {
                            Ok(task) => task,
                            Err(_) => return self.discarded(task_id, &agent_id, &workflow_id),
                        };
                        info!(
                            workflow_id = %workflow_id,
                            task_id = %task_id,
                            agent_id = %agent_id,
                            retry_count = task.retry_count,
                            "Task completed"
                        );

                        let mut reports = vec![TaskReport::from_state(&task, None, false)];
                        if !response.delegations.is_empty() {
                            reports.extend(
                                self.run_delegations(
                                    task_id,
                                    &message,
                                    response.delegations,
                                    depth,
                                )
                                .await,
                            );
                        }
                        return TaskRun {
                            reports,
                            error: None,
                        };
                    }
                    Err(err) => err,
                };

                let error_type = self.classifier.classify(&err);
                let strategy = self.config.retry.decide(error_type, retries);
                let now = Utc::now();
                self.registry
                    .record_error(
                        &agent_id,
                        ErrorLogEntry {
                            timestamp: now,
                            error_type,
                            message: err.to_string(),
                            stack: None,
                            context: ErrorContext {
                                workflow_id: workflow_id.clone(),
                                agent_id: agent_id.clone(),
                                operation: format!("handle:{}", message.message_type),
                                timestamp: now,
                            },
                            retry_strategy: strategy,
                        },
                    )
                    .await;

                let failed = match self.workflows.transition_task(
                    task_id,
                    TaskStatus::Failed,
                    TaskUpdate::failure(err.to_string(), error_type),
                ) {
                    Ok(task) => task,
                    Err(_) => return self.discarded(task_id, &agent_id, &workflow_id),
                };

                if strategy.should_retry {
                    let delay = self.config.retry.backoff(retries);
                    warn!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        agent_id = %agent_id,
                        error_type = %error_type,
                        attempt = retries + 1,
                        max_retries = strategy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying task"
                    );
                    if self
                        .workflows
                        .transition_task(task_id, TaskStatus::Retrying, TaskUpdate::none())
                        .is_err()
                    {
                        return self.discarded(task_id, &agent_id, &workflow_id);
                    }
                    retries += 1;
                    message.metadata.retry_count += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }

                if error_type == ErrorType::System {
                    error!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        agent_id = %agent_id,
                        error = %err,
                        "System failure; failing workflow"
                    );
                    if let Err(e) = self
                        .workflows
                        .set_workflow_status(&workflow_id, WorkflowStatus::Failed)
                    {
                        warn!(workflow_id = %workflow_id, error = %e, "Could not fail workflow");
                    }
                } else {
                    warn!(
                        workflow_id = %workflow_id,
                        task_id = %task_id,
                        agent_id = %agent_id,
                        error_type = %error_type,
                        retry_count = failed.retry_count,
                        error = %err,
                        "Task failed"
                    );
                }

                return TaskRun {
                    reports: vec![TaskReport::from_state(&failed, Some(error_type), false)],
                    error: Some(err),
                };
            }
        }
        .boxed()
    }

    /// Publish the follow-up messages returned by a completed task as its children.
    async fn run_delegations(
        &self,
        parent_task_id: Uuid,
        parent: &MessageObject,
        delegations: Vec<MessageObject>,
        depth: u32,
    ) -> Vec<TaskReport> {
        let child_depth = depth + 1;
        let mut reports = Vec::new();
        let mut runs = Vec::new();

        for mut child in delegations {
            child.workflow_id = parent.workflow_id.clone();
            child.metadata.parent_message_id = Some(parent.id);

            if child_depth > self.config.max_delegation_depth {
                let err = ConductorError::Validation(format!(
                    "delegation depth {child_depth} exceeds limit {}",
                    self.config.max_delegation_depth
                ));
                reports.extend(self.reject_delegation(parent_task_id, &child, err));
                continue;
            }

            let routes = match self.bus.validate(&child) {
                Ok(()) => self.bus.route(&child).await,
                Err(e) => Err(e),
            };
            let routes = match routes {
                Ok(routes) => routes,
                Err(e) => {
                    reports.extend(self.reject_delegation(parent_task_id, &child, e));
                    continue;
                }
            };

            for route in routes {
                match self.workflows.create_child_task(
                    parent_task_id,
                    &route.agent_id,
                    child.payload.clone(),
                ) {
                    Ok(task_id) => {
                        info!(
                            workflow_id = %child.workflow_id,
                            parent_task_id = %parent_task_id,
                            task_id = %task_id,
                            agent_id = %route.agent_id,
                            "Delegated task"
                        );
                        runs.push(self.run_task(route, child.clone(), task_id, child_depth));
                    }
                    Err(e) => {
                        warn!(
                            parent_task_id = %parent_task_id,
                            error = %e,
                            "Could not create delegated task"
                        );
                    }
                }
            }
        }

        for run in join_all(runs).await {
            reports.extend(run.reports);
        }
        reports
    }

    /// Record a delegation that never reached an agent as a FAILED child task.
    fn reject_delegation(
        &self,
        parent_task_id: Uuid,
        child: &MessageObject,
        err: ConductorError,
    ) -> Option<TaskReport> {
        let error_type = self.classifier.classify(&err);
        let agent_id = child.target_agent_id.as_deref().unwrap_or("*");
        warn!(
            parent_task_id = %parent_task_id,
            message_id = %child.id,
            error_type = %error_type,
            error = %err,
            "Rejected delegation"
        );

        let result = self
            .workflows
            .create_child_task(parent_task_id, agent_id, child.payload.clone())
            .and_then(|id| {
                self.workflows
                    .transition_task(id, TaskStatus::InProgress, TaskUpdate::none())?;
                self.workflows
                    .transition_task(
                        id,
                        TaskStatus::Failed,
                        TaskUpdate::failure(err.to_string(), error_type),
                    )
            });
        match result {
            Ok(task) => Some(TaskReport::from_state(&task, Some(error_type), false)),
            Err(e) => {
                warn!(
                    parent_task_id = %parent_task_id,
                    error = %e,
                    "Could not record rejected delegation"
                );
                None
            }
        }
    }

    fn discarded(&self, task_id: Uuid, agent_id: &str, workflow_id: &str) -> TaskRun {
        warn!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            agent_id = %agent_id,
            "Workflow is terminal; discarding task result"
        );
        let report = match self.workflows.task(task_id) {
            Ok(task) => TaskReport::from_state(&task, None, true),
            Err(_) => TaskReport {
                task_id,
                agent_id: agent_id.to_string(),
                status: TaskStatus::InProgress,
                retry_count: 0,
                parent_task_id: None,
                output: None,
                error: None,
                error_type: None,
                discarded: true,
            },
        };
        TaskRun {
            reports: vec![report],
            error: None,
        }
    }

    // --- Workflow access -------------------------------------------------

    /// Snapshot of a workflow. Fails with `NotReady` before initialization.
    pub fn get_workflow_state(&self, workflow_id: &str) -> ConductorResult<WorkflowState> {
        self.ensure_ready()?;
        self.workflows.get_workflow_state(workflow_id)
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.workflows.list_workflows()
    }

    /// Close a workflow as COMPLETED.
    pub fn complete_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        self.workflows
            .set_workflow_status(workflow_id, WorkflowStatus::Completed)
    }

    /// Close a workflow as FAILED.
    pub fn fail_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        self.workflows
            .set_workflow_status(workflow_id, WorkflowStatus::Failed)
    }

    /// Cancel a workflow. Dispatches already in flight finish, but their results are discarded.
    pub fn cancel_workflow(&self, workflow_id: &str) -> ConductorResult<()> {
        self.workflows
            .set_workflow_status(workflow_id, WorkflowStatus::Cancelled)
    }

    pub fn set_shared_data(
        &self,
        workflow_id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> ConductorResult<()> {
        self.workflows.set_shared_data(workflow_id, key, value)
    }

    // --- Agent access ----------------------------------------------------

    pub async fn get_agent_state(&self, agent_id: &str) -> ConductorResult<AgentState> {
        self.registry.get_agent_state(agent_id).await
    }

    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry.list_agents().await
    }

    /// Descriptor, state, a fresh health probe, and the error log for one agent.
    pub async fn agent_details(&self, agent_id: &str) -> ConductorResult<AgentDetails> {
        let descriptor = self.registry.descriptor(agent_id).await?;
        let health = self.registry.health(agent_id).await?;
        let state = self.registry.get_agent_state(agent_id).await?;
        let logs = self.registry.agent_logs(agent_id).await?;
        Ok(AgentDetails {
            id: descriptor.id,
            name: descriptor.name,
            capabilities: descriptor.capabilities,
            supported_message_types: descriptor.supported_message_types,
            state,
            health,
            logs,
        })
    }

    // --- Metrics ---------------------------------------------------------

    /// Current request metrics. Fails with `NotReady` before initialization.
    pub async fn get_metrics(&self) -> ConductorResult<PerformanceMetrics> {
        self.ensure_ready()?;
        Ok(self.monitor.get_metrics().await)
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}
