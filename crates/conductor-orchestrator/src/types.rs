use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a workflow. COMPLETED, FAILED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, no task yet.
    Pending,
    /// At least one task has been created.
    InProgress,
    /// Closed successfully by the caller.
    Completed,
    /// Closed by a SYSTEM failure or by the caller.
    Failed,
    /// Abandoned; in-flight results are discarded.
    Cancelled,
}

impl WorkflowStatus {
    /// True for COMPLETED, FAILED and CANCELLED.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Position in the forward-only progression.
    pub(crate) fn rank(self) -> u8 {
        match self {
            WorkflowStatus::Pending => 0,
            WorkflowStatus::InProgress => 1,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "PENDING"),
            WorkflowStatus::InProgress => write!(f, "IN_PROGRESS"),
            WorkflowStatus::Completed => write!(f, "COMPLETED"),
            WorkflowStatus::Failed => write!(f, "FAILED"),
            WorkflowStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Status of a single task.
///
/// Legal moves: PENDING→IN_PROGRESS, IN_PROGRESS→COMPLETED|FAILED,
/// FAILED→RETRYING, RETRYING→IN_PROGRESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, not yet dispatched.
    Pending,
    /// Handed to the agent.
    InProgress,
    /// The agent returned a response.
    Completed,
    /// The agent returned an error.
    Failed,
    /// Waiting to be dispatched again after a TRANSIENT failure.
    Retrying,
}

impl TaskStatus {
    /// Whether `self -> next` is a legal move, ignoring retry bounds.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Retrying)
                | (TaskStatus::Retrying, TaskStatus::InProgress)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Retrying => write!(f, "RETRYING"),
        }
    }
}

/// Runtime status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Registered; `initialize` has not returned yet.
    Initializing,
    /// Idle and routable.
    Ready,
    /// Handling at least one message.
    Busy,
    /// The last dispatch failed. Still routable.
    Error,
    /// Shut down; never routed to again.
    Shutdown,
}

impl AgentStatus {
    /// Whether the bus may deliver to an agent in this status.
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            AgentStatus::Ready | AgentStatus::Busy | AgentStatus::Error
        )
    }
}

/// Classification of a failure; decides retry eligibility and escalation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// Infrastructure hiccup; retryable.
    Transient,
    /// Caller error; never retried.
    Validation,
    /// Agent-declared domain failure; never retried.
    BusinessLogic,
    /// Engine-level failure; never retried, fails the whole workflow.
    System,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Transient => write!(f, "TRANSIENT"),
            ErrorType::Validation => write!(f, "VALIDATION"),
            ErrorType::BusinessLogic => write!(f, "BUSINESS_LOGIC"),
            ErrorType::System => write!(f, "SYSTEM"),
        }
    }
}

/// Creation and last-update times of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Source of the first message seen for the workflow.
    pub initiator_id: String,
}

/// A workflow: its tasks, shared key/value data, and lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub id: String,
    pub status: WorkflowStatus,
    /// Every task ever created in the workflow, keyed by id.
    pub tasks: HashMap<Uuid, TaskState>,
    /// Key/value scratch space shared by the workflow's agents.
    pub shared_data: HashMap<String, serde_json::Value>,
    pub metadata: WorkflowMetadata,
}

impl WorkflowState {
    pub fn new(id: impl Into<String>, initiator_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: WorkflowStatus::Pending,
            tasks: HashMap::new(),
            shared_data: HashMap::new(),
            metadata: WorkflowMetadata {
                created_at: now,
                updated_at: now,
                initiator_id: initiator_id.into(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Tasks sorted by creation time.
    pub fn tasks_in_order(&self) -> Vec<&TaskState> {
        let mut tasks: Vec<&TaskState> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub(crate) fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}

/// One unit of work assigned to one agent within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: Uuid,
    pub agent_id: String,
    pub status: TaskStatus,
    /// Payload of the message that created the task.
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Re-dispatches so far. Never exceeds the configured `max_retries`.
    pub retry_count: u32,
    /// Tasks delegated from this one, in creation order.
    #[serde(default)]
    pub child_task_ids: Vec<Uuid>,
    /// Set on tasks spawned through delegation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classification of the last failure. Only TRANSIENT failures may be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

impl TaskState {
    pub fn new(agent_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            status: TaskStatus::Pending,
            input,
            output: None,
            retry_count: 0,
            child_task_ids: Vec::new(),
            parent_task_id: None,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            error_type: None,
        }
    }
}

/// Runtime bookkeeping for a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: String,
    pub status: AgentStatus,
    /// Tasks currently inside the agent's handler.
    pub current_tasks: HashSet<Uuid>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Running mean over finished dispatches, in milliseconds.
    pub average_processing_time: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub configuration: serde_json::Value,
}

impl AgentState {
    pub fn new(id: impl Into<String>, configuration: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            status: AgentStatus::Initializing,
            current_tasks: HashSet::new(),
            completed_tasks: 0,
            failed_tasks: 0,
            average_processing_time: 0.0,
            last_health_check: None,
            configuration,
        }
    }

    pub(crate) fn record_processing_time(&mut self, elapsed_ms: f64) {
        let finished = self.completed_tasks + self.failed_tasks;
        if finished == 0 {
            self.average_processing_time = elapsed_ms;
        } else {
            let n = finished as f64;
            self.average_processing_time =
                (self.average_processing_time * (n - 1.0) + elapsed_ms) / n;
        }
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub workflow_id: String,
    pub agent_id: String,
    /// Engine operation that observed the failure, e.g. `handle:TASK_REQUEST`.
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

/// Retry decision attached to a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Whether the task is dispatched again.
    pub should_retry: bool,
    /// Retry budget for this kind of failure; 0 when it is never retried.
    pub max_retries: u32,
}

/// An append-only record of a classified agent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub context: ErrorContext,
    pub retry_strategy: RetryStrategy,
}

/// Running timing statistics for one agent, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTimingStats {
    pub count: u64,
    pub total_time: f64,
    pub average_time: f64,
    pub min_time: f64,
    pub max_time: f64,
}

impl AgentTimingStats {
    /// Fold one handler duration into the statistics.
    pub fn record(&mut self, elapsed_ms: f64) {
        if self.count == 0 {
            self.min_time = elapsed_ms;
            self.max_time = elapsed_ms;
        } else {
            self.min_time = self.min_time.min(elapsed_ms);
            self.max_time = self.max_time.max(elapsed_ms);
        }
        self.count += 1;
        self.total_time += elapsed_ms;
        self.average_time = self.total_time / self.count as f64;
    }
}

/// A request that ended unsuccessfully, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds from start to end of the request.
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate request statistics. Times are in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    /// Handler timings keyed by agent id.
    pub agent_processing_times: HashMap<String, AgentTimingStats>,
    #[serde(default)]
    pub recent_failures: Vec<FailedRequest>,
}

impl PerformanceMetrics {
    pub(crate) fn record_response(&mut self, elapsed_ms: f64, success: bool) {
        if self.total_requests == 0 {
            self.min_response_time = elapsed_ms;
            self.max_response_time = elapsed_ms;
        } else {
            self.min_response_time = self.min_response_time.min(elapsed_ms);
            self.max_response_time = self.max_response_time.max(elapsed_ms);
        }
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let n = self.total_requests as f64;
        self.average_response_time = (self.average_response_time * (n - 1.0) + elapsed_ms) / n;
    }
}
