use crate::retry::RetryPolicy;
use crate::types::{ErrorType, TaskState, TaskStatus, WorkflowState, WorkflowStatus};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Output or error attached to a task transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// Recorded on COMPLETED.
    pub output: Option<serde_json::Value>,
    /// Recorded on FAILED; also replaces the message on RETRYING.
    pub error: Option<String>,
    /// Recorded on FAILED. `None` means unclassified.
    pub error_type: Option<ErrorType>,
}

impl TaskUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    /// A successful result.
    pub fn output(value: serde_json::Value) -> Self {
        Self {
            output: Some(value),
            ..Self::default()
        }
    }

    /// An unclassified failure message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// A classified failure. Non-TRANSIENT kinds make the task ineligible for RETRYING.
    pub fn failure(message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            error: Some(message.into()),
            error_type: Some(error_type),
            ..Self::default()
        }
    }
}

/// The table of workflows.
///
/// The outer map is guarded by its own lock and each workflow by a separate
/// mutex, so task mutations within one workflow serialize while unrelated
/// workflows proceed independently. Task ids are indexed to their workflow.
///
/// The retry bound lives here as well, so `retry_count` never exceeds
/// `max_retries` no matter who drives the transitions.
pub struct WorkflowStateManager {
    workflows: RwLock<HashMap<String, Arc<Mutex<WorkflowState>>>>,
    task_index: RwLock<HashMap<Uuid, String>>,
    max_retries: u32,
}

impl WorkflowStateManager {
    /// An empty table using the default retry limit.
    pub fn new() -> Self {
        Self::with_max_retries(RetryPolicy::default().max_retries)
    }

    /// An empty table that allows at most `max_retries` RETRYING moves per task.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn entry(&self, workflow_id: &str) -> ConductorResult<Arc<Mutex<WorkflowState>>> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ConductorError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn workflow_of(&self, task_id: Uuid) -> ConductorResult<String> {
        self.task_index
            .read()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))
    }

    fn ensure_mutable(workflow: &WorkflowState) -> ConductorResult<()> {
        if workflow.is_terminal() {
            return Err(ConductorError::InvalidTransition(format!(
                "workflow {} is {}",
                workflow.id, workflow.status
            )));
        }
        Ok(())
    }

    /// Create the workflow if it has never been referenced. Idempotent.
    pub fn ensure_workflow(&self, workflow_id: &str, initiator_id: &str) -> WorkflowState {
        if let Some(existing) = self.workflows.read().get(workflow_id) {
            return existing.lock().clone();
        }
        let mut workflows = self.workflows.write();
        let entry = workflows.entry(workflow_id.to_string()).or_insert_with(|| {
            info!(workflow_id = %workflow_id, initiator = %initiator_id, "Workflow created");
            Arc::new(Mutex::new(WorkflowState::new(workflow_id, initiator_id)))
        });
        let snapshot = entry.lock().clone();
        snapshot
    }

    /// True if the workflow has been referenced.
    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.read().contains_key(workflow_id)
    }

    /// Snapshot of a workflow.
    pub fn get_workflow_state(&self, workflow_id: &str) -> ConductorResult<WorkflowState> {
        let entry = self.entry(workflow_id)?;
        let snapshot = entry.lock().clone();
        Ok(snapshot)
    }

    /// Ids of all known workflows, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_terminal(&self, workflow_id: &str) -> ConductorResult<bool> {
        let entry = self.entry(workflow_id)?;
        let terminal = entry.lock().is_terminal();
        Ok(terminal)
    }

    /// Add a PENDING task to the workflow and return its id.
    ///
    /// The first task moves a PENDING workflow to IN_PROGRESS.
    pub fn create_task(
        &self,
        workflow_id: &str,
        agent_id: &str,
        input: serde_json::Value,
    ) -> ConductorResult<Uuid> {
        self.insert_task(workflow_id, TaskState::new(agent_id, input))
    }

    /// Add a task spawned by `parent_task_id` and link it as a child, in one step.
    pub fn create_child_task(
        &self,
        parent_task_id: Uuid,
        agent_id: &str,
        input: serde_json::Value,
    ) -> ConductorResult<Uuid> {
        let workflow_id = self.workflow_of(parent_task_id)?;
        let entry = self.entry(&workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;

        let mut task = TaskState::new(agent_id, input);
        task.parent_task_id = Some(parent_task_id);
        let child_id = task.id;

        let parent = workflow
            .tasks
            .get_mut(&parent_task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(parent_task_id.to_string()))?;
        parent.child_task_ids.push(child_id);
        workflow.tasks.insert(child_id, task);
        workflow.touch();

        self.task_index.write().insert(child_id, workflow_id.clone());
        debug!(
            workflow_id = %workflow_id,
            parent = %parent_task_id,
            task_id = %child_id,
            "Child task created"
        );
        Ok(child_id)
    }

    fn insert_task(&self, workflow_id: &str, task: TaskState) -> ConductorResult<Uuid> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;

        let task_id = task.id;
        let agent_id = task.agent_id.clone();
        workflow.tasks.insert(task_id, task);
        if workflow.status == WorkflowStatus::Pending {
            workflow.status = WorkflowStatus::InProgress;
        }
        workflow.touch();

        self.task_index
            .write()
            .insert(task_id, workflow_id.to_string());
        debug!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            agent_id = %agent_id,
            "Task created"
        );
        Ok(task_id)
    }

    /// Snapshot of a single task.
    pub fn task(&self, task_id: Uuid) -> ConductorResult<TaskState> {
        let workflow_id = self.workflow_of(task_id)?;
        let entry = self.entry(&workflow_id)?;
        let workflow = entry.lock();
        workflow
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))
    }

    /// Move a task through its state machine.
    ///
    /// COMPLETED records `update.output`; FAILED records `update.error` and
    /// `update.error_type`; entering RETRYING increments `retry_count`.
    /// RETRYING is rejected once `retry_count` reaches `max_retries` or when
    /// the recorded failure is not TRANSIENT.
    pub fn transition_task(
        &self,
        task_id: Uuid,
        new_status: TaskStatus,
        update: TaskUpdate,
    ) -> ConductorResult<TaskState> {
        let workflow_id = self.workflow_of(task_id)?;
        let entry = self.entry(&workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;

        let task = workflow
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;

        if !task.status.can_transition_to(new_status) {
            return Err(ConductorError::InvalidTransition(format!(
                "task {task_id}: {} -> {new_status}",
                task.status
            )));
        }

        if new_status == TaskStatus::Retrying {
            if let Some(kind) = task.error_type.filter(|k| *k != ErrorType::Transient) {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id}: {kind} failures are not retried"
                )));
            }
            if task.retry_count >= self.max_retries {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {task_id}: retry limit {} reached",
                    self.max_retries
                )));
            }
        }

        match new_status {
            TaskStatus::InProgress => {
                task.error = None;
                task.error_type = None;
            }
            TaskStatus::Completed => {
                task.output = update.output;
                task.error = None;
                task.error_type = None;
                task.completed_at = Some(Utc::now());
            }
            TaskStatus::Failed => {
                task.error = Some(
                    update
                        .error
                        .unwrap_or_else(|| "unspecified failure".to_string()),
                );
                task.error_type = update.error_type;
                task.completed_at = Some(Utc::now());
            }
            TaskStatus::Retrying => {
                task.retry_count += 1;
                task.completed_at = None;
                if let Some(error) = update.error {
                    task.error = Some(error);
                }
            }
            TaskStatus::Pending => {}
        }
        task.status = new_status;
        let snapshot = task.clone();
        workflow.touch();

        debug!(
            workflow_id = %workflow_id,
            task_id = %task_id,
            status = %new_status,
            "Task transitioned"
        );
        Ok(snapshot)
    }

    /// Record `child_task_id` as spawned by `parent_task_id`. Both must share a workflow.
    ///
    /// Self-links, links that would close a cycle, and re-parenting a child
    /// that already belongs to another task are rejected with `Validation`.
    /// Linking an existing pair again is a no-op.
    pub fn link_child(&self, parent_task_id: Uuid, child_task_id: Uuid) -> ConductorResult<()> {
        if parent_task_id == child_task_id {
            return Err(ConductorError::Validation(format!(
                "task {child_task_id} cannot be its own child"
            )));
        }
        let workflow_id = self.workflow_of(parent_task_id)?;
        let child_workflow = self.workflow_of(child_task_id)?;
        if workflow_id != child_workflow {
            return Err(ConductorError::Validation(format!(
                "task {child_task_id} belongs to workflow {child_workflow}, not {workflow_id}"
            )));
        }

        let entry = self.entry(&workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;

        let child = workflow
            .tasks
            .get(&child_task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(child_task_id.to_string()))?;
        match child.parent_task_id {
            Some(existing) if existing == parent_task_id => return Ok(()),
            Some(existing) => {
                return Err(ConductorError::Validation(format!(
                    "task {child_task_id} is already a child of {existing}"
                )));
            }
            None => {}
        }

        // Walk up from the parent; meeting the child means the link closes a cycle.
        let mut ancestor = Some(parent_task_id);
        while let Some(id) = ancestor {
            if id == child_task_id {
                return Err(ConductorError::Validation(format!(
                    "linking {child_task_id} under {parent_task_id} would create a cycle"
                )));
            }
            ancestor = workflow.tasks.get(&id).and_then(|t| t.parent_task_id);
        }

        let parent = workflow
            .tasks
            .get_mut(&parent_task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(parent_task_id.to_string()))?;
        if !parent.child_task_ids.contains(&child_task_id) {
            parent.child_task_ids.push(child_task_id);
        }
        if let Some(child) = workflow.tasks.get_mut(&child_task_id) {
            child.parent_task_id = Some(parent_task_id);
        }
        workflow.touch();
        Ok(())
    }

    /// Merge a key into the workflow's shared data.
    pub fn set_shared_data(
        &self,
        workflow_id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> ConductorResult<()> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;
        workflow.shared_data.insert(key.into(), value);
        workflow.touch();
        Ok(())
    }

    /// Change the workflow status.
    ///
    /// Progression is forward-only (PENDING → IN_PROGRESS → terminal), except
    /// that CANCELLED is reachable from any non-terminal state.
    pub fn set_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> ConductorResult<()> {
        let entry = self.entry(workflow_id)?;
        let mut workflow = entry.lock();
        Self::ensure_mutable(&workflow)?;

        let current = workflow.status;
        if current == status {
            return Ok(());
        }
        if status != WorkflowStatus::Cancelled && status.rank() < current.rank() {
            return Err(ConductorError::InvalidTransition(format!(
                "workflow {workflow_id}: {current} -> {status}"
            )));
        }

        workflow.status = status;
        workflow.touch();
        info!(workflow_id = %workflow_id, from = %current, to = %status, "Workflow status changed");
        Ok(())
    }
}

impl Default for WorkflowStateManager {
    fn default() -> Self {
        Self::new()
    }
}
