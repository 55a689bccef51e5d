//! In-memory store

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ExecutionCompletion, ExecutionStore, StepCompletion, WorkflowStore};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Execution, ExecutionStatus, ExecutionStep, Owner, RunIds, StepKind, StepStatus,
    WorkflowDefinition, WorkflowStatus,
};

#[derive(Default)]
struct Inner {
    workflows: BTreeMap<i64, WorkflowDefinition>,
    owners: HashMap<i64, Owner>,
    templates: HashMap<i64, String>,
    executions: BTreeMap<i64, Execution>,
    /// Keyed by (execution_id, step_number)
    steps: BTreeMap<(i64, i32), ExecutionStep>,
    next_execution_id: i64,
    next_step_id: i64,
}

/// Store kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Internal("memory store lock poisoned".to_string()))
    }

    pub fn insert_workflow(&self, workflow: WorkflowDefinition) -> EngineResult<()> {
        self.lock()?.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    pub fn insert_owner(&self, owner: Owner) -> EngineResult<()> {
        self.lock()?.owners.insert(owner.id, owner);
        Ok(())
    }

    pub fn insert_template(&self, template_id: i64, query: impl Into<String>) -> EngineResult<()> {
        self.lock()?.templates.insert(template_id, query.into());
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_workflow(&self, workflow_id: i64) -> EngineResult<Option<WorkflowDefinition>> {
        Ok(self.lock()?.workflows.get(&workflow_id).cloned())
    }

    async fn list_active_workflows(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        Ok(self
            .lock()?
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Active)
            .cloned()
            .collect())
    }

    async fn set_workflow_status(&self, workflow_id: i64, status: WorkflowStatus) -> EngineResult<()> {
        let mut inner = self.lock()?;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| EngineError::not_found(format!("workflow {workflow_id}")))?;
        workflow.status = status;
        Ok(())
    }

    async fn record_last_run(&self, workflow_id: i64, at: DateTime<Utc>) -> EngineResult<()> {
        if let Some(workflow) = self.lock()?.workflows.get_mut(&workflow_id) {
            workflow.last_run = Some(at);
        }
        Ok(())
    }

    async fn record_next_run(&self, workflow_id: i64, at: Option<DateTime<Utc>>) -> EngineResult<()> {
        if let Some(workflow) = self.lock()?.workflows.get_mut(&workflow_id) {
            workflow.next_run = at;
        }
        Ok(())
    }

    async fn get_template_query(&self, template_id: i64) -> EngineResult<Option<String>> {
        Ok(self.lock()?.templates.get(&template_id).cloned())
    }

    async fn get_owner(&self, owner_id: i64) -> EngineResult<Option<Owner>> {
        Ok(self.lock()?.owners.get(&owner_id).cloned())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, workflow_id: i64, started_at: DateTime<Utc>) -> EngineResult<Execution> {
        let mut inner = self.lock()?;
        inner.next_execution_id += 1;
        let execution = Execution {
            id: inner.next_execution_id,
            workflow_id,
            status: ExecutionStatus::Running,
            started_at,
            completed_at: None,
            error_message: None,
            rows_affected: None,
            durable_workflow_id: None,
            durable_run_id: None,
        };
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>> {
        Ok(self.lock()?.executions.get(&execution_id).cloned())
    }

    async fn attach_run_ids(&self, execution_id: i64, ids: &RunIds) -> EngineResult<()> {
        let mut inner = self.lock()?;
        let execution = inner
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::not_found(format!("execution {execution_id}")))?;
        execution.durable_workflow_id = Some(ids.workflow_id.clone());
        execution.durable_run_id = Some(ids.run_id.to_string());
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: i64,
        completion: ExecutionCompletion,
    ) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        match inner.executions.get_mut(&execution_id) {
            Some(execution) if execution.status == ExecutionStatus::Running => {
                execution.status = completion.status;
                execution.error_message = completion.error_message;
                execution.rows_affected = completion.rows_affected;
                execution.completed_at = Some(completion.completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_running_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>> {
        Ok(self
            .lock()?
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id && e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .lock()?
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(executions)
    }

    async fn list_unfinished_executions(&self) -> EngineResult<Vec<Execution>> {
        Ok(self
            .lock()?
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }

    async fn begin_step(&self, execution_id: i64, kind: StepKind) -> EngineResult<ExecutionStep> {
        let mut inner = self.lock()?;
        let key = (execution_id, kind.number());

        if let Some(step) = inner.steps.get_mut(&key) {
            if step.status == StepStatus::Running {
                step.attempts += 1;
            }
            return Ok(step.clone());
        }

        inner.next_step_id += 1;
        let step = ExecutionStep {
            id: inner.next_step_id,
            execution_id,
            step_number: kind.number(),
            step_name: kind.as_str().to_string(),
            status: StepStatus::Running,
            attempts: 1,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            last_error: None,
            output: None,
            result: None,
        };
        inner.steps.insert(key, step.clone());
        Ok(step)
    }

    async fn record_step_attempt(
        &self,
        execution_id: i64,
        kind: StepKind,
        last_error: &str,
    ) -> EngineResult<()> {
        let mut inner = self.lock()?;
        if let Some(step) = inner.steps.get_mut(&(execution_id, kind.number())) {
            if step.status == StepStatus::Running {
                step.attempts += 1;
                step.last_error = Some(last_error.to_string());
            }
        }
        Ok(())
    }

    async fn complete_step(
        &self,
        execution_id: i64,
        kind: StepKind,
        completion: StepCompletion,
    ) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        match inner.steps.get_mut(&(execution_id, kind.number())) {
            Some(step) if step.status == StepStatus::Running => {
                step.status = completion.status;
                step.error_message = completion.error_message;
                step.output = completion.output;
                step.result = completion.result;
                step.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_steps(&self, execution_id: i64) -> EngineResult<Vec<ExecutionStep>> {
        Ok(self
            .lock()?
            .steps
            .range((execution_id, i32::MIN)..=(execution_id, i32::MAX))
            .map(|(_, step)| step.clone())
            .collect())
    }
}
