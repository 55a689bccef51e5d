//! Relational state: workflows, executions and step records
//!
//! [`PgStore`] is the production implementation; [`MemoryStore`] backs
//! tests and embedders that run without Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineResult;
use crate::models::{
    Execution, ExecutionStatus, ExecutionStep, Owner, RunIds, StepKind, StepStatus,
    WorkflowDefinition, WorkflowStatus,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Terminal write for a step record
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub output: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

impl StepCompletion {
    pub fn success(output: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            status: StepStatus::Success,
            error_message: None,
            output: Some(output),
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            error_message: Some(error.into()),
            output: None,
            result: None,
        }
    }
}

/// Terminal write for an execution
#[derive(Debug, Clone)]
pub struct ExecutionCompletion {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub rows_affected: Option<i64>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionCompletion {
    pub fn success(rows_affected: i64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            error_message: None,
            rows_affected: Some(rows_affected),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error_message: Some(error.into()),
            rows_affected: None,
            completed_at: Utc::now(),
        }
    }
}

/// Workflow definitions and the identity data the engine reads alongside them
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, workflow_id: i64) -> EngineResult<Option<WorkflowDefinition>>;

    async fn list_active_workflows(&self) -> EngineResult<Vec<WorkflowDefinition>>;

    async fn set_workflow_status(&self, workflow_id: i64, status: WorkflowStatus) -> EngineResult<()>;

    async fn record_last_run(&self, workflow_id: i64, at: DateTime<Utc>) -> EngineResult<()>;

    /// `None` clears the column
    async fn record_next_run(&self, workflow_id: i64, at: Option<DateTime<Utc>>) -> EngineResult<()>;

    /// Query text of a reusable template
    async fn get_template_query(&self, template_id: i64) -> EngineResult<Option<String>>;

    async fn get_owner(&self, owner_id: i64) -> EngineResult<Option<Owner>>;
}

/// Executions and their step records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a `running` execution
    async fn create_execution(&self, workflow_id: i64, started_at: DateTime<Utc>) -> EngineResult<Execution>;

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>>;

    async fn attach_run_ids(&self, execution_id: i64, ids: &RunIds) -> EngineResult<()>;

    /// Move a `running` execution to a terminal status. Returns false, and
    /// changes nothing, when it is already terminal.
    async fn complete_execution(
        &self,
        execution_id: i64,
        completion: ExecutionCompletion,
    ) -> EngineResult<bool>;

    async fn list_running_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>>;

    /// Newest first
    async fn list_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>>;

    /// Every `running` execution, across workflows; used after a restart
    async fn list_unfinished_executions(&self) -> EngineResult<Vec<Execution>>;

    /// Create the step row as `running`, or count another attempt when a
    /// resumed run picks up a step that was still running
    async fn begin_step(&self, execution_id: i64, kind: StepKind) -> EngineResult<ExecutionStep>;

    /// Count a retry on the step row and keep the error that caused it
    async fn record_step_attempt(
        &self,
        execution_id: i64,
        kind: StepKind,
        last_error: &str,
    ) -> EngineResult<()>;

    /// Write the step's terminal status. A no-op returning false unless the
    /// row is still `running`.
    async fn complete_step(
        &self,
        execution_id: i64,
        kind: StepKind,
        completion: StepCompletion,
    ) -> EngineResult<bool>;

    /// Ordered by step number
    async fn list_steps(&self, execution_id: i64) -> EngineResult<Vec<ExecutionStep>>;
}

/// Everything the engine persists
pub trait Store: WorkflowStore + ExecutionStore {}

impl<T: WorkflowStore + ExecutionStore> Store for T {}
