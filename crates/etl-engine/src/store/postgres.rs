//! Postgres-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use super::{ExecutionCompletion, ExecutionStore, StepCompletion, WorkflowStore};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Execution, ExecutionStep, Owner, RunIds, StepKind, WorkflowDefinition, WorkflowStatus,
};

const WORKFLOW_COLUMNS: &str = "id, owner_id, name, schedule, query, template_id, source_type, \
     source_config, destination_type, destination_config, status, last_run, next_run, created_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, started_at, completed_at, error_message, \
     rows_affected, durable_workflow_id, durable_run_id";

const STEP_COLUMNS: &str = "id, execution_id, step_number, step_name, status, attempts, started_at, \
     completed_at, error_message, last_error, output, result";

#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    id: i64,
    owner_id: i64,
    name: String,
    schedule: String,
    query: Option<String>,
    template_id: Option<i64>,
    source_type: String,
    source_config: serde_json::Value,
    destination_type: String,
    destination_config: serde_json::Value,
    status: String,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<WorkflowRow> for WorkflowDefinition {
    fn from(row: WorkflowRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            schedule: row.schedule,
            query: row.query,
            template_id: row.template_id,
            source_type: row.source_type,
            source_config: row.source_config,
            destination_type: row.destination_type,
            destination_config: row.destination_config,
            status: row.status.into(),
            last_run: row.last_run,
            next_run: row.next_run,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    workflow_id: i64,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    rows_affected: Option<i64>,
    durable_workflow_id: Option<String>,
    durable_run_id: Option<String>,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            status: row.status.into(),
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            rows_affected: row.rows_affected,
            durable_workflow_id: row.durable_workflow_id,
            durable_run_id: row.durable_run_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepRow {
    id: i64,
    execution_id: i64,
    step_number: i32,
    step_name: String,
    status: String,
    attempts: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    last_error: Option<String>,
    output: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
}

impl From<StepRow> for ExecutionStep {
    fn from(row: StepRow) -> Self {
        Self {
            id: row.id,
            execution_id: row.execution_id,
            step_number: row.step_number,
            step_name: row.step_name,
            status: row.status.into(),
            attempts: row.attempts,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            last_error: row.last_error,
            output: row.output,
            result: row.result,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OwnerRow {
    id: i64,
    username: Option<String>,
    email: Option<String>,
}

/// Store over a Postgres connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn get_workflow(&self, workflow_id: i64) -> EngineResult<Option<WorkflowDefinition>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_active_workflows(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = 'active' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_workflow_status(&self, workflow_id: i64, status: WorkflowStatus) -> EngineResult<()> {
        let result = sqlx::query("UPDATE workflows SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(workflow_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("workflow {workflow_id}")));
        }
        Ok(())
    }

    async fn record_last_run(&self, workflow_id: i64, at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET last_run = $2 WHERE id = $1")
            .bind(workflow_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_next_run(&self, workflow_id: i64, at: Option<DateTime<Utc>>) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET next_run = $2 WHERE id = $1")
            .bind(workflow_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_template_query(&self, template_id: i64) -> EngineResult<Option<String>> {
        let query: Option<String> =
            sqlx::query_scalar("SELECT query FROM query_templates WHERE id = $1")
                .bind(template_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(query)
    }

    async fn get_owner(&self, owner_id: i64) -> EngineResult<Option<Owner>> {
        let row = sqlx::query_as::<_, OwnerRow>("SELECT id, username, email FROM users WHERE id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Owner {
            id: row.id,
            username: row.username,
            email: row.email,
        }))
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    #[instrument(skip(self))]
    async fn create_execution(&self, workflow_id: i64, started_at: DateTime<Utc>) -> EngineResult<Execution> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "INSERT INTO workflow_executions (workflow_id, status, started_at) \
             VALUES ($1, 'running', $2) RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(workflow_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn attach_run_ids(&self, execution_id: i64, ids: &RunIds) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET durable_workflow_id = $2, durable_run_id = $3 WHERE id = $1",
        )
        .bind(execution_id)
        .bind(&ids.workflow_id)
        .bind(ids.run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!("execution {execution_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, completion), fields(status = completion.status.as_str()))]
    async fn complete_execution(
        &self,
        execution_id: i64,
        completion: ExecutionCompletion,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, error_message = $3, rows_affected = $4, completed_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(completion.status.as_str())
        .bind(completion.error_message)
        .bind(completion.rows_affected)
        .bind(completion.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_running_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 AND status = 'running' ORDER BY id"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_executions(&self, workflow_id: i64) -> EngineResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 ORDER BY started_at DESC, id DESC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_unfinished_executions(&self) -> EngineResult<Vec<Execution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE status = 'running' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn begin_step(&self, execution_id: i64, kind: StepKind) -> EngineResult<ExecutionStep> {
        let inserted = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO workflow_execution_steps (execution_id, step_number, step_name, status, attempts)
            VALUES ($1, $2, $3, 'running', 1)
            ON CONFLICT (execution_id, step_number) DO UPDATE
                SET attempts = workflow_execution_steps.attempts + 1
                WHERE workflow_execution_steps.status = 'running'
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(execution_id)
        .bind(kind.number())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Conflict with a terminal row: hand back what is there
        let existing = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_execution_steps \
             WHERE execution_id = $1 AND step_number = $2"
        ))
        .bind(execution_id)
        .bind(kind.number())
        .fetch_one(&self.pool)
        .await?;

        Ok(existing.into())
    }

    async fn record_step_attempt(
        &self,
        execution_id: i64,
        kind: StepKind,
        last_error: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_execution_steps
            SET attempts = attempts + 1, last_error = $3
            WHERE execution_id = $1 AND step_number = $2 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(kind.number())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_step(
        &self,
        execution_id: i64,
        kind: StepKind,
        completion: StepCompletion,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_execution_steps
            SET status = $3, error_message = $4, output = $5, result = $6, completed_at = NOW()
            WHERE execution_id = $1 AND step_number = $2 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(kind.number())
        .bind(completion.status.as_str())
        .bind(completion.error_message)
        .bind(completion.output)
        .bind(completion.result)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_steps(&self, execution_id: i64) -> EngineResult<Vec<ExecutionStep>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_execution_steps \
             WHERE execution_id = $1 ORDER BY step_number"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
