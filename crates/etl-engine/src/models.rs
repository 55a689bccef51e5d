//! Persistent entities owned by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Error => "error",
        }
    }
}

impl From<String> for WorkflowStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => WorkflowStatus::Active,
            "error" => WorkflowStatus::Error,
            _ => WorkflowStatus::Paused,
        }
    }
}

/// A stored workflow definition (maps to the workflows table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    /// Five-field cron expression, a macro such as `@daily`, or `@once`
    pub schedule: String,
    pub query: Option<String>,
    pub template_id: Option<i64>,
    pub source_type: String,
    pub source_config: serde_json::Value,
    pub destination_type: String,
    pub destination_config: serde_json::Value,
    pub status: WorkflowStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// A minimal active workflow; callers fill in the rest with struct update syntax
    pub fn new(id: i64, owner_id: i64, schedule: impl Into<String>) -> Self {
        Self {
            id,
            owner_id,
            name: format!("workflow-{id}"),
            schedule: schedule.into(),
            query: None,
            template_id: None,
            source_type: "none".to_string(),
            source_config: serde_json::json!({}),
            destination_type: "storage".to_string(),
            destination_config: serde_json::json!({}),
            status: WorkflowStatus::Active,
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
        }
    }

    /// The literal query, if it is non-blank
    pub fn literal_query(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Identity fields used to derive a tenant namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub username: Option<String>,
    pub email: Option<String>,
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl From<String> for ExecutionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// Identifiers of a run on the durable backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIds {
    /// `workflow-<workflow_id>-<unix_ts>`
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl RunIds {
    pub fn new(workflow_id: i64, at: DateTime<Utc>) -> Self {
        Self {
            workflow_id: format!("workflow-{}-{}", workflow_id, at.timestamp()),
            run_id: Uuid::new_v4(),
        }
    }
}

/// One run of a workflow (maps to the workflow_executions table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub workflow_id: i64,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub rows_affected: Option<i64>,
    pub durable_workflow_id: Option<String>,
    pub durable_run_id: Option<String>,
}

impl Execution {
    /// Durable identifiers, when the execution was started on the backend
    pub fn run_ids(&self) -> Option<RunIds> {
        let workflow_id = self.durable_workflow_id.clone()?;
        let run_id = self.durable_run_id.as_deref()?.parse().ok()?;
        Some(RunIds {
            workflow_id,
            run_id,
        })
    }
}

/// The three pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FetchSource,
    Transform,
    SaveDestination,
}

impl StepKind {
    pub const ALL: [StepKind; 3] = [
        StepKind::FetchSource,
        StepKind::Transform,
        StepKind::SaveDestination,
    ];

    pub fn number(&self) -> i32 {
        match self {
            StepKind::FetchSource => 1,
            StepKind::Transform => 2,
            StepKind::SaveDestination => 3,
        }
    }

    pub fn from_number(number: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.number() == number)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::FetchSource => "fetch_source",
            StepKind::Transform => "transform",
            StepKind::SaveDestination => "save_destination",
        }
    }

    /// Activity name the step is dispatched under
    pub fn activity(&self) -> &'static str {
        match self {
            StepKind::FetchSource => "fetch_source_data",
            StepKind::Transform => "transform_data",
            StepKind::SaveDestination => "save_to_destination",
        }
    }
}

/// Step record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }
}

impl From<String> for StepStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => StepStatus::Running,
            "success" => StepStatus::Success,
            _ => StepStatus::Failed,
        }
    }
}

/// Step record (maps to the workflow_execution_steps table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: i64,
    pub execution_id: i64,
    pub step_number: i32,
    pub step_name: String,
    pub status: StepStatus,
    /// Attempts started so far; retries reuse the row
    pub attempts: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Error of the most recent failed attempt
    pub last_error: Option<String>,
    /// Summary shown to users (row counts, object references)
    pub output: Option<serde_json::Value>,
    /// Full activity result, replayed when a run resumes
    pub result: Option<serde_json::Value>,
}

impl ExecutionStep {
    pub fn kind(&self) -> Option<StepKind> {
        StepKind::from_number(self.step_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [WorkflowStatus::Active, WorkflowStatus::Paused, WorkflowStatus::Error] {
            assert_eq!(WorkflowStatus::from(status.as_str().to_string()), status);
        }
        assert_eq!(ExecutionStatus::from("success".to_string()), ExecutionStatus::Success);
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_numbers_strictly_increase() {
        let numbers: Vec<i32> = StepKind::ALL.iter().map(StepKind::number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(StepKind::from_number(2), Some(StepKind::Transform));
        assert_eq!(StepKind::from_number(4), None);
        assert_eq!(StepKind::SaveDestination.activity(), "save_to_destination");
    }

    #[test]
    fn test_run_ids_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let ids = RunIds::new(42, at);
        assert_eq!(ids.workflow_id, format!("workflow-42-{}", at.timestamp()));
    }

    #[test]
    fn test_execution_run_ids_require_both_parts() {
        let mut execution = Execution {
            id: 1,
            workflow_id: 2,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            rows_affected: None,
            durable_workflow_id: Some("workflow-2-1".to_string()),
            durable_run_id: None,
        };
        assert!(execution.run_ids().is_none());

        let run_id = Uuid::new_v4();
        execution.durable_run_id = Some(run_id.to_string());
        assert_eq!(execution.run_ids().map(|ids| ids.run_id), Some(run_id));
    }

    #[test]
    fn test_literal_query_ignores_blank() {
        let mut workflow = WorkflowDefinition::new(1, 1, "@daily");
        workflow.query = Some("   ".to_string());
        assert_eq!(workflow.literal_query(), None);
        workflow.query = Some(" SELECT 1 ".to_string());
        assert_eq!(workflow.literal_query(), Some("SELECT 1"));
    }
}
