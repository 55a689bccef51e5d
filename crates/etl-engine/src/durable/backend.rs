//! The durable execution backend seam

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::BackendError;
use crate::models::{RunIds, StepKind};
use crate::pipeline::{PipelineInput, PipelineResult};

/// A request to run one pipeline durably
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub namespace: String,
    pub task_queue: String,
    /// Fresh ids for a new run, or the stored ids when resuming
    pub ids: RunIds,
    pub input: PipelineInput,
}

/// How a durable run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(PipelineResult),
    Failed {
        step: Option<StepKind>,
        error: String,
    },
    Cancelled,
    /// The backend shut down mid-run. Nothing terminal was written, so the
    /// run is picked up again by recovery.
    Interrupted,
}

/// Handle to a started run
#[derive(Debug)]
pub struct RunHandle {
    pub ids: RunIds,
    completion: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    pub fn new(ids: RunIds, completion: oneshot::Receiver<RunOutcome>) -> Self {
        Self { ids, completion }
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> RunOutcome {
        self.completion.await.unwrap_or_else(|_| RunOutcome::Failed {
            step: None,
            error: "durable run ended without reporting an outcome".to_string(),
        })
    }
}

/// Operations the engine needs from a durable execution service
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Cheap reachability probe
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Register a namespace. Returns `AlreadyExists` when it is already there.
    async fn register_namespace(
        &self,
        namespace: &str,
        retention: Duration,
    ) -> Result<(), BackendError>;

    async fn describe_namespace(&self, namespace: &str) -> Result<bool, BackendError>;

    async fn start_run(&self, request: RunRequest) -> Result<RunHandle, BackendError>;

    async fn cancel_run(&self, namespace: &str, ids: &RunIds) -> Result<(), BackendError>;
}
