//! In-process durable backend
//!
//! Keeps the namespace registry and runs each pipeline under the
//! [`PipelineSupervisor`] on its own task. Durability comes from the step
//! rows the supervisor writes: a run interrupted by a restart is started
//! again with the same ids and picks up after its last completed step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{DurableBackend, RunHandle, RunOutcome, RunRequest};
use super::supervisor::PipelineSupervisor;
use crate::error::BackendError;
use crate::models::RunIds;
use crate::tenant::task_queue_for;

struct ActiveRun {
    namespace: String,
    token: CancellationToken,
}

type Runs = Arc<Mutex<HashMap<RunIds, ActiveRun>>>;

pub struct LocalBackend {
    supervisor: Arc<PipelineSupervisor>,
    namespaces: Mutex<HashMap<String, Duration>>,
    runs: Runs,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, BackendError> {
    mutex
        .lock()
        .map_err(|_| BackendError::Unavailable("backend state lock poisoned".to_string()))
}

impl LocalBackend {
    pub fn new(supervisor: Arc<PipelineSupervisor>) -> Self {
        Self {
            supervisor,
            namespaces: Mutex::new(HashMap::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Retention a namespace was registered with
    pub fn retention(&self, namespace: &str) -> Option<Duration> {
        lock(&self.namespaces).ok()?.get(namespace).copied()
    }

    pub fn active_runs(&self) -> usize {
        lock(&self.runs).map(|runs| runs.len()).unwrap_or(0)
    }

    /// Stop accepting work and abort every run in place. Step and execution
    /// rows keep their `running` status for the next process to resume.
    pub fn shutdown(&self) {
        info!(active_runs = self.active_runs(), "shutting down durable backend");
        self.shutdown.cancel();
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.shutdown.is_cancelled() {
            Err(BackendError::Unavailable("backend is shut down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableBackend for LocalBackend {
    async fn health_check(&self) -> Result<(), BackendError> {
        self.ensure_open()
    }

    async fn register_namespace(&self, namespace: &str, retention: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        let mut namespaces = lock(&self.namespaces)?;
        if namespaces.contains_key(namespace) {
            return Err(BackendError::AlreadyExists(namespace.to_string()));
        }
        namespaces.insert(namespace.to_string(), retention);
        info!(namespace, retention_days = retention.as_secs() / 86_400, "namespace registered");
        Ok(())
    }

    async fn describe_namespace(&self, namespace: &str) -> Result<bool, BackendError> {
        self.ensure_open()?;
        Ok(lock(&self.namespaces)?.contains_key(namespace))
    }

    async fn start_run(&self, request: RunRequest) -> Result<RunHandle, BackendError> {
        self.ensure_open()?;

        if !lock(&self.namespaces)?.contains_key(&request.namespace) {
            return Err(BackendError::NamespaceNotFound(request.namespace));
        }
        if request.task_queue != task_queue_for(&request.namespace) {
            return Err(BackendError::TaskQueueMismatch {
                namespace: request.namespace,
                queue: request.task_queue,
            });
        }

        // Not a child of `shutdown`: a user cancel writes terminal rows, a
        // shutdown must not
        let token = CancellationToken::new();
        lock(&self.runs)?.insert(
            request.ids.clone(),
            ActiveRun {
                namespace: request.namespace.clone(),
                token: token.clone(),
            },
        );

        let (tx, rx) = oneshot::channel();
        let supervisor = self.supervisor.clone();
        let runs = self.runs.clone();
        let shutdown = self.shutdown.clone();
        let ids = request.ids.clone();

        info!(
            workflow_run = %ids.workflow_id,
            run_id = %ids.run_id,
            task_queue = %request.task_queue,
            "durable run started"
        );

        tokio::spawn(async move {
            // Dropping the supervisor future leaves the step rows as they are
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => RunOutcome::Interrupted,
                outcome = supervisor.run(&request.input, &token) => outcome,
            };
            if let Ok(mut runs) = runs.lock() {
                runs.remove(&request.ids);
            }
            debug!(workflow_run = %request.ids.workflow_id, ?outcome, "durable run finished");
            // The waiter may have gone away; the step rows already hold the result
            let _ = tx.send(outcome);
        });

        Ok(RunHandle::new(ids, rx))
    }

    async fn cancel_run(&self, namespace: &str, ids: &RunIds) -> Result<(), BackendError> {
        let runs = lock(&self.runs)?;
        match runs.get(ids) {
            Some(run) if run.namespace == namespace => {
                run.token.cancel();
                info!(workflow_run = %ids.workflow_id, "durable run cancelled");
                Ok(())
            }
            _ => {
                warn!(workflow_run = %ids.workflow_id, namespace, "no active run to cancel");
                Err(BackendError::RunNotFound(ids.workflow_id.clone()))
            }
        }
    }
}
