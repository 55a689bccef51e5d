//! Execution engine
//!
//! Turns a trigger (a cron fire or a manual run) into an execution record
//! and drives it to a terminal status. Each invocation asks the
//! [`CircuitBreaker`] whether to try the durable backend; when the backend
//! is disabled, unhealthy or refuses the run, the pipeline runs on the
//! [`FallbackExecutor`] instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, OverlapPolicy};
use crate::durable::{CircuitBreaker, RunHandle, RunOutcome, RunRequest};
use crate::error::{BackendError, EngineError, EngineResult};
use crate::fallback::FallbackExecutor;
use crate::models::{Execution, ExecutionStatus, RunIds, WorkflowDefinition, WorkflowStatus};
use crate::pipeline::transform::MISSING_QUERY;
use crate::pipeline::{PipelineInput, TenantContext};
use crate::store::{ExecutionCompletion, Store};
use crate::tenant::{TenantNamespace, TenantRegistry};

/// Error recorded on executions a restart left without a resumable run
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// What started an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Cron,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Manual => "manual",
        }
    }
}

/// A started execution. `completion` resolves to its final status.
#[derive(Debug)]
pub struct ExecutionTicket {
    pub execution_id: i64,
    pub completion: JoinHandle<ExecutionStatus>,
}

/// Result of [`ExecutionEngine::recover`]
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<ExecutionTicket>,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub durable_enabled: bool,
    pub overlap_policy: OverlapPolicy,
    /// Bound on backend health checks
    pub connect_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            durable_enabled: config.durable.enabled,
            overlap_policy: config.engine.overlap_policy,
            connect_timeout: config.durable.connect_timeout(),
            breaker_failure_threshold: config.durable.breaker_failure_threshold,
            breaker_reset: config.durable.breaker_reset(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Something that can start executions; the scheduler fires through this
#[async_trait]
pub trait ExecutionTrigger: Send + Sync {
    async fn trigger(&self, workflow_id: i64, kind: TriggerKind) -> EngineResult<Option<ExecutionTicket>>;
}

#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    tenants: Arc<TenantRegistry>,
    fallback: FallbackExecutor,
    breaker: CircuitBreaker,
    options: EngineOptions,
    /// Executions in flight in this process, per workflow
    in_flight: Mutex<HashMap<i64, usize>>,
}

/// Holds a workflow's in-flight slot until dropped
struct InFlight {
    inner: Arc<Inner>,
    workflow_id: i64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            if let Some(count) = in_flight.get_mut(&self.workflow_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    in_flight.remove(&self.workflow_id);
                }
            }
        }
    }
}

fn failure_message(err: EngineError) -> String {
    match err {
        EngineError::InvalidConfig(message) => message,
        other => other.to_string(),
    }
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        tenants: Arc<TenantRegistry>,
        fallback: FallbackExecutor,
        options: EngineOptions,
    ) -> Self {
        let breaker = CircuitBreaker::new(options.breaker_failure_threshold, options.breaker_reset);
        Self {
            inner: Arc::new(Inner {
                store,
                tenants,
                fallback,
                breaker,
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.inner.tenants
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Whether this process has an execution of `workflow_id` in flight
    pub fn is_running(&self, workflow_id: i64) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|in_flight| in_flight.contains_key(&workflow_id))
            .unwrap_or(false)
    }

    /// Start an execution of `workflow_id`.
    ///
    /// Returns `None` when the trigger is skipped: a cron fire for a workflow
    /// that is no longer active, or an overlapping trigger under
    /// [`OverlapPolicy::Skip`].
    #[instrument(skip(self, trigger), fields(trigger = trigger.as_str()))]
    pub async fn start_execution(
        &self,
        workflow_id: i64,
        trigger: TriggerKind,
    ) -> EngineResult<Option<ExecutionTicket>> {
        let workflow = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("workflow {workflow_id}")))?;

        if trigger == TriggerKind::Cron && workflow.status != WorkflowStatus::Active {
            info!(status = workflow.status.as_str(), "workflow is not active, skipping cron fire");
            return Ok(None);
        }

        let Some(slot) = self.inner.acquire(workflow_id) else {
            return Ok(None);
        };

        let started_at = Utc::now();
        let execution = self.inner.store.create_execution(workflow_id, started_at).await?;
        if let Err(e) = self.inner.store.record_last_run(workflow_id, started_at).await {
            warn!(error = %e, "failed to record last run");
        }
        info!(execution_id = execution.id, "execution started");

        let inner = self.inner.clone();
        let execution_id = execution.id;
        let completion = tokio::spawn(async move {
            let _slot = slot;
            inner.execute(workflow, execution_id).await
        });

        Ok(Some(ExecutionTicket {
            execution_id,
            completion,
        }))
    }

    /// Deal with executions a previous process left `running`: resume the
    /// ones that have durable run ids, fail the rest
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let unfinished = self.inner.store.list_unfinished_executions().await?;
        let mut report = RecoveryReport::default();

        for execution in unfinished {
            let execution_id = execution.id;
            match self.inner.clone().resume(execution).await {
                Some(ticket) => report.resumed.push(ticket),
                None => {
                    let marked = self
                        .inner
                        .store
                        .complete_execution(execution_id, ExecutionCompletion::failed(INTERRUPTED_BY_RESTART))
                        .await?;
                    if marked {
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            failed = report.failed,
            "recovered unfinished executions"
        );
        Ok(report)
    }
}

#[async_trait]
impl ExecutionTrigger for ExecutionEngine {
    async fn trigger(&self, workflow_id: i64, kind: TriggerKind) -> EngineResult<Option<ExecutionTicket>> {
        self.start_execution(workflow_id, kind).await
    }
}

impl Inner {
    fn acquire(self: &Arc<Self>, workflow_id: i64) -> Option<InFlight> {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = in_flight.entry(workflow_id).or_insert(0);

        if *count > 0 {
            match self.options.overlap_policy {
                OverlapPolicy::Skip => {
                    warn!(workflow_id, "execution already in flight, skipping trigger");
                    return None;
                }
                OverlapPolicy::Allow => {
                    warn!(workflow_id, running = *count, "starting overlapping execution");
                }
            }
        }

        *count += 1;
        Some(InFlight {
            inner: self.clone(),
            workflow_id,
        })
    }

    async fn execute(&self, workflow: WorkflowDefinition, execution_id: i64) -> ExecutionStatus {
        let completion = match self.prepare(&workflow, execution_id).await {
            Ok((input, namespace)) => self.dispatch(input, namespace).await,
            Err(e) => {
                warn!(execution_id, error = %e, "execution could not be prepared");
                Some(ExecutionCompletion::failed(failure_message(e)))
            }
        };
        self.settle(execution_id, completion).await
    }

    /// Finish the execution, or leave it `running` when the backend shut
    /// down under it
    async fn settle(&self, execution_id: i64, completion: Option<ExecutionCompletion>) -> ExecutionStatus {
        match completion {
            Some(completion) => self.finish(execution_id, completion).await,
            None => {
                info!(execution_id, "durable run interrupted by shutdown, left for recovery");
                ExecutionStatus::Running
            }
        }
    }

    async fn resolve_query(&self, workflow: &WorkflowDefinition) -> EngineResult<String> {
        if let Some(query) = workflow.literal_query() {
            return Ok(query.to_string());
        }

        if let Some(template_id) = workflow.template_id {
            let template = self.store.get_template_query(template_id).await?;
            if let Some(query) = template.filter(|q| !q.trim().is_empty()) {
                return Ok(query);
            }
        }

        Err(EngineError::InvalidConfig(MISSING_QUERY.to_string()))
    }

    async fn prepare(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: i64,
    ) -> EngineResult<(PipelineInput, TenantNamespace)> {
        let query = self.resolve_query(workflow).await?;

        let namespace = match self.store.get_owner(workflow.owner_id).await? {
            Some(owner) => TenantNamespace::for_owner(&owner),
            None => {
                warn!(owner_id = workflow.owner_id, "owner not found, namespacing by id");
                TenantNamespace::for_identity(None, None, Some(workflow.owner_id))
            }
        };

        let tenant = TenantContext {
            owner_id: workflow.owner_id,
            namespace: namespace.to_string(),
        };
        let input = PipelineInput::new(workflow, execution_id, tenant, query)?;
        Ok((input, namespace))
    }

    async fn dispatch(&self, input: PipelineInput, namespace: TenantNamespace) -> Option<ExecutionCompletion> {
        if self.options.durable_enabled {
            if self.breaker.allow() {
                match self.start_durable(&input, &namespace, None).await {
                    Ok(handle) => return self.await_run(handle).await,
                    Err(e) => {
                        self.breaker.record_failure();
                        warn!(
                            execution_id = input.execution_id,
                            error = %e,
                            "durable backend unavailable, using fallback executor"
                        );
                    }
                }
            } else {
                debug!(execution_id = input.execution_id, "breaker open, using fallback executor");
            }
        }

        Some(match self.fallback.run(&input).await {
            Ok(result) => ExecutionCompletion::success(result.row_count),
            Err(e) => ExecutionCompletion::failed(e.to_string()),
        })
    }

    async fn start_durable(
        &self,
        input: &PipelineInput,
        namespace: &TenantNamespace,
        resume: Option<RunIds>,
    ) -> EngineResult<RunHandle> {
        let backend = self.tenants.backend();
        let timeout = self.options.connect_timeout;

        tokio::time::timeout(timeout, backend.health_check())
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;

        if !self.tenants.ensure(namespace).await {
            return Err(BackendError::NamespaceNotFound(namespace.to_string()).into());
        }

        let ids = resume.unwrap_or_else(|| RunIds::new(input.workflow_id, Utc::now()));
        let handle = backend
            .start_run(RunRequest {
                namespace: namespace.to_string(),
                task_queue: namespace.task_queue(),
                ids: ids.clone(),
                input: input.clone(),
            })
            .await?;
        self.breaker.record_success();

        if let Err(e) = self.store.attach_run_ids(input.execution_id, &ids).await {
            warn!(execution_id = input.execution_id, error = %e, "failed to record durable run ids");
        }
        Ok(handle)
    }

    /// `None` when the run was interrupted and must stay resumable
    async fn await_run(&self, handle: RunHandle) -> Option<ExecutionCompletion> {
        match handle.wait().await {
            RunOutcome::Completed(result) => Some(ExecutionCompletion::success(result.row_count)),
            RunOutcome::Failed { error, .. } => Some(ExecutionCompletion::failed(error)),
            RunOutcome::Cancelled => Some(ExecutionCompletion::failed("cancelled")),
            RunOutcome::Interrupted => None,
        }
    }

    /// Write the terminal status unless something else (a user cancel)
    /// already did, and report the status that stuck
    async fn finish(&self, execution_id: i64, completion: ExecutionCompletion) -> ExecutionStatus {
        let status = completion.status;
        match self.store.complete_execution(execution_id, completion).await {
            Ok(true) => {
                info!(execution_id, status = status.as_str(), "execution finished");
                status
            }
            Ok(false) => {
                debug!(execution_id, "execution already terminal");
                match self.store.get_execution(execution_id).await {
                    Ok(Some(execution)) => execution.status,
                    _ => ExecutionStatus::Failed,
                }
            }
            Err(e) => {
                error!(execution_id, error = %e, "failed to record execution result");
                ExecutionStatus::Failed
            }
        }
    }

    /// Restart the durable run of an interrupted execution. `None` means it
    /// cannot be resumed and should be failed.
    async fn resume(self: Arc<Self>, execution: Execution) -> Option<ExecutionTicket> {
        let execution_id = execution.id;
        let ids = execution.run_ids()?;
        if !self.options.durable_enabled {
            return None;
        }

        let workflow = match self.store.get_workflow(execution.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return None,
            Err(e) => {
                warn!(execution_id, error = %e, "failed to load workflow for recovery");
                return None;
            }
        };

        let (input, namespace) = match self.prepare(&workflow, execution_id).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(execution_id, error = %e, "interrupted execution can no longer be prepared");
                return None;
            }
        };

        let handle = match self.start_durable(&input, &namespace, Some(ids)).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(execution_id, error = %e, "could not resume durable run");
                return None;
            }
        };
        info!(execution_id, workflow_id = workflow.id, "resumed durable run");

        let slot = self.acquire_for_recovery(workflow.id);
        let inner = self.clone();
        let completion = tokio::spawn(async move {
            let _slot = slot;
            let completion = inner.await_run(handle).await;
            inner.settle(execution_id, completion).await
        });

        Some(ExecutionTicket {
            execution_id,
            completion,
        })
    }

    /// Like `acquire` but never skips: the execution already exists
    fn acquire_for_recovery(self: &Arc<Self>, workflow_id: i64) -> InFlight {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            *in_flight.entry(workflow_id).or_insert(0) += 1;
        }
        InFlight {
            inner: self.clone(),
            workflow_id,
        }
    }
}
