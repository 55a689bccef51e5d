//! Workflow scheduler
//!
//! Keeps one timer task per scheduled workflow. Each task sleeps until the
//! next cron fire and then starts an execution through its
//! [`ExecutionTrigger`]. Cancelling a schedule awaits the task, so no fire
//! can happen once [`Scheduler::cancel`] has returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{ExecutionTrigger, TriggerKind};
use crate::error::{EngineError, EngineResult};
use crate::models::{WorkflowDefinition, WorkflowStatus};
use crate::schedule::{CronSchedule, ScheduleSpec};
use crate::store::{ExecutionCompletion, Store};
use crate::tenant::{TenantNamespace, TenantRegistry};

/// Error recorded on executions cancelled through the scheduler
pub const CANCELLED_BY_USER: &str = "cancelled by user";

struct ScheduleHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ScheduleHandle {
    async fn stop(self, workflow_id: i64) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(workflow_id, error = %e, "schedule task panicked");
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    tenants: Arc<TenantRegistry>,
    trigger: Arc<dyn ExecutionTrigger>,
    error_backoff: Duration,
    schedules: Mutex<HashMap<i64, ScheduleHandle>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        tenants: Arc<TenantRegistry>,
        trigger: Arc<dyn ExecutionTrigger>,
        error_backoff: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tenants,
                trigger,
                error_backoff,
                schedules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start (or replace) the timer for `workflow_id`.
    ///
    /// The expression is validated first; an invalid one is rejected and any
    /// existing schedule is left alone. Run-once values are not timers and
    /// are rejected here; see [`Scheduler::activate`].
    #[instrument(skip(self))]
    pub async fn schedule(&self, workflow_id: i64, cron_expr: &str, owner_id: i64) -> EngineResult<()> {
        let cron = match ScheduleSpec::parse(cron_expr)? {
            ScheduleSpec::Cron(cron) => cron,
            ScheduleSpec::Once => {
                return Err(EngineError::InvalidCron {
                    expression: cron_expr.to_string(),
                    reason: "run-once workflows execute immediately and have no timer".to_string(),
                })
            }
        };

        self.ensure_namespace(owner_id).await;

        let mut schedules = self.inner.schedules.lock().await;
        if let Some(existing) = schedules.remove(&workflow_id) {
            debug!("replacing existing schedule");
            existing.stop(workflow_id).await;
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(run_schedule(self.inner.clone(), workflow_id, cron, token.clone()));
        schedules.insert(workflow_id, ScheduleHandle { token, join });

        info!(expression = cron_expr, "workflow scheduled");
        Ok(())
    }

    /// Stop the timer for `workflow_id` and wait for it to exit. Returns
    /// whether a schedule existed.
    pub async fn cancel(&self, workflow_id: i64) -> bool {
        let mut schedules = self.inner.schedules.lock().await;
        match schedules.remove(&workflow_id) {
            Some(handle) => {
                handle.stop(workflow_id).await;
                info!(workflow_id, "schedule cancelled");
                true
            }
            None => false,
        }
    }

    /// Fail every running execution of the workflow. Backend cancellation is
    /// best effort; the stored status changes regardless.
    #[instrument(skip(self))]
    pub async fn cancel_running_executions(&self, workflow_id: i64, owner_id: i64) -> EngineResult<usize> {
        let running = self.inner.store.list_running_executions(workflow_id).await?;
        if running.is_empty() {
            return Ok(0);
        }

        let namespace = self.namespace_for(owner_id).await;
        let backend = self.inner.tenants.backend();
        let mut cancelled = 0;

        for execution in running {
            // Mark first so the run's own completion cannot overwrite it
            let marked = self
                .inner
                .store
                .complete_execution(execution.id, ExecutionCompletion::failed(CANCELLED_BY_USER))
                .await?;
            if marked {
                cancelled += 1;
            }

            if let Some(ids) = execution.run_ids() {
                if let Err(e) = backend.cancel_run(namespace.as_str(), &ids).await {
                    warn!(
                        execution_id = execution.id,
                        workflow_run = %ids.workflow_id,
                        error = %e,
                        "failed to cancel durable run"
                    );
                }
            }
        }

        info!(cancelled, "running executions cancelled");
        Ok(cancelled)
    }

    /// Schedule every active workflow. Called once at startup.
    pub async fn load_active(&self) -> EngineResult<usize> {
        let workflows = self.inner.store.list_active_workflows().await?;
        let mut loaded = 0;

        for workflow in workflows {
            match ScheduleSpec::parse(&workflow.schedule) {
                Ok(ScheduleSpec::Cron(_)) => {}
                Ok(ScheduleSpec::Once) => {
                    warn!(workflow_id = workflow.id, "active run-once workflow left unscheduled");
                    continue;
                }
                Err(e) => {
                    warn!(workflow_id = workflow.id, error = %e, "skipping workflow with invalid schedule");
                    continue;
                }
            }

            match self.schedule(workflow.id, &workflow.schedule, workflow.owner_id).await {
                Ok(()) => loaded += 1,
                Err(e) => error!(workflow_id = workflow.id, error = %e, "failed to schedule workflow"),
            }
        }

        info!(loaded, "active workflows scheduled");
        Ok(loaded)
    }

    /// Bring a workflow's schedule in line with its definition.
    ///
    /// Run-once workflows execute now; once the execution finishes the
    /// workflow is paused and left without a timer.
    #[instrument(skip(self, workflow), fields(workflow_id = workflow.id))]
    pub async fn activate(&self, workflow: &WorkflowDefinition) -> EngineResult<()> {
        match ScheduleSpec::parse(&workflow.schedule)? {
            ScheduleSpec::Cron(_) => {
                self.schedule(workflow.id, &workflow.schedule, workflow.owner_id)
                    .await
            }
            ScheduleSpec::Once => {
                self.cancel(workflow.id).await;
                self.ensure_namespace(workflow.owner_id).await;

                if let Some(ticket) = self.inner.trigger.trigger(workflow.id, TriggerKind::Manual).await? {
                    match ticket.completion.await {
                        Ok(status) => info!(execution_id = ticket.execution_id, status = status.as_str(), "run-once execution finished"),
                        Err(e) => error!(execution_id = ticket.execution_id, error = %e, "run-once execution task failed"),
                    }
                }

                self.inner
                    .store
                    .set_workflow_status(workflow.id, WorkflowStatus::Paused)
                    .await?;
                self.inner.store.record_next_run(workflow.id, None).await?;
                Ok(())
            }
        }
    }

    /// Stop scheduling a workflow and clear its next run
    pub async fn deactivate(&self, workflow_id: i64) -> EngineResult<()> {
        self.cancel(workflow_id).await;
        self.inner.store.record_next_run(workflow_id, None).await
    }

    pub async fn is_scheduled(&self, workflow_id: i64) -> bool {
        self.inner.schedules.lock().await.contains_key(&workflow_id)
    }

    /// Ids of scheduled workflows, ascending
    pub async fn scheduled_workflows(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.schedules.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel every schedule and wait for the tasks to exit
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, ScheduleHandle)> = self.inner.schedules.lock().await.drain().collect();
        info!(schedules = handles.len(), "stopping scheduler");
        for (workflow_id, handle) in handles {
            handle.stop(workflow_id).await;
        }
    }

    async fn namespace_for(&self, owner_id: i64) -> TenantNamespace {
        match self.inner.store.get_owner(owner_id).await {
            Ok(Some(owner)) => TenantNamespace::for_owner(&owner),
            Ok(None) => TenantNamespace::for_identity(None, None, Some(owner_id)),
            Err(e) => {
                warn!(owner_id, error = %e, "failed to load owner");
                TenantNamespace::for_identity(None, None, Some(owner_id))
            }
        }
    }

    async fn ensure_namespace(&self, owner_id: i64) {
        let namespace = self.namespace_for(owner_id).await;
        if !self.inner.tenants.ensure(&namespace).await {
            warn!(owner_id, namespace = %namespace, "continuing without a registered namespace");
        }
    }
}

enum Tick {
    Fired(DateTime<Utc>),
    Cancelled,
}

async fn run_schedule(inner: Arc<Inner>, workflow_id: i64, cron: CronSchedule, token: CancellationToken) {
    debug!(workflow_id, expression = cron.expression(), "schedule task started");
    let mut previous: Option<DateTime<Utc>> = None;

    loop {
        match tick(&inner, workflow_id, &cron, previous, &token).await {
            Ok(Tick::Fired(at)) => previous = Some(at),
            Ok(Tick::Cancelled) => break,
            Err(e) => {
                error!(
                    workflow_id,
                    error = %e,
                    retry_in = ?inner.error_backoff,
                    "schedule tick failed"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(inner.error_backoff) => {}
                }
            }
        }
    }

    debug!(workflow_id, "schedule task stopped");
}

async fn tick(
    inner: &Inner,
    workflow_id: i64,
    cron: &CronSchedule,
    previous: Option<DateTime<Utc>>,
    token: &CancellationToken,
) -> EngineResult<Tick> {
    let now = Utc::now();
    let next = cron.next_fire(previous, now).ok_or_else(|| EngineError::InvalidCron {
        expression: cron.expression().to_string(),
        reason: "no upcoming fire time".to_string(),
    })?;
    inner.store.record_next_run(workflow_id, Some(next)).await?;

    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    debug!(workflow_id, next_run = %next, "waiting for next fire");

    tokio::select! {
        _ = token.cancelled() => return Ok(Tick::Cancelled),
        _ = tokio::time::sleep(wait) => {}
    }
    if token.is_cancelled() {
        return Ok(Tick::Cancelled);
    }

    if let Some(ticket) = inner.trigger.trigger(workflow_id, TriggerKind::Cron).await? {
        debug!(workflow_id, execution_id = ticket.execution_id, "cron fire started execution");
    }
    Ok(Tick::Fired(next))
}
