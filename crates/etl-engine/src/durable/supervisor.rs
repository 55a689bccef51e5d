//! Pipeline supervisor
//!
//! Drives one execution through `pending -> fetching -> transforming ->
//! saving -> success`, with `failed` reachable from every non-terminal state.
//! Each step gets one `workflow_execution_steps` row, written `running`
//! before the first attempt and flipped to its terminal status afterwards.
//! Retries reuse the row and bump its attempt counter.
//!
//! Steps that already finished (a resumed run) are not invoked again: their
//! stored result is fed to the next step instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backend::RunOutcome;
use super::policy::{PipelinePolicy, StepPolicy};
use crate::error::StepError;
use crate::models::{ExecutionStep, StepKind, StepStatus};
use crate::pipeline::{
    ActivityRegistry, FetchSourceResult, PipelineInput, PipelineResult, PipelineState, SaveResult,
    TransformResult,
};
use crate::store::{StepCompletion, Store};

/// A step result that can be summarised for the step row
trait StepResult: DeserializeOwned {
    fn summary(&self) -> Value;
}

impl StepResult for FetchSourceResult {
    fn summary(&self) -> Value {
        FetchSourceResult::summary(self)
    }
}

impl StepResult for TransformResult {
    fn summary(&self) -> Value {
        TransformResult::summary(self)
    }
}

impl StepResult for SaveResult {
    fn summary(&self) -> Value {
        SaveResult::summary(self)
    }
}

pub struct PipelineSupervisor {
    store: Arc<dyn Store>,
    activities: ActivityRegistry,
    policy: PipelinePolicy,
}

impl PipelineSupervisor {
    pub fn new(store: Arc<dyn Store>, activities: ActivityRegistry, policy: PipelinePolicy) -> Self {
        Self {
            store,
            activities,
            policy,
        }
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    /// Run (or resume) the pipeline for `input.execution_id`.
    ///
    /// Never writes the execution's own status; the caller does that from
    /// the returned outcome.
    #[instrument(skip_all, fields(execution_id = input.execution_id, workflow_id = input.workflow_id))]
    pub async fn run(&self, input: &PipelineInput, cancel: &CancellationToken) -> RunOutcome {
        let mut completed: HashMap<StepKind, ExecutionStep> =
            match self.store.list_steps(input.execution_id).await {
                Ok(steps) => steps
                    .into_iter()
                    .filter_map(|step| step.kind().map(|kind| (kind, step)))
                    .collect(),
                Err(e) => {
                    return RunOutcome::Failed {
                        step: None,
                        error: format!("failed to load step history: {e}"),
                    }
                }
            };

        let mut state = PipelineState::Pending;
        let mut fetched: Option<FetchSourceResult> = None;
        let mut transformed: Option<TransformResult> = None;
        let mut result: Option<PipelineResult> = None;
        let mut failure: Option<RunOutcome> = None;

        while !state.is_terminal() {
            debug!(state = state.as_str(), "pipeline state");

            state = match state {
                PipelineState::Pending => PipelineState::Fetching,
                PipelineState::Fetching => {
                    let payload = input.fetch_payload();
                    match self
                        .step::<FetchSourceResult>(input, StepKind::FetchSource, &payload, &mut completed, cancel)
                        .await
                    {
                        Ok(out) => {
                            fetched = Some(out);
                            PipelineState::Transforming
                        }
                        Err(outcome) => {
                            failure = Some(outcome);
                            PipelineState::Failed
                        }
                    }
                }
                PipelineState::Transforming => {
                    let payload = input.transform_payload(fetched.take().unwrap_or_default());
                    match self
                        .step::<TransformResult>(input, StepKind::Transform, &payload, &mut completed, cancel)
                        .await
                    {
                        Ok(out) => {
                            transformed = Some(out);
                            PipelineState::Saving
                        }
                        Err(outcome) => {
                            failure = Some(outcome);
                            PipelineState::Failed
                        }
                    }
                }
                PipelineState::Saving => {
                    let data = transformed.take().unwrap_or_default();
                    let row_count = data.row_count;
                    let payload = input.save_payload(data);
                    match self
                        .step::<SaveResult>(input, StepKind::SaveDestination, &payload, &mut completed, cancel)
                        .await
                    {
                        Ok(save) => {
                            result = Some(PipelineResult { row_count, save });
                            PipelineState::Success
                        }
                        Err(outcome) => {
                            failure = Some(outcome);
                            PipelineState::Failed
                        }
                    }
                }
                terminal => terminal,
            };
        }

        if let Some(outcome) = failure {
            return outcome;
        }
        match result {
            Some(result) => {
                info!(row_count = result.row_count, "pipeline completed");
                RunOutcome::Completed(result)
            }
            None => RunOutcome::Failed {
                step: None,
                error: "pipeline finished without a result".to_string(),
            },
        }
    }

    async fn step<T: StepResult>(
        &self,
        input: &PipelineInput,
        kind: StepKind,
        payload: &impl Serialize,
        completed: &mut HashMap<StepKind, ExecutionStep>,
        cancel: &CancellationToken,
    ) -> Result<T, RunOutcome> {
        let execution_id = input.execution_id;
        let fail = |error: String| RunOutcome::Failed {
            step: Some(kind),
            error,
        };

        if let Some(prior) = completed.remove(&kind) {
            match prior.status {
                StepStatus::Success => match prior.result.map(serde_json::from_value::<T>) {
                    Some(Ok(out)) => {
                        info!(step = kind.as_str(), "step already completed, reusing its result");
                        return Ok(out);
                    }
                    Some(Err(e)) => {
                        return Err(fail(format!("stored result of {} is unreadable: {e}", kind.as_str())))
                    }
                    None => {
                        return Err(fail(format!("stored result of {} is missing", kind.as_str())))
                    }
                },
                StepStatus::Failed => {
                    return Err(fail(
                        prior
                            .error_message
                            .unwrap_or_else(|| format!("{} failed", kind.as_str())),
                    ))
                }
                StepStatus::Running => {
                    info!(step = kind.as_str(), attempts = prior.attempts, "resuming interrupted step");
                }
            }
        }

        let payload = serde_json::to_value(payload).map_err(|e| fail(e.to_string()))?;
        self.store
            .begin_step(execution_id, kind)
            .await
            .map_err(|e| fail(format!("failed to record step start: {e}")))?;
        info!(step = kind.as_str(), "step started");

        let policy = self.policy.for_step(kind);
        let outcome = match self.attempts(execution_id, kind, policy, payload, cancel).await {
            Ok(value) => serde_json::from_value::<T>(value.clone())
                .map(|out| (out, value))
                .map_err(StepError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok((out, value)) => {
                self.finish_step(execution_id, kind, StepCompletion::success(out.summary(), value))
                    .await;
                info!(step = kind.as_str(), "step succeeded");
                Ok(out)
            }
            Err(e) => {
                error!(step = kind.as_str(), error = %e, "step failed");
                self.finish_step(execution_id, kind, StepCompletion::failed(e.to_string()))
                    .await;
                Err(match e {
                    StepError::Cancelled => RunOutcome::Cancelled,
                    e => fail(e.to_string()),
                })
            }
        }
    }

    /// Invoke the step's activity until it succeeds, fails terminally or the
    /// attempt budget runs out
    async fn attempts(
        &self,
        execution_id: i64,
        kind: StepKind,
        policy: &StepPolicy,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        let mut attempt = 1;
        loop {
            let invocation = tokio::time::timeout(
                policy.timeout,
                self.activities.invoke(kind.activity(), payload.clone()),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(StepError::Cancelled),
                r = invocation => r.unwrap_or(Err(StepError::TimedOut(policy.timeout))),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => e,
                Err(e) => return Err(e),
            };

            let delay = policy.backoff(attempt);
            warn!(
                step = kind.as_str(),
                attempt,
                max_attempts = policy.max_attempts,
                retry_in = ?delay,
                error = %err,
                "step attempt failed, retrying"
            );
            if let Err(e) = self
                .store
                .record_step_attempt(execution_id, kind, &err.to_string())
                .await
            {
                warn!(step = kind.as_str(), error = %e, "failed to record step attempt");
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn finish_step(&self, execution_id: i64, kind: StepKind, completion: StepCompletion) {
        match self.store.complete_step(execution_id, kind, completion).await {
            Ok(true) => {}
            Ok(false) => debug!(step = kind.as_str(), "step row already terminal"),
            Err(e) => error!(step = kind.as_str(), error = %e, "failed to record step completion"),
        }
    }
}
