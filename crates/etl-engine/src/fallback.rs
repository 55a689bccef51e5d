//! Synchronous fallback executor
//!
//! Runs the three steps inline when the durable backend is not available.
//! No retries and no step rows: the first failure ends the execution and
//! only the execution record is updated, by the caller.

use tracing::{info, instrument, warn};

use crate::error::StepError;
use crate::models::StepKind;
use crate::pipeline::{
    ActivityRegistry, FetchSourceResult, PipelineInput, PipelineResult, SaveResult, TransformResult,
};

pub struct FallbackExecutor {
    activities: ActivityRegistry,
}

impl FallbackExecutor {
    pub fn new(activities: ActivityRegistry) -> Self {
        Self { activities }
    }

    #[instrument(skip_all, fields(execution_id = input.execution_id, workflow_id = input.workflow_id))]
    pub async fn run(&self, input: &PipelineInput) -> Result<PipelineResult, StepError> {
        info!("running pipeline without the durable backend");

        let fetched: FetchSourceResult = self
            .call(StepKind::FetchSource, &input.fetch_payload())
            .await?;
        let transformed: TransformResult = self
            .call(StepKind::Transform, &input.transform_payload(fetched))
            .await?;
        let row_count = transformed.row_count;
        let save: SaveResult = self
            .call(StepKind::SaveDestination, &input.save_payload(transformed))
            .await?;

        info!(row_count, "pipeline completed");
        Ok(PipelineResult { row_count, save })
    }

    async fn call<P, T>(&self, kind: StepKind, payload: &P) -> Result<T, StepError>
    where
        P: serde::Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        self.activities
            .call(kind.activity(), payload)
            .await
            .inspect_err(|e| warn!(step = kind.as_str(), error = %e, "step failed"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::{ActivityHandler, DestinationDescriptor, SourceDescriptor, TenantContext};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: AtomicUsize,
        result: Result<Value, &'static str>,
    }

    impl Counting {
        fn new(result: Result<Value, &'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result,
            })
        }
    }

    #[async_trait]
    impl ActivityHandler for Counting {
        async fn invoke(&self, _: Value) -> Result<Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(StepError::failed)
        }
    }

    fn input() -> PipelineInput {
        PipelineInput {
            workflow_id: 1,
            execution_id: 1,
            tenant: TenantContext {
                owner_id: 1,
                namespace: "user-a".to_string(),
            },
            query: "SELECT 1 AS x".to_string(),
            source: SourceDescriptor::None,
            destination: DestinationDescriptor::Storage,
        }
    }

    fn registry(fetch: Arc<Counting>, transform: Arc<Counting>, save: Arc<Counting>) -> ActivityRegistry {
        ActivityRegistry::new()
            .register_handler(StepKind::FetchSource.activity(), fetch)
            .register_handler(StepKind::Transform.activity(), transform)
            .register_handler(StepKind::SaveDestination.activity(), save)
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let executor = FallbackExecutor::new(registry(
            Counting::new(Ok(json!({}))),
            Counting::new(Ok(json!({ "row_count": 4 }))),
            Counting::new(Ok(json!({ "saved": true }))),
        ));

        let result = executor.run(&input()).await.unwrap();
        assert_eq!(result.row_count, 4);
        assert!(result.save.saved);
    }

    #[tokio::test]
    async fn test_first_failure_stops_without_retry() {
        let transform = Counting::new(Err("table missing"));
        let save = Counting::new(Ok(json!({})));
        let executor = FallbackExecutor::new(registry(
            Counting::new(Ok(json!({}))),
            transform.clone(),
            save.clone(),
        ));

        let err = executor.run(&input()).await.unwrap_err();
        assert_eq!(err.to_string(), "table missing");
        assert_eq!(transform.calls.load(Ordering::SeqCst), 1);
        assert_eq!(save.calls.load(Ordering::SeqCst), 0);
    }
}
