//! Step 3: write the transformed rows to the workflow destination

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::{Activity, DestinationDescriptor, PipelineServices, SavePayload, SaveResult, TransformResult};
use crate::error::StepError;
use crate::storage::output_key;
use crate::tenant::bucket_for;

const CSV_CONTENT_TYPE: &str = "text/csv";

/// Render rows as CSV. Headers come from the query columns, or from the
/// first row when the result carries none.
pub fn render_csv(result: &TransformResult) -> Result<Vec<u8>, StepError> {
    let headers: Vec<String> = if result.columns.is_empty() {
        result
            .data
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        result.columns.clone()
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !headers.is_empty() {
        writer.write_record(&headers)?;
    }

    for row in &result.data {
        let record = headers.iter().map(|column| match row.get(column) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        });
        writer.write_record(record)?;
    }

    writer
        .into_inner()
        .map_err(|e| StepError::failed(format!("failed to flush CSV output: {}", e.error())))
}

pub struct SaveToDestination {
    services: Arc<PipelineServices>,
}

impl SaveToDestination {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    async fn save_to_storage(&self, payload: &SavePayload) -> Result<SaveResult, StepError> {
        let bucket = bucket_for(&payload.tenant.namespace);
        let key = output_key(payload.workflow_id, payload.execution_id);
        let body = render_csv(&payload.data)?;

        self.services.objects.ensure_bucket(&bucket).await?;
        self.services
            .objects
            .put_object(&bucket, &key, body, Some(CSV_CONTENT_TYPE))
            .await?;

        Ok(SaveResult {
            saved: true,
            row_count: payload.data.row_count,
            message: Some(format!("Saved {} row(s) to {bucket}/{key}", payload.data.row_count)),
            object: Some(key),
            bucket: Some(bucket),
            status_code: None,
        })
    }

    async fn post_to_webhook(&self, url: &str, payload: &SavePayload) -> Result<SaveResult, StepError> {
        let response = self
            .services
            .http
            .post(url)
            .json(&payload.data.data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "webhook rejected the result");
        }

        Ok(SaveResult {
            saved: status.is_success(),
            row_count: payload.data.row_count,
            status_code: Some(status.as_u16()),
            message: Some(format!("Posted to webhook: {status}")),
            ..SaveResult::default()
        })
    }
}

#[async_trait]
impl Activity for SaveToDestination {
    const NAME: &'static str = "save_to_destination";
    type Payload = SavePayload;
    type Output = SaveResult;

    #[instrument(skip(self, payload), fields(execution_id = payload.execution_id, workflow_id = payload.workflow_id))]
    async fn run(&self, payload: SavePayload) -> Result<SaveResult, StepError> {
        let result = match &payload.destination {
            DestinationDescriptor::Storage => self.save_to_storage(&payload).await?,
            DestinationDescriptor::Webhook { url } => self.post_to_webhook(url, &payload).await?,
            DestinationDescriptor::Ftp => SaveResult {
                row_count: payload.data.row_count,
                message: Some("FTP not yet implemented".to_string()),
                ..SaveResult::default()
            },
        };

        info!(saved = result.saved, row_count = result.row_count, "destination written");
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::analytics::{into_row, AnalyticsRegistry};
    use crate::pipeline::TenantContext;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use serde_json::json;
    use std::time::Duration;

    fn result(columns: &[&str], rows: Vec<Value>) -> TransformResult {
        let data: Vec<_> = rows.into_iter().map(into_row).collect();
        TransformResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            row_count: data.len() as i64,
            data,
        }
    }

    #[test]
    fn test_render_csv_formats_cells() {
        let data = result(
            &["id", "name", "score"],
            vec![
                json!({ "id": 1, "name": "alice", "score": 1.5 }),
                json!({ "id": 2, "name": "bob, jr", "score": null }),
            ],
        );
        let csv = String::from_utf8(render_csv(&data).unwrap()).unwrap();
        assert_eq!(csv, "id,name,score\n1,alice,1.5\n2,\"bob, jr\",\n");
    }

    #[test]
    fn test_render_csv_without_columns_uses_first_row() {
        let data = result(&[], vec![json!({ "x": 1 })]);
        let csv = String::from_utf8(render_csv(&data).unwrap()).unwrap();
        assert_eq!(csv, "x\n1\n");

        assert!(render_csv(&TransformResult::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_destination_writes_tenant_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        let services = PipelineServices::new(
            objects.clone(),
            Arc::new(AnalyticsRegistry::new(dir.path())),
            Duration::from_secs(5),
        )
        .unwrap();
        let step = SaveToDestination::new(Arc::new(services));

        let saved = step
            .run(SavePayload {
                execution_id: 9,
                workflow_id: 3,
                tenant: TenantContext {
                    owner_id: 1,
                    namespace: "user-alice_b".to_string(),
                },
                destination: DestinationDescriptor::Storage,
                data: result(&["x"], vec![json!({ "x": 1 })]),
            })
            .await
            .unwrap();

        assert!(saved.saved);
        assert_eq!(saved.bucket.as_deref(), Some("user-alice-b"));
        assert_eq!(saved.object.as_deref(), Some("transformed/workflow_3_9.csv"));
        assert_eq!(objects.keys("user-alice-b"), vec!["transformed/workflow_3_9.csv"]);

        let body = objects.get_object("user-alice-b", "transformed/workflow_3_9.csv").await.unwrap();
        assert_eq!(body, b"x\n1\n");
    }
}
