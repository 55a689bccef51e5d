//! Step 2: load sources into the tenant database and run the query

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{Activity, FileFormat, FileSpec, PipelineServices, TransformPayload, TransformResult};
use crate::analytics::{
    parse_csv, parse_json_rows, sanitize_identifier, validate_identifier, TenantDatabase,
    SOURCE_DATA_TABLE,
};
use crate::error::StepError;
use crate::tenant::bucket_for;

pub const MISSING_QUERY: &str = "No query or template defined";

fn unsupported_format(file: &FileSpec) -> StepError {
    StepError::InvalidConfig(format!("{}: parquet sources are not supported", file.path))
}

pub struct TransformData {
    services: Arc<PipelineServices>,
}

impl TransformData {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    async fn load_file(
        &self,
        db: &TenantDatabase,
        bucket: &str,
        file: &FileSpec,
    ) -> Result<u64, StepError> {
        // Names the user typed must already be safe; names taken from the
        // file itself are cleaned up
        let table = match &file.table_name {
            Some(name) if !name.trim().is_empty() => validate_identifier(name.trim())?.to_string(),
            _ => sanitize_identifier(&file.raw_table_name()),
        };

        if file.format == FileFormat::Parquet {
            return Err(unsupported_format(file));
        }

        let bytes = self.services.objects.get_object(bucket, &file.path).await?;
        debug!(path = %file.path, table = %table, size = bytes.len(), "loading source file");

        match file.format {
            FileFormat::Csv => {
                let (headers, rows) = parse_csv(&bytes)?;
                db.load_table(&table, &headers, &rows).await
            }
            FileFormat::Json => {
                let rows = parse_json_rows(&bytes)?;
                db.load_rows(&table, &rows).await
            }
            FileFormat::Parquet => Err(unsupported_format(file)),
        }
    }
}

#[async_trait]
impl Activity for TransformData {
    const NAME: &'static str = "transform_data";
    type Payload = TransformPayload;
    type Output = TransformResult;

    #[instrument(skip(self, payload), fields(execution_id = payload.execution_id, owner_id = payload.tenant.owner_id))]
    async fn run(&self, payload: TransformPayload) -> Result<TransformResult, StepError> {
        let query = payload.query.trim();
        if query.is_empty() {
            return Err(StepError::InvalidConfig(MISSING_QUERY.to_string()));
        }

        let db = self.services.analytics.database(payload.tenant.owner_id).await?;

        if !payload.source.files.is_empty() {
            let bucket = bucket_for(&payload.tenant.namespace);
            for file in &payload.source.files {
                self.load_file(&db, &bucket, file).await?;
            }
        }

        if !payload.source.data.is_empty() {
            db.load_rows(SOURCE_DATA_TABLE, &payload.source.data).await?;
        }

        let result = db.query(query).await?;
        info!(row_count = result.row_count, "transform complete");
        Ok(result)
    }
}
