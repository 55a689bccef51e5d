//! Payloads and results exchanged between pipeline steps
//!
//! Every activity takes one JSON payload and returns one JSON result. The
//! typed structs here are the canonical shapes; the durable supervisor stores
//! results as JSON so a resumed run can feed them to the next step.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::models::WorkflowDefinition;

/// A row produced by a source or by the transform query
pub type Row = Map<String, Value>;

/// File format of an uploaded source object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Json,
    Parquet,
}

/// One uploaded object to load as a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Object key inside the tenant bucket
    pub path: String,
    /// Target table; derived from the file name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub format: FileFormat,
}

impl FileSpec {
    /// Table name as written by the user, or the file stem
    pub fn raw_table_name(&self) -> String {
        match &self.table_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                let file = self.path.rsplit('/').next().unwrap_or(&self.path);
                file.split('.').next().unwrap_or(file).to_string()
            }
        }
    }
}

/// Where step 1 reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDescriptor {
    None,
    File { files: Vec<FileSpec> },
    Api { url: String },
    Ftp,
}

impl SourceDescriptor {
    /// Build from the workflow's `source_type`/`source_config` columns
    pub fn from_config(source_type: &str, config: &Value) -> EngineResult<Self> {
        match source_type.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(SourceDescriptor::None),
            "file" => {
                let files = match config.get("files") {
                    Some(files) => serde_json::from_value(files.clone()).map_err(|e| {
                        EngineError::InvalidConfig(format!("invalid file source: {e}"))
                    })?,
                    None => Vec::new(),
                };
                Ok(SourceDescriptor::File { files })
            }
            "api" => {
                let url = config
                    .get("url")
                    .and_then(Value::as_str)
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| EngineError::InvalidConfig("api source needs a url".into()))?;
                Ok(SourceDescriptor::Api {
                    url: url.to_string(),
                })
            }
            "ftp" => Ok(SourceDescriptor::Ftp),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown source type {other:?}"
            ))),
        }
    }
}

/// Where step 3 writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationDescriptor {
    Storage,
    Webhook { url: String },
    Ftp,
}

impl DestinationDescriptor {
    /// Build from the workflow's `destination_type`/`destination_config` columns
    pub fn from_config(destination_type: &str, config: &Value) -> EngineResult<Self> {
        match destination_type.trim().to_ascii_lowercase().as_str() {
            "" | "storage" => Ok(DestinationDescriptor::Storage),
            "webhook" => {
                let url = config
                    .get("url")
                    .and_then(Value::as_str)
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| {
                        EngineError::InvalidConfig("webhook destination needs a url".into())
                    })?;
                Ok(DestinationDescriptor::Webhook {
                    url: url.to_string(),
                })
            }
            "ftp" => Ok(DestinationDescriptor::Ftp),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown destination type {other:?}"
            ))),
        }
    }
}

/// The tenant an execution runs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub owner_id: i64,
    pub namespace: String,
}

/// Everything the pipeline needs, fixed when the execution is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInput {
    pub workflow_id: i64,
    pub execution_id: i64,
    pub tenant: TenantContext,
    pub query: String,
    pub source: SourceDescriptor,
    pub destination: DestinationDescriptor,
}

impl PipelineInput {
    pub fn new(
        workflow: &WorkflowDefinition,
        execution_id: i64,
        tenant: TenantContext,
        query: String,
    ) -> EngineResult<Self> {
        Ok(Self {
            workflow_id: workflow.id,
            execution_id,
            tenant,
            query,
            source: SourceDescriptor::from_config(&workflow.source_type, &workflow.source_config)?,
            destination: DestinationDescriptor::from_config(
                &workflow.destination_type,
                &workflow.destination_config,
            )?,
        })
    }

    pub fn fetch_payload(&self) -> FetchSourcePayload {
        FetchSourcePayload {
            execution_id: self.execution_id,
            tenant: self.tenant.clone(),
            source: self.source.clone(),
        }
    }

    pub fn transform_payload(&self, fetched: FetchSourceResult) -> TransformPayload {
        TransformPayload {
            execution_id: self.execution_id,
            tenant: self.tenant.clone(),
            query: self.query.clone(),
            source: fetched,
        }
    }

    pub fn save_payload(&self, transformed: TransformResult) -> SavePayload {
        SavePayload {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            tenant: self.tenant.clone(),
            destination: self.destination.clone(),
            data: transformed,
        }
    }
}

/// Input of `fetch_source_data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSourcePayload {
    pub execution_id: i64,
    pub tenant: TenantContext,
    pub source: SourceDescriptor,
}

/// Output of `fetch_source_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchSourceResult {
    #[serde(default)]
    pub data: Vec<Row>,
    #[serde(default)]
    pub row_count: i64,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FetchSourceResult {
    pub fn summary(&self) -> Value {
        let files: Vec<&str> = self.files.iter().map(|f| f.path.as_str()).collect();
        json!({ "row_count": self.row_count, "files": files, "message": self.message })
    }
}

/// Input of `transform_data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformPayload {
    pub execution_id: i64,
    pub tenant: TenantContext,
    pub query: String,
    pub source: FetchSourceResult,
}

/// Output of `transform_data`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub data: Vec<Row>,
    #[serde(default)]
    pub row_count: i64,
}

impl TransformResult {
    pub fn summary(&self) -> Value {
        json!({ "row_count": self.row_count, "columns": self.columns })
    }
}

/// Input of `save_to_destination`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavePayload {
    pub execution_id: i64,
    pub workflow_id: i64,
    pub tenant: TenantContext,
    pub destination: DestinationDescriptor,
    pub data: TransformResult,
}

/// Output of `save_to_destination`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveResult {
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub row_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SaveResult {
    pub fn summary(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Aggregate result of a successful pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Rows produced by the transform step
    pub row_count: i64,
    pub save: SaveResult,
}

/// Pipeline states, driven by the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Fetching,
    Transforming,
    Saving,
    Success,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Success | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Fetching => "fetching",
            PipelineState::Transforming => "transforming",
            PipelineState::Saving => "saving",
            PipelineState::Success => "success",
            PipelineState::Failed => "failed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_source_descriptor_from_config() {
        assert_eq!(
            SourceDescriptor::from_config("none", &json!({})).unwrap(),
            SourceDescriptor::None
        );

        let files = SourceDescriptor::from_config(
            "file",
            &json!({ "files": [{ "path": "uploads/sales 2024.csv" }, { "path": "uploads/x.json", "table_name": "x", "format": "json" }] }),
        )
        .unwrap();
        let SourceDescriptor::File { files } = files else {
            panic!("expected file source");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].format, FileFormat::Csv);
        assert_eq!(files[0].raw_table_name(), "sales 2024");
        assert_eq!(files[1].format, FileFormat::Json);

        assert!(matches!(
            SourceDescriptor::from_config("api", &json!({})),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(SourceDescriptor::from_config("gopher", &json!({})).is_err());
    }

    #[test]
    fn test_destination_descriptor_from_config() {
        assert_eq!(
            DestinationDescriptor::from_config("storage", &Value::Null).unwrap(),
            DestinationDescriptor::Storage
        );
        assert_eq!(
            DestinationDescriptor::from_config("webhook", &json!({ "url": "http://hook" })).unwrap(),
            DestinationDescriptor::Webhook {
                url: "http://hook".to_string()
            }
        );
        assert!(DestinationDescriptor::from_config("webhook", &json!({ "url": " " })).is_err());
    }

    #[test]
    fn test_results_tolerate_missing_fields() {
        let fetched: FetchSourceResult = serde_json::from_value(json!({ "row_count": 2 })).unwrap();
        assert!(fetched.data.is_empty());
        let saved: SaveResult = serde_json::from_value(json!({ "saved": true })).unwrap();
        assert_eq!(saved.object, None);
    }

    #[test]
    fn test_save_summary_omits_empty_fields() {
        let saved = SaveResult {
            saved: true,
            row_count: 1,
            object: Some("transformed/workflow_1_2.csv".to_string()),
            ..SaveResult::default()
        };
        let summary = saved.summary();
        assert_eq!(summary["object"], "transformed/workflow_1_2.csv");
        assert!(summary.get("status_code").is_none());
    }
}
