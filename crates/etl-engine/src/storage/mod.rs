use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

use crate::error::{EngineError, EngineResult};

pub mod config;
pub mod memory;

pub use memory::MemoryObjectStore;

/// Prefix for files users upload as pipeline sources
pub const UPLOADS_PREFIX: &str = "uploads/";

/// Prefix for pipeline output
pub const TRANSFORMED_PREFIX: &str = "transformed/";

/// Object key of an execution's output. Stable per execution so a retried
/// save overwrites its earlier attempt.
pub fn output_key(workflow_id: i64, execution_id: i64) -> String {
    format!("{TRANSFORMED_PREFIX}workflow_{workflow_id}_{execution_id}.csv")
}

/// Bucket-scoped object operations the pipeline needs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn ensure_bucket(&self, bucket: &str) -> EngineResult<()>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> EngineResult<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>>;
}

fn storage_error(e: anyhow::Error) -> EngineError {
    EngineError::Storage(format!("{e:#}"))
}

/// S3 / MinIO client
#[derive(Clone)]
pub struct Storage {
    client: Client,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "etl-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(endpoint = ?config.endpoint, region = %config.region, "Storage client initialized");

        Ok(Self { client })
    }

    async fn create_bucket_if_missing(&self, bucket: &str) -> Result<()> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }

        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!("Created bucket {}", bucket);
                Ok(())
            }
            Err(e) => {
                let already_there = e
                    .as_service_error()
                    .map(|s| s.is_bucket_already_owned_by_you() || s.is_bucket_already_exists())
                    .unwrap_or(false);
                if already_there {
                    Ok(())
                } else {
                    Err(e).context(format!("Failed to create bucket {bucket}"))
                }
            }
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request.send().await.context("Failed to upload to S3")?;

        info!("Successfully uploaded to s3://{}/{}", bucket, key);
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading from s3://{}/{}", bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to download from S3: {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }
}

#[async_trait]
impl ObjectStore for Storage {
    #[instrument(skip(self))]
    async fn ensure_bucket(&self, bucket: &str) -> EngineResult<()> {
        self.create_bucket_if_missing(bucket).await.map_err(storage_error)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> EngineResult<()> {
        self.upload(bucket, key, data, content_type)
            .await
            .map_err(storage_error)
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> EngineResult<Vec<u8>> {
        self.download(bucket, key).await.map_err(storage_error)
    }
}
