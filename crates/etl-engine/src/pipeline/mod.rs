//! The three pipeline steps and the data they exchange
//!
//! `fetch_source_data` resolves the source, `transform_data` loads it into
//! the tenant's analytical database and runs the workflow query, and
//! `save_to_destination` writes the result out. Each step is an
//! [`Activity`] so the durable supervisor and the fallback executor dispatch
//! them the same way.

use std::sync::Arc;
use std::time::Duration;

use crate::analytics::AnalyticsRegistry;
use crate::storage::ObjectStore;

pub mod activity;
pub mod fetch;
pub mod save;
pub mod transform;
pub mod types;

pub use activity::{Activity, ActivityHandler, ActivityRegistry};
pub use fetch::FetchSourceData;
pub use save::SaveToDestination;
pub use transform::TransformData;
pub use types::*;

/// Shared clients the step implementations use
pub struct PipelineServices {
    pub objects: Arc<dyn ObjectStore>,
    pub analytics: Arc<AnalyticsRegistry>,
    pub http: reqwest::Client,
}

impl PipelineServices {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        analytics: Arc<AnalyticsRegistry>,
        http_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(concat!("etl-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            objects,
            analytics,
            http,
        })
    }
}

/// Registry with the three production steps
pub fn pipeline_activities(services: Arc<PipelineServices>) -> ActivityRegistry {
    ActivityRegistry::new()
        .register(FetchSourceData::new(services.clone()))
        .register(TransformData::new(services.clone()))
        .register(SaveToDestination::new(services))
}
