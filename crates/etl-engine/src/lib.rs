//! ETL Engine Library
//!
//! Multi-tenant workflow scheduling and durable pipeline execution.
//!
//! # Overview
//!
//! A workflow is a cron schedule plus a three-step pipeline:
//!
//! 1. **fetch**: resolve the source (uploaded files, an HTTP API, or nothing)
//! 2. **transform**: load the source into the owner's SQLite database and
//!    run the workflow's SQL
//! 3. **save**: write the result to object storage or POST it to a webhook
//!
//! # Architecture
//!
//! - [`scheduler::Scheduler`] keeps one timer task per active workflow and
//!   fires executions through the [`engine::ExecutionEngine`].
//! - The engine creates the execution record and hands the pipeline to the
//!   durable backend ([`durable::LocalBackend`]), whose
//!   [`durable::PipelineSupervisor`] records a row per step and retries each
//!   step under its [`durable::StepPolicy`].
//! - When the backend is disabled or a [`durable::CircuitBreaker`] says it is
//!   unhealthy, the engine runs the steps inline on the
//!   [`fallback::FallbackExecutor`] instead.
//! - Every owner gets a [`tenant::TenantNamespace`], registered lazily with
//!   the backend by the [`tenant::TenantRegistry`].
//!
//! State lives behind the [`store::Store`] traits: [`store::PgStore`] in
//! production, [`store::MemoryStore`] for tests and embedding.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use etl_engine::analytics::AnalyticsRegistry;
//! use etl_engine::durable::{LocalBackend, PipelinePolicy, PipelineSupervisor};
//! use etl_engine::engine::{EngineOptions, ExecutionEngine, TriggerKind};
//! use etl_engine::fallback::FallbackExecutor;
//! use etl_engine::pipeline::{pipeline_activities, PipelineServices};
//! use etl_engine::storage::MemoryObjectStore;
//! use etl_engine::store::{MemoryStore, Store};
//! use etl_engine::tenant::TenantRegistry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let services = PipelineServices::new(
//!     Arc::new(MemoryObjectStore::new()),
//!     Arc::new(AnalyticsRegistry::new("./data")),
//!     Duration::from_secs(60),
//! )?;
//! let activities = pipeline_activities(Arc::new(services));
//!
//! let supervisor = PipelineSupervisor::new(store.clone(), activities.clone(), PipelinePolicy::default());
//! let backend = Arc::new(LocalBackend::new(Arc::new(supervisor)));
//! let tenants = Arc::new(TenantRegistry::new(backend, Duration::from_secs(7 * 86_400), Duration::from_secs(10)));
//!
//! let engine = ExecutionEngine::new(store, tenants, FallbackExecutor::new(activities), EngineOptions::default());
//! if let Some(ticket) = engine.start_execution(1, TriggerKind::Manual).await? {
//!     let status = ticket.completion.await?;
//!     println!("execution {} finished: {}", ticket.execution_id, status.as_str());
//! }
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod models;
pub mod pipeline;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod tenant;

// Re-export commonly used types
pub use error::{BackendError, EngineError, EngineResult, StepError};
