//! Common test utilities for ETL engine integration tests
//!
//! [`Harness`] wires the whole engine over in-memory state: a
//! [`MemoryStore`], a [`MemoryObjectStore`], per-tenant SQLite databases in a
//! temporary directory and the in-process durable backend.
//!
//! [`TestPostgres`] starts a PostgreSQL container with migrations applied
//! for the tests that exercise [`etl_engine::store::PgStore`]. Those tests
//! are `#[ignore]`d because they need Docker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

use etl_engine::analytics::AnalyticsRegistry;
use etl_engine::config::OverlapPolicy;
use etl_engine::durable::{LocalBackend, PipelinePolicy, PipelineSupervisor};
use etl_engine::engine::{EngineOptions, ExecutionEngine, ExecutionTicket, TriggerKind};
use etl_engine::error::StepError;
use etl_engine::fallback::FallbackExecutor;
use etl_engine::models::{ExecutionStatus, Owner, WorkflowDefinition};
use etl_engine::pipeline::{pipeline_activities, ActivityHandler, ActivityRegistry, PipelineServices};
use etl_engine::scheduler::Scheduler;
use etl_engine::storage::MemoryObjectStore;
use etl_engine::store::MemoryStore;
use etl_engine::tenant::{TenantNamespace, TenantRegistry};

pub const OWNER_ID: i64 = 1;
pub const OWNER_NAME: &str = "alice";

/// Route engine logs to the test writer. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,etl_engine=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

/// Namespace of the default owner
pub fn owner_namespace() -> TenantNamespace {
    TenantNamespace::for_identity(Some(OWNER_NAME), None, None)
}

/// Bucket of the default owner
pub fn owner_bucket() -> String {
    owner_namespace().bucket_name()
}

// ============================================================================
// In-memory engine
// ============================================================================

/// Knobs for [`Harness::start_with`]
pub struct HarnessOptions {
    pub durable_enabled: bool,
    pub overlap_policy: OverlapPolicy,
    /// Replaces the production step activities
    pub activities: Option<ActivityRegistry>,
    /// Zero backoff keeps retry tests fast without pausing time
    pub policy: PipelinePolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            durable_enabled: true,
            overlap_policy: OverlapPolicy::Skip,
            activities: None,
            policy: PipelinePolicy::default().without_backoff(),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub analytics: Arc<AnalyticsRegistry>,
    pub backend: Arc<LocalBackend>,
    pub tenants: Arc<TenantRegistry>,
    pub engine: ExecutionEngine,
    pub scheduler: Scheduler,
    data_dir: Arc<TempDir>,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(HarnessOptions::default())
    }

    pub fn start_with(options: HarnessOptions) -> Self {
        init_test_tracing();
        let data_dir = Arc::new(tempfile::tempdir().expect("create data dir"));
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let analytics = Arc::new(AnalyticsRegistry::new(data_dir.path()));

        store
            .insert_owner(Owner {
                id: OWNER_ID,
                username: Some(OWNER_NAME.to_string()),
                email: Some("alice@example.com".to_string()),
            })
            .expect("insert owner");

        Self::assemble(store, objects, analytics, data_dir, options)
    }

    /// A second process over the same store, objects and tenant databases,
    /// with a fresh durable backend. Its `recover` sees what this one left.
    pub fn restart_with(&self, options: HarnessOptions) -> Self {
        Self::assemble(
            self.store.clone(),
            self.objects.clone(),
            self.analytics.clone(),
            self.data_dir.clone(),
            options,
        )
    }

    fn assemble(
        store: Arc<MemoryStore>,
        objects: Arc<MemoryObjectStore>,
        analytics: Arc<AnalyticsRegistry>,
        data_dir: Arc<TempDir>,
        options: HarnessOptions,
    ) -> Self {
        let activities = options.activities.unwrap_or_else(|| {
            let services = PipelineServices::new(objects.clone(), analytics.clone(), Duration::from_secs(10))
                .expect("build http client");
            pipeline_activities(Arc::new(services))
        });

        let supervisor = PipelineSupervisor::new(store.clone(), activities.clone(), options.policy);
        let backend = Arc::new(LocalBackend::new(Arc::new(supervisor)));
        let tenants = Arc::new(TenantRegistry::new(
            backend.clone(),
            Duration::from_secs(7 * 86_400),
            Duration::from_secs(5),
        ));

        let engine = ExecutionEngine::new(
            store.clone(),
            tenants.clone(),
            FallbackExecutor::new(activities),
            EngineOptions {
                durable_enabled: options.durable_enabled,
                overlap_policy: options.overlap_policy,
                connect_timeout: Duration::from_secs(5),
                breaker_failure_threshold: 3,
                breaker_reset: Duration::from_secs(30),
            },
        );
        let scheduler = Scheduler::new(
            store.clone(),
            tenants.clone(),
            Arc::new(engine.clone()),
            Duration::from_secs(60),
        );

        Self {
            store,
            objects,
            analytics,
            backend,
            tenants,
            engine,
            scheduler,
            data_dir,
        }
    }

    /// Insert a workflow owned by the default owner
    pub fn add_workflow(&self, workflow: WorkflowDefinition) -> WorkflowDefinition {
        self.store.insert_workflow(workflow.clone()).expect("insert workflow");
        workflow
    }

    /// Manually trigger `workflow_id` and wait for the execution to finish
    pub async fn run(&self, workflow_id: i64) -> (i64, ExecutionStatus) {
        let ticket = self
            .engine
            .start_execution(workflow_id, TriggerKind::Manual)
            .await
            .expect("start execution")
            .expect("execution was not skipped");
        finish(ticket).await
    }
}

pub async fn finish(ticket: ExecutionTicket) -> (i64, ExecutionStatus) {
    let status = ticket.completion.await.expect("execution task");
    (ticket.execution_id, status)
}

/// Workflow with a literal query, no source and the storage destination
pub fn query_workflow(id: i64, query: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        query: Some(query.to_string()),
        ..WorkflowDefinition::new(id, OWNER_ID, "0 3 * * *")
    }
}

// ============================================================================
// Scripted activities
// ============================================================================

/// Activity that answers from a script and counts its calls
pub struct ScriptedActivity {
    calls: AtomicUsize,
    failures: usize,
    hang: bool,
    output: Value,
}

impl ScriptedActivity {
    pub fn ok(output: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: 0,
            hang: false,
            output,
        })
    }

    /// Fails the first `failures` calls with "attempt N failed"
    pub fn failing(failures: usize, output: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            hang: false,
            output,
        })
    }

    /// Never returns
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: 0,
            hang: true,
            output: Value::Null,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActivityHandler for ScriptedActivity {
    async fn invoke(&self, _payload: Value) -> Result<Value, StepError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang {
            std::future::pending::<()>().await;
        }
        if n <= self.failures {
            return Err(StepError::failed(format!("attempt {n} failed")));
        }
        Ok(self.output.clone())
    }
}

/// Registry built from three scripted steps
pub fn scripted_activities(
    fetch: Arc<ScriptedActivity>,
    transform: Arc<ScriptedActivity>,
    save: Arc<ScriptedActivity>,
) -> ActivityRegistry {
    use etl_engine::models::StepKind;

    ActivityRegistry::new()
        .register_handler(StepKind::FetchSource.activity(), fetch)
        .register_handler(StepKind::Transform.activity(), transform)
        .register_handler(StepKind::SaveDestination.activity(), save)
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with migrations applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        info!("Migrations completed successfully");

        Ok(Self { container, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}
