//! ETL Engine - scheduler and pipeline worker daemon

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use etl_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info};

use etl_engine::{
    analytics::AnalyticsRegistry,
    config::Config,
    durable::{LocalBackend, PipelinePolicy, PipelineSupervisor},
    engine::{EngineOptions, ExecutionEngine},
    fallback::FallbackExecutor,
    pipeline::{pipeline_activities, PipelineServices},
    scheduler::Scheduler,
    storage::{config::StorageConfig, Storage},
    store::{PgStore, Store},
    tenant::TenantRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::default()
        .with_prefix("etl-engine")
        .with_filter("etl_engine=debug,sqlx=warn,aws_config=warn")
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting ETL engine");

    let config = Config::load()?;
    info!(
        durable = config.durable.enabled,
        overlap_policy = ?config.engine.overlap_policy,
        data_dir = %config.engine.data_dir.display(),
        "Configuration loaded"
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to Postgres")?;
    info!("Database connection pool established");

    let pg_store = PgStore::new(db_pool);
    pg_store.migrate().await.context("Failed to run migrations")?;
    info!("Database migrations completed");
    let store: Arc<dyn Store> = Arc::new(pg_store);

    let storage = Storage::new(StorageConfig::from_env()?).await?;
    let analytics = Arc::new(AnalyticsRegistry::new(&config.engine.data_dir));
    let services = PipelineServices::new(Arc::new(storage), analytics.clone(), config.engine.http_timeout())?;
    let activities = pipeline_activities(Arc::new(services));

    let supervisor = PipelineSupervisor::new(store.clone(), activities.clone(), PipelinePolicy::default());
    let backend = Arc::new(LocalBackend::new(Arc::new(supervisor)));
    let tenants = Arc::new(TenantRegistry::new(
        backend.clone(),
        config.durable.namespace_retention(),
        config.durable.connect_timeout(),
    ));

    let engine = ExecutionEngine::new(
        store.clone(),
        tenants.clone(),
        FallbackExecutor::new(activities),
        EngineOptions::from_config(&config),
    );
    let scheduler = Scheduler::new(
        store,
        tenants,
        Arc::new(engine.clone()),
        config.engine.schedule_error_backoff(),
    );

    match engine.recover().await {
        Ok(report) => info!(
            resumed = report.resumed.len(),
            failed = report.failed,
            "Interrupted executions handled"
        ),
        Err(e) => error!("Failed to recover interrupted executions: {e}"),
    }

    let scheduled = scheduler.load_active().await?;
    info!("Scheduler started with {} active workflow(s)", scheduled);

    shutdown_signal().await;

    scheduler.shutdown().await;
    backend.shutdown();
    analytics.close().await;

    info!("ETL engine shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
