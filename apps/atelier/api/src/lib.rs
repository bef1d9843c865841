//! Atelier API server.
//!
//! Startup wires the components in dependency order (sensor, queue, bus,
//! supervisor, executor, pool, API) and tears them down in reverse on
//! SIGINT/SIGTERM.

use axum::middleware;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::FromEnv;
use database::{BuildStore, SqliteBuildStore, SqliteExecutionStore};
use domain_containers::{ContainerSupervisor, DockerCli};
use domain_execution::{
    ExecutorConfig, JobExecutor, PoolConfig, RuntimeWorkflowRunner, WorkerPool,
};
use domain_generation::InferenceClient;
use eyre::WrapErr;
use progress_bus::ProgressBus;
use std::sync::Arc;
use std::time::Duration;
use sysmon::ResourceSensor;
use task_queue::DurableQueue;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod openapi;
pub mod state;

use config::Config;
use state::AppState;

/// Completed job records older than this are swept from the queue index.
const COMPLETED_RETENTION: Duration = Duration::from_secs(3600);

/// Run the server until a shutdown signal arrives.
pub async fn run() -> eyre::Result<()> {
    install_color_eyre();

    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    init_tracing(&config.environment);
    observability::init_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting atelier API"
    );

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .wrap_err("Failed to create output directory")?;
    tokio::fs::create_dir_all(&config.input_dir)
        .await
        .wrap_err("Failed to create input directory")?;

    // Startup order: sensor -> queue -> bus -> store -> supervisor ->
    // executor -> pool -> API.
    let sensor = Arc::new(ResourceSensor::new(&config.output_dir));

    let queue = Arc::new(
        DurableQueue::open(&config.queue_path, config.max_queue_size)
            .await
            .wrap_err("Failed to open job queue")?,
    );

    let bus = Arc::new(ProgressBus::new(config.max_ws_connections));
    let heartbeat = bus.spawn_heartbeat();

    let store = database::connect(&config.database_url)
        .await
        .wrap_err("Failed to open store")?;
    let builds: Arc<SqliteBuildStore> = Arc::new(SqliteBuildStore::new(store.clone()));
    let executions = Arc::new(SqliteExecutionStore::new(store));

    let supervisor = Arc::new(ContainerSupervisor::new(
        Arc::clone(&builds) as Arc<dyn BuildStore>,
        Arc::new(DockerCli::new()),
    ));
    if let Some(url) = &config.comfyui_url {
        info!(url = %url, "Using fixed inference runtime, container supervision bypassed");
    }

    let runner = Arc::new(RuntimeWorkflowRunner::new(
        supervisor,
        InferenceClient::new(&config.output_dir),
        config.comfyui_url.clone(),
        config.task_timeout,
    ));

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&queue),
        runner,
        Arc::clone(&bus),
        Arc::clone(&sensor),
        executions,
        ExecutorConfig {
            max_concurrent_jobs: config.max_concurrent_tasks,
            default_timeout: config.task_timeout,
            ..ExecutorConfig::default()
        },
    ));

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&executor),
        Arc::clone(&sensor),
        PoolConfig {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            scale_threshold: config.scale_threshold,
            ..PoolConfig::default()
        },
    ));
    pool.start().await;

    let cleanup = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(COMPLETED_RETENTION);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                queue.cleanup_completed(COMPLETED_RETENTION).await;
            }
        })
    };

    let workflow_template = load_workflow_template(&config).map(Arc::new);

    let state = AppState {
        tracker: executor.tracker(),
        config: Arc::new(config.clone()),
        queue: Arc::clone(&queue),
        bus: Arc::clone(&bus),
        executor: Arc::clone(&executor),
        pool: Arc::clone(&pool),
        sensor,
        builds: builds as Arc<dyn BuildStore>,
        http: reqwest::Client::new(),
        workflow_template,
    };

    let app = api::routes(state.clone())
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_key,
        ))
        .layer(middleware::from_fn(
            observability::middleware::metrics_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let address = config.server.address();
    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind {address}"))?;
    info!(address = %address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Server error")?;

    // Reverse order teardown.
    info!("Shutting down");
    cleanup.abort();
    pool.stop().await;
    bus.close_all().await;
    heartbeat.abort();

    info!("Atelier API shutdown complete");
    Ok(())
}

/// Load the workflow template served by `/api/generate`, when configured.
fn load_workflow_template(config: &Config) -> Option<serde_json::Value> {
    let path = config.workflow_path.as_ref()?;
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(template) => {
                info!(path = %path.display(), "Loaded workflow template");
                Some(template)
            }
            Err(e) => {
                warn!(path = %path.display(), "Workflow template is not valid JSON: {e}");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), "Workflow template unreadable, ignoring: {e}");
            None
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
