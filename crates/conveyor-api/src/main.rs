//! Conveyor CI API server

use anyhow::Context;
use clap::{Parser, ValueEnum};
use conveyor_api::{AppState, routes};
use conveyor_config::load_system_config;
use conveyor_db::{MemoryStore, PgStore, Store, create_pool, run_migrations};
use conveyor_scheduler::ControlPlane;
use conveyor_worker::{DockerConnector, WorkerBeacon};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "conveyor-server", version, about = "Conveyor CI control plane")]
struct Args {
    /// System configuration file (KDL)
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text", env = "CONVEYOR_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let mut config = load_system_config(args.config.as_deref())
        .context("failed to load system configuration")?;
    config.apply_env();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url)
                .await
                .context("failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Database connected");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("No database configured, state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let plane = Arc::new(ControlPlane::new(
        store,
        Arc::new(DockerConnector::new()),
        &config,
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    {
        let plane = plane.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { plane.run(shutdown).await }));
    }

    if !config.workers.is_empty() {
        let interval = config
            .workers
            .iter()
            .map(|w| w.ttl)
            .min()
            .map(|ttl| ttl / 2)
            .unwrap_or(Duration::from_secs(15))
            .max(Duration::from_secs(1));
        let beacon = WorkerBeacon::new(
            plane.registry(),
            config
                .workers
                .iter()
                .map(|w| (w.registration.clone(), w.ttl))
                .collect(),
        );
        let shutdown = shutdown.clone();
        info!(workers = config.workers.len(), ?interval, "Starting worker beacon");
        tasks.push(tokio::spawn(async move { beacon.run(interval, shutdown).await }));
    }

    let app = routes::router(AppState::new(plane))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Starting server on {}", config.listen);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }

    Ok(())
}
