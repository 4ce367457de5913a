//! Architect build coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use architect_config::{ArchitectConfig, load_config};
use architect_core::{BroadcastBroker, MemoryStore, Stores};
use architect_db::{create_pool, pg_stores, run_migrations};
use architect_scheduler::{BuildScheduler, BuilderRegistry};
use architect_server::{AppState, listener, routes};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "architect.kdl";

#[derive(Parser)]
#[command(name = "architect")]
#[command(about = "Coordinates builds across a fleet of builders", long_about = None)]
struct Cli {
    /// Path to a KDL configuration file [default: architect.kdl if present]
    #[arg(long, env = "ARCHITECT_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string; overrides `database-url` in the config
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()));
    let mut config = match &path {
        Some(path) => load(path)?,
        None => ArchitectConfig::default(),
    };
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }
    if config.builder_tokens.is_empty() {
        warn!("No builder tokens configured; every builder join will be rejected");
    }
    let config = Arc::new(config);

    let broker = BroadcastBroker::default();
    let (stores, pool) = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            (pg_stores(pool.clone()), Some(pool))
        }
        None => {
            warn!("No database configured; builds are kept in memory");
            (Stores::memory(Arc::new(MemoryStore::new())), None)
        }
    };

    let registry = Arc::new(BuilderRegistry::new(stores).with_broker(Arc::new(broker.clone())));
    let scheduler = BuildScheduler::new(registry.clone(), &config.scheduler);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let builders = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind builder listener on {}", config.listen))?;
    info!("Accepting builders on {}", config.listen);
    let listener_task = tokio::spawn(listener::serve(
        builders,
        registry.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));

    let mut state = AppState::new(registry, broker, config.registry.page_size);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let http = TcpListener::bind(&config.http)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http))?;
    info!("Starting server on {}", config.http);

    axum::serve(http, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = scheduler_task.await;
    let _ = listener_task.await;
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<ArchitectConfig> {
    let config = load_config(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
