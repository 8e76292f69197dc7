//! API services entrypoint.
//!
//! Serves the snapshot ingest router and the orchestrator router, each on
//! its own port, against one shared database. Workers run separately as
//! `riskrun-worker` daemons.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riskrun_backend::api::{ingest_router, orchestrator_router, AppState};
use riskrun_backend::config::AppConfig;
use riskrun_backend::db::Database;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let db = Database::open(&config.database_url).context("opening database")?;
    let state = AppState::new(db, config.run_defaults());

    let ingest_listener = TcpListener::bind(&config.ingest_bind_addr)
        .await
        .with_context(|| format!("binding ingest service to {}", config.ingest_bind_addr))?;
    let orchestrator_listener = TcpListener::bind(&config.orchestrator_bind_addr)
        .await
        .with_context(|| {
            format!("binding orchestrator service to {}", config.orchestrator_bind_addr)
        })?;
    info!(
        ingest = %config.ingest_bind_addr,
        orchestrator = %config.orchestrator_bind_addr,
        database = %config.database_url,
        "riskrun api services listening"
    );

    let ingest = async {
        axum::serve(ingest_listener, ingest_router(state.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    let orchestrator = async {
        axum::serve(orchestrator_listener, orchestrator_router(state.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    tokio::try_join!(ingest, orchestrator).context("serving")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
