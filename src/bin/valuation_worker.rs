//! Valuation worker daemon.
//!
//! Claims tasks from the shared database and prices them until told to stop.
//! Exit codes: 0 on a clean signal shutdown, 1 on configuration errors, 2 on
//! unrecoverable runtime errors (database unreachable at start, registry
//! boot failure, fatal invariant breaks) so a supervisor can restart it.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riskrun_backend::db::Database;
use riskrun_backend::pricing::PricerRegistry;
use riskrun_backend::worker::{Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "riskrun-worker")]
#[command(about = "Valuation run worker daemon")]
struct Args {
    /// SQLite database path shared with the API services.
    #[arg(long, env = "DATABASE_URL", default_value = "./riskrun.db")]
    database_url: String,

    /// Unique worker identity; generated when absent.
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    #[arg(long, env = "WORKER_LEASE_SECONDS", default_value_t = 60)]
    lease_seconds: u64,

    #[arg(long, env = "WORKER_IDLE_SLEEP_SECONDS", default_value_t = 0.5)]
    idle_sleep_seconds: f64,

    /// Prometheus exporter address; metrics are off when unset.
    #[arg(long, env = "METRICS_BIND_ADDR")]
    metrics_bind_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    if args.lease_seconds == 0 {
        error!("WORKER_LEASE_SECONDS must be >= 1");
        std::process::exit(1);
    }
    if args.idle_sleep_seconds < 0.0 || !args.idle_sleep_seconds.is_finite() {
        error!("WORKER_IDLE_SLEEP_SECONDS must be a non-negative number");
        std::process::exit(1);
    }
    let metrics_addr: Option<SocketAddr> = match &args.metrics_bind_addr {
        Some(addr) => match addr.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                error!(%addr, "METRICS_BIND_ADDR is not a socket address");
                std::process::exit(1);
            }
        },
        None => None,
    };

    if let Some(addr) = metrics_addr {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!(%addr, "prometheus exporter listening"),
            Err(e) => warn!(error = %e, "prometheus exporter failed to start, continuing without metrics"),
        }
    }

    let db = match Database::open(&args.database_url) {
        Ok(db) => db,
        Err(e) => {
            error!(database_url = %args.database_url, error = %e, "database unreachable at start");
            std::process::exit(2);
        }
    };
    let registry = match PricerRegistry::bootstrap() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "pricer registry boot failed");
            std::process::exit(2);
        }
    };
    info!(product_types = ?registry.list(), "pricer registry bootstrapped");

    let config = WorkerConfig {
        worker_id: args
            .worker_id
            .unwrap_or_else(|| WorkerConfig::default().worker_id),
        lease_seconds: args.lease_seconds,
        idle_sleep_seconds: args.idle_sleep_seconds,
    };
    let mut worker = Worker::new(config, db, registry);
    let shutdown = worker.shutdown_flag();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.store(true, Ordering::Relaxed);
    });

    match tokio::task::spawn_blocking(move || worker.run()).await {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(fatal)) => {
            error!(error = %fatal, "worker terminated on fatal error");
            std::process::exit(2);
        }
        Err(join_error) => {
            error!(error = %join_error, "worker thread panicked");
            std::process::exit(2);
        }
    }
}
