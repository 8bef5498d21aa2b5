//! Gatekeep HTTP server binary.
//!
//! Serves the user API over PostgreSQL, or over the in-memory store with
//! `--memory` for local development.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use gatekeep_api::AppState;
use gatekeep_api::config::ApiConfig;
use gatekeep_core::ledger::MemoryTokenLedger;
use gatekeep_core::otp::{LogDelivery, MemoryOtpStore};
use gatekeep_core::rate_limit::RateLimiter;
use gatekeep_core::service::VerificationDeps;
use gatekeep_core::store::Stores;
use gatekeep_core::store::memory::MemoryStore;
use gatekeep_core::store::postgres::PgStore;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "info,gatekeep_api=debug,gatekeep_core=debug";

/// CLI arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "gatekeep_server", about = "Gatekeep user API server")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "GATEKEEP_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 = ephemeral).
    #[arg(long, env = "GATEKEEP_PORT", default_value_t = 8080)]
    port: u16,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/gatekeep"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Keep all state in process memory instead of PostgreSQL.
    #[arg(long, default_value_t = false)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let config = ApiConfig::from_env()?;

    let stores = if args.memory {
        warn!("using in-memory store; all data is lost on exit");
        Stores::new(MemoryStore::new())
    } else {
        info!(
            max_connections = args.max_connections,
            "connecting to database"
        );
        let pool = PgPoolOptions::new()
            .max_connections(args.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&args.database_url)
            .await?;

        info!("running database migrations");
        gatekeep_core::migrate::migrate(&pool).await?;
        Stores::new(PgStore::new(pool))
    };

    let otps = Arc::new(MemoryOtpStore::new());
    let ledger = Arc::new(MemoryTokenLedger::new());
    let otp_limiter = Arc::new(RateLimiter::new(config.auth.otp_rate_limit));
    let deps = VerificationDeps {
        otps: otps.clone(),
        delivery: Arc::new(LogDelivery),
        ledger: ledger.clone(),
        limiter: otp_limiter.clone(),
    };

    let sweep_period = config.auth.client_rate_limit.cleanup_interval;
    let state = AppState::new(stores, deps, config);

    // Background sweeps stop with the server.
    let shutdown = CancellationToken::new();
    let sweeps = vec![
        state.limiter.spawn_cleanup(shutdown.clone()),
        otp_limiter.spawn_cleanup(shutdown.clone()),
        otps.spawn_cleanup(sweep_period, shutdown.clone()),
        ledger.spawn_cleanup(sweep_period, shutdown.clone()),
    ];

    let app = gatekeep_api::router(state);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, version = gatekeep_core::version(), "gatekeep listening");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await;

    shutdown.cancel();
    for sweep in sweeps {
        let _ = sweep.await;
    }

    serve_result?;
    Ok(())
}
