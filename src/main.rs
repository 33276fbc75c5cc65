//! ExecDesk backend: agentic trading orchestrator service.
//!
//! Wires the process once at startup (config, database + migrations,
//! market data client, Prometheus recorder, HTTP router) and serves the
//! API. Runs execute in background workers spawned by the confirmation
//! gate; nothing here re-reads the environment after boot.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use execdesk_backend::api::{build_router, AppState};
use execdesk_backend::config::Settings;
use execdesk_backend::db::Db;
use execdesk_backend::deps::Deps;
use execdesk_backend::market_data::CoinbaseMarketData;
use execdesk_backend::redaction::RedactingStdout;

#[derive(Parser, Debug)]
#[command(name = "execdesk", about = "Agentic trading orchestrator backend")]
struct Args {
    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Database path (overrides DATABASE_URL).
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Every formatted log line passes through secret redaction.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("execdesk_backend=info,execdesk=info,tower_http=warn")
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingStdout))
        .init();

    let mut settings = Settings::from_env();
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(db) = args.db {
        settings.database_url = db;
    }
    let port = settings.port;

    let db = Db::open(&settings.db_path()).context("open database")?;
    db.init().await.context("initialize database schema")?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            warn!(error = %e, "Prometheus recorder install failed, metrics disabled");
            e
        })
        .ok();

    let market = Arc::new(CoinbaseMarketData::new("https://api.exchange.coinbase.com"));
    let deps = Deps::new(db, settings, market);
    let state = AppState::new(deps, metrics_handle);

    // Periodic rate-limiter window cleanup.
    let limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.cleanup();
        }
    });

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.context("bind listener")?;
    info!(%addr, "execdesk backend listening");
    axum::serve(listener, router).await.context("serve")?;
    Ok(())
}
