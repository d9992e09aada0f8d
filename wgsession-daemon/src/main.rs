//! `wgsessiond` — the WireGuard session and connectivity daemon binary.
//!
//! Parses the CLI, wires the Adapter / Store / Session Engine / User Admin
//! / HTTP API together, then runs the tick loop and the HTTP server
//! concurrently until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wgsession_core::DaemonConfig;
use wgsession_daemon::api::{build_router, ApiState};
use wgsession_daemon::stats::StatisticsAggregator;
use wgsession_daemon::{PeerTableAdapter, SessionEngine, Store, UserAdmin, WgAdapter, WgSessionEngine};

/// The WireGuard session and connectivity daemon.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port the HTTP API binds to.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Tick interval, in seconds.
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Handshake freshness window, in seconds.
    #[arg(long = "max-handshake-age", default_value_t = 180)]
    max_handshake_age: i64,

    /// Raise the tracing filter to `debug`.
    #[arg(long)]
    debug: bool,

    /// SQLite database file path.
    #[arg(long = "db-path", default_value = "wireguard.db")]
    db_path: String,

    /// WireGuard interface name the adapter targets.
    #[arg(long, default_value = "wg0")]
    interface: String,

    /// Server public key placed into rendered client configs.
    #[arg(long = "server-public-key", default_value = "<SERVER_PUBLIC_KEY>")]
    server_public_key: String,

    /// `host:port` placed into rendered client configs as the `Endpoint`.
    #[arg(long = "server-endpoint", default_value = "server.example.com:51820")]
    server_endpoint: String,
}

impl From<Cli> for DaemonConfig {
    fn from(cli: Cli) -> Self {
        Self {
            port: cli.port,
            interval_secs: cli.interval,
            max_handshake_age: cli.max_handshake_age,
            debug: cli.debug,
            db_path: cli.db_path,
            interface: cli.interface,
            server_public_key: cli.server_public_key,
            server_endpoint: cli.server_endpoint,
        }
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug = cli.debug;
    init_tracing(debug);

    let config = Arc::new(DaemonConfig::from(cli));
    info!(
        interface = %config.interface,
        port = config.port,
        interval_secs = config.interval_secs,
        "starting wgsessiond"
    );

    let store = Arc::new(Store::open(&config.db_path).context("failed to open the database")?);
    let adapter: Arc<dyn PeerTableAdapter> = Arc::new(WgAdapter::new(config.interface.clone()));
    let engine = Arc::new(WgSessionEngine::new(
        store.clone(),
        adapter.clone(),
        config.max_handshake_age,
    ));
    let engine_trait: Arc<dyn SessionEngine> = engine.clone();
    let admin = Arc::new(UserAdmin::new(store.clone(), adapter.clone(), engine_trait.clone(), config.clone()));
    let stats = Arc::new(StatisticsAggregator::new(store.clone()));

    let state = ApiState {
        store: store.clone(),
        engine: engine_trait,
        adapter: adapter.clone(),
        admin,
        stats,
        config: config.clone(),
    };
    let router = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "http api listening");

    let tick_interval = Duration::from_secs(config.interval_secs.max(1));
    let tick_engine = engine.clone();
    let tick_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            ticker.tick().await;
            tick_engine.tick().await;
        }
    });

    let shutdown = shutdown_signal();
    let serve_result = axum::serve(listener, router).with_graceful_shutdown(shutdown).await;

    tick_task.abort();
    serve_result.context("http server error")?;
    info!("wgsessiond shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
