use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod handlers;
mod history;
mod metrics;
mod signaling;
mod transfer;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, PipedropConfig, ServerConfig};
use crate::db::Database;
use crate::history::TransferHistory;
use crate::metrics::ServerMetrics;
use crate::signaling::ConnectionRegistry;
use crate::transfer::TransferRegistry;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const STARTUP_HISTORY_LIMIT: u32 = 5;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "pipedrop")]
#[command(about = "Browser-to-browser file relay that streams without touching disk")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.pipedrop)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (default)
    Serve(ServeArgs),

    /// Print recently completed transfers
    History(HistoryArgs),
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides config.toml)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config.toml)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Directory of static UI assets to serve at /
    #[arg(long)]
    ui_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    /// Number of transfers to show
    #[arg(short = 'n', long, default_value = "5")]
    limit: u32,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Live signaling connections keyed by client identity
    pub connections: ConnectionRegistry,
    /// Pending and in-flight pipes keyed by transfer key
    pub transfers: TransferRegistry,
    /// Server runtime configuration
    pub server_config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    /// None when `[history] enabled = false`
    pub history: Option<TransferHistory>,
    /// Cancelled on shutdown; signaling loops exit on it
    pub shutdown: CancellationToken,
}

pub(crate) fn build_router(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/ws", get(handlers::signaling_handler))
        .route(
            "/stream",
            get(handlers::download_handler).post(handlers::upload_handler),
        )
        .route("/api/history", get(handlers::history_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match ui_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::History(args)) => history_command(cli.data_dir, args).await,
        Some(Commands::Serve(args)) => run_server(cli.data_dir, args).await,
        None => run_server(cli.data_dir, ServeArgs::default()).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "pipedrop=debug,tower_http=debug,info"
    } else {
        "pipedrop=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load_file_config(config: &PipedropConfig) -> Result<FileConfig> {
    config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration in {} or PIPEDROP_* environment",
                config.config_toml_path().display()
            )
        })
}

async fn history_command(data_dir: Option<PathBuf>, args: HistoryArgs) -> Result<()> {
    let config = PipedropConfig::new(data_dir)?;
    let db = Database::new(&config).await?;
    let history = TransferHistory::new(db.pool.clone());

    let records = history.recent(args.limit).await?;
    if records.is_empty() {
        println!("No transfers recorded yet.");
        return Ok(());
    }
    for record in &records {
        println!("{}", history::format_record(record));
    }
    let stats = history.stats().await?;
    println!(
        "{} transfers, {} bytes total",
        stats.transfers, stats.total_bytes
    );
    Ok(())
}

async fn run_server(data_dir: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    init_tracing(args.debug);

    info!("Starting pipedrop relay");

    let config = PipedropConfig::new(data_dir)?;
    let file_config = load_file_config(&config)?;
    let server_config = Arc::new(ServerConfig::from_file(&file_config));

    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);

    let history = if file_config.history.enabled {
        let history = TransferHistory::new(db.pool.clone());
        log_recent_transfers(&history).await;
        Some(history)
    } else {
        info!("Transfer history disabled");
        None
    };

    info!(
        "Server config: attach_timeout={:?}, pipe_buffer={}KB, copy_buffer={}KB",
        server_config.transfer.attach_timeout,
        server_config.transfer.pipe_buffer_bytes / 1024,
        server_config.transfer.copy_buffer_bytes / 1024
    );

    let shutdown = CancellationToken::new();
    let app_state = AppState {
        connections: ConnectionRegistry::new(),
        transfers: TransferRegistry::new(server_config.transfer.pipe_buffer_bytes),
        server_config,
        metrics: Arc::new(ServerMetrics::new()),
        db,
        history,
        shutdown: shutdown.clone(),
    };

    let ui_dir = args.ui_dir.or(file_config.server.ui_dir);
    if let Some(dir) = &ui_dir {
        info!("Serving static UI from {}", dir.display());
    }
    let app = build_router(app_state, ui_dir);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("pipedrop listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET    /ws        - Signaling WebSocket");
    info!("  POST   /stream    - Upload (to, name, size)");
    info!("  GET    /stream    - Download (to, from, name, size)");

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
        }
    };

    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    info!("Shutdown complete");
    server_result
}

async fn log_recent_transfers(history: &TransferHistory) {
    match history.recent(STARTUP_HISTORY_LIMIT).await {
        Ok(records) if records.is_empty() => info!("No transfers recorded yet"),
        Ok(records) => {
            info!("Last {} transfers:", records.len());
            for record in &records {
                info!("  {}", history::format_record(record));
            }
        }
        Err(e) => warn!("Failed to read transfer history: {}", e),
    }
}
