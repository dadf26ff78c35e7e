mod cache;
mod config;
mod http;
mod metrics;
mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::CacheManager;
use crate::cache::store::DEFAULT_USER_AGENT;
use crate::config::Config;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pkghub", version, about = "Caching reverse proxy for package registries")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "PKGHUB_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Listen address; overrides `listen` from the config file.
    #[arg(short, long, env = "PKGHUB_BIND")]
    bind: Option<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, env = "PKGHUB_VERBOSE")]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CacheManager,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(config: Config, http_client: reqwest::Client) -> Self {
        let cache = CacheManager::new(config.dir.clone(), http_client);
        Self {
            config: Arc::new(config),
            cache,
            metrics: MetricsRegistry::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", state.config.listen))?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let mut config = config::load_config(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.listen = bind;
    }

    tracing::info!(
        config_path = %cli.config,
        cache_dir = %config.dir.display(),
        pypi = config.server.pypi.len(),
        static_mirrors = config.server.static_files.len(),
        galaxy = config.server.galaxy.len(),
        "starting pkghub"
    );

    // ---- Ensure local cache directory exists ----
    tokio::fs::create_dir_all(&config.dir)
        .await
        .with_context(|| format!("failed to create cache dir: {}", config.dir.display()))?;

    let http_client = reqwest::Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .build()
        .context("failed to build reqwest client")?;

    // ---- Serve ----
    run_http_server(AppState::new(config, http_client)).await?;

    tracing::info!("pkghub shut down cleanly");
    Ok(())
}
