use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use mirrorcache::config::{self, Config};
use mirrorcache::hooks::{Hooks, PrefixCanonicalizer};
use mirrorcache::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "mirrorcache", about = "Caching proxy for git smart HTTP")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MIRRORCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on; overrides `proxy.listen`'s port.
    #[arg(short, long, env = "MIRRORCACHE_PORT")]
    port: Option<u16>,

    /// Root directory of cached repositories; overrides `cache.root`.
    #[arg(long, env = "MIRRORCACHE_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Upstream base URL; overrides `upstream.base_url`.
    #[arg(long, env = "MIRRORCACHE_UPSTREAM")]
    upstream: Option<Url>,
}

impl Cli {
    fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => Config::default(),
        };
        if let Some(port) = self.port {
            config.proxy.listen.set_port(port);
        }
        if let Some(root) = &self.cache_root {
            config.cache.root = root.clone();
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.base_url = Some(upstream.clone());
        }
        config::validate_config(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen_addr: SocketAddr) -> Result<()> {
    let app = mirrorcache::http::create_router(Arc::new(state));

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
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

    // ---- Config ----
    let config = cli.load()?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = ?cli.config,
        cache_root = %config.cache.root.display(),
        "starting mirrorcache"
    );

    // ---- Cache root ----
    tokio::fs::create_dir_all(&config.cache.root)
        .await
        .with_context(|| {
            format!(
                "failed to create cache root: {}",
                config.cache.root.display()
            )
        })?;

    // ---- State ----
    let base_url = config
        .upstream
        .base_url
        .clone()
        .context("upstream.base_url (or --upstream) is required")?;
    let hooks = Hooks::new(PrefixCanonicalizer::new(base_url));
    let listen_addr = config.proxy.listen;
    let state = AppState::new(config, hooks)?;

    // ---- Serve ----
    run_http_server(state, listen_addr).await?;

    tracing::info!("mirrorcache shut down");
    Ok(())
}
