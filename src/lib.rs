//! Transparent caching proxy for the git smart-HTTP protocol.
//!
//! Clients fetch through the proxy exactly as they would from the origin.
//! Each upstream repository is kept as a bare mirror under the cache root;
//! ref discovery and upload-pack are answered from the mirror, which is
//! refreshed from the origin (once, no matter how many clients ask) when it
//! is missing what a client wants.  Pushes are relayed to the origin.

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod git;
pub mod hooks;
pub mod http;
pub mod metrics;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::executor::{CommandExecutor, GitExecutor};
use crate::fetch::{FetchCoordinator, GitFetcher, UpstreamFetcher};
use crate::hooks::Hooks;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub cache: CacheManager,
    pub fetcher: FetchCoordinator,
    pub executor: Arc<dyn CommandExecutor>,
    pub hooks: Hooks,
    /// Client for relaying pushes to the origin.
    pub http_client: reqwest::Client,
}

impl AppState {
    /// State backed by the `git` binary.
    pub fn new(config: Config, hooks: Hooks) -> Result<Self> {
        let fetcher = GitFetcher::new(&config.upstream).context("failed to set up upstream fetcher")?;
        Self::with_backends(config, hooks, Arc::new(fetcher), Arc::new(GitExecutor))
    }

    /// State with caller-supplied fetch and serve backends.
    pub fn with_backends(
        config: Config,
        hooks: Hooks,
        fetcher: Arc<dyn UpstreamFetcher>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let cache = CacheManager::new(&config.cache, &metrics);
        let fetcher = FetchCoordinator::new(
            fetcher,
            Arc::clone(&hooks.operation_reporter),
            metrics.clone(),
            &config.fetch,
            cache.max_staleness(),
        );
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            metrics,
            cache,
            fetcher,
            executor,
            hooks,
            http_client,
        })
    }
}
