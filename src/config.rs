use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Largest accepted upload-pack request body, after gzip decoding.
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_request_body_bytes() -> usize {
    64 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL request paths are joined onto (e.g. `https://git.example.com/`).
    pub base_url: Option<Url>,
    /// Name of an environment variable whose value is sent as the
    /// `Authorization` header on mirror fetches.
    pub auth_header_env: Option<String>,
    /// `User-Agent` for mirror fetches; git's own when unset.
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one bare mirror per upstream repository.
    #[serde(default)]
    pub root: PathBuf,
    /// Refresh a mirror once its last refresh is older than this, in
    /// addition to refreshing on missing objects.  Unset means refreshes are
    /// driven by misses only.
    pub max_staleness_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Upper bound on concurrently running upstream fetches across all repos.
    #[serde(default = "default_max_concurrent_upstream_fetches")]
    pub max_concurrent_upstream_fetches: usize,
    /// Abort a single upstream fetch after this many seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_upstream_fetches: default_max_concurrent_upstream_fetches(),
            timeout_secs: None,
        }
    }
}

fn default_max_concurrent_upstream_fetches() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`.
///
/// Command-line overrides are applied afterwards, so validation is left to
/// [`validate_config`].
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes as null rather than an empty map.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.cache.root.as_os_str().is_empty(),
        "cache.root must be set"
    );
    anyhow::ensure!(
        config.proxy.max_request_body_bytes > 0,
        "proxy.max_request_body_bytes must be positive"
    );
    anyhow::ensure!(
        config.fetch.max_concurrent_upstream_fetches > 0,
        "fetch.max_concurrent_upstream_fetches must be at least 1"
    );
    anyhow::ensure!(
        config.fetch.timeout_secs != Some(0),
        "fetch.timeout_secs must be positive when set"
    );
    if let Some(base) = &config.upstream.base_url {
        anyhow::ensure!(
            matches!(base.scheme(), "http" | "https" | "file"),
            "upstream.base_url must be an http, https or file URL"
        );
    }
    Ok(())
}
