use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{FetchError, FetchKind, UpstreamFetcher};
use crate::cache::CanonicalRepoUrl;
use crate::config::UpstreamConfig;
use crate::git;
use crate::hooks::RunningOperation;

/// Mirror settings applied when a mirror is (re)initialised.  They let the
/// mirror answer filtered and ref-in-want requests the way the origin would.
const MIRROR_CONFIG: &[(&str, &str)] = &[
    ("protocol.version", "2"),
    ("uploadpack.allowFilter", "true"),
    ("uploadpack.allowRefInWant", "true"),
];

/// [`UpstreamFetcher`] that runs `git fetch` into the mirror.
#[derive(Clone)]
pub struct GitFetcher {
    /// Extra git configuration passed through `GIT_CONFIG_*` variables so
    /// secrets never land on the command line or in the mirror's config.
    env: Vec<(String, String)>,
}

impl GitFetcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut settings: Vec<(String, String)> = Vec::new();
        if let Some(var) = &config.auth_header_env {
            let value = std::env::var(var)
                .with_context(|| format!("upstream auth header variable {var} is not set"))?;
            settings.push((
                "http.extraHeader".to_string(),
                format!("Authorization: {}", value.trim()),
            ));
        }
        if let Some(agent) = &config.user_agent {
            settings.push(("http.userAgent".to_string(), agent.clone()));
        }
        Ok(Self {
            env: config_env(&settings),
        })
    }
}

/// Encode `settings` as `GIT_CONFIG_COUNT` / `GIT_CONFIG_KEY_n` /
/// `GIT_CONFIG_VALUE_n`.
fn config_env(settings: &[(String, String)]) -> Vec<(String, String)> {
    if settings.is_empty() {
        return Vec::new();
    }
    let mut env = vec![("GIT_CONFIG_COUNT".to_string(), settings.len().to_string())];
    for (i, (key, value)) in settings.iter().enumerate() {
        env.push((format!("GIT_CONFIG_KEY_{i}"), key.clone()));
        env.push((format!("GIT_CONFIG_VALUE_{i}"), value.clone()));
    }
    env
}

#[async_trait]
impl UpstreamFetcher for GitFetcher {
    #[instrument(skip(self, op), fields(%url, mirror = %mirror.display()))]
    async fn fetch(
        &self,
        url: &CanonicalRepoUrl,
        mirror: &Path,
        kind: FetchKind,
        op: &dyn RunningOperation,
    ) -> Result<(), FetchError> {
        if kind == FetchKind::Initial || !git::validate_bare_repo(mirror).await {
            git::init_bare_repo(mirror).await.map_err(FetchError::Local)?;
            for (key, value) in MIRROR_CONFIG {
                git::git_config_set(mirror, key, value)
                    .await
                    .map_err(FetchError::Local)?;
            }
            git::set_remote(mirror, "origin", url.as_str())
                .await
                .map_err(FetchError::Local)?;
        }

        let result = git::git_fetch_mirror(mirror, "origin", &self.env, |line: &str| {
            op.report_progress(line)
        })
        .await
        .map_err(FetchError::Upstream)?;

        // `fetch` copies refs but never the origin's HEAD symref.
        let head = git::git_remote_head(mirror, "origin", &self.env)
            .await
            .map_err(FetchError::Upstream)?;
        if let Some(head) = &head {
            git::set_head(mirror, head).await.map_err(FetchError::Local)?;
        }

        debug!(
            head = head.as_deref().unwrap_or("-"),
            refs_updated = result.refs_updated,
            objects_received = result.objects_received,
            "fetch finished"
        );
        Ok(())
    }
}
