//! Canonical repository identifiers and their on-disk names.

use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

/// Why a repository path or URL could not be turned into a cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalizeError {
    #[error("empty repository path")]
    Empty,
    #[error("path segment {0:?} is not allowed")]
    ForbiddenSegment(String),
    #[error("repository path contains forbidden characters")]
    ForbiddenCharacters,
    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
    /// Policy rejection raised by an embedder-supplied canonicalizer.
    #[error("{0}")]
    Rejected(String),
}

/// Normalized identifier of an upstream repository, used as the cache key.
///
/// Credentials, query, fragment, trailing slashes and a trailing `.git` are
/// stripped so that every spelling of the same repository maps to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalRepoUrl(Url);

impl CanonicalRepoUrl {
    /// Parse and normalize an absolute repository URL.
    pub fn parse(input: &str) -> Result<Self, CanonicalizeError> {
        let url = Url::parse(input).map_err(|e| CanonicalizeError::InvalidUrl(e.to_string()))?;
        Self::from_url(url)
    }

    /// Normalize an already parsed URL.
    pub fn from_url(mut url: Url) -> Result<Self, CanonicalizeError> {
        match url.scheme() {
            "http" | "https" | "file" => {}
            other => return Err(CanonicalizeError::UnsupportedScheme(other.to_string())),
        }
        if url.scheme() != "file" && url.host_str().map_or(true, str::is_empty) {
            return Err(CanonicalizeError::InvalidUrl(format!("{url} has no host")));
        }

        // Setting credentials only fails on cannot-be-a-base URLs, which the
        // scheme check above already excludes.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_query(None);
        url.set_fragment(None);

        let trimmed = url.path().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let trimmed = trimmed.trim_end_matches('/').to_string();

        if trimmed.is_empty() {
            return Err(CanonicalizeError::Empty);
        }
        for segment in trimmed.split('/').skip(1) {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(CanonicalizeError::ForbiddenSegment(segment.to_string()));
            }
        }
        url.set_path(&trimmed);

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Absolute URL of a smart-HTTP endpoint below this repository, e.g.
    /// `info/refs` or `git-receive-pack`.
    pub fn endpoint(&self, suffix: &str, query: Option<&str>) -> String {
        let mut out = format!("{}/{}", self.0.as_str(), suffix.trim_start_matches('/'));
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            out.push('?');
            out.push_str(q);
        }
        out
    }

    /// First directory level of the mirror layout: host (and port, if any).
    pub fn host_dir(&self) -> String {
        let host = match self.0.host_str().filter(|h| !h.is_empty()) {
            Some(host) => host.to_ascii_lowercase(),
            None => "local".to_string(),
        };
        let host = match self.0.port() {
            Some(port) => format!("{host}_{port}"),
            None => host,
        };
        sanitize_component(&host)
    }

    /// Directory name of the bare mirror: readable last path segment plus a
    /// digest of the whole canonical URL, so distinct URLs never share a
    /// directory.
    pub fn mirror_dir_name(&self) -> String {
        let last = self
            .0
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("repo");
        let readable: String = sanitize_component(last).chars().take(64).collect();
        let digest = hex::encode(Sha256::digest(self.0.as_str().as_bytes()));
        format!("{readable}-{}.git", &digest[..16])
    }
}

impl fmt::Display for CanonicalRepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}
