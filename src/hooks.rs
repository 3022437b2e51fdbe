//! Embedder hooks.
//!
//! The proxy core depends only on the traits in this module.  Each trait has
//! a blanket implementation for plain closures and a default that logs
//! through `tracing`; [`Hooks`] bundles one of each for [`crate::AppState`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::url::{CanonicalRepoUrl, CanonicalizeError};
use crate::error::{ProxyError, RefreshError};

/// The parts of an inbound request the hooks get to see.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestInfo {
    fn user_agent(&self) -> &str {
        self.headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Maps the repository part of a request path to an upstream URL.
pub trait UrlCanonicalizer: Send + Sync {
    fn canonicalize(&self, repo_path: &str) -> Result<CanonicalRepoUrl, CanonicalizeError>;
}

impl<F> UrlCanonicalizer for F
where
    F: Fn(&str) -> Result<CanonicalRepoUrl, CanonicalizeError> + Send + Sync,
{
    fn canonicalize(&self, repo_path: &str) -> Result<CanonicalRepoUrl, CanonicalizeError> {
        self(repo_path)
    }
}

/// Receives every upstream and internal failure with its full detail.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, request: &RequestInfo, error: &ProxyError);
}

impl<F> ErrorReporter for F
where
    F: Fn(&RequestInfo, &ProxyError) + Send + Sync,
{
    fn report(&self, request: &RequestInfo, error: &ProxyError) {
        self(request, error)
    }
}

/// Called once per request after the response body has finished (or was
/// abandoned).
pub trait RequestLogger: Send + Sync {
    fn log(
        &self,
        request: &RequestInfo,
        status: StatusCode,
        request_size: u64,
        response_size: u64,
        latency: Duration,
    );
}

impl<F> RequestLogger for F
where
    F: Fn(&RequestInfo, StatusCode, u64, u64, Duration) + Send + Sync,
{
    fn log(
        &self,
        request: &RequestInfo,
        status: StatusCode,
        request_size: u64,
        response_size: u64,
        latency: Duration,
    ) {
        self(request, status, request_size, response_size, latency)
    }
}

/// Progress sink for one long-running upstream operation.
/// `report_done` is called exactly once.
pub trait RunningOperation: Send + Sync {
    fn report_progress(&self, message: &str);
    fn report_done(&self, error: Option<&RefreshError>);
}

/// Starts a [`RunningOperation`] for each upstream fetch.
pub trait OperationReporter: Send + Sync {
    fn start(&self, action: &str, url: &CanonicalRepoUrl) -> Box<dyn RunningOperation>;
}

impl<F> OperationReporter for F
where
    F: Fn(&str, &CanonicalRepoUrl) -> Box<dyn RunningOperation> + Send + Sync,
{
    fn start(&self, action: &str, url: &CanonicalRepoUrl) -> Box<dyn RunningOperation> {
        self(action, url)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Joins request paths onto a fixed upstream base URL.
///
/// `/org/repo.git` with base `https://git.example.com/` becomes
/// `https://git.example.com/org/repo`.  Traversal segments (also in
/// percent-encoded form), backslashes and control characters are rejected.
#[derive(Debug, Clone)]
pub struct PrefixCanonicalizer {
    base: Url,
}

impl PrefixCanonicalizer {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

impl UrlCanonicalizer for PrefixCanonicalizer {
    fn canonicalize(&self, repo_path: &str) -> Result<CanonicalRepoUrl, CanonicalizeError> {
        if repo_path
            .chars()
            .any(|c| c.is_control() || matches!(c, '\\' | '?' | '#'))
        {
            return Err(CanonicalizeError::ForbiddenCharacters);
        }

        let relative = repo_path.trim_matches('/');
        if relative.is_empty() {
            return Err(CanonicalizeError::Empty);
        }

        for segment in relative.split('/') {
            let lower = segment.to_ascii_lowercase();
            if lower.contains("%2f") || lower.contains("%5c") || lower.contains("%00") {
                return Err(CanonicalizeError::ForbiddenCharacters);
            }
            let decoded = lower.replace("%2e", ".");
            if segment.is_empty() || decoded == "." || decoded == ".." {
                return Err(CanonicalizeError::ForbiddenSegment(segment.to_string()));
            }
        }

        let mut url = self.base.clone();
        let path = format!("{}/{}", self.base.path().trim_end_matches('/'), relative);
        url.set_path(&path);
        CanonicalRepoUrl::from_url(url)
    }
}

/// Logs failures at `error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, request: &RequestInfo, error: &ProxyError) {
        error!(
            method = %request.method,
            path = %request.uri.path(),
            status = ?error.canonical_status(),
            error = %error,
            "request failed"
        );
    }
}

/// Logs one access line per request at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRequestLogger;

impl RequestLogger for TracingRequestLogger {
    fn log(
        &self,
        request: &RequestInfo,
        status: StatusCode,
        request_size: u64,
        response_size: u64,
        latency: Duration,
    ) {
        info!(
            method = %request.method,
            path = %request.uri.path(),
            status = status.as_u16(),
            request_size,
            response_size,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            user_agent = %request.user_agent(),
            "request"
        );
    }
}

/// Logs operation start and completion at `info`, progress at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOperationReporter;

impl OperationReporter for TracingOperationReporter {
    fn start(&self, action: &str, url: &CanonicalRepoUrl) -> Box<dyn RunningOperation> {
        info!(action, repo = %url, "operation started");
        Box::new(LoggedOperation {
            action: action.to_string(),
            url: url.to_string(),
            started: Instant::now(),
        })
    }
}

struct LoggedOperation {
    action: String,
    url: String,
    started: Instant,
}

impl RunningOperation for LoggedOperation {
    fn report_progress(&self, message: &str) {
        debug!(action = %self.action, repo = %self.url, message, "operation progress");
    }

    fn report_done(&self, error: Option<&RefreshError>) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match error {
            None => info!(action = %self.action, repo = %self.url, elapsed_ms, "operation finished"),
            Some(err) => warn!(
                action = %self.action,
                repo = %self.url,
                elapsed_ms,
                error = %err,
                "operation failed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// One of each hook, shared by every request.
#[derive(Clone)]
pub struct Hooks {
    pub canonicalizer: Arc<dyn UrlCanonicalizer>,
    pub error_reporter: Arc<dyn ErrorReporter>,
    pub request_logger: Arc<dyn RequestLogger>,
    pub operation_reporter: Arc<dyn OperationReporter>,
}

impl Hooks {
    /// `canonicalizer` plus the tracing-based defaults for everything else.
    pub fn new(canonicalizer: impl UrlCanonicalizer + 'static) -> Self {
        Self {
            canonicalizer: Arc::new(canonicalizer),
            error_reporter: Arc::new(TracingErrorReporter),
            request_logger: Arc::new(TracingRequestLogger),
            operation_reporter: Arc::new(TracingOperationReporter),
        }
    }

    pub fn with_error_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.error_reporter = Arc::new(reporter);
        self
    }

    pub fn with_request_logger(mut self, logger: impl RequestLogger + 'static) -> Self {
        self.request_logger = Arc::new(logger);
        self
    }

    pub fn with_operation_reporter(mut self, reporter: impl OperationReporter + 'static) -> Self {
        self.operation_reporter = Arc::new(reporter);
        self
    }
}
