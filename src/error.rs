//! Error taxonomy shared by the cache engine and the HTTP front door.
//!
//! Every failure a request can hit falls in one of three buckets (client,
//! upstream, internal), exposed through [`ProxyError::canonical_status`].
//! The HTTP layer is the only place that turns these into status codes.

use std::time::Duration;

use axum::http::StatusCode;

use crate::cache::url::CanonicalizeError;
use crate::cache::CacheError;
use crate::metrics::CanonicalStatus;

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

/// Outcome of a failed mirror refresh.
///
/// Cloneable because every caller joined to one refresh receives the same
/// result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("fetch of {url} from upstream failed: {message}")]
    Upstream { url: String, message: String },
    #[error("local mirror of {url} could not be updated: {message}")]
    Local { url: String, message: String },
    #[error("fetch of {url} from upstream did not finish within {timeout:?}")]
    TimedOut { url: String, timeout: Duration },
    #[error("refresh of {url} was abandoned before completing")]
    Aborted { url: String },
}

impl RefreshError {
    pub fn canonical_status(&self) -> CanonicalStatus {
        match self {
            Self::Upstream { .. } | Self::TimedOut { .. } => CanonicalStatus::UpstreamError,
            Self::Local { .. } | Self::Aborted { .. } => CanonicalStatus::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Front door
// ---------------------------------------------------------------------------

/// Every way an inbound protocol command can fail.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    // -- client --
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("repository path rejected: {0}")]
    Canonicalize(#[from] CanonicalizeError),
    #[error("client disconnected")]
    ClientDisconnected,

    // -- upstream --
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("{url} does not contain requested object(s) even after refreshing: {}", .objects.join(" "))]
    ObjectUnavailable { url: String, objects: Vec<String> },
    #[error("forwarding to {url} failed: {source:#}")]
    Forward {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    // -- internal --
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ProxyError {
    pub fn canonical_status(&self) -> CanonicalStatus {
        match self {
            Self::BadRequest(_)
            | Self::NotFound
            | Self::MethodNotAllowed
            | Self::PayloadTooLarge { .. }
            | Self::Canonicalize(_)
            | Self::ClientDisconnected => CanonicalStatus::ClientError,
            Self::Refresh(err) => err.canonical_status(),
            Self::ObjectUnavailable { .. } | Self::Forward { .. } => CanonicalStatus::UpstreamError,
            Self::Cache(_) | Self::Internal(_) => CanonicalStatus::InternalError,
        }
    }

    /// Whether the error-reporter hook should hear about this failure.
    pub fn is_reportable(&self) -> bool {
        !matches!(self.canonical_status(), CanonicalStatus::ClientError)
    }

    /// Status and body shown to the client. Upstream and internal failures
    /// are reduced to a generic message; the full error goes to the
    /// error reporter only.
    pub fn public_response(&self) -> (StatusCode, String) {
        match self {
            Self::BadRequest(_) | Self::Canonicalize(_) => {
                (StatusCode::BAD_REQUEST, format!("{self}\n"))
            }
            Self::NotFound => (StatusCode::NOT_FOUND, "not found\n".to_string()),
            Self::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed\n".to_string(),
            ),
            Self::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, format!("{self}\n")),
            // Nobody is listening; the status only shows up in logs.
            Self::ClientDisconnected => (StatusCode::BAD_REQUEST, String::new()),
            _ => match self.canonical_status() {
                CanonicalStatus::UpstreamError => (
                    StatusCode::BAD_GATEWAY,
                    "upstream repository unavailable\n".to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error\n".to_string(),
                ),
            },
        }
    }
}
