//! Per-command bookkeeping: one inbound metric sample, one request-log call
//! and error reporting, all taken when the response body is finished.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::ProxyError;
use crate::executor::ByteStream;
use crate::hooks::{Hooks, RequestInfo};
use crate::metrics::{CacheState, CanonicalStatus, CommandType, InboundLabels, Metrics};
use crate::AppState;

/// A successful response whose body is still to be streamed.
pub(crate) struct Served {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
    /// Outcome recorded if the body streams to the end.
    pub canonical_status: CanonicalStatus,
}

impl Served {
    pub fn ok(content_type: &'static str, body: ByteStream) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Self {
            status: StatusCode::OK,
            headers,
            body,
            canonical_status: CanonicalStatus::Ok,
        }
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub(crate) struct CommandRecorder {
    metrics: Arc<Metrics>,
    hooks: Hooks,
    request: RequestInfo,
    command_type: Option<CommandType>,
    cache_state: CacheState,
    request_size: Arc<AtomicU64>,
    started: Instant,
    finished: bool,
}

impl CommandRecorder {
    pub fn new(state: &AppState, request: RequestInfo) -> Self {
        Self {
            metrics: Arc::clone(&state.metrics.metrics),
            hooks: state.hooks.clone(),
            request,
            command_type: None,
            cache_state: CacheState::Hit,
            request_size: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Requests that never classify as a protocol command are logged but
    /// not counted.
    pub fn set_command(&mut self, command_type: CommandType) {
        self.command_type = Some(command_type);
    }

    pub fn set_cache_state(&mut self, cache_state: CacheState) {
        self.cache_state = cache_state;
    }

    /// Counter for request body bytes as they are read.
    pub fn request_size(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.request_size)
    }

    /// Pass an upstream or internal failure to the error reporter.
    pub fn report_error(&self, err: &ProxyError) {
        if err.is_reportable() {
            self.hooks.error_reporter.report(&self.request, err);
        }
    }

    /// Answer with `err`.
    pub fn fail(mut self, err: ProxyError) -> Response {
        self.report_error(&err);
        let (status, body) = err.public_response();
        self.finish(status, err.canonical_status(), body.len() as u64);
        err.into_response()
    }

    /// Answer with `served`, recording once its body is done.
    pub fn respond(self, served: Served) -> Response {
        let stream = ReportingStream {
            inner: served.body,
            status: served.status,
            canonical_status: served.canonical_status,
            sent: 0,
            recorder: Some(self),
        };
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = served.status;
        *response.headers_mut() = served.headers;
        response
    }

    fn finish(&mut self, status: StatusCode, canonical_status: CanonicalStatus, response_size: u64) {
        if self.finished {
            return;
        }
        self.finished = true;
        let latency = self.started.elapsed();
        if let Some(command_type) = self.command_type {
            self.metrics.record_inbound(
                &InboundLabels {
                    command_type,
                    canonical_status,
                    cache_state: self.cache_state,
                },
                latency,
            );
        }
        self.hooks.request_logger.log(
            &self.request,
            status,
            self.request_size.load(Ordering::Relaxed),
            response_size,
            latency,
        );
    }
}

/// The handler was dropped before producing a response: the client hung up
/// while the command was still waiting on a refresh or the store.
impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                path = %self.request.uri.path(),
                "client went away before a response was ready"
            );
            let (status, _) = ProxyError::ClientDisconnected.public_response();
            self.finish(status, CanonicalStatus::ClientError, 0);
        }
    }
}

// ---------------------------------------------------------------------------
// Body wrapper
// ---------------------------------------------------------------------------

/// Counts bytes on their way out and finishes the recorder exactly once:
/// at end of stream, on a stream error, or when dropped early because the
/// client went away.
struct ReportingStream {
    inner: ByteStream,
    status: StatusCode,
    canonical_status: CanonicalStatus,
    sent: u64,
    recorder: Option<CommandRecorder>,
}

impl Stream for ReportingStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.inner.poll_next_unpin(cx));
        match &item {
            Some(Ok(chunk)) => self.sent += chunk.len() as u64,
            Some(Err(e)) => {
                if let Some(mut recorder) = self.recorder.take() {
                    let err = ProxyError::Internal(anyhow::anyhow!("response stream failed: {e}"));
                    recorder.report_error(&err);
                    recorder.finish(self.status, CanonicalStatus::InternalError, self.sent);
                }
            }
            None => {
                if let Some(mut recorder) = self.recorder.take() {
                    recorder.finish(self.status, self.canonical_status, self.sent);
                }
            }
        }
        Poll::Ready(item)
    }
}

impl Drop for ReportingStream {
    fn drop(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            debug!(
                path = %recorder.request().uri.path(),
                sent = self.sent,
                "client went away before the response finished"
            );
            recorder.finish(self.status, CanonicalStatus::ClientError, self.sent);
        }
    }
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = self.public_response();
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::http::{Method, Uri};
    use url::Url;

    use super::*;
    use crate::config::Config;
    use crate::hooks::PrefixCanonicalizer;
    use crate::testing::{FakeExecutor, FakeFetcher};

    fn state(cache: &tempfile::TempDir, logged: &Arc<Mutex<Vec<StatusCode>>>) -> AppState {
        let mut config = Config::default();
        config.cache.root = cache.path().to_path_buf();
        let logged = Arc::clone(logged);
        let hooks = Hooks::new(PrefixCanonicalizer::new(
            Url::parse("https://git.example.com/").unwrap(),
        ))
        .with_request_logger(
            move |_req: &RequestInfo, status: StatusCode, _req_size: u64, _resp_size: u64, _latency: Duration| {
                logged.lock().unwrap().push(status);
            },
        );
        AppState::with_backends(
            config,
            hooks,
            Arc::new(FakeFetcher::new(Duration::ZERO)),
            Arc::new(FakeExecutor::default()),
        )
        .unwrap()
    }

    fn request() -> RequestInfo {
        RequestInfo {
            method: Method::GET,
            uri: Uri::from_static("/org/repo.git/info/refs?service=git-upload-pack"),
            headers: HeaderMap::new(),
        }
    }

    fn inbound(state: &AppState, canonical_status: CanonicalStatus, cache_state: CacheState) -> u64 {
        state
            .metrics
            .metrics
            .inbound_commands
            .get_or_create(&InboundLabels {
                command_type: CommandType::InfoRefs,
                canonical_status,
                cache_state,
            })
            .get()
    }

    #[test]
    fn recorder_dropped_before_responding_counts_a_client_error() {
        let cache = tempfile::tempdir().unwrap();
        let logged = Arc::new(Mutex::new(Vec::new()));
        let state = state(&cache, &logged);

        let mut recorder = CommandRecorder::new(&state, request());
        recorder.set_command(CommandType::InfoRefs);
        recorder.set_cache_state(CacheState::Miss);
        drop(recorder);

        assert_eq!(inbound(&state, CanonicalStatus::ClientError, CacheState::Miss), 1);
        assert_eq!(*logged.lock().unwrap(), vec![StatusCode::BAD_REQUEST]);
    }

    #[test]
    fn failed_command_is_recorded_once() {
        let cache = tempfile::tempdir().unwrap();
        let logged = Arc::new(Mutex::new(Vec::new()));
        let state = state(&cache, &logged);

        let mut recorder = CommandRecorder::new(&state, request());
        recorder.set_command(CommandType::InfoRefs);
        let response = recorder.fail(ProxyError::NotFound);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(inbound(&state, CanonicalStatus::ClientError, CacheState::Hit), 1);
        assert_eq!(*logged.lock().unwrap(), vec![StatusCode::NOT_FOUND]);
    }
}
