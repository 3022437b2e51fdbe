//! axum router and the protocol front door.
//!
//! Routes:
//! - `GET  /healthz`                                   - Health check
//! - `GET  /metrics`                                   - Prometheus metrics
//! - `GET  /<repo>/info/refs?service=git-upload-pack`  - Ref discovery, from the mirror
//! - `POST /<repo>/git-upload-pack`                    - Negotiation / pack, from the mirror
//! - `GET  /<repo>/info/refs?service=git-receive-pack` - Push discovery, forwarded
//! - `POST /<repo>/git-receive-pack`                   - Push, forwarded
//!
//! Repository paths have any depth, so the protocol endpoints are served by
//! the fallback handler and classified by suffix.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::instrument;

use super::passthrough;
use super::reporting::{CommandRecorder, Served};
use super::request::{GitService, ProtocolRequest};
use super::serve;
use crate::error::ProxyError;
use crate::hooks::RequestInfo;
use crate::AppState;

const GIT_PROTOCOL_HEADER: &str = "git-protocol";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "ok\n",
    )
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let text = state
        .metrics
        .encode()
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        text,
    )
        .into_response())
}

/// Every smart-HTTP request.  Errors never escape: each one is reported,
/// counted and turned into a response by the recorder.
#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
async fn handle_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut recorder = CommandRecorder::new(
        &state,
        RequestInfo {
            method,
            uri,
            headers,
        },
    );

    let command = {
        let request = recorder.request();
        ProtocolRequest::classify(&request.method, request.uri.path(), request.uri.query())
    };
    let command = match command {
        Ok(command) => command,
        Err(err) => return recorder.fail(err),
    };
    recorder.set_command(command.command_type());

    match dispatch(&state, &command, body, &mut recorder).await {
        Ok(served) => recorder.respond(served),
        Err(err) => recorder.fail(err),
    }
}

async fn dispatch(
    state: &AppState,
    command: &ProtocolRequest,
    body: Body,
    recorder: &mut CommandRecorder,
) -> Result<Served, ProxyError> {
    let url = state.hooks.canonicalizer.canonicalize(command.repo_path())?;
    let git_protocol = recorder
        .request()
        .headers
        .get(GIT_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match command {
        ProtocolRequest::InfoRefs {
            service: GitService::UploadPack,
            ..
        } => serve::serve_info_refs(state, &url, git_protocol.as_deref(), recorder).await,
        ProtocolRequest::InfoRefs {
            service: GitService::ReceivePack,
            ..
        } => {
            let query = recorder.request().uri.query().map(str::to_string);
            passthrough::forward(state, &url, "info/refs", query.as_deref(), body, recorder).await
        }
        ProtocolRequest::UploadPack { .. } => {
            let encoding = recorder
                .request()
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let request = serve::read_request_body(
                body,
                encoding.as_deref(),
                state.config.proxy.max_request_body_bytes,
                &recorder.request_size(),
            )
            .await?;
            serve::serve_upload_pack(state, &url, request, git_protocol.as_deref(), recorder).await
        }
        ProtocolRequest::ReceivePack { .. } => {
            passthrough::forward(state, &url, "git-receive-pack", None, body, recorder).await
        }
    }
}
