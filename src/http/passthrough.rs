//! Write path: push discovery and push are relayed to the origin as-is.
//! The mirror is never consulted or touched.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use futures::StreamExt;
use tracing::{debug, instrument};

use super::reporting::{CommandRecorder, Served};
use crate::cache::CanonicalRepoUrl;
use crate::error::ProxyError;
use crate::metrics::{CacheState, CanonicalStatus, OutboundCommand, OutboundLabels};
use crate::AppState;

/// Request headers relayed to the origin.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "content-type",
    "content-encoding",
    "git-protocol",
    "accept",
    "user-agent",
];

/// Response headers relayed back to the client.
const RELAYED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "www-authenticate",
    "content-encoding",
];

/// Forward `body` to `<url>/<suffix>[?query]` and stream the origin's answer
/// back.
#[instrument(skip(state, url, body, recorder), fields(repo = %url))]
pub(crate) async fn forward(
    state: &AppState,
    url: &CanonicalRepoUrl,
    suffix: &str,
    query: Option<&str>,
    body: Body,
    recorder: &mut CommandRecorder,
) -> Result<Served, ProxyError> {
    recorder.set_cache_state(CacheState::Bypass);
    let target = url.endpoint(suffix, query);
    let method = recorder.request().method.clone();

    let mut builder = state.http_client.request(method.clone(), &target);
    for &name in FORWARDED_REQUEST_HEADERS {
        for value in recorder.request().headers.get_all(name) {
            builder = builder.header(name, value.clone());
        }
    }
    if method == Method::POST {
        let received = recorder.request_size();
        let counted = body.into_data_stream().inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        });
        builder = builder.body(reqwest::Body::wrap_stream(counted));
    }

    debug!(%target, "forwarding to origin");
    let started = Instant::now();
    let result = builder.send().await;
    let elapsed = started.elapsed();

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            record_outbound(state, CanonicalStatus::UpstreamError, elapsed);
            return Err(ProxyError::Forward {
                url: target,
                source: e.into(),
            });
        }
    };

    let status = response.status();
    let canonical_status = classify_origin_status(status);
    record_outbound(state, canonical_status, elapsed);

    let mut headers = HeaderMap::new();
    for &name in RELAYED_RESPONSE_HEADERS {
        for value in response.headers().get_all(name) {
            headers.append(name, value.clone());
        }
    }

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();

    Ok(Served {
        status,
        headers,
        body,
        canonical_status,
    })
}

fn record_outbound(state: &AppState, canonical_status: CanonicalStatus, elapsed: std::time::Duration) {
    state.metrics.metrics.record_outbound(
        &OutboundLabels {
            command_type: OutboundCommand::ReceivePack,
            canonical_status,
        },
        elapsed,
    );
}

/// The origin's verdict, seen from the proxy.
fn classify_origin_status(status: StatusCode) -> CanonicalStatus {
    if status.is_client_error() {
        CanonicalStatus::ClientError
    } else if status.is_server_error() {
        CanonicalStatus::UpstreamError
    } else {
        CanonicalStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_statuses_are_classified() {
        assert_eq!(classify_origin_status(StatusCode::OK), CanonicalStatus::Ok);
        assert_eq!(
            classify_origin_status(StatusCode::UNAUTHORIZED),
            CanonicalStatus::ClientError
        );
        assert_eq!(
            classify_origin_status(StatusCode::SERVICE_UNAVAILABLE),
            CanonicalStatus::UpstreamError
        );
    }
}
