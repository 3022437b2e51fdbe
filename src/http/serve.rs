//! Read path: answer ref discovery and upload-pack from the mirror.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use super::pktline;
use super::request::GitService;
use super::reporting::{CommandRecorder, Served};
use crate::cache::{CanonicalRepoUrl, MirrorEntry, MirrorReadGuard};
use crate::error::{ProxyError, RefreshError};
use crate::executor::ExecError;
use crate::fetch::Freshness;
use crate::metrics::CacheState;
use crate::AppState;

const ADVERTISEMENT_CONTENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";

/// A read against one mirror entry.  Tracks whether this command already
/// went through a refresh, so that at most one upstream round trip is made
/// per command.
struct MirrorRead<'a> {
    state: &'a AppState,
    entry: Arc<MirrorEntry>,
    refreshed: bool,
    /// Refresh failure papered over by serving the previous mirror contents.
    degraded: Option<RefreshError>,
}

impl<'a> MirrorRead<'a> {
    async fn begin(
        state: &'a AppState,
        url: &CanonicalRepoUrl,
        recorder: &mut CommandRecorder,
    ) -> Result<MirrorRead<'a>, ProxyError> {
        let entry = state.cache.resolve(url)?;
        // Holds if the client goes away while the refresh is still running.
        recorder.set_cache_state(if state.cache.is_fresh(&entry) {
            CacheState::Hit
        } else {
            CacheState::Miss
        });
        let mut read = MirrorRead {
            state,
            entry,
            refreshed: false,
            degraded: None,
        };

        match state.fetcher.ensure_fresh(&read.entry).await {
            Ok(freshness) => {
                recorder.set_cache_state(freshness.cache_state());
                read.refreshed = freshness != Freshness::AlreadyFresh;
            }
            Err(err) if read.entry.has_data() => {
                warn!(repo = %url, error = %err, "refresh failed; serving previous mirror contents");
                recorder.set_cache_state(CacheState::Miss);
                recorder.report_error(&ProxyError::Refresh(err.clone()));
                read.refreshed = true;
                read.degraded = Some(err);
            }
            Err(err) => {
                recorder.set_cache_state(CacheState::Miss);
                return Err(err.into());
            }
        }
        Ok(read)
    }

    async fn acquire(&self) -> MirrorReadGuard {
        self.state.cache.acquire_for_read(&self.entry).await
    }

    /// React to objects missing from the mirror: refresh once, or give up if
    /// this command already refreshed.
    async fn recover_missing(
        &mut self,
        generation: u64,
        missing: Vec<String>,
        recorder: &mut CommandRecorder,
    ) -> Result<(), ProxyError> {
        if let Some(err) = self.degraded.take() {
            return Err(err.into());
        }
        if self.refreshed {
            return Err(ProxyError::ObjectUnavailable {
                url: self.entry.key().to_string(),
                objects: missing,
            });
        }

        debug!(repo = %self.entry.key(), missing = missing.len(), "mirror is missing wants; refreshing");
        self.state.cache.report_missing(&self.entry, generation);
        recorder.set_cache_state(CacheState::Miss);
        self.refreshed = true;
        self.state.fetcher.ensure_fresh(&self.entry).await?;
        Ok(())
    }
}

/// Whether the client asked for protocol v2 in its `Git-Protocol` header.
pub(crate) fn is_protocol_v2(git_protocol: Option<&str>) -> bool {
    git_protocol.is_some_and(|p| p.split(':').any(|kv| kv.trim() == "version=2"))
}

// ---------------------------------------------------------------------------
// info/refs
// ---------------------------------------------------------------------------

#[instrument(skip(state, url, recorder), fields(repo = %url))]
pub(crate) async fn serve_info_refs(
    state: &AppState,
    url: &CanonicalRepoUrl,
    git_protocol: Option<&str>,
    recorder: &mut CommandRecorder,
) -> Result<Served, ProxyError> {
    let read = MirrorRead::begin(state, url, recorder).await?;
    let guard = read.acquire().await;

    let refs = state
        .executor
        .advertise_refs(read.entry.local_path(), git_protocol)
        .await
        .map_err(|e| exec_error(url, e))?;
    // git has the refs open; a refresh may proceed while the body streams.
    drop(guard);

    let body = if is_protocol_v2(git_protocol) {
        refs
    } else {
        let header = pktline::service_advertisement_header(GitService::UploadPack.as_str());
        let header = Bytes::from(header);
        futures::stream::once(async move { Ok(header) })
            .chain(refs)
            .boxed()
    };

    Ok(Served::ok(ADVERTISEMENT_CONTENT_TYPE, body))
}

// ---------------------------------------------------------------------------
// upload-pack
// ---------------------------------------------------------------------------

#[instrument(skip(state, url, request, recorder), fields(repo = %url, request_len = request.len()))]
pub(crate) async fn serve_upload_pack(
    state: &AppState,
    url: &CanonicalRepoUrl,
    request: Bytes,
    git_protocol: Option<&str>,
    recorder: &mut CommandRecorder,
) -> Result<Served, ProxyError> {
    let mut read = MirrorRead::begin(state, url, recorder).await?;

    loop {
        let guard = read.acquire().await;
        match state
            .executor
            .upload_pack(read.entry.local_path(), request.clone(), git_protocol)
            .await
        {
            Ok(pack) => {
                // Wants were checked and git is running; fetches only add
                // objects, so the store need not stay locked while streaming.
                drop(guard);
                return Ok(Served::ok(RESULT_CONTENT_TYPE, pack));
            }
            Err(ExecError::MissingObjects(missing)) => {
                let generation = guard.generation();
                drop(guard);
                read.recover_missing(generation, missing, recorder).await?;
            }
            Err(ExecError::Local(e)) => return Err(ProxyError::Internal(e)),
        }
    }
}

fn exec_error(url: &CanonicalRepoUrl, err: ExecError) -> ProxyError {
    match err {
        ExecError::MissingObjects(objects) => ProxyError::ObjectUnavailable {
            url: url.to_string(),
            objects,
        },
        ExecError::Local(e) => ProxyError::Internal(e),
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Read an upload-pack request body into memory, enforcing `limit` on both
/// the bytes received and the decoded size.
pub(crate) async fn read_request_body(
    body: Body,
    content_encoding: Option<&str>,
    limit: usize,
    received: &AtomicU64,
) -> Result<Bytes, ProxyError> {
    let gzip = match content_encoding.map(|e| e.trim().to_ascii_lowercase()) {
        None => false,
        Some(e) if e.is_empty() || e == "identity" => false,
        Some(e) if e == "gzip" || e == "x-gzip" => true,
        Some(other) => {
            return Err(ProxyError::BadRequest(format!(
                "unsupported content encoding {other:?}"
            )))
        }
    };

    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| ProxyError::ClientDisconnected)?;
        received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }

    if !gzip {
        return Ok(Bytes::from(buf));
    }

    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(buf.as_slice())
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| ProxyError::BadRequest(format!("invalid gzip request body: {e}")))?;
    if decoded.len() > limit {
        return Err(ProxyError::PayloadTooLarge { limit });
    }
    Ok(Bytes::from(decoded))
}
