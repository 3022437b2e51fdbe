//! In-memory stand-ins for the git-backed fetcher and executor.
//!
//! The fake origin is a list of object names.  A fake fetch copies that list
//! into `objects.txt` inside the mirror; the fake executor serves from that
//! file and reports wants it does not list as missing.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::cache::CanonicalRepoUrl;
use crate::error::RefreshError;
use crate::executor::{ByteStream, CommandExecutor, ExecError};
use crate::fetch::{FetchError, FetchKind, UpstreamFetcher};
use crate::hooks::{OperationReporter, RunningOperation};
use crate::http::pktline::{encode_pkt, encode_pkt_line, requested_objects, PktLine};
use crate::metrics::MetricsRegistry;

const OBJECTS_FILE: &str = "objects.txt";

pub const OID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const OID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub struct FakeFetcher {
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    fail_next: Mutex<Option<String>>,
    origin: Mutex<Vec<String>>,
    kinds: Mutex<Vec<FetchKind>>,
}

impl FakeFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Mutex::new(delay),
            fail_next: Mutex::new(None),
            origin: Mutex::new(vec![OID_A.to_string()]),
            kinds: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<FetchKind> {
        self.kinds.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Make the next fetch fail with `message` as the origin's complaint.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    /// Add an object to the fake origin.
    pub fn push_object(&self, oid: &str) {
        self.origin.lock().unwrap().push(oid.to_string());
    }
}

#[async_trait]
impl UpstreamFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _url: &CanonicalRepoUrl,
        mirror: &Path,
        kind: FetchKind,
        op: &dyn RunningOperation,
    ) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let failure = self.fail_next.lock().unwrap().take();
        if let Some(message) = failure {
            return Err(FetchError::Upstream(anyhow::anyhow!(message)));
        }

        let contents = self.origin.lock().unwrap().join("\n");
        tokio::fs::write(mirror.join(OBJECTS_FILE), contents)
            .await
            .map_err(|e| FetchError::Local(e.into()))?;
        op.report_progress("Receiving objects: 100% done.");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeExecutor {
    upload_calls: AtomicUsize,
}

impl FakeExecutor {
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    async fn objects(mirror: &Path) -> Result<Vec<String>, ExecError> {
        let contents = tokio::fs::read_to_string(mirror.join(OBJECTS_FILE))
            .await
            .map_err(|e| ExecError::Local(e.into()))?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}

fn one_chunk(body: Vec<u8>) -> ByteStream {
    futures::stream::iter(vec![Ok(Bytes::from(body))]).boxed()
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn advertise_refs(
        &self,
        mirror: &Path,
        git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError> {
        let objects = Self::objects(mirror).await?;
        let mut body = Vec::new();
        if git_protocol == Some("version=2") {
            body.extend(encode_pkt_line(b"version 2\n"));
        }
        for (i, oid) in objects.iter().enumerate() {
            body.extend(encode_pkt_line(format!("{oid} refs/heads/b{i}\n").as_bytes()));
        }
        body.extend(encode_pkt(&PktLine::Flush));
        Ok(one_chunk(body))
    }

    async fn upload_pack(
        &self,
        mirror: &Path,
        request: Bytes,
        _git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let objects = Self::objects(mirror).await?;
        let wanted = requested_objects(&request);
        let missing: Vec<String> = wanted
            .iter()
            .filter(|w| !objects.contains(w))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ExecError::MissingObjects(missing));
        }
        Ok(one_chunk(format!("PACK {}", wanted.join(" ")).into_bytes()))
    }
}

/// A v0 upload-pack request wanting `oids`.
pub fn upload_pack_request(oids: &[&str]) -> Vec<u8> {
    let mut req = Vec::new();
    for oid in oids {
        req.extend(encode_pkt_line(format!("want {oid}\n").as_bytes()));
    }
    req.extend(encode_pkt(&PktLine::Flush));
    req.extend(encode_pkt_line(b"done\n"));
    req
}

// ---------------------------------------------------------------------------
// Operation reporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingReporter {
    started: Mutex<Vec<String>>,
    done: Arc<Mutex<Vec<Option<String>>>>,
}

impl RecordingReporter {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn done_count(&self) -> usize {
        self.done.lock().unwrap().len()
    }

    pub fn done_errors(&self) -> usize {
        self.done.lock().unwrap().iter().filter(|d| d.is_some()).count()
    }
}

impl OperationReporter for RecordingReporter {
    fn start(&self, action: &str, _url: &CanonicalRepoUrl) -> Box<dyn RunningOperation> {
        self.started.lock().unwrap().push(action.to_string());
        Box::new(RecordingOperation {
            done: Arc::clone(&self.done),
        })
    }
}

struct RecordingOperation {
    done: Arc<Mutex<Vec<Option<String>>>>,
}

impl RunningOperation for RecordingOperation {
    fn report_progress(&self, _message: &str) {}

    fn report_done(&self, error: Option<&RefreshError>) {
        self.done.lock().unwrap().push(error.map(ToString::to_string));
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Number of upstream-fetch blocking time samples recorded so far.
pub fn blocking_samples(metrics: &MetricsRegistry) -> u64 {
    let text = metrics.encode().unwrap();
    text.lines()
        .find_map(|line| line.strip_prefix("mirrorcache_upstream_fetch_blocking_seconds_count "))
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}
