//! Upstream fetch coordination.
//!
//! [`FetchCoordinator::ensure_fresh`] makes sure at most one refresh per
//! mirror is in flight.  The caller that finds the mirror stale starts the
//! refresh on a detached task; every other caller arriving meanwhile joins
//! it and gets the same result.  Because the refresh does not live on any
//! request's future, a client hanging up cannot cancel it.

mod git;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::cache::entry::{wait_for_refresh, RefreshLease, RefreshTicket};
use crate::cache::{CanonicalRepoUrl, MirrorEntry};
use crate::config::FetchConfig;
use crate::error::RefreshError;
use crate::hooks::{OperationReporter, RunningOperation};
use crate::metrics::{CacheState, CanonicalStatus, MetricsRegistry, OutboundCommand, OutboundLabels};

pub use git::GitFetcher;

/// Action name handed to the operation reporter for every refresh.
pub const FETCH_ACTION: &str = "fetch-upstream";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// The mirror has not been fetched successfully by this process yet.
    Initial,
    Incremental,
}

impl FetchKind {
    pub fn outbound_command(self) -> OutboundCommand {
        match self {
            Self::Initial => OutboundCommand::InitialFetch,
            Self::Incremental => OutboundCommand::IncrementalFetch,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The origin could not be reached or refused the fetch.
    #[error("{0:#}")]
    Upstream(anyhow::Error),
    /// The local mirror could not be prepared or written.
    #[error("{0:#}")]
    Local(anyhow::Error),
}

/// Pulls a mirror up to date with its origin.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &CanonicalRepoUrl,
        mirror: &Path,
        kind: FetchKind,
        op: &dyn RunningOperation,
    ) -> Result<(), FetchError>;
}

/// How [`FetchCoordinator::ensure_fresh`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing to do.
    AlreadyFresh,
    /// This caller started the refresh.
    Refreshed,
    /// This caller waited for a refresh somebody else started.
    Joined,
}

impl Freshness {
    pub fn cache_state(self) -> CacheState {
        match self {
            Self::AlreadyFresh => CacheState::Hit,
            Self::Refreshed | Self::Joined => CacheState::Miss,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FetchCoordinator {
    fetcher: Arc<dyn UpstreamFetcher>,
    reporter: Arc<dyn OperationReporter>,
    metrics: MetricsRegistry,
    limit: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    max_staleness: Option<Duration>,
}

impl FetchCoordinator {
    pub fn new(
        fetcher: Arc<dyn UpstreamFetcher>,
        reporter: Arc<dyn OperationReporter>,
        metrics: MetricsRegistry,
        config: &FetchConfig,
        max_staleness: Option<Duration>,
    ) -> Self {
        let limit = (config.max_concurrent_upstream_fetches > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_upstream_fetches)));
        Self {
            fetcher,
            reporter,
            metrics,
            limit,
            timeout: config.timeout_secs.map(Duration::from_secs),
            max_staleness,
        }
    }

    /// Bring `entry` up to date, starting or joining a refresh as needed.
    pub async fn ensure_fresh(&self, entry: &Arc<MirrorEntry>) -> Result<Freshness, RefreshError> {
        match entry.begin_refresh(self.max_staleness) {
            RefreshTicket::AlreadyFresh => Ok(Freshness::AlreadyFresh),
            RefreshTicket::Join(rx) => {
                let started = Instant::now();
                let result = wait_for_refresh(rx, entry.key()).await;
                self.metrics.metrics.record_upstream_wait(started.elapsed());
                result.map(|()| Freshness::Joined)
            }
            RefreshTicket::Lead(lease) => {
                let rx = lease.subscribe();
                let this = self.clone();
                tokio::spawn(async move { this.run_refresh(lease).await });
                wait_for_refresh(rx, entry.key())
                    .await
                    .map(|()| Freshness::Refreshed)
            }
        }
    }

    #[instrument(skip_all, fields(repo = %lease.entry().key()))]
    async fn run_refresh(self, lease: RefreshLease) {
        let entry = Arc::clone(lease.entry());
        let kind = if lease.generation() == 0 {
            FetchKind::Initial
        } else {
            FetchKind::Incremental
        };
        let op = self.reporter.start(FETCH_ACTION, entry.key());

        let _permit = match &self.limit {
            Some(limit) => match Arc::clone(limit).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    let err = RefreshError::Local {
                        url: entry.key().to_string(),
                        message: format!("fetch limiter closed: {e}"),
                    };
                    op.report_done(Some(&err));
                    lease.complete(Err(err));
                    return;
                }
            },
            None => None,
        };

        let store = entry.write_store().await;
        info!(?kind, "refreshing mirror from upstream");

        let started = Instant::now();
        let fetch = self
            .fetcher
            .fetch(entry.key(), entry.local_path(), kind, op.as_ref());
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result.map_err(|e| refresh_error(entry.key(), e)),
                Err(_) => Err(RefreshError::TimedOut {
                    url: entry.key().to_string(),
                    timeout,
                }),
            },
            None => fetch.await.map_err(|e| refresh_error(entry.key(), e)),
        };
        let elapsed = started.elapsed();
        drop(store);

        let status = match &result {
            Ok(()) => CanonicalStatus::Ok,
            Err(err) => err.canonical_status(),
        };
        self.metrics.metrics.record_outbound(
            &OutboundLabels {
                command_type: kind.outbound_command(),
                canonical_status: status,
            },
            elapsed,
        );

        match &result {
            Ok(()) => info!(
                ?kind,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "mirror refreshed"
            ),
            Err(err) => warn!(?kind, error = %err, "mirror refresh failed"),
        }
        op.report_done(result.as_ref().err());
        lease.complete(result);
    }
}

fn refresh_error(url: &CanonicalRepoUrl, err: FetchError) -> RefreshError {
    match err {
        FetchError::Upstream(e) => RefreshError::Upstream {
            url: url.to_string(),
            message: format!("{e:#}"),
        },
        FetchError::Local(e) => RefreshError::Local {
            url: url.to_string(),
            message: format!("{e:#}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, MirrorState};
    use crate::config::CacheConfig;
    use crate::testing::{blocking_samples, FakeFetcher, RecordingReporter};

    struct Harness {
        _dir: tempfile::TempDir,
        cache: CacheManager,
        fetcher: Arc<FakeFetcher>,
        reporter: Arc<RecordingReporter>,
        metrics: MetricsRegistry,
        coordinator: FetchCoordinator,
    }

    fn harness(fetch: FetchConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new();
        let cache = CacheManager::new(
            &CacheConfig {
                root: dir.path().to_path_buf(),
                max_staleness_secs: None,
            },
            &metrics,
        );
        let fetcher = Arc::new(FakeFetcher::new(Duration::from_millis(200)));
        let reporter = Arc::new(RecordingReporter::default());
        let coordinator = FetchCoordinator::new(
            fetcher.clone(),
            reporter.clone(),
            metrics.clone(),
            &fetch,
            None,
        );
        Harness {
            _dir: dir,
            cache,
            fetcher,
            reporter,
            metrics,
            coordinator,
        }
    }

    fn entry(h: &Harness) -> Arc<MirrorEntry> {
        let url = CanonicalRepoUrl::parse("https://git.example.com/org/repo").unwrap();
        h.cache.resolve(&url).unwrap()
    }

    fn outbound(h: &Harness, command_type: OutboundCommand, status: CanonicalStatus) -> u64 {
        h.metrics
            .metrics
            .outbound_commands
            .get_or_create(&OutboundLabels {
                command_type,
                canonical_status: status,
            })
            .get()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let h = harness(FetchConfig::default());
        let entry = entry(&h);

        let results = futures::future::join_all(
            (0..10).map(|_| h.coordinator.ensure_fresh(&entry)),
        )
        .await;

        assert_eq!(h.fetcher.calls(), 1);
        let refreshed = results
            .iter()
            .filter(|r| matches!(r, Ok(Freshness::Refreshed)))
            .count();
        let joined = results
            .iter()
            .filter(|r| matches!(r, Ok(Freshness::Joined)))
            .count();
        assert_eq!((refreshed, joined), (1, 9));
        assert_eq!(blocking_samples(&h.metrics), 9);
        assert_eq!(outbound(&h, OutboundCommand::InitialFetch, CanonicalStatus::Ok), 1);
        assert_eq!(entry.state(), MirrorState::Fresh);
        assert_eq!(h.reporter.started(), vec![FETCH_ACTION.to_string()]);
        assert_eq!(h.reporter.done_count(), 1);
    }

    #[tokio::test]
    async fn fresh_entries_are_not_refetched() {
        let h = harness(FetchConfig::default());
        let entry = entry(&h);

        assert_eq!(h.coordinator.ensure_fresh(&entry).await, Ok(Freshness::Refreshed));
        assert_eq!(h.coordinator.ensure_fresh(&entry).await, Ok(Freshness::AlreadyFresh));
        assert_eq!(h.fetcher.calls(), 1);

        // A reported miss makes the next call fetch incrementally.
        h.cache.report_missing(&entry, entry.generation());
        assert_eq!(h.coordinator.ensure_fresh(&entry).await, Ok(Freshness::Refreshed));
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(h.fetcher.kinds(), vec![FetchKind::Initial, FetchKind::Incremental]);
        assert_eq!(
            outbound(&h, OutboundCommand::IncrementalFetch, CanonicalStatus::Ok),
            1
        );
    }

    #[tokio::test]
    async fn failed_refresh_is_retried_by_the_next_caller() {
        let h = harness(FetchConfig::default());
        let entry = entry(&h);
        h.fetcher.fail_next("remote: Repository not found.");

        let err = h.coordinator.ensure_fresh(&entry).await.unwrap_err();
        assert!(matches!(err, RefreshError::Upstream { ref message, .. } if message.contains("not found")));
        assert_eq!(entry.state(), MirrorState::Failed);
        assert_eq!(entry.snapshot().last_refresh_error, Some(err));
        assert_eq!(
            outbound(&h, OutboundCommand::InitialFetch, CanonicalStatus::UpstreamError),
            1
        );
        assert_eq!(h.reporter.done_errors(), 1);

        assert_eq!(h.coordinator.ensure_fresh(&entry).await, Ok(Freshness::Refreshed));
        assert_eq!(entry.state(), MirrorState::Fresh);
        assert_eq!(h.fetcher.calls(), 2);
        // Still initial: the first attempt never succeeded.
        assert_eq!(h.fetcher.kinds(), vec![FetchKind::Initial, FetchKind::Initial]);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let h = harness(FetchConfig {
            max_concurrent_upstream_fetches: 1,
            timeout_secs: None,
        });
        let coordinator = FetchCoordinator {
            timeout: Some(Duration::from_millis(20)),
            ..h.coordinator.clone()
        };
        h.fetcher.set_delay(Duration::from_secs(30));
        let entry = entry(&h);

        let err = coordinator.ensure_fresh(&entry).await.unwrap_err();
        assert!(matches!(err, RefreshError::TimedOut { .. }));
        assert_eq!(entry.state(), MirrorState::Failed);
    }

    #[tokio::test]
    async fn dropping_the_leader_does_not_cancel_the_refresh() {
        let h = harness(FetchConfig::default());
        let entry = entry(&h);

        let leader = {
            let coordinator = h.coordinator.clone();
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { coordinator.ensure_fresh(&entry).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        // Joins the refresh that is still running on its own task.
        assert_eq!(h.coordinator.ensure_fresh(&entry).await, Ok(Freshness::Joined));
        assert_eq!(entry.state(), MirrorState::Fresh);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn slow_reader_does_not_stall_refresh_or_other_readers() {
        let h = harness(FetchConfig::default());
        h.fetcher.set_delay(Duration::ZERO);
        let entry = entry(&h);
        h.coordinator.ensure_fresh(&entry).await.unwrap();

        // A reader still streaming its response finds a want missing.
        let slow = h.cache.acquire_for_read(&entry).await;
        h.cache.report_missing(&entry, slow.generation());
        let refresh = h.coordinator.ensure_fresh(&entry);
        tokio::pin!(refresh);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut refresh)
            .await
            .is_err());
        assert_eq!(h.fetcher.calls(), 1);

        let other = tokio::time::timeout(Duration::from_millis(500), h.cache.acquire_for_read(&entry))
            .await
            .expect("reader held back by a queued refresh");
        drop(other);
        drop(slow);

        let result = tokio::time::timeout(Duration::from_secs(1), refresh)
            .await
            .expect("refresh never ran");
        assert_eq!(result, Ok(Freshness::Refreshed));
        assert_eq!(h.fetcher.calls(), 2);
    }
}
