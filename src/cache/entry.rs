//! Per-repository mirror state.
//!
//! A [`MirrorEntry`] pairs a small state machine (guarded by a plain mutex
//! that is never held across an await point) with a lock over the mirror's
//! object store.  Readers share the store; a refresh takes it exclusively
//! while `git fetch` writes into it.  A refresh waiting for readers to drain
//! does not hold back readers that arrive meanwhile.
//!
//! Only one refresh can be in flight per entry.  The caller that starts it
//! holds a [`RefreshLease`]; everyone else gets a `watch` receiver and is
//! woken with the same result when the lease completes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::cache::url::CanonicalRepoUrl;
use crate::error::RefreshError;

pub(crate) type RefreshResult = Result<(), RefreshError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// Directory exists, nothing fetched yet by this process.
    Uninitialized,
    /// A refresh is running.
    Refreshing,
    /// Last refresh succeeded and nothing has invalidated it since.
    Fresh,
    /// A reader found objects missing from the mirror.
    Stale,
    /// Last refresh failed; the next caller retries.
    Failed,
}

/// Point-in-time copy of an entry's bookkeeping.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub state: MirrorState,
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<RefreshError>,
    pub generation: u64,
}

#[derive(Debug)]
struct EntryInner {
    state: MirrorState,
    last_refresh_time: Option<DateTime<Utc>>,
    last_refresh_at: Option<Instant>,
    last_refresh_error: Option<RefreshError>,
    /// Number of successful refreshes so far.
    generation: u64,
    in_flight: Option<watch::Receiver<Option<RefreshResult>>>,
}

/// What a caller of [`MirrorEntry::begin_refresh`] has to do next.
pub(crate) enum RefreshTicket {
    AlreadyFresh,
    Join(watch::Receiver<Option<RefreshResult>>),
    Lead(RefreshLease),
}

// ---------------------------------------------------------------------------
// MirrorEntry
// ---------------------------------------------------------------------------

/// One locally cached repository.
#[derive(Debug)]
pub struct MirrorEntry {
    key: CanonicalRepoUrl,
    local_path: PathBuf,
    inner: Mutex<EntryInner>,
    store: Arc<StoreLock>,
}

impl MirrorEntry {
    pub(crate) fn new(key: CanonicalRepoUrl, local_path: PathBuf) -> Self {
        Self {
            key,
            local_path,
            inner: Mutex::new(EntryInner {
                state: MirrorState::Uninitialized,
                last_refresh_time: None,
                last_refresh_at: None,
                last_refresh_error: None,
                generation: 0,
                in_flight: None,
            }),
            store: Arc::new(StoreLock::default()),
        }
    }

    pub fn key(&self) -> &CanonicalRepoUrl {
        &self.key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn state(&self) -> MirrorState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether a refresh has ever succeeded, i.e. the mirror holds data that
    /// can be served best-effort when a later refresh fails.
    pub fn has_data(&self) -> bool {
        self.lock().generation > 0
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let inner = self.lock();
        EntrySnapshot {
            state: inner.state,
            last_refresh_time: inner.last_refresh_time,
            last_refresh_error: inner.last_refresh_error.clone(),
            generation: inner.generation,
        }
    }

    /// Fresh and, when a staleness window is configured, still inside it.
    pub fn is_fresh(&self, max_staleness: Option<Duration>) -> bool {
        is_fresh(&self.lock(), max_staleness)
    }

    /// Atomically decide whether the caller refreshes, joins a running
    /// refresh, or has nothing to do.
    pub(crate) fn begin_refresh(self: &Arc<Self>, max_staleness: Option<Duration>) -> RefreshTicket {
        let mut inner = self.lock();
        if inner.state == MirrorState::Refreshing {
            if let Some(rx) = inner.in_flight.as_ref() {
                return RefreshTicket::Join(rx.clone());
            }
        }
        if is_fresh(&inner, max_staleness) {
            return RefreshTicket::AlreadyFresh;
        }

        let (tx, rx) = watch::channel(None);
        let previous = inner.state;
        inner.state = MirrorState::Refreshing;
        inner.in_flight = Some(rx);
        debug!(repo = %self.key, ?previous, "refresh started");

        RefreshTicket::Lead(RefreshLease {
            entry: Arc::clone(self),
            tx,
            generation: inner.generation,
            completed: false,
        })
    }

    /// Mark the entry stale after a reader found objects missing.
    ///
    /// Ignored unless the entry is still at `observed_generation`: a refresh
    /// that finished in the meantime already covers the miss, and one that is
    /// running will be joined.
    pub(crate) fn mark_missing(&self, observed_generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.state == MirrorState::Fresh && inner.generation == observed_generation {
            inner.state = MirrorState::Stale;
            debug!(repo = %self.key, generation = observed_generation, "marked stale");
            return true;
        }
        false
    }

    /// Shared access to the object store.
    pub(crate) async fn read_store(self: &Arc<Self>) -> MirrorReadGuard {
        let guard = self.store.read().await;
        MirrorReadGuard {
            generation: self.generation(),
            entry: Arc::clone(self),
            _guard: guard,
        }
    }

    /// Exclusive access to the object store, held by the refresher only.
    pub(crate) async fn write_store(&self) -> StoreWriteGuard {
        self.store.write().await
    }

    fn lock(&self) -> MutexGuard<'_, EntryInner> {
        lock_recovering(&self.inner)
    }
}

/// The critical sections never panic; recover the data if one did.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_fresh(inner: &EntryInner, max_staleness: Option<Duration>) -> bool {
    if inner.state != MirrorState::Fresh {
        return false;
    }
    match (max_staleness, inner.last_refresh_at) {
        (Some(window), Some(at)) => at.elapsed() < window,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Store lock
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreHolders {
    readers: usize,
    writing: bool,
}

/// Reader-preferring shared/exclusive lock.  Readers only wait while a
/// writer holds the store, never while one is queued.
#[derive(Debug, Default)]
struct StoreLock {
    holders: Mutex<StoreHolders>,
    released: Notify,
}

impl StoreLock {
    async fn read(self: &Arc<Self>) -> StoreReadGuard {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut holders = lock_recovering(&self.holders);
                if !holders.writing {
                    holders.readers += 1;
                    return StoreReadGuard {
                        lock: Arc::clone(self),
                    };
                }
            }
            released.await;
        }
    }

    async fn write(self: &Arc<Self>) -> StoreWriteGuard {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut holders = lock_recovering(&self.holders);
                if !holders.writing && holders.readers == 0 {
                    holders.writing = true;
                    return StoreWriteGuard {
                        lock: Arc::clone(self),
                    };
                }
            }
            released.await;
        }
    }
}

#[derive(Debug)]
pub(crate) struct StoreReadGuard {
    lock: Arc<StoreLock>,
}

impl Drop for StoreReadGuard {
    fn drop(&mut self) {
        let drained = {
            let mut holders = lock_recovering(&self.lock.holders);
            holders.readers -= 1;
            holders.readers == 0
        };
        if drained {
            self.lock.released.notify_waiters();
        }
    }
}

/// Exclusive hold on a mirror's object store.
#[derive(Debug)]
pub(crate) struct StoreWriteGuard {
    lock: Arc<StoreLock>,
}

impl Drop for StoreWriteGuard {
    fn drop(&mut self) {
        lock_recovering(&self.lock.holders).writing = false;
        self.lock.released.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Read guard
// ---------------------------------------------------------------------------

/// Shared hold on a mirror's object store.  Dropping it lets a waiting
/// refresh proceed.
#[derive(Debug)]
pub struct MirrorReadGuard {
    entry: Arc<MirrorEntry>,
    generation: u64,
    _guard: StoreReadGuard,
}

impl MirrorReadGuard {
    pub fn entry(&self) -> &Arc<MirrorEntry> {
        &self.entry
    }

    /// Refresh generation the mirror was at when the guard was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ---------------------------------------------------------------------------
// Refresh lease
// ---------------------------------------------------------------------------

/// Exclusive right to refresh one entry.  Completing it records the result
/// and wakes every joined caller; dropping it uncompleted records an
/// [`RefreshError::Aborted`] so joiners never hang.
pub(crate) struct RefreshLease {
    entry: Arc<MirrorEntry>,
    tx: watch::Sender<Option<RefreshResult>>,
    generation: u64,
    completed: bool,
}

impl RefreshLease {
    pub(crate) fn entry(&self) -> &Arc<MirrorEntry> {
        &self.entry
    }

    /// Successful refreshes the entry had before this one.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<RefreshResult>> {
        self.tx.subscribe()
    }

    pub(crate) fn complete(mut self, result: RefreshResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: RefreshResult) {
        if self.completed {
            return;
        }
        self.completed = true;
        {
            let mut inner = self.entry.lock();
            match &result {
                Ok(()) => {
                    inner.state = MirrorState::Fresh;
                    inner.generation += 1;
                    inner.last_refresh_time = Some(Utc::now());
                    inner.last_refresh_at = Some(Instant::now());
                    inner.last_refresh_error = None;
                }
                Err(err) => {
                    inner.state = MirrorState::Failed;
                    inner.last_refresh_error = Some(err.clone());
                }
            }
            inner.in_flight = None;
        }
        // Receivers may all be gone; the state above is what matters then.
        let _ = self.tx.send(Some(result));
    }
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        if !self.completed {
            let url = self.entry.key.to_string();
            self.finish(Err(RefreshError::Aborted { url }));
        }
    }
}

/// Wait on a joined refresh and inherit its result.
pub(crate) async fn wait_for_refresh(
    mut rx: watch::Receiver<Option<RefreshResult>>,
    url: &CanonicalRepoUrl,
) -> RefreshResult {
    match rx.wait_for(Option::is_some).await {
        Ok(result) => result.clone().unwrap_or(Ok(())),
        Err(_) => Err(RefreshError::Aborted {
            url: url.to_string(),
        }),
    }
}
