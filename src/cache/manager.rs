//! Registry of mirror entries and their on-disk layout.
//!
//! Mirrors are stored as bare Git repositories under
//! `{root}/{host[_port]}/{name}-{digest}.git`.  Entries are created lazily on
//! first request and never removed by this process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus_client::metrics::gauge::Gauge;
use tracing::{debug, info};

use crate::cache::entry::{MirrorEntry, MirrorReadGuard};
use crate::cache::url::CanonicalRepoUrl;
use crate::config::CacheConfig;
use crate::metrics::MetricsRegistry;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create mirror directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

/// Owns the cache root and the canonical-URL to entry map.
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
    entries: Arc<DashMap<CanonicalRepoUrl, Arc<MirrorEntry>>>,
    max_staleness: Option<Duration>,
    mirrors: Gauge,
}

impl CacheManager {
    pub fn new(config: &CacheConfig, metrics: &MetricsRegistry) -> Self {
        Self {
            root: config.root.clone(),
            entries: Arc::new(DashMap::new()),
            max_staleness: config.max_staleness_secs.map(Duration::from_secs),
            mirrors: metrics.metrics.mirrors.clone(),
        }
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    /// On-disk path of the bare mirror for `url`.
    pub fn mirror_path(&self, url: &CanonicalRepoUrl) -> PathBuf {
        self.root.join(url.host_dir()).join(url.mirror_dir_name())
    }

    /// Return the entry for `url`, creating it (and its directory) on first
    /// use.  Concurrent first calls observe exactly one creation.
    pub fn resolve(&self, url: &CanonicalRepoUrl) -> Result<Arc<MirrorEntry>, CacheError> {
        if let Some(existing) = self.entries.get(url) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.entries.entry(url.clone()) {
            Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let path = self.mirror_path(url);
                std::fs::create_dir_all(&path).map_err(|source| CacheError::CreateDir {
                    path: path.clone(),
                    source,
                })?;
                info!(repo = %url, path = %path.display(), "registered new mirror");

                let entry = Arc::new(MirrorEntry::new(url.clone(), path));
                vacant.insert(Arc::clone(&entry));
                self.mirrors.inc();
                Ok(entry)
            }
        }
    }

    /// Shared access to an entry's object store; waits only while a refresh
    /// holds it exclusively.
    pub async fn acquire_for_read(&self, entry: &Arc<MirrorEntry>) -> MirrorReadGuard {
        entry.read_store().await
    }

    /// Record that a reader at `generation` found objects missing.  Returns
    /// whether the entry was marked stale by this call.
    pub fn report_missing(&self, entry: &MirrorEntry, generation: u64) -> bool {
        let marked = entry.mark_missing(generation);
        debug!(repo = %entry.key(), generation, marked, "missing objects reported");
        marked
    }

    pub fn is_fresh(&self, entry: &MirrorEntry) -> bool {
        entry.is_fresh(self.max_staleness)
    }

    /// Snapshot of every known entry.
    pub fn entries(&self) -> Vec<Arc<MirrorEntry>> {
        self.entries
            .iter()
            .map(|item| Arc::clone(item.value()))
            .collect()
    }
}
