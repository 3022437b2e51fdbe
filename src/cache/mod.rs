//! Local mirror cache.
//!
//! [`CacheManager`] maps canonical repository URLs to [`MirrorEntry`]s, each
//! a bare repository on disk with its own refresh state machine and store
//! lock.

pub mod entry;
pub mod manager;
pub mod url;

pub use entry::{EntrySnapshot, MirrorEntry, MirrorReadGuard, MirrorState};
pub use manager::{CacheError, CacheManager};
pub use url::{CanonicalRepoUrl, CanonicalizeError};
