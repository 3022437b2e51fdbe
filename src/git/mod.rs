//! Git command wrappers and bare repository management.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.

pub mod bare_repo;
pub mod commands;

pub use bare_repo::{git_config_set, init_bare_repo, set_head, set_remote, validate_bare_repo};
pub use commands::{
    git_fetch_mirror, git_missing_objects, git_remote_head, git_upload_pack_streamed, FetchResult,
};
