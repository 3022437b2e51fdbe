//! Bare mirror repository setup.
//!
//! Helpers for initialising, validating and configuring the bare
//! repositories that back each mirror entry.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a bare Git repository at `path`.
///
/// The directory may already exist (the cache manager creates it when the
/// entry is registered).  If it already contains a `HEAD` file this is a
/// no-op.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    if path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create mirror directory: {}", path.display()))?;

    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a bare Git repository (a directory with a
/// `HEAD` file).  A lightweight heuristic, not an integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return false;
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !objects_ok {
        warn!(path = %path.display(), "HEAD exists but objects/ is missing");
    }

    true
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Run `git -C <repo> config <key> <value>`.
#[instrument(fields(repo = %repo_path.display(), %key, %value))]
pub async fn git_config_set(repo_path: &Path, key: &str, value: &str) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("config")
        .arg(key)
        .arg(value)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git config")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git config {key} failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }
    Ok(())
}

/// Set (or update) a named remote on a bare repo.
///
/// Runs `git remote add <name> <url>` or, if the remote already exists,
/// `git remote set-url <name> <url>`.
#[instrument(fields(repo = %repo_path.display(), %name, %url))]
pub async fn set_remote(repo_path: &Path, name: &str, url: &str) -> Result<()> {
    let add_output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("remote")
        .arg("add")
        .arg(name)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git remote add")?;

    if add_output.status.success() {
        debug!("remote added");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&add_output.stderr);
    if !stderr.contains("already exists") {
        bail!(
            "git remote add failed (status {}): {}",
            add_output.status,
            stderr.trim(),
        );
    }

    let set_output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("remote")
        .arg("set-url")
        .arg(name)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git remote set-url")?;

    if !set_output.status.success() {
        let set_stderr = String::from_utf8_lossy(&set_output.stderr);
        bail!(
            "git remote set-url failed (status {}): {}",
            set_output.status,
            set_stderr.trim(),
        );
    }

    debug!("remote URL updated");
    Ok(())
}

/// Point the repository's `HEAD` at `refname` with `git symbolic-ref`.
#[instrument(fields(repo = %repo_path.display(), %refname))]
pub async fn set_head(repo_path: &Path, refname: &str) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .arg("symbolic-ref")
        .arg("HEAD")
        .arg(refname)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git symbolic-ref")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git symbolic-ref HEAD {refname} failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
