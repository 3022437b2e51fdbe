//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary.
//! Children are spawned with `kill_on_drop` so that dropping a future or a
//! response stream never leaves a stray git process behind.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::executor::ByteStream;

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Summary of a `git fetch` into a mirror.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Number of refs that were updated (new or changed).
    pub refs_updated: usize,
    /// Objects the remote reported sending, 0 if it did not say.
    pub objects_received: u64,
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch --prune --force --progress <remote> +refs/*:refs/*` inside
/// an existing bare repo, handing every progress line on stderr to
/// `on_progress` as it arrives.
#[instrument(skip(env_vars, on_progress), fields(repo = %repo_path.display(), %remote))]
pub async fn git_fetch_mirror(
    repo_path: &Path,
    remote: &str,
    env_vars: &[(String, String)],
    mut on_progress: impl FnMut(&str) + Send,
) -> Result<FetchResult> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("fetch")
        .arg("--prune")
        .arg("--force")
        .arg("--progress")
        .arg(remote)
        .arg("+refs/*:refs/*");

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!("spawning git fetch");

    let mut child = cmd.spawn().context("failed to spawn git fetch")?;
    let mut stderr = child
        .stderr
        .take()
        .context("git fetch stderr was not captured")?;

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut refs_updated = 0;
    let mut objects_received = 0;
    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = stderr
            .read(&mut buf)
            .await
            .context("failed to read git fetch stderr")?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        for line in drain_progress_lines(&mut pending, false) {
            refs_updated += count_updated_refs(&line);
            if objects_received == 0 {
                objects_received = parse_total_objects(&line);
            }
            on_progress(&line);
            push_tail(&mut tail, line);
        }
    }
    for line in drain_progress_lines(&mut pending, true) {
        on_progress(&line);
        push_tail(&mut tail, line);
    }

    let status = child.wait().await.context("failed to wait for git fetch")?;
    if !status.success() {
        bail!(
            "git fetch failed (status {}): {}",
            status,
            Vec::from(tail).join("\n"),
        );
    }

    debug!(refs_updated, objects_received, "git fetch complete");
    Ok(FetchResult {
        refs_updated,
        objects_received,
    })
}

/// Split complete lines (terminated by `\n` or `\r`) off the front of
/// `pending`.  With `flush`, whatever remains is returned as a final line.
fn drain_progress_lines(pending: &mut Vec<u8>, flush: bool) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    if flush && !pending.is_empty() {
        let line = String::from_utf8_lossy(pending).trim().to_string();
        pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Count ref-update lines (` -> `) in `git fetch` stderr.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

/// Parse the object count from a `remote: Total N (...)` line; 0 when absent.
fn parse_total_objects(stderr: &str) -> u64 {
    for line in stderr.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.split("Total").nth(1) {
            for token in rest.split_whitespace() {
                if let Ok(n) = token
                    .trim_matches(|c: char| !c.is_ascii_digit())
                    .parse::<u64>()
                {
                    return n;
                }
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Upload-pack (streamed)
// ---------------------------------------------------------------------------

/// Run `git upload-pack --stateless-rpc [--advertise-refs] <repo_path>` and
/// return its stdout as a stream.
///
/// `input` is written to stdin from a separate task so a large response can
/// never deadlock against a large request.  If git exits non-zero after the
/// last chunk, the stream ends with an error item carrying its stderr.
/// Dropping the stream kills the process.
#[instrument(skip(input), fields(repo = %repo_path.display(), advertise_refs))]
pub async fn git_upload_pack_streamed(
    repo_path: &Path,
    input: Option<Bytes>,
    advertise_refs: bool,
    git_protocol: Option<&str>,
) -> Result<ByteStream> {
    let mut cmd = Command::new("git");
    cmd.arg("upload-pack").arg("--stateless-rpc");
    if advertise_refs {
        cmd.arg("--advertise-refs");
    }
    cmd.arg(repo_path);

    if let Some(protocol) = git_protocol {
        cmd.env("GIT_PROTOCOL", protocol);
    }

    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .context("failed to spawn git upload-pack (streamed)")?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        tokio::spawn(async move {
            // upload-pack may stop reading early and close its end; the exit
            // status reports the real problem in that case.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "git upload-pack closed stdin early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .context("git upload-pack stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_tail(s)));

    let state = UploadPackStream {
        stdout: ReaderStream::new(stdout),
        child: Some(child),
        stderr,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        let child = state.child.as_mut()?;
        match state.stdout.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), state)),
            Some(Err(e)) => {
                state.child = None;
                Some((Err(e), state))
            }
            None => {
                let status = child.wait().await;
                let stderr = match state.stderr.take() {
                    Some(handle) => handle.await.unwrap_or_default(),
                    None => String::new(),
                };
                state.child = None;
                match exit_error(status, &stderr) {
                    None => None,
                    Some(err) => Some((Err(err), state)),
                }
            }
        }
    });

    Ok(stream.boxed())
}

struct UploadPackStream {
    stdout: ReaderStream<tokio::process::ChildStdout>,
    /// `None` once the stream has finished.
    child: Option<Child>,
    stderr: Option<JoinHandle<String>>,
}

fn exit_error(status: std::io::Result<ExitStatus>, stderr: &str) -> Option<std::io::Error> {
    match status {
        Ok(status) if status.success() => None,
        Ok(status) => {
            warn!(%status, stderr = %stderr.trim(), "git upload-pack exited with non-zero status");
            Some(std::io::Error::other(format!(
                "git upload-pack exited with {status}: {}",
                stderr.trim()
            )))
        }
        Err(e) => Some(e),
    }
}

async fn read_tail(mut reader: impl AsyncRead + Unpin) -> String {
    let mut out = Vec::new();
    // Errors here only shorten the diagnostic text.
    let _ = reader.read_to_end(&mut out).await;
    let text = String::from_utf8_lossy(&out);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// cat-file
// ---------------------------------------------------------------------------

/// Return the subset of `names` (object ids or ref names) the repository at
/// `repo_path` cannot resolve, using `git cat-file --batch-check`.
#[instrument(skip(names), fields(repo = %repo_path.display(), count = names.len()))]
pub async fn git_missing_objects(repo_path: &Path, names: &[String]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("cat-file")
        .arg("--batch-check");

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn git cat-file")?;

    let mut input = String::new();
    for name in names {
        input.push_str(name);
        input.push('\n');
    }
    let mut stdin = child
        .stdin
        .take()
        .context("git cat-file stdin was not captured")?;
    let writer = tokio::spawn(async move {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await
    });

    let output = child
        .wait_with_output()
        .await
        .context("failed to wait for git cat-file")?;
    writer
        .await
        .context("git cat-file writer task failed")?
        .context("failed to write to git cat-file stdin")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git cat-file --batch-check failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    let missing = parse_missing(&String::from_utf8_lossy(&output.stdout));
    debug!(missing = missing.len(), "git cat-file complete");
    Ok(missing)
}

/// Pick the names reported as `<name> missing` out of `--batch-check` output.
fn parse_missing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim_end().strip_suffix(" missing"))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// ls-remote
// ---------------------------------------------------------------------------

/// Ask `remote` which branch its `HEAD` points at, via
/// `git ls-remote --symref <remote> HEAD`.  `None` when the remote's `HEAD`
/// is detached or missing.
#[instrument(skip(env_vars), fields(repo = %repo_path.display(), %remote))]
pub async fn git_remote_head(
    repo_path: &Path,
    remote: &str,
    env_vars: &[(String, String)],
) -> Result<Option<String>> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("ls-remote")
        .arg("--symref")
        .arg(remote)
        .arg("HEAD");

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!("spawning git ls-remote");

    let output = cmd
        .output()
        .await
        .context("failed to spawn git ls-remote")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git ls-remote failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    let head = parse_symref_head(&String::from_utf8_lossy(&output.stdout));
    debug!(?head, "git ls-remote complete");
    Ok(head)
}

/// Pick the target of `HEAD` out of `ls-remote --symref` output, whose
/// symref lines read `ref: <target>\tHEAD`.
fn parse_symref_head(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (target, name) = line.strip_prefix("ref: ")?.split_once('\t')?;
        (name.trim() == "HEAD").then(|| target.trim().to_string())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_updated_refs_basic() {
        let stderr = "\
From https://git.example.com/org/repo
   abc1234..def5678  main       -> main
 * [new branch]      feature-x  -> feature-x
";
        assert_eq!(count_updated_refs(stderr), 2);
    }

    #[test]
    fn count_updated_refs_empty() {
        assert_eq!(count_updated_refs(""), 0);
    }

    #[test]
    fn parse_total_objects_with_total() {
        let stderr = "\
remote: Enumerating objects: 100, done.
remote: Total 42 (delta 10), reused 40 (delta 8), pack-reused 0
";
        assert_eq!(parse_total_objects(stderr), 42);
        assert_eq!(parse_total_objects("nothing here"), 0);
    }

    #[test]
    fn progress_lines_split_on_carriage_returns() {
        let mut pending = b"Receiving objects:  10% (1/10)\rReceiving objects: 100% (10/10), done.\nResolv".to_vec();
        let lines = drain_progress_lines(&mut pending, false);
        assert_eq!(
            lines,
            vec![
                "Receiving objects:  10% (1/10)".to_string(),
                "Receiving objects: 100% (10/10), done.".to_string(),
            ]
        );
        assert_eq!(pending, b"Resolv");

        let rest = drain_progress_lines(&mut pending, true);
        assert_eq!(rest, vec!["Resolv".to_string()]);
        assert!(pending.is_empty());
    }

    #[test]
    fn symref_head_is_parsed() {
        let out = "ref: refs/heads/trunk\tHEAD\n1111111111111111111111111111111111111111\tHEAD\n";
        assert_eq!(parse_symref_head(out), Some("refs/heads/trunk".to_string()));
    }

    #[test]
    fn detached_head_has_no_symref() {
        let out = "1111111111111111111111111111111111111111\tHEAD\n";
        assert_eq!(parse_symref_head(out), None);
        assert_eq!(parse_symref_head(""), None);
    }

    #[test]
    fn parse_missing_picks_missing_lines_only() {
        let stdout = "\
1111111111111111111111111111111111111111 commit 230
2222222222222222222222222222222222222222 missing
refs/heads/gone missing
";
        assert_eq!(
            parse_missing(stdout),
            vec![
                "2222222222222222222222222222222222222222".to_string(),
                "refs/heads/gone".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_objects_short_circuits_on_empty_input() {
        let missing = git_missing_objects(Path::new("/nonexistent"), &[])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
