//! Serving protocol commands out of a local mirror.
//!
//! The executor only ever reads from the mirror.  It checks that every
//! object a client wants is present before starting `git upload-pack`, so
//! the front door can refresh and retry instead of serving an incomplete
//! negotiation.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, instrument};

use crate::git;
use crate::http::pktline;

/// Single-pass response body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The request references objects or refs the mirror does not have.
    #[error("mirror is missing {} requested object(s)", .0.len())]
    MissingObjects(Vec<String>),
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Ref advertisement for `git-upload-pack`, without the smart-HTTP
    /// service header.
    async fn advertise_refs(
        &self,
        mirror: &Path,
        git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError>;

    /// Answer one stateless upload-pack request.
    async fn upload_pack(
        &self,
        mirror: &Path,
        request: Bytes,
        git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError>;
}

/// [`CommandExecutor`] backed by the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitExecutor;

impl GitExecutor {
    async fn ensure_repo(mirror: &Path) -> Result<(), ExecError> {
        if git::validate_bare_repo(mirror).await {
            Ok(())
        } else {
            Err(ExecError::Local(anyhow::anyhow!(
                "{} is not a bare repository",
                mirror.display()
            )))
        }
    }
}

#[async_trait]
impl CommandExecutor for GitExecutor {
    #[instrument(skip(self), fields(mirror = %mirror.display()))]
    async fn advertise_refs(
        &self,
        mirror: &Path,
        git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError> {
        Self::ensure_repo(mirror).await?;
        Ok(git::git_upload_pack_streamed(mirror, None, true, git_protocol).await?)
    }

    #[instrument(skip(self, request), fields(mirror = %mirror.display(), request_len = request.len()))]
    async fn upload_pack(
        &self,
        mirror: &Path,
        request: Bytes,
        git_protocol: Option<&str>,
    ) -> Result<ByteStream, ExecError> {
        Self::ensure_repo(mirror).await?;

        let wanted = pktline::requested_objects(&request);
        let missing = git::git_missing_objects(mirror, &wanted).await?;
        if !missing.is_empty() {
            debug!(wanted = wanted.len(), missing = missing.len(), "mirror is missing wants");
            return Err(ExecError::MissingObjects(missing));
        }

        Ok(git::git_upload_pack_streamed(mirror, Some(request), false, git_protocol).await?)
    }
}
