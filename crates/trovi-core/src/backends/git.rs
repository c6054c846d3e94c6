//! git backend - read-only reference to `remote@ref`
//!
//! バイト転送はしない。リンクだけを生成する:
//! - GitHub / GitLab の http(s) remote には zip アーカイブの http リンク
//! - すべての remote に git リンク（remote + ref）

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

use crate::domain::{DownloadLink, StorageError};
use crate::ports::{Clock, StorageBackend};

use super::lock::ContentLockRegistry;
use super::state::BackendState;

pub const GIT_BACKEND: &str = "git";
pub const DEFAULT_REF: &str = "HEAD";

/// Hosting providers with a known archive endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    fn detect(remote: &Url) -> Option<Self> {
        if !matches!(remote.scheme(), "http" | "https") {
            return None;
        }
        match remote.host_str()? {
            "github.com" | "www.github.com" => Some(Self::GitHub),
            "gitlab.com" | "www.gitlab.com" => Some(Self::GitLab),
            _ => None,
        }
    }

    fn archive_url(self, remote: &str, reference: &str) -> String {
        let base = remote.trim_end_matches('/');
        let base = base.strip_suffix(".git").unwrap_or(base);
        match self {
            Self::GitHub => format!("{base}/archive/{reference}.zip"),
            Self::GitLab => {
                let repo = base.rsplit('/').next().unwrap_or(base);
                format!("{base}/-/archive/{reference}/{repo}-{reference}.zip")
            }
        }
    }
}

/// Splits `remote@ref`. An `@` inside the remote's authority
/// (`git@github.com:org/repo`, `https://user@host/repo`) is not a ref separator.
pub fn parse_content_id(content_id: &str) -> Result<(String, String), StorageError> {
    let (remote, reference) = match content_id.rsplit_once('@') {
        Some((remote, reference)) if is_ref_separator(remote, reference) => (remote, reference),
        _ => (content_id, DEFAULT_REF),
    };

    if remote.is_empty() {
        return Err(StorageError::InvalidContentId {
            backend: GIT_BACKEND.to_string(),
            content_id: content_id.to_string(),
            reason: "missing remote".to_string(),
        });
    }
    Ok((remote.to_string(), reference.to_string()))
}

fn is_ref_separator(remote: &str, reference: &str) -> bool {
    if remote.is_empty() {
        return true;
    }
    if reference.is_empty() || reference.contains(':') {
        return false;
    }
    match remote.split_once("://") {
        Some((_, rest)) => rest.contains('/'),
        None => remote.contains(':') || remote.contains('/'),
    }
}

pub struct GitBackend {
    locks: Arc<ContentLockRegistry>,
    clock: Arc<dyn Clock>,
    link_lifespan: TimeDelta,
    content_id: String,
    remote: String,
    reference: String,
    state: BackendState,
}

impl GitBackend {
    pub fn new(
        locks: Arc<ContentLockRegistry>,
        clock: Arc<dyn Clock>,
        link_lifespan: TimeDelta,
        content_id: &str,
    ) -> Result<Self, StorageError> {
        let (remote, reference) = parse_content_id(content_id)?;
        Ok(Self {
            locks,
            clock,
            link_lifespan,
            content_id: content_id.to_string(),
            remote,
            reference,
            state: BackendState::new(),
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn expiry(&self) -> DateTime<Utc> {
        self.clock.now() + self.link_lifespan
    }
}

#[async_trait]
impl StorageBackend for GitBackend {
    fn name(&self) -> &str {
        GIT_BACKEND
    }

    fn content_id(&self) -> Option<&str> {
        Some(&self.content_id)
    }

    fn writable(&self) -> bool {
        false
    }

    fn readable(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn open(&mut self) -> Result<(), StorageError> {
        if self.state.is_closed() {
            return Err(StorageError::AlreadyClosed(GIT_BACKEND.to_string()));
        }
        if !self.state.is_open() {
            let lock = self.locks.acquire(&self.content_id).await;
            self.state.hold(lock);
        }
        Ok(())
    }

    async fn write(&mut self, _chunk: Bytes) -> Result<usize, StorageError> {
        Err(StorageError::NotWritable(GIT_BACKEND.to_string()))
    }

    async fn read(&mut self, _max: usize) -> Result<Bytes, StorageError> {
        Err(StorageError::NotReadable(GIT_BACKEND.to_string()))
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.state.begin_close(GIT_BACKEND)?;
        self.state.seal();
        Ok(())
    }

    async fn size(&mut self) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn temporary_download_url(&self) -> Result<Option<DownloadLink>, StorageError> {
        let Ok(parsed) = Url::parse(&self.remote) else {
            return Ok(None);
        };
        Ok(Provider::detect(&parsed).map(|provider| {
            DownloadLink::http_get(
                provider.archive_url(&self.remote, &self.reference),
                self.expiry(),
            )
        }))
    }

    async fn git_remote(&self) -> Result<Option<DownloadLink>, StorageError> {
        Ok(Some(DownloadLink::git(
            self.remote.clone(),
            self.reference.clone(),
            self.expiry(),
        )))
    }
}
