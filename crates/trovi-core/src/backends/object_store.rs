//! objectstore backend - segmented large-object upload
//!
//! # レイアウト
//! - segment: `/{container}/{content_id}/segments/{index:020}`
//! - manifest: `/{container}/{content_id}`（`X-Object-Manifest: {container}/{content_id}/segments/`）
//!
//! manifest が書かれるまでコンテンツは完成とみなされない。途中で止まった
//! upload は segment だけが残り、manifest がないので外からは見えない。
//!
//! seek/tell の単位は segment index。読み出しは内部的に byte offset を追い、
//! `tell()` は `ceil(offset / segment_size)` を返す。

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use uuid::Uuid;

use crate::domain::{DownloadLink, RemoteError, StorageError};
use crate::ports::{Clock, ObjectStoreClient, StorageBackend};

use super::lock::ContentLockRegistry;
use super::state::BackendState;

pub const OBJECTSTORE_BACKEND: &str = "objectstore";

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct ObjectStoreOptions {
    pub container: String,
    pub temp_url_key: String,
    pub link_lifespan: TimeDelta,
    /// Bytes per segment. Also the unit of `seek`/`tell`.
    pub segment_size: u64,
}

pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectStoreClient>,
    locks: Arc<ContentLockRegistry>,
    clock: Arc<dyn Clock>,
    options: ObjectStoreOptions,
    content_id: Option<String>,
    content_type: String,
    state: BackendState,

    /// Manifest already exists remotely.
    sealed_remote: bool,
    read_offset: u64,
}

impl ObjectStoreBackend {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        locks: Arc<ContentLockRegistry>,
        clock: Arc<dyn Clock>,
        options: ObjectStoreOptions,
        content_id: Option<String>,
        content_type: Option<String>,
    ) -> Result<Self, StorageError> {
        if let Some(id) = &content_id {
            if id.is_empty() || id.contains('/') {
                return Err(StorageError::InvalidContentId {
                    backend: OBJECTSTORE_BACKEND.to_string(),
                    content_id: id.clone(),
                    reason: "must be a single non-empty path segment".to_string(),
                });
            }
        }
        Ok(Self {
            client,
            locks,
            clock,
            options,
            content_id,
            content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            state: BackendState::new(),
            sealed_remote: false,
            read_offset: 0,
        })
    }

    fn object_path(&self) -> Result<String, StorageError> {
        let id = self
            .content_id
            .as_deref()
            .ok_or_else(|| StorageError::ContentNotFound(OBJECTSTORE_BACKEND.to_string()))?;
        Ok(format!("/{}/{}", self.options.container, id))
    }

    fn segment_prefix(&self, content_id: &str) -> String {
        format!("{}/{}/segments/", self.options.container, content_id)
    }

    fn segment_path(&self, content_id: &str, index: u64) -> String {
        format!("/{}{:020}", self.segment_prefix(content_id), index)
    }

    fn segment_size(&self) -> u64 {
        self.options.segment_size.max(1)
    }

    /// Random ids until one is absent remotely.
    async fn generate_content_id(&self) -> Result<String, StorageError> {
        loop {
            let candidate = Uuid::new_v4().to_string();
            let path = format!("/{}/{}", self.options.container, candidate);
            match self.client.head(&path).await? {
                None => return Ok(candidate),
                Some(_) => tracing::warn!(content_id = %candidate, "content id collision, retrying"),
            }
        }
    }

    fn sign(&self, account_path: &str, exp: i64) -> Result<String, StorageError> {
        let body = format!("GET\n{exp}\n{account_path}");
        let mut mac = HmacSha1::new_from_slice(self.options.temp_url_key.as_bytes())
            .map_err(|e| RemoteError::Malformed(format!("temp url key: {e}")))?;
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn sync_cursor_to_offset(&mut self) {
        let segment = self.read_offset.div_ceil(self.segment_size());
        self.state.set_cursor(segment);
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &str {
        OBJECTSTORE_BACKEND
    }

    fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    fn writable(&self) -> bool {
        !self.state.is_closed() && !self.sealed_remote
    }

    fn readable(&self) -> bool {
        if self.state.is_closed() || self.content_id.is_none() {
            return false;
        }
        self.state.size.is_none_or(|size| self.read_offset < size)
    }

    fn seekable(&self) -> bool {
        true
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn open(&mut self) -> Result<(), StorageError> {
        if self.state.is_closed() {
            return Err(StorageError::AlreadyClosed(OBJECTSTORE_BACKEND.to_string()));
        }
        if self.state.is_open() {
            return Ok(());
        }

        let content_id = match &self.content_id {
            Some(id) => id.clone(),
            None => {
                let id = self.generate_content_id().await?;
                tracing::info!(content_id = %id, "allocated new objectstore content id");
                self.content_id = Some(id.clone());
                self.state.size = Some(0);
                id
            }
        };

        let lock = self.locks.acquire(&content_id).await;
        self.state.hold(lock);

        if self.state.size.is_none() {
            let meta = self.client.head(&self.object_path()?).await?;
            self.sealed_remote = meta.as_ref().is_some_and(|m| m.manifest.is_some());
            self.state.size = Some(meta.map_or(0, |m| m.content_length));
        }
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<usize, StorageError> {
        self.state.check_writable(OBJECTSTORE_BACKEND, self.writable())?;
        if chunk.is_empty() {
            return Ok(0);
        }
        let index = self.state.claim_segment()?;
        let content_id = self
            .content_id
            .clone()
            .ok_or_else(|| StorageError::ContentNotFound(OBJECTSTORE_BACKEND.to_string()))?;

        let written = chunk.len();
        self.client
            .put(&self.segment_path(&content_id, index), chunk)
            .await?;
        self.state.advance(written as u64);
        tracing::debug!(content_id = %content_id, segment = index, bytes = written, "segment stored");
        Ok(written)
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, StorageError> {
        if self.state.is_closed() {
            return Err(StorageError::NotReadable(OBJECTSTORE_BACKEND.to_string()));
        }
        let path = self.object_path()?;
        let size = self.size().await?;
        if self.read_offset >= size || max == 0 {
            return Ok(Bytes::new());
        }

        let end = size.min(self.read_offset.saturating_add(max as u64));
        let chunk = self.client.get_range(&path, self.read_offset..end).await?;
        self.read_offset += chunk.len() as u64;
        self.sync_cursor_to_offset();
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.state.begin_close(OBJECTSTORE_BACKEND)?;

        let mut finalized = Ok(());
        let segments = self.state.segments_written();
        if let Some(id) = self.content_id.clone() {
            if segments > 0 && !self.sealed_remote {
                let path = format!("/{}/{}", self.options.container, id);
                finalized = self
                    .client
                    .put_manifest(&path, &self.segment_prefix(&id), &self.content_type)
                    .await
                    .map_err(StorageError::from);
                if finalized.is_ok() {
                    self.sealed_remote = true;
                    tracing::info!(content_id = %id, segments, "manifest written");
                }
            }
        }

        self.state.seal();
        finalized
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidSeek {
            backend: OBJECTSTORE_BACKEND.to_string(),
            reason: reason.to_string(),
        };

        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.state.next_segment().checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let total = self.size().await?.div_ceil(self.segment_size());
                total.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| invalid("position out of range"))?;

        self.state.set_cursor(target);
        let size = self.state.size.unwrap_or(0);
        self.read_offset = target.saturating_mul(self.segment_size()).min(size);
        Ok(target)
    }

    fn tell(&self) -> Result<u64, StorageError> {
        Ok(self.state.next_segment())
    }

    async fn size(&mut self) -> Result<u64, StorageError> {
        if let Some(size) = self.state.size {
            return Ok(size);
        }
        if self.content_id.is_none() {
            return Ok(0);
        }
        let meta = self.client.head(&self.object_path()?).await?;
        let size = meta.map_or(0, |m| m.content_length);
        self.state.size = Some(size);
        Ok(size)
    }

    async fn temporary_download_url(&self) -> Result<Option<DownloadLink>, StorageError> {
        let path = self.object_path()?;
        let endpoint = self.client.endpoint().await?;
        let account = endpoint
            .find("/v1/")
            .map(|i| &endpoint[i..])
            .ok_or_else(|| RemoteError::Malformed(format!("storage url without /v1/: {endpoint}")))?;

        let exp = self.clock.now().timestamp() + self.options.link_lifespan.num_seconds();
        let signature = self.sign(&format!("{account}{path}"), exp)?;
        let exp_at = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| RemoteError::Malformed(format!("link expiry out of range: {exp}")))?;

        Ok(Some(DownloadLink::http_get(
            format!("{endpoint}{path}?temp_url_sig={signature}&temp_url_expires={exp}"),
            exp_at,
        )))
    }
}
