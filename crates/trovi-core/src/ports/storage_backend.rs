//! StorageBackend port - コンテンツ保存先の統一ストリーミング I/O
//!
//! すべての backend variant（objectstore, git, archive）はこの trait を実装します。
//! 呼び出し側は `Box<dyn StorageBackend>` だけを扱い、variant を意識しません。
//!
//! # 設計原則
//! - identity は `(name, content_id)`。content_id は最初の `open()` で遅延生成される
//! - `open()` で content lock を取得し、`close()` で必ず解放する
//! - close 後（sealed）は書き込み不可。sealed は一方向の遷移
//! - open/close の対は [`crate::backends::scoped`] で強制できる

use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{ContentUrn, DownloadLink, StorageError};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name as used in content URNs (`objectstore`, `git`, `archive`).
    fn name(&self) -> &str;

    /// None until content exists or `open()` generated a new identifier.
    fn content_id(&self) -> Option<&str>;

    /// Whether this variant ever accepts writes.
    fn writable(&self) -> bool;

    /// False once closed or once the read cursor reached the end of the content.
    fn readable(&self) -> bool;

    fn seekable(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool;

    async fn open(&mut self) -> Result<(), StorageError>;

    /// Returns the number of bytes accepted.
    async fn write(&mut self, chunk: Bytes) -> Result<usize, StorageError>;

    /// Reads at most `max` bytes. An empty result means end of content.
    async fn read(&mut self, max: usize) -> Result<Bytes, StorageError>;

    /// Finalizes the content and releases the content lock, even if
    /// finalization fails. A second call fails with `AlreadyClosed`.
    async fn close(&mut self) -> Result<(), StorageError>;

    /// Position is a segment index, not a byte offset.
    async fn seek(&mut self, _pos: SeekFrom) -> Result<u64, StorageError> {
        Err(StorageError::NotSeekable(self.name().to_string()))
    }

    fn tell(&self) -> Result<u64, StorageError> {
        Err(StorageError::NotSeekable(self.name().to_string()))
    }

    /// Lazily fetched and cached. 0 for content that is not stored yet.
    async fn size(&mut self) -> Result<u64, StorageError>;

    /// Signed or public HTTP URL for the current content, if the variant has one.
    async fn temporary_download_url(&self) -> Result<Option<DownloadLink>, StorageError> {
        Ok(None)
    }

    /// Git remote for the current content, if the variant has one.
    async fn git_remote(&self) -> Result<Option<DownloadLink>, StorageError> {
        Ok(None)
    }

    fn to_urn(&self) -> Result<ContentUrn, StorageError> {
        match self.content_id() {
            Some(id) => Ok(ContentUrn::new(self.name(), id)),
            None => Err(StorageError::ContentNotFound(self.name().to_string())),
        }
    }

    /// Every access method for the current content.
    async fn get_links(&self) -> Result<Vec<DownloadLink>, StorageError> {
        let links: Vec<DownloadLink> = [self.temporary_download_url().await?, self.git_remote().await?]
            .into_iter()
            .flatten()
            .collect();
        if links.is_empty() {
            return Err(StorageError::NoAccessMethod(self.name().to_string()));
        }
        Ok(links)
    }
}
