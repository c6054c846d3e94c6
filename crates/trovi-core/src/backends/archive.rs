//! archive backend - DOI を発行するアーカイブ（Zenodo）
//!
//! # フロー
//! - content id なしで open: 新規 draft を作成
//! - content id（DOI）ありで最初の write: その record の新バージョン draft を作成し、
//!   継承されたファイルを削除する
//! - write: pipe に書き込む。pipe の読み側はバックグラウンドの upload task が消費する
//! - close: pipe を閉じて upload task を待ち、失敗を伝播してから publish。
//!   publish で得た DOI が新しい content id になる
//!
//! DOI を持つ content は DOI で lock する。新規 draft は publish まで id がないので lock しない。
//!
//! draft の作成（新規・新バージョンとも）には DepositionMetadata が必要。
//! 読み出しだけならメタデータは不要。

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::domain::{DownloadLink, RemoteError, StorageError};
use crate::ports::{ByteStream, Deposition, DepositionClient, DepositionMetadata, StorageBackend};

use super::lock::ContentLockRegistry;
use super::state::BackendState;

pub const ARCHIVE_BACKEND: &str = "archive";
pub const ARCHIVE_FILENAME: &str = "archive.tar.gz";
pub const LEGACY_ARCHIVE_FILENAME: &str = "archive.zip";

/// Record id of a DOI of the form `10.<registrant>/zenodo.<record>`.
pub fn record_from_doi(doi: &str) -> Result<String, StorageError> {
    let invalid = || StorageError::InvalidContentId {
        backend: ARCHIVE_BACKEND.to_string(),
        content_id: doi.to_string(),
        reason: "DOI is invalid (wrong format)".to_string(),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    let rest = doi.strip_prefix("10.").ok_or_else(invalid)?;
    let (registrant, suffix) = rest.split_once('/').ok_or_else(invalid)?;
    let record = suffix.strip_prefix("zenodo.").ok_or_else(invalid)?;
    if !all_digits(registrant) || !all_digits(record) {
        return Err(invalid());
    }
    Ok(record.to_string())
}

/// Upload running in the background while the caller keeps writing.
struct PendingUpload {
    deposition_id: String,
    writer: DuplexStream,
    task: JoinHandle<Result<(), RemoteError>>,
}

pub struct ArchiveBackend {
    client: Arc<dyn DepositionClient>,
    locks: Arc<ContentLockRegistry>,
    metadata: Option<DepositionMetadata>,
    pipe_capacity: usize,
    content_id: Option<String>,
    state: BackendState,

    draft: Option<Deposition>,
    upload: Option<PendingUpload>,

    /// Mutex only to keep the backend `Sync`; accessed through `get_mut`.
    reader: Mutex<Option<ByteStream>>,
    pending: Bytes,
    bytes_read: u64,
    exhausted: bool,
}

impl ArchiveBackend {
    pub fn new(
        client: Arc<dyn DepositionClient>,
        locks: Arc<ContentLockRegistry>,
        metadata: Option<DepositionMetadata>,
        pipe_capacity: usize,
        content_id: Option<String>,
    ) -> Result<Self, StorageError> {
        if let Some(doi) = &content_id {
            record_from_doi(doi)?;
        }
        Ok(Self {
            client,
            locks,
            metadata,
            pipe_capacity: pipe_capacity.max(1),
            content_id,
            state: BackendState::new(),
            draft: None,
            upload: None,
            reader: Mutex::new(None),
            pending: Bytes::new(),
            bytes_read: 0,
            exhausted: false,
        })
    }

    fn record(&self) -> Result<String, StorageError> {
        let doi = self
            .content_id
            .as_deref()
            .ok_or_else(|| StorageError::ContentNotFound(ARCHIVE_BACKEND.to_string()))?;
        record_from_doi(doi)
    }

    async fn start_draft(&mut self) -> Result<Deposition, StorageError> {
        if let Some(draft) = &self.draft {
            return Ok(draft.clone());
        }

        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| StorageError::MissingMetadata(ARCHIVE_BACKEND.to_string()))?;
        let draft = match &self.content_id {
            None => self.client.create_deposition(metadata).await?,
            Some(doi) => {
                let record = record_from_doi(doi)?;
                let latest = self.client.latest_record(&record).await?;
                let draft = self.client.new_version(&latest).await?;
                let draft = self.client.update_metadata(&draft.id, metadata).await?;
                for file in &draft.files {
                    self.client.delete_file(&draft.id, &file.id).await?;
                    tracing::debug!(deposition_id = %draft.id, file_id = %file.id, "deleted inherited file");
                }
                draft
            }
        };
        tracing::info!(deposition_id = %draft.id, "started deposition draft");
        self.draft = Some(draft.clone());
        Ok(draft)
    }

    async fn start_upload(&mut self) -> Result<(), StorageError> {
        let draft = self.start_draft().await?;
        let (writer, reader) = tokio::io::duplex(self.pipe_capacity);
        let body: ByteStream = Box::pin(ReaderStream::new(reader));

        let client = self.client.clone();
        let deposition = draft.clone();
        let task = tokio::spawn(async move { client.upload(&deposition, ARCHIVE_FILENAME, body).await });

        self.upload = Some(PendingUpload {
            deposition_id: draft.id,
            writer,
            task,
        });
        Ok(())
    }

    /// Waits for the background upload, then publishes. Returns the DOI.
    async fn finish_upload(&mut self, upload: PendingUpload) -> Result<String, StorageError> {
        let PendingUpload {
            deposition_id,
            mut writer,
            task,
        } = upload;

        let shutdown = writer.shutdown().await;
        drop(writer);
        task.await
            .map_err(|e| RemoteError::Upload(e.to_string()))??;
        shutdown.map_err(RemoteError::Io)?;

        let doi = self.client.publish(&deposition_id).await?;
        record_from_doi(&doi)?;
        tracing::info!(deposition_id = %deposition_id, doi = %doi, "deposition published");
        Ok(doi)
    }

    fn reader_mut(&mut self) -> &mut Option<ByteStream> {
        self.reader.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// The file `read` streams: the tarball when present, else the first file.
    /// Returns its name and size.
    async fn pick_download_file(&self, record: &str) -> Result<(String, u64), StorageError> {
        let files = self.client.record_files(record).await?;
        let picked = files
            .iter()
            .find(|f| f.filename == ARCHIVE_FILENAME)
            .or_else(|| files.first());
        Ok(match picked {
            Some(file) => (file.filename.clone(), file.filesize),
            None => (LEGACY_ARCHIVE_FILENAME.to_string(), 0),
        })
    }
}

#[async_trait]
impl StorageBackend for ArchiveBackend {
    fn name(&self) -> &str {
        ARCHIVE_BACKEND
    }

    fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    fn writable(&self) -> bool {
        !self.state.is_closed()
    }

    fn readable(&self) -> bool {
        if self.state.is_closed() || self.content_id.is_none() || self.exhausted {
            return false;
        }
        self.state.size.is_none_or(|size| self.bytes_read < size)
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn open(&mut self) -> Result<(), StorageError> {
        if self.state.is_closed() {
            return Err(StorageError::AlreadyClosed(ARCHIVE_BACKEND.to_string()));
        }
        if self.state.is_open() || self.draft.is_some() {
            return Ok(());
        }

        match self.content_id.clone() {
            Some(doi) => {
                let lock = self.locks.acquire(&doi).await;
                self.state.hold(lock);
            }
            None => {
                self.start_draft().await?;
            }
        }
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<usize, StorageError> {
        if !self.writable() {
            return Err(StorageError::NotWritable(ARCHIVE_BACKEND.to_string()));
        }
        if !self.state.is_open() && self.draft.is_none() {
            return Err(StorageError::NotOpen(ARCHIVE_BACKEND.to_string()));
        }
        self.state.claim_segment()?;
        if self.upload.is_none() {
            self.start_upload().await?;
        }

        let written = chunk.len();
        if let Some(upload) = self.upload.as_mut() {
            upload.writer.write_all(&chunk).await.map_err(RemoteError::Io)?;
        }
        self.state.advance(written as u64);
        Ok(written)
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, StorageError> {
        if self.state.is_closed() {
            return Err(StorageError::NotReadable(ARCHIVE_BACKEND.to_string()));
        }
        if max == 0 || self.exhausted {
            return Ok(Bytes::new());
        }

        if self.reader_mut().is_none() {
            let record = self.record()?;
            let (filename, _) = self.pick_download_file(&record).await?;
            let stream = self.client.download(&record, &filename).await?;
            *self.reader_mut() = Some(stream);
        }

        while self.pending.is_empty() {
            let next = match self.reader_mut().as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            };
            match next {
                Some(chunk) => self.pending = chunk.map_err(RemoteError::Io)?,
                None => {
                    self.exhausted = true;
                    return Ok(Bytes::new());
                }
            }
        }

        let take = max.min(self.pending.len());
        let chunk = self.pending.split_to(take);
        self.bytes_read += chunk.len() as u64;
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.state.begin_close(ARCHIVE_BACKEND)?;

        let finalized = match self.upload.take() {
            Some(upload) => self.finish_upload(upload).await,
            None => Ok(String::new()),
        };
        let result = match finalized {
            Ok(doi) if !doi.is_empty() => {
                self.content_id = Some(doi);
                self.state.size = None;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "archive upload failed");
                Err(err)
            }
        };

        *self.reader_mut() = None;
        self.state.seal();
        result
    }

    async fn size(&mut self) -> Result<u64, StorageError> {
        if let Some(size) = self.state.size {
            return Ok(size);
        }
        if self.content_id.is_none() {
            return Ok(0);
        }
        let record = self.record()?;
        let (_, size) = self.pick_download_file(&record).await?;
        self.state.size = Some(size);
        Ok(size)
    }

    async fn temporary_download_url(&self) -> Result<Option<DownloadLink>, StorageError> {
        let record = self.record()?;
        let filename = if self.client.file_exists(&record, ARCHIVE_FILENAME).await? {
            ARCHIVE_FILENAME
        } else {
            LEGACY_ARCHIVE_FILENAME
        };
        let url = format!(
            "{}/records/{record}/files/{filename}?download=1",
            self.client.base_url().trim_end_matches('/')
        );
        Ok(Some(DownloadLink::http_get(url, DateTime::<Utc>::MAX_UTC)))
    }
}
