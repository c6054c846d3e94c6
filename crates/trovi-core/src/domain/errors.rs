//! Errors - エラー型と分類
//!
//! # 分類
//! - StorageError: backend 契約違反（クライアントに見える）
//! - RemoteError: リモートシステム（Swift, Zenodo）との通信失敗
//! - StoreError: MigrationRecord の永続化失敗
//! - MigrationError: migration ジョブを ERROR で終わらせる失敗
//! - RequestError: リクエスト検証（ジョブは作られない）

use thiserror::Error;

use super::ids::VersionId;
use super::migration::MigrationStatus;
use super::urn::ContentUrn;

#[derive(Debug, Error)]
pub enum UrnError {
    #[error("not a contents urn: {0}")]
    Prefix(String),

    #[error("malformed contents urn: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("background upload failed: {0}")]
    Upload(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("content is not writable: {0}")]
    NotWritable(String),

    #[error("content is not readable: {0}")]
    NotReadable(String),

    #[error("backend {0} does not support seeking")]
    NotSeekable(String),

    #[error("invalid seek on {backend}: {reason}")]
    InvalidSeek { backend: String, reason: String },

    #[error("tried to close content which was already closed: {0}")]
    AlreadyClosed(String),

    #[error("backend {0} must be opened before use")]
    NotOpen(String),

    #[error("segment limit reached")]
    TooManySegments,

    #[error("no content stored on backend {0}")]
    ContentNotFound(String),

    #[error("backend {0} could not generate any access method")]
    NoAccessMethod(String),

    #[error("content ended after {got} of {expected} bytes")]
    ShortRead { expected: u64, got: u64 },

    #[error("backend {0} needs publication metadata to create new content")]
    MissingMetadata(String),

    #[error("invalid content id {content_id:?} for backend {backend}: {reason}")]
    InvalidContentId {
        backend: String,
        content_id: String,
        reason: String,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("migration not found: {0}")]
    NotFound(String),

    #[error("version {0} already has a migration in progress")]
    Conflict(VersionId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt migration row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
#[error("invalid migration transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: MigrationStatus,
    pub to: MigrationStatus,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("version {0} already has a migration in progress")]
    Conflict(VersionId),

    #[error(transparent)]
    InvalidUrn(#[from] UrnError),

    #[error("upload body is empty")]
    EmptyUpload,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RequestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(version) => RequestError::Conflict(version),
            other => RequestError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("source content {0} is empty")]
    EmptySource(ContentUrn),

    #[error("error reading from source: {0}")]
    SourceRead(#[source] StorageError),

    #[error("error writing to destination: {0}")]
    DestinationWrite(#[source] StorageError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("migration worker has stopped")]
    WorkerStopped,
}

impl MigrationError {
    /// Message recorded on the MigrationRecord for the known kinds.
    /// Anything else is recorded as a generic unknown error.
    pub fn record_message(&self) -> Option<&'static str> {
        match self {
            MigrationError::EmptySource(_) => Some("Source content is empty"),
            MigrationError::SourceRead(_) => Some("Error reading from source"),
            MigrationError::DestinationWrite(_) => Some("Error writing to destination"),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
