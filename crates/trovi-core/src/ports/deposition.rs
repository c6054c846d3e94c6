//! DepositionClient port - DOI を発行するアーカイブサービス（Zenodo）
//!
//! # フロー
//! 1. 新規: `create_deposition` → `upload` → `publish`
//! 2. 新バージョン: `latest_record` → `new_version` → `update_metadata`
//!    → `delete_file`（継承されたファイル） → `upload` → `publish`
//!
//! 読み出しは公開済み record に対して行います（`record_files`, `download`）。

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{RemoteError, VersionId};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Draft deposition（未公開）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposition {
    pub id: String,

    /// Bucket URL for file uploads.
    pub bucket_url: String,

    pub files: Vec<DepositionFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepositionFile {
    pub id: String,
    pub filename: String,
    pub filesize: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    #[serde(default)]
    pub affiliation: Option<String>,
}

/// Descriptive metadata sent with a new draft or a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositionMetadata {
    pub title: String,
    pub description: String,
    pub creators: Vec<Creator>,
    pub publication_date: NaiveDate,
    pub keywords: Vec<String>,
}

impl DepositionMetadata {
    pub fn new(title: impl Into<String>, description: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            creators: Vec::new(),
            publication_date: date,
            keywords: Vec::new(),
        }
    }

    /// Metadata of an artifact version: published on the version's creation date.
    pub fn for_version(version: VersionId, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(title, description, version.created_at().date_naive())
    }

    /// Request body of the deposition API.
    pub fn to_payload(&self) -> Value {
        let creators: Vec<Value> = self
            .creators
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "affiliation": c.affiliation.clone().unwrap_or_default(),
                })
            })
            .collect();
        let mut keywords = vec!["chameleon".to_string()];
        keywords.extend(self.keywords.iter().filter(|k| *k != "chameleon").cloned());

        json!({
            "metadata": {
                "title": self.title,
                "description": self.description,
                "creators": creators,
                "upload_type": "publication",
                "publication_type": "workingpaper",
                "publication_date": self.publication_date.format("%Y-%m-%d").to_string(),
                "communities": [{"identifier": "chameleon"}],
                "keywords": keywords,
            }
        })
    }
}

#[async_trait]
pub trait DepositionClient: Send + Sync {
    /// Public base URL, e.g. `https://zenodo.org`.
    fn base_url(&self) -> &str;

    async fn create_deposition(&self, metadata: &DepositionMetadata) -> Result<Deposition, RemoteError>;

    /// Id of the latest published record in the concept that `record` belongs to.
    async fn latest_record(&self, record: &str) -> Result<String, RemoteError>;

    /// Starts a new draft version of a published record.
    async fn new_version(&self, record: &str) -> Result<Deposition, RemoteError>;

    async fn update_metadata(
        &self,
        deposition_id: &str,
        metadata: &DepositionMetadata,
    ) -> Result<Deposition, RemoteError>;

    async fn delete_file(&self, deposition_id: &str, file_id: &str) -> Result<(), RemoteError>;

    async fn upload(&self, deposition: &Deposition, filename: &str, body: ByteStream) -> Result<(), RemoteError>;

    /// Returns the DOI of the published record.
    async fn publish(&self, deposition_id: &str) -> Result<String, RemoteError>;

    async fn record_files(&self, record: &str) -> Result<Vec<DepositionFile>, RemoteError>;

    async fn file_exists(&self, record: &str, filename: &str) -> Result<bool, RemoteError>;

    async fn download(&self, record: &str, filename: &str) -> Result<ByteStream, RemoteError>;
}
