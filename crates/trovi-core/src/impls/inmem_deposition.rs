//! In-memory DepositionClient.
//!
//! Drafts become records with the same id on publish, and every record belongs
//! to a concept whose latest version `latest_record` resolves, like Zenodo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::domain::RemoteError;
use crate::ports::{ByteStream, Deposition, DepositionClient, DepositionFile, DepositionMetadata};

#[derive(Debug, Clone)]
struct Entry {
    concept: String,
    metadata: Option<DepositionMetadata>,
    files: Vec<(DepositionFile, Bytes)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    drafts: HashMap<String, Entry>,
    records: HashMap<String, Entry>,
    latest: HashMap<String, String>,
    calls: Vec<String>,
}

impl State {
    fn allocate(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn deposition(id: &str, entry: &Entry) -> Deposition {
        Deposition {
            id: id.to_string(),
            bucket_url: format!("memory://bucket/{id}"),
            files: entry.files.iter().map(|(f, _)| f.clone()).collect(),
        }
    }
}

fn not_found(what: &str, id: &str) -> RemoteError {
    RemoteError::Status {
        status: 404,
        url: format!("memory://{what}/{id}"),
        body: String::new(),
    }
}

pub fn doi_for(record: &str) -> String {
    format!("10.5281/zenodo.{record}")
}

pub struct InMemoryDeposition {
    base_url: String,
    state: Mutex<State>,
    fail_uploads: AtomicBool,
}

impl InMemoryDeposition {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Mutex::new(State::default()),
            fail_uploads: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent upload fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Publishes a record holding one file and returns its DOI.
    pub fn seed_record(&self, filename: &str, contents: Bytes) -> String {
        self.seed_record_files(&[(filename, contents)])
    }

    /// Publishes a record holding `files` in order and returns its DOI.
    pub fn seed_record_files(&self, files: &[(&str, Bytes)]) -> String {
        let mut state = self.state();
        let id = state.allocate();
        let files = files
            .iter()
            .enumerate()
            .map(|(n, (filename, contents))| {
                let file = DepositionFile {
                    id: format!("file-{id}-{n}"),
                    filename: filename.to_string(),
                    filesize: contents.len() as u64,
                };
                (file, contents.clone())
            })
            .collect();
        state.records.insert(
            id.clone(),
            Entry {
                concept: id.clone(),
                metadata: None,
                files,
            },
        );
        state.latest.insert(id.clone(), id.clone());
        doi_for(&id)
    }

    /// Metadata a published record was created or updated with.
    pub fn metadata(&self, record: &str) -> Option<DepositionMetadata> {
        self.state().records.get(record)?.metadata.clone()
    }

    /// Contents of a published file.
    pub fn file(&self, record: &str, filename: &str) -> Option<Bytes> {
        self.state()
            .records
            .get(record)?
            .files
            .iter()
            .find(|(f, _)| f.filename == filename)
            .map(|(_, b)| b.clone())
    }

    /// Names of the operations performed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl DepositionClient for InMemoryDeposition {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn create_deposition(&self, metadata: &DepositionMetadata) -> Result<Deposition, RemoteError> {
        let mut state = self.state();
        let id = state.allocate();
        let entry = Entry {
            concept: id.clone(),
            metadata: Some(metadata.clone()),
            files: Vec::new(),
        };
        let deposition = State::deposition(&id, &entry);
        state.drafts.insert(id.clone(), entry);
        state.calls.push(format!("create_deposition {id}"));
        Ok(deposition)
    }

    async fn latest_record(&self, record: &str) -> Result<String, RemoteError> {
        let state = self.state();
        let entry = state.records.get(record).ok_or_else(|| not_found("records", record))?;
        state
            .latest
            .get(&entry.concept)
            .cloned()
            .ok_or_else(|| not_found("concepts", &entry.concept))
    }

    async fn new_version(&self, record: &str) -> Result<Deposition, RemoteError> {
        let mut state = self.state();
        let source = state.records.get(record).cloned().ok_or_else(|| not_found("records", record))?;
        let id = state.allocate();
        let entry = Entry {
            concept: source.concept,
            metadata: source.metadata,
            files: source.files,
        };
        let deposition = State::deposition(&id, &entry);
        state.drafts.insert(id.clone(), entry);
        state.calls.push(format!("new_version {record} -> {id}"));
        Ok(deposition)
    }

    async fn update_metadata(
        &self,
        deposition_id: &str,
        metadata: &DepositionMetadata,
    ) -> Result<Deposition, RemoteError> {
        let mut state = self.state();
        let entry = state
            .drafts
            .get_mut(deposition_id)
            .ok_or_else(|| not_found("deposit/depositions", deposition_id))?;
        entry.metadata = Some(metadata.clone());
        let deposition = State::deposition(deposition_id, entry);
        state.calls.push(format!("update_metadata {deposition_id}"));
        Ok(deposition)
    }

    async fn delete_file(&self, deposition_id: &str, file_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        let entry = state
            .drafts
            .get_mut(deposition_id)
            .ok_or_else(|| not_found("deposit/depositions", deposition_id))?;
        entry.files.retain(|(f, _)| f.id != file_id);
        state.calls.push(format!("delete_file {deposition_id} {file_id}"));
        Ok(())
    }

    async fn upload(&self, deposition: &Deposition, filename: &str, mut body: ByteStream) -> Result<(), RemoteError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Upload(format!("upload to {} rejected", deposition.id)));
        }

        let mut contents = BytesMut::new();
        while let Some(chunk) = body.next().await {
            contents.extend_from_slice(&chunk?);
        }

        let mut state = self.state();
        let entry = state
            .drafts
            .get_mut(&deposition.id)
            .ok_or_else(|| not_found("deposit/depositions", &deposition.id))?;
        let contents = contents.freeze();
        entry.files.retain(|(f, _)| f.filename != filename);
        entry.files.push((
            DepositionFile {
                id: format!("file-{}-{filename}", deposition.id),
                filename: filename.to_string(),
                filesize: contents.len() as u64,
            },
            contents,
        ));
        state.calls.push(format!("upload {} {filename}", deposition.id));
        Ok(())
    }

    async fn publish(&self, deposition_id: &str) -> Result<String, RemoteError> {
        let mut state = self.state();
        let entry = state
            .drafts
            .remove(deposition_id)
            .ok_or_else(|| not_found("deposit/depositions", deposition_id))?;
        state.latest.insert(entry.concept.clone(), deposition_id.to_string());
        state.records.insert(deposition_id.to_string(), entry);
        state.calls.push(format!("publish {deposition_id}"));
        Ok(doi_for(deposition_id))
    }

    async fn record_files(&self, record: &str) -> Result<Vec<DepositionFile>, RemoteError> {
        let state = self.state();
        let entry = state.records.get(record).ok_or_else(|| not_found("records", record))?;
        Ok(entry.files.iter().map(|(f, _)| f.clone()).collect())
    }

    async fn file_exists(&self, record: &str, filename: &str) -> Result<bool, RemoteError> {
        Ok(self.file(record, filename).is_some())
    }

    async fn download(&self, record: &str, filename: &str) -> Result<ByteStream, RemoteError> {
        let contents = self
            .file(record, filename)
            .ok_or_else(|| not_found("records", &format!("{record}/files/{filename}")))?;
        // Small fixed-size chunks so readers see more than one item.
        let chunks: Vec<Result<Bytes, std::io::Error>> = contents
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
