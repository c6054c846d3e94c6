//! In-memory ObjectStoreClient.
//!
//! Manifest objects behave like Swift dynamic large objects: HEAD and GET
//! resolve to the concatenation of every object under the manifest prefix.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::domain::RemoteError;
use crate::ports::{ObjectMeta, ObjectStoreClient};

#[derive(Debug, Clone)]
enum StoredObject {
    Data(Bytes),
    Manifest { prefix: String },
}

pub struct InMemoryObjectStore {
    endpoint: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(objects: &BTreeMap<String, StoredObject>, path: &str) -> Option<Bytes> {
        match objects.get(path)? {
            StoredObject::Data(bytes) => Some(bytes.clone()),
            StoredObject::Manifest { prefix } => {
                let prefix = format!("/{prefix}");
                let mut out = BytesMut::new();
                for (_, object) in objects.range(prefix.clone()..).take_while(|(k, _)| k.starts_with(&prefix)) {
                    if let StoredObject::Data(bytes) = object {
                        out.extend_from_slice(bytes);
                    }
                }
                Some(out.freeze())
            }
        }
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn endpoint(&self) -> Result<String, RemoteError> {
        Ok(self.endpoint.clone())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        let objects = self.objects();
        let manifest = match objects.get(path) {
            None => return Ok(None),
            Some(StoredObject::Manifest { prefix }) => Some(prefix.clone()),
            Some(StoredObject::Data(_)) => None,
        };
        let content_length = Self::resolve(&objects, path).map_or(0, |b| b.len() as u64);
        Ok(Some(ObjectMeta {
            content_length,
            manifest,
        }))
    }

    async fn put(&self, path: &str, body: Bytes) -> Result<(), RemoteError> {
        self.objects().insert(path.to_string(), StoredObject::Data(body));
        Ok(())
    }

    async fn put_manifest(
        &self,
        path: &str,
        segment_prefix: &str,
        _content_type: &str,
    ) -> Result<(), RemoteError> {
        self.objects().insert(
            path.to_string(),
            StoredObject::Manifest {
                prefix: segment_prefix.to_string(),
            },
        );
        Ok(())
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes, RemoteError> {
        let objects = self.objects();
        let bytes = Self::resolve(&objects, path).ok_or_else(|| RemoteError::Status {
            status: 404,
            url: path.to_string(),
            body: String::new(),
        })?;
        let len = bytes.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len).max(range.start.min(len)) as usize;
        Ok(bytes.slice(start..end))
    }
}
