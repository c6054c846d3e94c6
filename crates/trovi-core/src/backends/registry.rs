//! BackendRegistry - backend 名から StorageBackend を作る factory
//!
//! # 使用例
//! ```ignore
//! let mut registry = BackendRegistry::new(Arc::new(ContentLockRegistry::new()));
//! registry.register("git", Arc::new(GitFactory::new(clock, lifespan)))?;
//!
//! let backend = registry.resolve("git", BackendRequest::existing("https://github.com/org/repo@main"))?;
//! ```
//!
//! # 内部実装
//! - HashMap<String, Arc<dyn BackendFactory>> で管理
//! - ContentLockRegistry はここで一つだけ持ち、すべての factory に渡す

use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeDelta;

use crate::domain::{ContentUrn, RegistryError, RequestError, StorageError};
use crate::ports::{Clock, DepositionClient, DepositionMetadata, ObjectStoreClient, StorageBackend};

use super::archive::ArchiveBackend;
use super::git::{GIT_BACKEND, GitBackend};
use super::lock::ContentLockRegistry;
use super::object_store::{ObjectStoreBackend, ObjectStoreOptions};

/// Everything a caller may know about the content it wants to address.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// None for content that is about to be created.
    pub content_id: Option<String>,
    pub content_type: Option<String>,
    /// Publication metadata for backends that publish (archive).
    pub metadata: Option<DepositionMetadata>,
}

impl BackendRequest {
    pub fn new_content() -> Self {
        Self::default()
    }

    pub fn existing(content_id: impl Into<String>) -> Self {
        Self {
            content_id: Some(content_id.into()),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: DepositionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        locks: Arc<ContentLockRegistry>,
        request: BackendRequest,
    ) -> Result<Box<dyn StorageBackend>, StorageError>;
}

pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
    locks: Arc<ContentLockRegistry>,
}

impl BackendRegistry {
    pub fn new(locks: Arc<ContentLockRegistry>) -> Self {
        Self {
            factories: HashMap::new(),
            locks,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicateBackend(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn locks(&self) -> &Arc<ContentLockRegistry> {
        &self.locks
    }

    pub fn resolve(
        &self,
        name: &str,
        request: BackendRequest,
    ) -> Result<Box<dyn StorageBackend>, RequestError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RequestError::UnknownBackend(name.to_string()))?;
        Ok(factory.create(self.locks.clone(), request)?)
    }

    pub fn resolve_urn(&self, urn: &ContentUrn) -> Result<Box<dyn StorageBackend>, RequestError> {
        self.resolve(urn.backend(), BackendRequest::existing(urn.content_id()))
    }
}

pub struct ObjectStoreFactory {
    client: Arc<dyn ObjectStoreClient>,
    clock: Arc<dyn Clock>,
    options: ObjectStoreOptions,
}

impl ObjectStoreFactory {
    pub fn new(client: Arc<dyn ObjectStoreClient>, clock: Arc<dyn Clock>, options: ObjectStoreOptions) -> Self {
        Self { client, clock, options }
    }
}

impl BackendFactory for ObjectStoreFactory {
    fn create(
        &self,
        locks: Arc<ContentLockRegistry>,
        request: BackendRequest,
    ) -> Result<Box<dyn StorageBackend>, StorageError> {
        Ok(Box::new(ObjectStoreBackend::new(
            self.client.clone(),
            locks,
            self.clock.clone(),
            self.options.clone(),
            request.content_id,
            request.content_type,
        )?))
    }
}

pub struct GitFactory {
    clock: Arc<dyn Clock>,
    link_lifespan: TimeDelta,
}

impl GitFactory {
    pub fn new(clock: Arc<dyn Clock>, link_lifespan: TimeDelta) -> Self {
        Self { clock, link_lifespan }
    }
}

impl BackendFactory for GitFactory {
    fn create(
        &self,
        locks: Arc<ContentLockRegistry>,
        request: BackendRequest,
    ) -> Result<Box<dyn StorageBackend>, StorageError> {
        let content_id = request.content_id.ok_or_else(|| StorageError::InvalidContentId {
            backend: GIT_BACKEND.to_string(),
            content_id: String::new(),
            reason: "git content must name an existing remote".to_string(),
        })?;
        Ok(Box::new(GitBackend::new(
            locks,
            self.clock.clone(),
            self.link_lifespan,
            &content_id,
        )?))
    }
}

/// New archive content needs `BackendRequest::metadata`; there is no default.
pub struct ArchiveFactory {
    client: Arc<dyn DepositionClient>,
    pipe_capacity: usize,
}

impl ArchiveFactory {
    pub fn new(client: Arc<dyn DepositionClient>, pipe_capacity: usize) -> Self {
        Self { client, pipe_capacity }
    }
}

impl BackendFactory for ArchiveFactory {
    fn create(
        &self,
        locks: Arc<ContentLockRegistry>,
        request: BackendRequest,
    ) -> Result<Box<dyn StorageBackend>, StorageError> {
        Ok(Box::new(ArchiveBackend::new(
            self.client.clone(),
            locks,
            request.metadata,
            self.pipe_capacity,
            request.content_id,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDeposition, InMemoryObjectStore};
    use crate::ports::SystemClock;

    fn registry() -> BackendRegistry {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut registry = BackendRegistry::new(Arc::new(ContentLockRegistry::new()));
        registry
            .register(
                "objectstore",
                Arc::new(ObjectStoreFactory::new(
                    Arc::new(InMemoryObjectStore::new("https://swift.example.org/v1/AUTH_x")),
                    clock.clone(),
                    ObjectStoreOptions {
                        container: "trovi".to_string(),
                        temp_url_key: "k".to_string(),
                        link_lifespan: TimeDelta::seconds(60),
                        segment_size: 8,
                    },
                )),
            )
            .unwrap();
        registry
            .register("git", Arc::new(GitFactory::new(clock.clone(), TimeDelta::seconds(60))))
            .unwrap();
        registry
            .register(
                "archive",
                Arc::new(ArchiveFactory::new(
                    Arc::new(InMemoryDeposition::new("https://zenodo.example.org")),
                    64,
                )),
            )
            .unwrap();
        registry
    }

    #[test]
    fn resolves_registered_names() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["archive", "git", "objectstore"]);

        let git = registry
            .resolve("git", BackendRequest::existing("https://github.com/org/repo@main"))
            .unwrap();
        assert_eq!(git.name(), "git");
        assert_eq!(git.content_id(), Some("https://github.com/org/repo@main"));

        let fresh = registry.resolve("objectstore", BackendRequest::new_content()).unwrap();
        assert!(fresh.content_id().is_none());
        assert!(fresh.writable());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result = registry().resolve("dropbox", BackendRequest::new_content());
        assert!(matches!(result, Err(RequestError::UnknownBackend(name)) if name == "dropbox"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let result = registry.register("git", Arc::new(GitFactory::new(Arc::new(SystemClock), TimeDelta::zero())));
        assert!(matches!(result, Err(RegistryError::DuplicateBackend(_))));
    }

    #[test]
    fn resolves_from_urn() {
        let urn: ContentUrn = "urn:trovi:contents:archive:10.5281/zenodo.42".parse().unwrap();
        let backend = registry().resolve_urn(&urn).unwrap();
        assert_eq!(backend.to_urn().unwrap(), urn);
    }

    #[test]
    fn git_requires_content_id() {
        let result = registry().resolve("git", BackendRequest::new_content());
        assert!(matches!(
            result,
            Err(RequestError::Storage(StorageError::InvalidContentId { .. }))
        ));
    }
}
