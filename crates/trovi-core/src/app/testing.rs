//! Test wiring: every backend registered against in-memory fakes.

use std::sync::Arc;

use chrono::TimeDelta;

use crate::backends::{
    ArchiveFactory, BackendRegistry, BackendRequest, ContentLockRegistry, GitFactory, ObjectStoreFactory,
    ObjectStoreOptions,
};
use crate::domain::{ContentUrn, VersionId};
use crate::impls::{InMemoryDeposition, InMemoryMigrationStore, InMemoryObjectStore};
use crate::ports::{Clock, Creator, DepositionMetadata, MigrationStore, ObjectStoreClient, SystemClock};

use super::job::MigrationContext;

pub(crate) struct Harness {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<InMemoryMigrationStore>,
    pub deposition: Arc<InMemoryDeposition>,
    pub backends: Arc<BackendRegistry>,
    pub ctx: Arc<MigrationContext>,
}

impl Harness {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_objects(
            chunk_size,
            Arc::new(InMemoryObjectStore::new("https://swift.example.org/v1/AUTH_test")),
        )
    }

    /// Same wiring with `objects` behind the objectstore backend.
    pub fn with_objects(chunk_size: usize, objects: Arc<dyn ObjectStoreClient>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let deposition = Arc::new(InMemoryDeposition::new("https://zenodo.example.org"));

        let mut backends = BackendRegistry::new(Arc::new(ContentLockRegistry::new()));
        backends
            .register(
                "objectstore",
                Arc::new(ObjectStoreFactory::new(
                    objects,
                    clock.clone(),
                    ObjectStoreOptions {
                        container: "trovi".to_string(),
                        temp_url_key: "secret".to_string(),
                        link_lifespan: TimeDelta::hours(1),
                        segment_size: 8,
                    },
                )),
            )
            .unwrap();
        backends
            .register("git", Arc::new(GitFactory::new(clock.clone(), TimeDelta::hours(1))))
            .unwrap();
        backends
            .register(
                "archive",
                Arc::new(ArchiveFactory::new(deposition.clone(), 64)),
            )
            .unwrap();
        let backends = Arc::new(backends);

        let store = Arc::new(InMemoryMigrationStore::new());
        let ctx = Arc::new(MigrationContext {
            store: store.clone(),
            backends: backends.clone(),
            clock: clock.clone(),
            chunk_size,
        });
        Self {
            clock,
            store,
            deposition,
            backends,
            ctx,
        }
    }

    /// A fresh context sharing this harness's store and backends.
    pub fn context(&self) -> MigrationContext {
        MigrationContext {
            store: self.ctx.store.clone(),
            backends: self.ctx.backends.clone(),
            clock: self.ctx.clock.clone(),
            chunk_size: self.ctx.chunk_size,
        }
    }
}

pub(crate) fn publication_metadata(version: VersionId) -> DepositionMetadata {
    let mut metadata = DepositionMetadata::for_version(version, "Artifact", "Reproduces figure 3");
    metadata.creators.push(Creator {
        name: "Doe, Jane".to_string(),
        affiliation: Some("University".to_string()),
    });
    metadata
}

/// Stores publication metadata for `version`, as needed to publish it to archive.
pub(crate) async fn describe_version(h: &Harness, version: VersionId) -> DepositionMetadata {
    let metadata = publication_metadata(version);
    h.store.set_version_metadata(version, &metadata).await.unwrap();
    metadata
}

/// Writes `chunks` as new objectstore content and returns its URN.
pub(crate) async fn seed_objectstore(h: &Harness, chunks: &[&str]) -> ContentUrn {
    let mut backend = h
        .backends
        .resolve("objectstore", BackendRequest::new_content())
        .unwrap();
    backend.open().await.unwrap();
    for chunk in chunks {
        backend.write(bytes::Bytes::copy_from_slice(chunk.as_bytes())).await.unwrap();
    }
    backend.close().await.unwrap();
    backend.to_urn().unwrap()
}
