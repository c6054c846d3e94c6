//! Migration job - 一件の migration を QUEUED から終端状態まで進める
//!
//! # フロー
//! 1. MigrationStore から record を取得し IN_PROGRESS に遷移（"Selected for migration"）
//! 2. source を URN から、destination を backend 名と version の公開メタデータから解決
//! 3. source を scoped で open し、size < 1 なら destination に触れずに失敗
//! 4. chunk ごとに read → write → progress 更新（毎回永続化）。
//!    size に届く前に source が尽きたら SourceRead で失敗
//! 5. destination を close し、URN を記録して SUCCESS
//!
//! どこで失敗しても record は必ず ERROR で終わる。失敗した destination は
//! close されず drop される（manifest も publish もされない）。

use std::io::SeekFrom;
use std::sync::Arc;

use futures::FutureExt;

use crate::backends::{BackendRegistry, BackendRequest, scoped};
use crate::domain::migration::MESSAGE_UNKNOWN_ERROR;
use crate::domain::{MigrationError, MigrationId, MigrationRecord, MigrationStatus, StorageError};
use crate::ports::{Clock, MigrationStore, StorageBackend};

pub const MESSAGE_FINALIZING: &str = "Finalizing migration";

/// Shared dependencies of every migration job.
pub struct MigrationContext {
    pub store: Arc<dyn MigrationStore>,
    pub backends: Arc<BackendRegistry>,
    pub clock: Arc<dyn Clock>,

    /// Upper bound of a single read from the source.
    pub chunk_size: usize,
}

/// Runs migration `id` to a terminal state.
///
/// Records that are no longer QUEUED are returned untouched so that a
/// duplicate enqueue never restarts a finished job.
pub async fn run_migration(
    ctx: &Arc<MigrationContext>,
    id: MigrationId,
) -> Result<MigrationRecord, MigrationError> {
    let mut record = ctx.store.get(id).await?;
    if record.status != MigrationStatus::Queued {
        tracing::warn!(migration_id = %id, status = %record.status, "migration is not queued, skipping");
        return Ok(record);
    }

    record.start(ctx.clock.now())?;
    ctx.store.update(&record).await?;
    tracing::info!(
        migration_id = %id,
        source = %record.source_urn,
        destination = %record.destination_backend,
        "migration started"
    );

    match execute(ctx, record).await {
        Ok(record) => Ok(record),
        Err(err) => {
            mark_failed(ctx, id, &err).await;
            Err(err)
        }
    }
}

async fn execute(
    ctx: &Arc<MigrationContext>,
    record: MigrationRecord,
) -> Result<MigrationRecord, MigrationError> {
    let mut source = ctx.backends.resolve_urn(&record.source_urn)?;
    let mut request = BackendRequest::new_content();
    if let Some(metadata) = ctx.store.version_metadata(record.version).await? {
        request = request.with_metadata(metadata);
    }
    let destination = ctx.backends.resolve(&record.destination_backend, request)?;

    let drain_ctx = Arc::clone(ctx);
    let (mut destination, mut record) = scoped(&mut *source, move |source| {
        drain(source, destination, record, drain_ctx).boxed()
    })
    .await?;

    record.set_message(MESSAGE_FINALIZING);
    ctx.store.update(&record).await?;

    destination
        .close()
        .await
        .map_err(MigrationError::DestinationWrite)?;
    let urn = destination.to_urn()?;

    record.succeed(urn.clone(), ctx.clock.now())?;
    ctx.store.update(&record).await?;
    ctx.store.set_version_contents(record.version, &urn).await?;

    tracing::info!(migration_id = %record.id, urn = %urn, "migration finished");
    Ok(record)
}

/// Copies the open source into a freshly opened destination.
async fn drain<B>(
    source: &mut B,
    mut destination: Box<dyn StorageBackend>,
    mut record: MigrationRecord,
    ctx: Arc<MigrationContext>,
) -> Result<(Box<dyn StorageBackend>, MigrationRecord), MigrationError>
where
    B: StorageBackend + ?Sized,
{
    let total = source.size().await.map_err(MigrationError::SourceRead)?;
    if total < 1 {
        return Err(MigrationError::EmptySource(record.source_urn.clone()));
    }

    destination.open().await?;
    record.set_message(format!("Uploading to {}", destination.name()));
    ctx.store.update(&record).await?;

    let mut written: u64 = 0;
    while source.readable() {
        let chunk = source
            .read(ctx.chunk_size)
            .await
            .map_err(MigrationError::SourceRead)?;
        if chunk.is_empty() {
            break;
        }
        let n = destination
            .write(chunk)
            .await
            .map_err(MigrationError::DestinationWrite)?;
        written += n as u64;

        record.record_progress(written as f64 / total as f64);
        ctx.store.update(&record).await?;
        tracing::debug!(migration_id = %record.id, written, total, "chunk copied");
    }
    if written != total {
        return Err(MigrationError::SourceRead(StorageError::ShortRead {
            expected: total,
            got: written,
        }));
    }

    if source.seekable() {
        source.seek(SeekFrom::Start(0)).await?;
    }
    Ok((destination, record))
}

/// Moves the persisted record to ERROR. Failures here are only logged.
async fn mark_failed(ctx: &MigrationContext, id: MigrationId, err: &MigrationError) {
    let message = match err.record_message() {
        Some(message) => {
            tracing::warn!(migration_id = %id, error = %err, "migration failed");
            message
        }
        None => {
            tracing::error!(migration_id = %id, error = ?err, "uncaught error during migration");
            MESSAGE_UNKNOWN_ERROR
        }
    };

    let mut record = match ctx.store.get(id).await {
        Ok(record) => record,
        Err(store_err) => {
            tracing::error!(migration_id = %id, error = %store_err, "could not reload failed migration");
            return;
        }
    };
    if record.status != MigrationStatus::InProgress {
        return;
    }
    if let Err(transition) = record.fail(message, ctx.clock.now()) {
        tracing::error!(migration_id = %id, error = %transition, "could not fail migration");
        return;
    }
    if let Err(store_err) = ctx.store.update(&record).await {
        tracing::error!(migration_id = %id, error = %store_err, "could not persist failed migration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range;

    use async_trait::async_trait;
    use bytes::Bytes;
    use ulid::Ulid;

    use crate::app::testing::{Harness, describe_version, seed_objectstore};
    use crate::domain::migration::MESSAGE_SELECTED;
    use crate::domain::{ContentUrn, RemoteError, VersionId};
    use crate::impls::InMemoryObjectStore;
    use crate::impls::inmem_deposition::doi_for;
    use crate::ports::{ObjectMeta, ObjectStoreClient};

    /// Object store whose reads come back empty past the first byte range.
    struct EndsEarly(InMemoryObjectStore);

    #[async_trait]
    impl ObjectStoreClient for EndsEarly {
        async fn endpoint(&self) -> Result<String, RemoteError> {
            self.0.endpoint().await
        }

        async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
            self.0.head(path).await
        }

        async fn put(&self, path: &str, body: Bytes) -> Result<(), RemoteError> {
            self.0.put(path, body).await
        }

        async fn put_manifest(
            &self,
            path: &str,
            segment_prefix: &str,
            content_type: &str,
        ) -> Result<(), RemoteError> {
            self.0.put_manifest(path, segment_prefix, content_type).await
        }

        async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes, RemoteError> {
            if range.start > 0 {
                return Ok(Bytes::new());
            }
            self.0.get_range(path, range).await
        }
    }

    fn queued(h: &Harness, source: ContentUrn, destination: &str) -> MigrationRecord {
        MigrationRecord::new(
            MigrationId::from_ulid(Ulid::new()),
            VersionId::from_ulid(Ulid::new()),
            source,
            destination,
            h.clock.now(),
        )
    }

    #[tokio::test]
    async fn copies_objectstore_content_into_archive() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &["hello ", "migration", "!"]).await;
        let record = queued(&h, source, "archive");
        let metadata = describe_version(&h, record.version).await;
        h.store.create_if_idle(&record).await.unwrap();

        let done = run_migration(&h.ctx, record.id).await.unwrap();

        assert_eq!(done.status, MigrationStatus::Success);
        assert_eq!(done.progress, 1.0);
        let urn = done.destination_urn.clone().unwrap();
        assert_eq!(urn.backend(), "archive");
        assert_eq!(done.message, format!("Uploaded to {urn}"));

        let record_id = urn.content_id().rsplit('.').next().unwrap().to_string();
        assert_eq!(urn.content_id(), doi_for(&record_id));
        assert_eq!(
            h.deposition.file(&record_id, "archive.tar.gz").unwrap().as_ref(),
            b"hello migration!"
        );
        assert_eq!(h.deposition.metadata(&record_id), Some(metadata));
        assert_eq!(h.store.version_contents(record.version).await.unwrap(), Some(urn));
    }

    #[tokio::test]
    async fn archive_destination_without_metadata_fails_before_any_deposit() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &["payload"]).await;
        let record = queued(&h, source, "archive");
        h.store.create_if_idle(&record).await.unwrap();

        let err = run_migration(&h.ctx, record.id).await.unwrap_err();

        assert!(
            matches!(err, MigrationError::Storage(StorageError::MissingMetadata(_))),
            "{err:?}"
        );
        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Error);
        assert_eq!(stored.message, MESSAGE_UNKNOWN_ERROR);
        assert!(h.deposition.calls().is_empty(), "{:?}", h.deposition.calls());
    }

    #[tokio::test]
    async fn source_ending_early_is_a_read_error() {
        let objects = EndsEarly(InMemoryObjectStore::new("https://swift.example.org/v1/AUTH_test"));
        let h = Harness::with_objects(4, std::sync::Arc::new(objects));
        let source = seed_objectstore(&h, &["twelve ", "bytes"]).await;
        let record = queued(&h, source, "archive");
        describe_version(&h, record.version).await;
        h.store.create_if_idle(&record).await.unwrap();

        let err = run_migration(&h.ctx, record.id).await.unwrap_err();

        assert!(
            matches!(
                err,
                MigrationError::SourceRead(StorageError::ShortRead { expected: 12, got: 4 })
            ),
            "{err:?}"
        );
        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Error);
        assert_eq!(stored.message, "Error reading from source");
        assert!(stored.progress < 1.0);
        assert!(stored.destination_urn.is_none());
        assert!(h.store.version_contents(record.version).await.unwrap().is_none());
        assert!(!h.deposition.calls().iter().any(|c| c.starts_with("publish")));
    }

    #[tokio::test]
    async fn persisted_progress_is_monotonic_and_ends_at_one() {
        let h = Harness::new(3);
        let source = seed_objectstore(&h, &["abcdefgh", "ijklmnop", "qr"]).await;
        let record = queued(&h, source, "objectstore");
        h.store.create_if_idle(&record).await.unwrap();

        run_migration(&h.ctx, record.id).await.unwrap();

        let history = h.store.history(record.id).await;
        let progress: Vec<f64> = history.iter().map(|r| r.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.last().copied(), Some(1.0));
        assert!(history.iter().any(|r| r.message == MESSAGE_SELECTED));
        assert!(history.iter().any(|r| r.message == "Uploading to objectstore"));
        assert!(history.iter().any(|r| r.message == MESSAGE_FINALIZING));
        // one update per chunk: 18 bytes in chunks of 3
        let mid_transfer = history
            .iter()
            .filter(|r| r.progress > 0.0 && r.progress < 1.0)
            .count();
        assert_eq!(mid_transfer, 5);
    }

    #[tokio::test]
    async fn empty_source_fails_without_touching_destination() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &[]).await;
        let record = queued(&h, source, "archive");
        h.store.create_if_idle(&record).await.unwrap();

        let err = run_migration(&h.ctx, record.id).await.unwrap_err();

        assert!(matches!(err, MigrationError::EmptySource(_)));
        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Error);
        assert_eq!(stored.message, "Source content is empty");
        assert!(h.deposition.calls().is_empty(), "{:?}", h.deposition.calls());
    }

    #[tokio::test]
    async fn git_source_is_empty() {
        let h = Harness::new(4);
        let source = ContentUrn::new("git", "https://github.com/org/repo@main");
        let record = queued(&h, source, "objectstore");
        h.store.create_if_idle(&record).await.unwrap();

        let err = run_migration(&h.ctx, record.id).await.unwrap_err();
        assert!(matches!(err, MigrationError::EmptySource(_)));
    }

    #[tokio::test]
    async fn destination_failure_is_recorded() {
        let h = Harness::new(4);
        h.deposition.fail_uploads(true);
        let source = seed_objectstore(&h, &["payload"]).await;
        let record = queued(&h, source, "archive");
        describe_version(&h, record.version).await;
        h.store.create_if_idle(&record).await.unwrap();

        let err = run_migration(&h.ctx, record.id).await.unwrap_err();

        assert!(matches!(err, MigrationError::DestinationWrite(_)), "{err:?}");
        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Error);
        assert_eq!(stored.message, "Error writing to destination");
        assert!(stored.destination_urn.is_none());
        assert!(!h.deposition.calls().iter().any(|c| c.starts_with("publish")));
    }

    #[tokio::test]
    async fn missing_source_content_is_an_unknown_error() {
        let h = Harness::new(4);
        let source = ContentUrn::new("archive", "not-a-doi");
        let record = queued(&h, source, "objectstore");
        h.store.create_if_idle(&record).await.unwrap();

        run_migration(&h.ctx, record.id).await.unwrap_err();

        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Error);
        assert_eq!(stored.message, MESSAGE_UNKNOWN_ERROR);
    }

    #[tokio::test]
    async fn finished_record_is_not_restarted() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &["x"]).await;
        let record = queued(&h, source, "objectstore");
        h.store.create_if_idle(&record).await.unwrap();

        let first = run_migration(&h.ctx, record.id).await.unwrap();
        let second = run_migration(&h.ctx, record.id).await.unwrap();

        assert_eq!(first, second);
    }
}
