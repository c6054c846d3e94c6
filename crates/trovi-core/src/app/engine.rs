//! MigrationEngine - migration を一件ずつ実行する単一ワーカー
//!
//! # 設計原則
//! - worker は一つだけ。同時に実行される migration はプロセス全体で最大一件
//! - キューは上限なしの mpsc。中身は MigrationId だけで、状態の正本は MigrationStore
//! - 同じ version に IN_PROGRESS の migration があれば submit は Conflict
//!
//! # Shutdown
//! `shutdown_and_join` は新しいジョブの取り出しを止め、実行中のジョブの完了を待つ。
//! キューに残ったジョブは QUEUED のまま残り、次回起動時の recovery で再投入される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::{
    ContentUrn, MigrationError, MigrationId, MigrationRecord, RequestError, StoreError, VersionId,
};
use crate::ports::IdGenerator;

use super::job::{MigrationContext, run_migration};

pub struct MigrationEngine {
    ctx: Arc<MigrationContext>,
    ids: Arc<dyn IdGenerator>,
    jobs: mpsc::UnboundedSender<MigrationId>,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl MigrationEngine {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn spawn(ctx: MigrationContext, ids: Arc<dyn IdGenerator>) -> Self {
        let ctx = Arc::new(ctx);
        let (jobs, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker_loop(ctx.clone(), rx, shutdown_rx));
        Self {
            ctx,
            ids,
            jobs,
            shutdown_tx,
            worker,
        }
    }

    pub fn context(&self) -> &Arc<MigrationContext> {
        &self.ctx
    }

    /// Creates a QUEUED migration of `version` from `source` to the backend
    /// named `destination` and hands it to the worker.
    pub async fn submit(
        &self,
        version: VersionId,
        source: ContentUrn,
        destination: &str,
    ) -> Result<MigrationRecord, RequestError> {
        for backend in [source.backend(), destination] {
            if !self.ctx.backends.contains(backend) {
                return Err(RequestError::UnknownBackend(backend.to_string()));
            }
        }

        let record = MigrationRecord::new(
            self.ids.generate_migration_id(),
            version,
            source,
            destination,
            self.ctx.clock.now(),
        );
        self.ctx.store.create_if_idle(&record).await?;
        tracing::info!(
            migration_id = %record.id,
            version = %version,
            destination,
            "migration queued"
        );

        if self.enqueue(record.id).is_err() {
            tracing::warn!(migration_id = %record.id, "worker stopped, migration stays queued");
        }
        Ok(record)
    }

    /// Hands an existing QUEUED record to the worker.
    pub fn enqueue(&self, id: MigrationId) -> Result<(), MigrationError> {
        self.jobs.send(id).map_err(|_| MigrationError::WorkerStopped)
    }

    /// Most recent migration of `version`.
    pub async fn status(&self, version: VersionId) -> Result<Option<MigrationRecord>, StoreError> {
        self.ctx.store.latest_for_version(version).await
    }

    /// Polls the store until migration `id` reaches SUCCESS or ERROR.
    pub async fn wait_for(&self, id: MigrationId, poll: Duration) -> Result<MigrationRecord, StoreError> {
        loop {
            let record = self.ctx.store.get(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops taking jobs and waits for the in-flight one.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "migration worker panicked");
        }
    }
}

async fn worker_loop(
    ctx: Arc<MigrationContext>,
    mut jobs: mpsc::UnboundedReceiver<MigrationId>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!("migration worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let id = tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = jobs.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        // errors are already recorded on the migration
        if let Err(err) = run_migration(&ctx, id).await {
            tracing::debug!(migration_id = %id, error = %err, "migration ended with error");
        }
    }
    tracing::info!("migration worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{Harness, describe_version, seed_objectstore};
    use crate::domain::MigrationStatus;
    use crate::ports::{MigrationStore, UlidGenerator};
    use ulid::Ulid;

    const POLL: Duration = Duration::from_millis(5);

    fn engine(h: &Harness) -> MigrationEngine {
        MigrationEngine::spawn(h.context(), Arc::new(UlidGenerator::new(h.clock.clone())))
    }

    fn version() -> VersionId {
        VersionId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn submitted_migration_runs_to_success() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &["some ", "bytes"]).await;
        let engine = engine(&h);
        let version = version();
        describe_version(&h, version).await;

        let record = engine.submit(version, source, "archive").await.unwrap();
        assert_eq!(record.status, MigrationStatus::Queued);

        let done = engine.wait_for(record.id, POLL).await.unwrap();
        assert_eq!(done.status, MigrationStatus::Success);
        assert_eq!(engine.status(version).await.unwrap(), Some(done));

        engine.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected_without_a_record() {
        let h = Harness::new(4);
        let engine = engine(&h);
        let version = version();

        let err = engine
            .submit(version, ContentUrn::new("objectstore", "abc"), "tape")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::UnknownBackend(name) if name == "tape"));

        let err = engine
            .submit(version, ContentUrn::new("floppy", "abc"), "archive")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::UnknownBackend(name) if name == "floppy"));

        assert!(engine.status(version).await.unwrap().is_none());
        engine.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn conflict_while_in_progress_creates_nothing() {
        let h = Harness::new(4);
        let version = version();
        let mut running = MigrationRecord::new(
            MigrationId::from_ulid(Ulid::new()),
            version,
            ContentUrn::new("objectstore", "abc"),
            "archive",
            h.clock.now(),
        );
        running.start(h.clock.now()).unwrap();
        h.store.insert_raw(running.clone()).await;
        let engine = engine(&h);

        let err = engine
            .submit(version, ContentUrn::new("objectstore", "abc"), "archive")
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::Conflict(v) if v == version));
        assert_eq!(engine.status(version).await.unwrap(), Some(running));
        engine.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn jobs_run_one_at_a_time_in_order() {
        let h = Harness::new(2);
        let engine = engine(&h);

        let mut submitted = Vec::new();
        for chunks in [&["first"][..], &["second", "!"][..], &["third"][..]] {
            let source = seed_objectstore(&h, chunks).await;
            submitted.push(engine.submit(version(), source, "objectstore").await.unwrap());
        }
        let mut finished = Vec::new();
        for record in &submitted {
            finished.push(engine.wait_for(record.id, POLL).await.unwrap());
        }

        for pair in finished.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            assert!(earlier.finished_at.unwrap() <= later.started_at.unwrap());
        }
        engine.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_unstarted_jobs_queued() {
        let h = Harness::new(4);
        let source = seed_objectstore(&h, &["late"]).await;
        let engine = engine(&h);

        engine.request_shutdown();
        let record = engine.submit(version(), source, "objectstore").await.unwrap();
        engine.shutdown_and_join().await;

        let stored = h.store.get(record.id).await.unwrap();
        assert_eq!(stored.status, MigrationStatus::Queued);
    }
}
