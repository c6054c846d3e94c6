//! Startup recovery - 永続化された migration と「実行中のジョブは無い」という事実を合わせる
//!
//! 起動時に一度だけ、engine を起動した直後に呼ぶ。
//!
//! 1. IN_PROGRESS のまま残った migration は ERROR にする（途中まで書いた転送は
//!    破損していないことを確認できないので再開しない）
//! 2. QUEUED のまま残った migration は worker に再投入する

use crate::domain::migration::MESSAGE_INTERRUPTED;
use crate::domain::{MigrationError, MigrationStatus, StoreError};
use crate::ports::{Clock, MigrationStore};

use super::engine::MigrationEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reaped: usize,
    pub requeued: usize,
}

/// Marks every IN_PROGRESS migration as interrupted.
pub async fn reap_unfinished_migrations(
    store: &dyn MigrationStore,
    clock: &dyn Clock,
) -> Result<usize, StoreError> {
    let in_progress = store.list_by_status(MigrationStatus::InProgress).await?;
    tracing::info!(count = in_progress.len(), "found migrations interrupted by shutdown");

    let mut reaped = 0;
    for mut record in in_progress {
        if let Err(err) = record.fail(MESSAGE_INTERRUPTED, clock.now()) {
            tracing::warn!(migration_id = %record.id, error = %err, "could not reap migration");
            continue;
        }
        store.update(&record).await?;
        reaped += 1;
    }
    Ok(reaped)
}

/// Hands every QUEUED migration back to the worker, oldest first.
pub async fn requeue_queued_migrations(
    store: &dyn MigrationStore,
    engine: &MigrationEngine,
) -> Result<usize, MigrationError> {
    let queued = store.list_by_status(MigrationStatus::Queued).await?;
    tracing::info!(count = queued.len(), "re-queueing migrations");

    for record in &queued {
        engine.enqueue(record.id)?;
    }
    Ok(queued.len())
}

/// Runs both routines against the engine's store.
pub async fn recover(engine: &MigrationEngine) -> Result<RecoveryReport, MigrationError> {
    let ctx = engine.context();
    let reaped = reap_unfinished_migrations(ctx.store.as_ref(), ctx.clock.as_ref()).await?;
    let requeued = requeue_queued_migrations(ctx.store.as_ref(), engine).await?;
    Ok(RecoveryReport { reaped, requeued })
}
