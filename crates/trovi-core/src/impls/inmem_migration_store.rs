//! In-memory MigrationStore.
//!
//! Keeps every persisted snapshot of each record so tests can observe the
//! sequence of progress updates a migration produced.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ContentUrn, MigrationId, MigrationRecord, MigrationStatus, StoreError, VersionId};
use crate::ports::{DepositionMetadata, MigrationStore};

#[derive(Default)]
struct State {
    /// Insertion order doubles as creation order.
    order: Vec<MigrationId>,
    history: HashMap<MigrationId, Vec<MigrationRecord>>,
    contents: HashMap<VersionId, ContentUrn>,
    metadata: HashMap<VersionId, DepositionMetadata>,
}

impl State {
    fn current(&self, id: &MigrationId) -> Option<&MigrationRecord> {
        self.history.get(id).and_then(|h| h.last())
    }

    fn records(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.order.iter().filter_map(|id| self.current(id))
    }
}

#[derive(Default)]
pub struct InMemoryMigrationStore {
    state: Mutex<State>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot persisted for `id`, oldest first.
    pub async fn history(&self, id: MigrationId) -> Vec<MigrationRecord> {
        self.state.lock().await.history.get(&id).cloned().unwrap_or_default()
    }

    /// Inserts a record as-is, bypassing the conflict check. Used to stage
    /// state left behind by a previous process.
    pub async fn insert_raw(&self, record: MigrationRecord) {
        let mut state = self.state.lock().await;
        state.order.push(record.id);
        state.history.insert(record.id, vec![record]);
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn create_if_idle(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let busy = state
            .records()
            .any(|r| r.version == record.version && r.status == MigrationStatus::InProgress);
        if busy {
            return Err(StoreError::Conflict(record.version));
        }
        state.order.push(record.id);
        state.history.insert(record.id, vec![record.clone()]);
        Ok(())
    }

    async fn get(&self, id: MigrationId) -> Result<MigrationRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .current(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let history = state
            .history
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.to_string()))?;
        history.push(record.clone());
        Ok(())
    }

    async fn latest_for_version(&self, version: VersionId) -> Result<Option<MigrationRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records().filter(|r| r.version == version).last().cloned())
    }

    async fn list_by_status(&self, status: MigrationStatus) -> Result<Vec<MigrationRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records().filter(|r| r.status == status).cloned().collect())
    }

    async fn set_version_contents(&self, version: VersionId, urn: &ContentUrn) -> Result<(), StoreError> {
        self.state.lock().await.contents.insert(version, urn.clone());
        Ok(())
    }

    async fn version_contents(&self, version: VersionId) -> Result<Option<ContentUrn>, StoreError> {
        Ok(self.state.lock().await.contents.get(&version).cloned())
    }

    async fn set_version_metadata(&self, version: VersionId, metadata: &DepositionMetadata) -> Result<(), StoreError> {
        self.state.lock().await.metadata.insert(version, metadata.clone());
        Ok(())
    }

    async fn version_metadata(&self, version: VersionId) -> Result<Option<DepositionMetadata>, StoreError> {
        Ok(self.state.lock().await.metadata.get(&version).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    fn record(version: VersionId) -> MigrationRecord {
        MigrationRecord::new(
            MigrationId::from_ulid(Ulid::new()),
            version,
            ContentUrn::new("objectstore", "abc"),
            "archive",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conflict_only_while_in_progress() {
        let store = InMemoryMigrationStore::new();
        let version = VersionId::from_ulid(Ulid::new());

        let mut first = record(version);
        store.create_if_idle(&first).await.unwrap();
        // a queued migration does not block another request
        store.create_if_idle(&record(version)).await.unwrap();

        first.start(Utc::now()).unwrap();
        store.update(&first).await.unwrap();
        let err = store.create_if_idle(&record(version)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(v) if v == version));

        first.fail("boom", Utc::now()).unwrap();
        store.update(&first).await.unwrap();
        store.create_if_idle(&record(version)).await.unwrap();
    }

    #[tokio::test]
    async fn history_keeps_every_snapshot() {
        let store = InMemoryMigrationStore::new();
        let mut r = record(VersionId::from_ulid(Ulid::new()));
        store.create_if_idle(&r).await.unwrap();
        r.start(Utc::now()).unwrap();
        store.update(&r).await.unwrap();

        let history = store.history(r.id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, MigrationStatus::Queued);
        assert_eq!(store.get(r.id).await.unwrap().status, MigrationStatus::InProgress);
    }

    #[tokio::test]
    async fn latest_for_version_is_most_recent() {
        let store = InMemoryMigrationStore::new();
        let version = VersionId::from_ulid(Ulid::new());
        let a = record(version);
        let b = record(version);
        store.create_if_idle(&a).await.unwrap();
        store.create_if_idle(&b).await.unwrap();
        store.create_if_idle(&record(VersionId::from_ulid(Ulid::new()))).await.unwrap();

        assert_eq!(store.latest_for_version(version).await.unwrap().unwrap().id, b.id);
        assert_eq!(store.list_by_status(MigrationStatus::Queued).await.unwrap().len(), 3);
    }
}
