//! SQLite-backed MigrationStore.
//!
//! Schema is created on connect. Every update runs in its own short
//! transaction so progress is visible to other readers while a job runs.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::domain::{ContentUrn, MigrationId, MigrationRecord, MigrationStatus, StoreError, VersionId};
use crate::ports::{DepositionMetadata, MigrationStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS migrations (
        id TEXT PRIMARY KEY NOT NULL,
        version TEXT NOT NULL,
        source_urn TEXT NOT NULL,
        destination_backend TEXT NOT NULL,
        destination_urn TEXT,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        progress REAL NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS migrations_version_idx ON migrations (version)",
    "CREATE INDEX IF NOT EXISTS migrations_status_idx ON migrations (status)",
    r#"
    CREATE TABLE IF NOT EXISTS artifact_version_contents (
        version TEXT PRIMARY KEY NOT NULL,
        contents_urn TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifact_version_metadata (
        version TEXT PRIMARY KEY NOT NULL,
        metadata TEXT NOT NULL
    )
    "#,
];

const SELECT_COLUMNS: &str = "SELECT id, version, source_urn, destination_backend, destination_urn, \
     status, message, progress, created_at, started_at, finished_at FROM migrations";

#[derive(sqlx::FromRow)]
struct MigrationRow {
    id: String,
    version: String,
    source_urn: String,
    destination_backend: String,
    destination_urn: Option<String>,
    status: String,
    message: String,
    progress: f64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<MigrationRow> for MigrationRecord {
    type Error = StoreError;

    fn try_from(row: MigrationRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, value: &str| StoreError::Corrupt(format!("{field}={value:?}"));
        Ok(MigrationRecord {
            id: MigrationId::from_str(&row.id).map_err(|_| corrupt("id", &row.id))?,
            version: VersionId::from_str(&row.version).map_err(|_| corrupt("version", &row.version))?,
            source_urn: row
                .source_urn
                .parse()
                .map_err(|_| corrupt("source_urn", &row.source_urn))?,
            destination_backend: row.destination_backend,
            destination_urn: row
                .destination_urn
                .as_deref()
                .map(|urn| urn.parse().map_err(|_| corrupt("destination_urn", urn)))
                .transpose()?,
            status: row.status.parse().map_err(|_| corrupt("status", &row.status))?,
            message: row.message,
            progress: row.progress,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

pub struct SqliteMigrationStore {
    pool: SqlitePool,
}

impl SqliteMigrationStore {
    /// Connects to `url` (e.g. `sqlite://trovi.db?mode=rwc`), creating the
    /// database file and schema when missing.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. One connection, so every query sees the
    /// same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MigrationStore for SqliteMigrationStore {
    async fn create_if_idle(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let busy: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM migrations WHERE version = ? AND status = ? LIMIT 1",
        )
        .bind(record.version.to_storage_string())
        .bind(MigrationStatus::InProgress.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Err(StoreError::Conflict(record.version));
        }

        sqlx::query(
            r#"
            INSERT INTO migrations (id, version, source_urn, destination_backend, destination_urn,
                                    status, message, progress, created_at, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_storage_string())
        .bind(record.version.to_storage_string())
        .bind(record.source_urn.to_string())
        .bind(&record.destination_backend)
        .bind(record.destination_urn.as_ref().map(ToString::to_string))
        .bind(record.status.as_str())
        .bind(&record.message)
        .bind(record.progress)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: MigrationId) -> Result<MigrationRecord, StoreError> {
        let row: Option<MigrationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.to_storage_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?.try_into()
    }

    async fn update(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE migrations
            SET destination_urn = ?, status = ?, message = ?, progress = ?,
                started_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record.destination_urn.as_ref().map(ToString::to_string))
        .bind(record.status.as_str())
        .bind(&record.message)
        .bind(record.progress)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.id.to_storage_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_for_version(&self, version: VersionId) -> Result<Option<MigrationRecord>, StoreError> {
        let row: Option<MigrationRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE version = ? ORDER BY rowid DESC LIMIT 1"))
                .bind(version.to_storage_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(MigrationRecord::try_from).transpose()
    }

    async fn list_by_status(&self, status: MigrationStatus) -> Result<Vec<MigrationRecord>, StoreError> {
        let rows: Vec<MigrationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY rowid ASC"))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MigrationRecord::try_from).collect()
    }

    async fn set_version_contents(&self, version: VersionId, urn: &ContentUrn) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO artifact_version_contents (version, contents_urn)
            VALUES (?, ?)
            ON CONFLICT(version) DO UPDATE SET contents_urn = excluded.contents_urn
            "#,
        )
        .bind(version.to_storage_string())
        .bind(urn.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn version_contents(&self, version: VersionId) -> Result<Option<ContentUrn>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT contents_urn FROM artifact_version_contents WHERE version = ?")
                .bind(version.to_storage_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(urn,)| {
            urn.parse()
                .map_err(|_| StoreError::Corrupt(format!("contents_urn={urn:?}")))
        })
        .transpose()
    }

    async fn set_version_metadata(&self, version: VersionId, metadata: &DepositionMetadata) -> Result<(), StoreError> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO artifact_version_metadata (version, metadata)
            VALUES (?, ?)
            ON CONFLICT(version) DO UPDATE SET metadata = excluded.metadata
            "#,
        )
        .bind(version.to_storage_string())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn version_metadata(&self, version: VersionId) -> Result<Option<DepositionMetadata>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM artifact_version_metadata WHERE version = ?")
                .bind(version.to_storage_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| {
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn round_trips_a_finished_record() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let mut r = record(VersionId::from_ulid(Ulid::new()));
        store.create_if_idle(&r).await.unwrap();

        r.start(Utc::now()).unwrap();
        r.record_progress(0.5);
        store.update(&r).await.unwrap();
        r.succeed(ContentUrn::new("archive", "10.5281/zenodo.9"), Utc::now()).unwrap();
        store.update(&r).await.unwrap();

        let loaded = store.get(r.id).await.unwrap();
        assert_eq!(loaded.status, MigrationStatus::Success);
        assert_eq!(loaded.destination_urn, r.destination_urn);
        assert_eq!(loaded.progress, 1.0);
        assert_eq!(loaded.message, "Uploaded to urn:trovi:contents:archive:10.5281/zenodo.9");
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn rejects_second_migration_while_in_progress() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let version = VersionId::from_ulid(Ulid::new());
        let mut first = record(version);
        store.create_if_idle(&first).await.unwrap();
        first.start(Utc::now()).unwrap();
        store.update(&first).await.unwrap();

        let second = record(version);
        assert!(matches!(
            store.create_if_idle(&second).await,
            Err(StoreError::Conflict(v)) if v == version
        ));
        assert!(matches!(store.get(second.id).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.latest_for_version(version).await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn lists_by_status_in_creation_order() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let a = record(VersionId::from_ulid(Ulid::new()));
        let b = record(VersionId::from_ulid(Ulid::new()));
        store.create_if_idle(&a).await.unwrap();
        store.create_if_idle(&b).await.unwrap();

        let queued = store.list_by_status(MigrationStatus::Queued).await.unwrap();
        assert_eq!(queued.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(store.list_by_status(MigrationStatus::InProgress).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_record_fails() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let r = record(VersionId::from_ulid(Ulid::new()));
        assert!(matches!(store.update(&r).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn version_contents_upsert() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let version = VersionId::from_ulid(Ulid::new());
        assert!(store.version_contents(version).await.unwrap().is_none());

        store.set_version_contents(version, &ContentUrn::new("objectstore", "a")).await.unwrap();
        store.set_version_contents(version, &ContentUrn::new("archive", "10.1/zenodo.2")).await.unwrap();
        assert_eq!(
            store.version_contents(version).await.unwrap(),
            Some(ContentUrn::new("archive", "10.1/zenodo.2"))
        );
    }

    #[tokio::test]
    async fn version_metadata_round_trips() {
        let store = SqliteMigrationStore::in_memory().await.unwrap();
        let version = VersionId::from_ulid(Ulid::new());
        assert!(store.version_metadata(version).await.unwrap().is_none());

        let mut metadata = DepositionMetadata::for_version(version, "Artifact", "Reproduces figure 3");
        metadata.creators.push(crate::ports::Creator {
            name: "Doe, Jane".to_string(),
            affiliation: Some("University".to_string()),
        });
        store.set_version_metadata(version, &metadata).await.unwrap();

        assert_eq!(store.version_metadata(version).await.unwrap(), Some(metadata));
    }
}
