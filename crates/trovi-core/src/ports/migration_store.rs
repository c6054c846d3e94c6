//! MigrationStore port - MigrationRecord の正本（source of truth）
//!
//! # 実装
//! - **SqliteMigrationStore**: sqlx + SQLite（本番用）
//! - **InMemoryMigrationStore**: テスト用（更新履歴を保持）
//!
//! # 設計原則
//! - 各 update は短いトランザクション。進捗は完了を待たずに読み手へ見える
//! - `create_if_idle` は IN_PROGRESS の確認と insert を同一トランザクションで行う
//! - レコードは削除しない（監査ログ）

use async_trait::async_trait;

use crate::domain::{ContentUrn, MigrationId, MigrationRecord, MigrationStatus, StoreError, VersionId};
use crate::ports::DepositionMetadata;

#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Inserts `record` unless its version already has an IN_PROGRESS migration,
    /// in which case `StoreError::Conflict` is returned and nothing is written.
    async fn create_if_idle(&self, record: &MigrationRecord) -> Result<(), StoreError>;

    async fn get(&self, id: MigrationId) -> Result<MigrationRecord, StoreError>;

    /// Overwrites the mutable fields of an existing record.
    async fn update(&self, record: &MigrationRecord) -> Result<(), StoreError>;

    /// Most recently created migration of `version`.
    async fn latest_for_version(&self, version: VersionId) -> Result<Option<MigrationRecord>, StoreError>;

    /// Oldest first.
    async fn list_by_status(&self, status: MigrationStatus) -> Result<Vec<MigrationRecord>, StoreError>;

    async fn set_version_contents(&self, version: VersionId, urn: &ContentUrn) -> Result<(), StoreError>;

    async fn version_contents(&self, version: VersionId) -> Result<Option<ContentUrn>, StoreError>;

    /// Publication metadata of `version`, sent to backends that publish new content.
    async fn set_version_metadata(&self, version: VersionId, metadata: &DepositionMetadata) -> Result<(), StoreError>;

    async fn version_metadata(&self, version: VersionId) -> Result<Option<DepositionMetadata>, StoreError>;
}
