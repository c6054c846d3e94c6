//! App - アプリケーション層
//!
//! ports と backends を組み合わせてユースケースを実装します。
//!
//! # 主要コンポーネント
//! - **MigrationEngine**: migration を一件ずつ実行する単一ワーカー
//! - **run_migration**: 一件の migration 本体（read → write → progress）
//! - **recovery**: 起動時の IN_PROGRESS 回収と QUEUED 再投入
//! - **ContentUpload**: メモリ閾値つきのアップロード
//! - **describe_contents**: URN → access methods

pub mod contents;
pub mod engine;
pub mod job;
pub mod recovery;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use self::contents::{ContentsRef, ContentsView, describe_contents};
pub use self::engine::MigrationEngine;
pub use self::job::{MigrationContext, run_migration};
pub use self::recovery::{RecoveryReport, reap_unfinished_migrations, recover, requeue_queued_migrations};
pub use self::upload::{ContentUpload, UploadReceipt, archive_content_type};
