//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Swift, Zenodo, git ホスティング, DB）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - MigrationStore が migration 状態の正本
//! - StorageBackend はリモート保存先ごとの統一 I/O
//! - ObjectStoreClient / DepositionClient は backend が使う薄い通信層

pub mod clock;
pub mod deposition;
pub mod id_generator;
pub mod migration_store;
pub mod object_store;
pub mod storage_backend;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::deposition::{
    ByteStream, Creator, Deposition, DepositionClient, DepositionFile, DepositionMetadata,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::migration_store::MigrationStore;
pub use self::object_store::{ObjectMeta, ObjectStoreClient};
pub use self::storage_backend::StorageBackend;
