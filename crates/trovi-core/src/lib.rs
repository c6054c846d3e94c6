//! trovi-core
//!
//! Storage backends for artifact contents and the engine that migrates
//! contents between them.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, content URN, download links, migration record, errors）
//! - **ports**: 抽象化レイヤー（StorageBackend, ObjectStoreClient, DepositionClient, MigrationStore, Clock, IdGenerator）
//! - **backends**: StorageBackend の 3 variant（objectstore, git, archive）と content lock、registry
//! - **impls**: 実装（Swift, Zenodo, SQLite と開発用の InMemory*）
//! - **app**: アプリケーションロジック（MigrationEngine, recovery, upload, contents）
//! - **config**: 環境変数からの Settings

pub mod app;
pub mod backends;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
