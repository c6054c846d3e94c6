//! Storage backends - StorageBackend の variant と共通部品
//!
//! - `lock`: content id ごとの排他（ContentLockRegistry）
//! - `state`: sealed / segment cursor / size キャッシュの共通状態
//! - `scoped`: open/close を対にする helper
//! - `object_store`, `git`, `archive`: 3 つの variant
//! - `registry`: backend 名 → インスタンスの factory

pub mod archive;
pub mod git;
pub mod lock;
pub mod object_store;
pub mod registry;
pub mod scoped;
pub mod state;

pub use self::archive::{ARCHIVE_BACKEND, ArchiveBackend, record_from_doi};
pub use self::git::{GIT_BACKEND, GitBackend};
pub use self::lock::{ContentLock, ContentLockRegistry};
pub use self::object_store::{OBJECTSTORE_BACKEND, ObjectStoreBackend, ObjectStoreOptions};
pub use self::registry::{
    ArchiveFactory, BackendFactory, BackendRegistry, BackendRequest, GitFactory, ObjectStoreFactory,
};
pub use self::scoped::scoped;
pub use self::state::{BackendState, MAX_SEGMENTS};
