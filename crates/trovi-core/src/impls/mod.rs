//! Implementations - ports の具体実装
//!
//! - 本番用: SwiftClient, ZenodoClient, SqliteMigrationStore
//! - テスト / 開発用: InMemory* （外部システムなしで動く）

pub mod inmem_deposition;
pub mod inmem_migration_store;
pub mod inmem_object_store;
pub mod sqlite_migration_store;
pub mod swift;
pub mod zenodo;

pub use self::inmem_deposition::InMemoryDeposition;
pub use self::inmem_migration_store::InMemoryMigrationStore;
pub use self::inmem_object_store::InMemoryObjectStore;
pub use self::sqlite_migration_store::SqliteMigrationStore;
pub use self::swift::{SwiftClient, SwiftCredentials};
pub use self::zenodo::ZenodoClient;
