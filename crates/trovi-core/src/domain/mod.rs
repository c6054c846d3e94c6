//! Domain model (IDs, content URNs, download links, migration records, errors).
//!
//! 外部システムを前提にしない純粋な型だけを置きます。

pub mod errors;
pub mod ids;
pub mod link;
pub mod migration;
pub mod urn;

pub use self::errors::{
    ConfigError, MigrationError, RegistryError, RemoteError, RequestError, StorageError,
    StoreError, TransitionError, UrnError,
};
pub use self::ids::{MigrationId, VersionId};
pub use self::link::{DownloadLink, GitLink, HttpLink};
pub use self::migration::{MigrationRecord, MigrationStatus};
pub use self::urn::ContentUrn;
