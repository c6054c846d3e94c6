//! Settings - 環境変数からの設定読み込み
//!
//! `from_env` はプロセス環境を読む（`.env` の読み込みは呼び出し側で行う）。
//! テストでは `from_lookup` に任意の lookup 関数を渡す。
//!
//! Swift は `TROVI_SWIFT_AUTH_URL` があるときだけ有効になり、そのときに限り
//! 残りの必須項目が欠けていると `ConfigError::Missing` になる。

use std::str::FromStr;
use std::sync::Arc;

use chrono::TimeDelta;

use crate::backends::{
    ARCHIVE_BACKEND, ArchiveFactory, BackendRegistry, ContentLockRegistry, GIT_BACKEND, GitFactory,
    OBJECTSTORE_BACKEND, ObjectStoreFactory, ObjectStoreOptions,
};
use crate::domain::{ConfigError, RegistryError};
use crate::impls::{SwiftClient, SwiftCredentials, ZenodoClient};
use crate::ports::Clock;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://trovi.db?mode=rwc";
pub const DEFAULT_FILE_UPLOAD_MAX_MEMORY_SIZE: usize = 2_621_440;
pub const DEFAULT_LINK_LIFESPAN_SECONDS: i64 = 86_400;
pub const DEFAULT_ZENODO_URL: &str = "https://zenodo.org";
pub const DEFAULT_ARCHIVE_PIPE_CAPACITY: usize = 1_048_576;

#[derive(Debug, Clone)]
pub struct SwiftSettings {
    pub credentials: SwiftCredentials,
    pub container: String,
    pub temp_url_key: String,
    pub auth_retry_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ZenodoSettings {
    pub url: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,

    /// In-memory upload threshold. Also the migration chunk size and the
    /// object-store segment size.
    pub file_upload_max_memory_size: usize,

    pub link_lifespan: TimeDelta,
    pub swift: Option<SwiftSettings>,
    pub zenodo: ZenodoSettings,
    pub archive_pipe_capacity: usize,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let file_upload_max_memory_size = env.parsed(
            "TROVI_FILE_UPLOAD_MAX_MEMORY_SIZE",
            DEFAULT_FILE_UPLOAD_MAX_MEMORY_SIZE,
        )?;
        if file_upload_max_memory_size == 0 {
            return Err(ConfigError::Invalid {
                key: "TROVI_FILE_UPLOAD_MAX_MEMORY_SIZE",
                value: "0".to_string(),
            });
        }
        let lifespan_seconds: i64 =
            env.parsed("TROVI_LINK_LIFESPAN_SECONDS", DEFAULT_LINK_LIFESPAN_SECONDS)?;
        let link_lifespan =
            TimeDelta::try_seconds(lifespan_seconds).ok_or_else(|| ConfigError::Invalid {
                key: "TROVI_LINK_LIFESPAN_SECONDS",
                value: lifespan_seconds.to_string(),
            })?;

        let swift = match env.optional("TROVI_SWIFT_AUTH_URL") {
            None => None,
            Some(auth_url) => Some(SwiftSettings {
                credentials: SwiftCredentials {
                    auth_url,
                    username: env.required("TROVI_SWIFT_USERNAME")?,
                    user_domain_name: env.or("TROVI_SWIFT_USER_DOMAIN_NAME", "default"),
                    password: env.required("TROVI_SWIFT_PASSWORD")?,
                    project_name: env.required("TROVI_SWIFT_PROJECT_NAME")?,
                    project_domain_name: env.or("TROVI_SWIFT_PROJECT_DOMAIN_NAME", "default"),
                    region_name: env.optional("TROVI_SWIFT_REGION_NAME"),
                },
                container: env.or("TROVI_SWIFT_CONTAINER", "trovi"),
                temp_url_key: env.required("TROVI_SWIFT_TEMP_URL_KEY")?,
                auth_retry_attempts: env.parsed("TROVI_SWIFT_AUTH_RETRY_ATTEMPTS", 3)?,
            }),
        };

        Ok(Self {
            database_url: env.or("TROVI_DATABASE_URL", DEFAULT_DATABASE_URL),
            file_upload_max_memory_size,
            link_lifespan,
            swift,
            zenodo: ZenodoSettings {
                url: env.or("TROVI_ZENODO_URL", DEFAULT_ZENODO_URL),
                access_token: env.optional("TROVI_ZENODO_ACCESS_TOKEN"),
            },
            archive_pipe_capacity: env
                .parsed("TROVI_ARCHIVE_PIPE_CAPACITY", DEFAULT_ARCHIVE_PIPE_CAPACITY)?,
        })
    }

    pub fn object_store_options(&self) -> Option<ObjectStoreOptions> {
        self.swift.as_ref().map(|swift| ObjectStoreOptions {
            container: swift.container.clone(),
            temp_url_key: swift.temp_url_key.clone(),
            link_lifespan: self.link_lifespan,
            segment_size: self.file_upload_max_memory_size as u64,
        })
    }

    /// Registers git and archive, plus objectstore when Swift is configured.
    pub fn backend_registry(&self, clock: Arc<dyn Clock>) -> Result<BackendRegistry, RegistryError> {
        let mut registry = BackendRegistry::new(Arc::new(ContentLockRegistry::new()));

        if let (Some(swift), Some(options)) = (&self.swift, self.object_store_options()) {
            let client = Arc::new(SwiftClient::new(
                swift.credentials.clone(),
                swift.auth_retry_attempts,
                clock.clone(),
            ));
            registry.register(
                OBJECTSTORE_BACKEND,
                Arc::new(ObjectStoreFactory::new(client, clock.clone(), options)),
            )?;
        } else {
            tracing::warn!("TROVI_SWIFT_AUTH_URL is not set, objectstore backend disabled");
        }

        registry.register(
            GIT_BACKEND,
            Arc::new(GitFactory::new(clock, self.link_lifespan)),
        )?;

        let zenodo = Arc::new(ZenodoClient::new(
            self.zenodo.url.clone(),
            self.zenodo.access_token.clone(),
        ));
        registry.register(
            ARCHIVE_BACKEND,
            Arc::new(ArchiveFactory::new(zenodo, self.archive_pipe_capacity)),
        )?;

        tracing::debug!(backends = ?registry.names(), "storage backends registered");
        Ok(registry)
    }
}
