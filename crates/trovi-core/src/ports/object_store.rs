//! ObjectStoreClient port - Swift 互換オブジェクトストレージ
//!
//! objectstore backend が必要とする最小限の操作だけを定義します。
//! パスはすべて `/{container}/{object}` 形式です。
//!
//! # 実装
//! - **SwiftClient**: Keystone 認証 + HTTP（本番用）
//! - **InMemoryObjectStore**: テスト用（dynamic large object を再現）

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::RemoteError;

/// HEAD の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Logical length. For a manifest object this is the sum of its segments.
    pub content_length: u64,

    /// `X-Object-Manifest` value when the object is a manifest.
    pub manifest: Option<String>,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Storage URL of the account, e.g. `https://swift.example.org/v1/AUTH_abc`.
    async fn endpoint(&self) -> Result<String, RemoteError>;

    /// None when the object does not exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError>;

    async fn put(&self, path: &str, body: Bytes) -> Result<(), RemoteError>;

    /// Zero-length object whose content is every object under `segment_prefix`
    /// (`{container}/{prefix}`) in lexicographic order.
    async fn put_manifest(
        &self,
        path: &str,
        segment_prefix: &str,
        content_type: &str,
    ) -> Result<(), RemoteError>;

    /// Byte range of the logical object. The range end is exclusive.
    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes, RemoteError>;
}
