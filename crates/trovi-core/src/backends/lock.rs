//! ContentLockRegistry - content id ごとの排他制御
//!
//! # 設計原則
//! - キーは content id のみ（backend 名は含まない）。同じ id を指す別インスタンスも排他される
//! - 再入不可。backend は `open()` で一度だけ取得し、`close()` または drop で解放する
//! - プロセス起動時に一つ作り、`BackendRegistry` 経由ですべての backend に共有する
//!
//! # 既知の制約
//! エントリは削除されない。レジストリはプロセスの寿命に比例して増え続ける
//! （`len()` で観測できる）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct ContentLockRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ContentLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for `content_id`, inserting it on first use.
    pub fn get_or_create(&self, content_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(content_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Waits until no other holder exists for `content_id`.
    pub async fn acquire(&self, content_id: &str) -> ContentLock {
        let slot = self.get_or_create(content_id);
        let guard = slot.lock_owned().await;
        tracing::debug!(content_id, "content lock acquired");
        ContentLock {
            content_id: content_id.to_string(),
            _guard: guard,
        }
    }

    /// Number of content ids ever locked in this process.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held content lock. Released on drop.
pub struct ContentLock {
    content_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl ContentLock {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl Drop for ContentLock {
    fn drop(&mut self) {
        tracing::debug!(content_id = %self.content_id, "content lock released");
    }
}

impl std::fmt::Debug for ContentLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLock")
            .field("content_id", &self.content_id)
            .finish()
    }
}
