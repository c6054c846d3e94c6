//! BackendState - backend variant 共通の状態
//!
//! 各 variant はこの struct を埋め込み、open/close/write の共通ルール
//! （sealed 判定, lock の保持, segment cursor, size キャッシュ）を委譲します。

use crate::domain::StorageError;

use super::lock::ContentLock;

/// Highest segment index a single content may use.
pub const MAX_SEGMENTS: u64 = u64::MAX;

#[derive(Debug, Default)]
pub struct BackendState {
    /// Cached remote size. None until fetched.
    pub size: Option<u64>,
    closed: bool,
    next_segment: u64,
    segments_written: u64,
    lock: Option<ContentLock>,
}

impl BackendState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_open(&self) -> bool {
        self.lock.is_some()
    }

    pub fn hold(&mut self, lock: ContentLock) {
        self.lock = Some(lock);
    }

    pub fn next_segment(&self) -> u64 {
        self.next_segment
    }

    pub fn segments_written(&self) -> u64 {
        self.segments_written
    }

    /// Common guard of every write path.
    pub fn check_writable(&self, backend: &str, writable: bool) -> Result<(), StorageError> {
        if !writable || self.closed {
            return Err(StorageError::NotWritable(backend.to_string()));
        }
        if !self.is_open() {
            return Err(StorageError::NotOpen(backend.to_string()));
        }
        Ok(())
    }

    /// Index the next write goes to.
    pub fn claim_segment(&self) -> Result<u64, StorageError> {
        if self.next_segment >= MAX_SEGMENTS {
            return Err(StorageError::TooManySegments);
        }
        Ok(self.next_segment)
    }

    /// Records a stored segment and moves the cursor past it.
    pub fn advance(&mut self, written: u64) {
        self.next_segment = self.next_segment.saturating_add(1);
        self.segments_written = self.segments_written.saturating_add(1);
        self.size = Some(self.size.unwrap_or(0).saturating_add(written));
    }

    pub fn set_cursor(&mut self, segment: u64) {
        self.next_segment = segment;
    }

    /// First half of `close()`: rejects a second close.
    pub fn begin_close(&self, backend: &str) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::AlreadyClosed(backend.to_string()));
        }
        Ok(())
    }

    /// Second half of `close()`: marks the content sealed and releases the
    /// content lock, whatever the finalization result was.
    pub fn seal(&mut self) {
        self.closed = true;
        self.lock.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ContentLockRegistry;

    #[test]
    fn segment_ceiling_is_checked() {
        let mut state = BackendState::new();
        state.set_cursor(MAX_SEGMENTS);
        assert!(matches!(state.claim_segment(), Err(StorageError::TooManySegments)));

        state.set_cursor(MAX_SEGMENTS - 1);
        assert_eq!(state.claim_segment().unwrap(), MAX_SEGMENTS - 1);
    }

    #[test]
    fn advance_tracks_size_and_counts() {
        let mut state = BackendState::new();
        state.advance(10);
        state.advance(5);
        assert_eq!(state.next_segment(), 2);
        assert_eq!(state.segments_written(), 2);
        assert_eq!(state.size, Some(15));
    }

    #[tokio::test]
    async fn seal_releases_lock_and_is_one_way() {
        let registry = ContentLockRegistry::new();
        let mut state = BackendState::new();
        state.hold(registry.acquire("x").await);
        assert!(state.check_writable("objectstore", true).is_ok());

        state.begin_close("objectstore").unwrap();
        state.seal();

        assert!(!state.is_open());
        assert!(matches!(
            state.begin_close("objectstore"),
            Err(StorageError::AlreadyClosed(_))
        ));
        assert!(matches!(
            state.check_writable("objectstore", true),
            Err(StorageError::NotWritable(_))
        ));
        // lock is free again
        let _relock = registry.acquire("x").await;
    }
}
