//! ContentUpload - 受け取った body を backend に保存する
//!
//! # フロー
//! - 長さが閾値（`max_memory_size`）以下: メモリに溜めて、完了時に一回で write
//! - 閾値を超える（申告された長さ、または溜めている途中で超えた）:
//!   その時点で backend を open し、以降の chunk はそのまま write
//!
//! 途中で失敗した backend は close しない（manifest も publish もされない）。

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};

use crate::backends::{BackendRegistry, BackendRequest};
use crate::domain::{ContentUrn, RemoteError, RequestError, StorageError};

/// Archive formats accepted for artifact contents, by file suffix.
const ARCHIVE_TYPES: &[(&str, &str)] = &[(".tar.gz", "application/tar+gz"), (".tar", "application/tar")];

/// Content type of a supported archive file name.
pub fn archive_content_type(file_name: &str) -> Option<&'static str> {
    let name = Path::new(file_name).file_name()?.to_str()?;
    ARCHIVE_TYPES
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, content_type)| *content_type)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub urn: ContentUrn,
    pub size: u64,

    /// False when the body fit under the in-memory threshold.
    pub streamed: bool,
}

pub struct ContentUpload {
    backends: Arc<BackendRegistry>,
    max_memory_size: usize,
}

impl ContentUpload {
    pub fn new(backends: Arc<BackendRegistry>, max_memory_size: usize) -> Self {
        Self {
            backends,
            max_memory_size,
        }
    }

    /// Stores `body` as new content of `backend`.
    ///
    /// `content_length` is the size announced by the caller, if any.
    pub async fn upload<S>(
        &self,
        backend: &str,
        request: BackendRequest,
        content_length: Option<u64>,
        mut body: S,
    ) -> Result<UploadReceipt, RequestError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin + Send,
    {
        let mut target = self.backends.resolve(backend, request)?;
        if !target.writable() {
            return Err(StorageError::NotWritable(backend.to_string()).into());
        }

        let threshold = self.max_memory_size as u64;
        let mut streaming = content_length.is_some_and(|len| len > threshold);
        if streaming {
            target.open().await?;
        }

        let mut buffer = BytesMut::new();
        let mut size: u64 = 0;
        while let Some(chunk) = body.try_next().await.map_err(body_error)? {
            size += chunk.len() as u64;
            if streaming {
                target.write(chunk).await?;
                continue;
            }
            buffer.extend_from_slice(&chunk);
            if buffer.len() as u64 > threshold {
                tracing::debug!(backend, buffered = buffer.len(), "upload exceeded memory threshold, streaming");
                target.open().await?;
                target.write(buffer.split().freeze()).await?;
                streaming = true;
            }
        }

        if size == 0 {
            return Err(RequestError::EmptyUpload);
        }
        if !streaming {
            target.open().await?;
            target.write(buffer.freeze()).await?;
        }
        target.close().await?;

        let urn = target.to_urn()?;
        tracing::info!(urn = %urn, size, streamed = streaming, "upload stored");
        Ok(UploadReceipt {
            urn,
            size,
            streamed: streaming,
        })
    }
}

fn body_error(err: io::Error) -> RequestError {
    StorageError::Remote(RemoteError::Io(err)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::Harness;
    use futures::stream;
    use rstest::rstest;

    fn body(chunks: &[&str]) -> stream::Iter<std::vec::IntoIter<Result<Bytes, io::Error>>> {
        let chunks: Vec<Result<Bytes, io::Error>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        stream::iter(chunks)
    }

    async fn read_back(h: &Harness, urn: &ContentUrn) -> Vec<u8> {
        let mut backend = h.backends.resolve_urn(urn).unwrap();
        backend.open().await.unwrap();
        let mut out = Vec::new();
        while backend.readable() {
            let chunk = backend.read(64).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        backend.close().await.unwrap();
        out
    }

    #[rstest]
    #[case::small_body_is_buffered(&["ab", "cd"], None, false)]
    #[case::growing_body_switches_to_streaming(&["abcdef", "ghijkl", "mn"], None, true)]
    #[case::announced_large_body_streams(&["abcdefghijkl"], Some(12), true)]
    #[tokio::test]
    async fn stores_body_in_objectstore(
        #[case] chunks: &[&str],
        #[case] content_length: Option<u64>,
        #[case] streamed: bool,
    ) {
        let h = Harness::new(4);
        let upload = ContentUpload::new(h.backends.clone(), 8);

        let receipt = upload
            .upload("objectstore", BackendRequest::new_content(), content_length, body(chunks))
            .await
            .unwrap();

        assert_eq!(receipt.streamed, streamed);
        assert_eq!(receipt.size, chunks.concat().len() as u64);
        assert_eq!(read_back(&h, &receipt.urn).await, chunks.concat().as_bytes());
    }

    #[tokio::test]
    async fn git_rejects_uploads() {
        let h = Harness::new(4);
        let upload = ContentUpload::new(h.backends.clone(), 8);
        let err = upload
            .upload(
                "git",
                BackendRequest::existing("https://github.com/org/repo@main"),
                None,
                body(&["x"]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Storage(StorageError::NotWritable(_))));
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let h = Harness::new(4);
        let upload = ContentUpload::new(h.backends.clone(), 8);
        let err = upload
            .upload("objectstore", BackendRequest::new_content(), None, body(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::EmptyUpload));
    }

    #[tokio::test]
    async fn body_errors_surface() {
        let h = Harness::new(4);
        let upload = ContentUpload::new(h.backends.clone(), 8);
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);
        let err = upload
            .upload("objectstore", BackendRequest::new_content(), None, failing)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Storage(StorageError::Remote(RemoteError::Io(_)))));
    }

    #[rstest]
    #[case::tarball("artifact.tar.gz", Some("application/tar+gz"))]
    #[case::tar("dir/artifact.tar", Some("application/tar"))]
    #[case::zip("artifact.zip", None)]
    #[case::gzip_only("artifact.gz", None)]
    fn archive_types(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(archive_content_type(name), expected);
    }
}
