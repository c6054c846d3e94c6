//! Scoped open/close helper.
//!
//! `scoped` opens a backend, runs the body, then closes the backend whether or
//! not the body failed. A body error wins over a close error.

use futures::future::BoxFuture;

use crate::domain::StorageError;
use crate::ports::StorageBackend;

pub async fn scoped<B, T, E, F>(backend: &mut B, body: F) -> Result<T, E>
where
    B: StorageBackend + ?Sized,
    E: From<StorageError>,
    F: for<'a> FnOnce(&'a mut B) -> BoxFuture<'a, Result<T, E>>,
{
    backend.open().await?;
    let result = body(backend).await;
    let closed = backend.close().await;
    match (result, closed) {
        (Err(err), Err(close_err)) => {
            tracing::warn!(backend = backend.name(), error = %close_err, "close failed after error");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(_), Err(close_err)) => Err(close_err.into()),
        (Ok(value), Ok(())) => Ok(value),
    }
}
