//! Abstract object store trait.
//!
//! Every storage backend must implement [`ObjectStore`].  The trait works
//! in terms of flat string keys and opaque bytes so the upload core does
//! not need to know the underlying medium.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Boxed future returned by every [`ObjectStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Failure reported by an object store.
///
/// `NotFound` is kept apart from the other failures so callers can tell
/// "the object is not there" from "the store could not answer".
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object exists at the requested key.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// The store could not serve the request right now (timeouts,
    /// throttling, 5xx).  Retrying later may succeed.
    #[error("transient store error: {0}")]
    Transient(#[source] anyhow::Error),

    /// The store rejected the request outright.
    #[error("store error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StoreError {
    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full storage key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Scoped read handle returned by [`ObjectStore::get`].
///
/// The body is only pulled when [`ObjectReader::read_to_bytes`] is
/// called.  Dropping the reader releases the underlying connection or
/// buffer.
pub struct ObjectReader {
    key: String,
    size: u64,
    body: Pin<Box<dyn AsyncRead + Send>>,
}

impl ObjectReader {
    pub fn new(key: impl Into<String>, size: u64, body: impl AsyncRead + Send + 'static) -> Self {
        Self {
            key: key.into(),
            size,
            body: Box::pin(body),
        }
    }

    /// Storage key this handle was opened on.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Object size as reported by the store.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the body into memory, consuming the handle.
    pub async fn read_to_bytes(mut self) -> Result<Bytes, StoreError> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.body
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StoreError::Transient(anyhow::anyhow!("reading {}: {e}", self.key)))?;
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Async key-addressed object store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Open the object at `key` for reading.
    fn get(&self, key: &str) -> StoreFuture<'_, ObjectReader>;

    /// Write `data` to `key`, returning the object's ETag.
    fn put(&self, key: &str, data: Bytes) -> StoreFuture<'_, String>;

    /// List the objects whose key starts with `prefix`.  Order is not
    /// guaranteed.
    fn list(&self, prefix: &str) -> StoreFuture<'_, Vec<ObjectEntry>>;

    /// Concatenate `sources`, in the given order, into a new object at
    /// `dest`, returning the ETag of the new object.
    fn compose(&self, dest: &str, sources: &[String]) -> StoreFuture<'_, String>;

    /// Issue a time-limited, credential-free GET URL for `key`.
    fn presigned_url(&self, key: &str, expiry: Duration) -> StoreFuture<'_, String>;
}
