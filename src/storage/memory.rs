//! In-memory object store.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>`.  Listing
//! returns keys in hash-map order, so callers must not rely on it being
//! sorted.  A configurable memory limit (`max_size_bytes`) caps total
//! stored bytes.
//!
//! Presigned URLs are issued by [`crate::signing`] against a public base
//! URL and served by the `/objects/*key` route.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use super::backend::{ObjectEntry, ObjectReader, ObjectStore, StoreError, StoreFuture};
use crate::signing::{self, SigningCredentials};

/// In-memory object store.
pub struct MemoryBackend {
    /// storage_key -> (data, etag).
    objects: tokio::sync::RwLock<HashMap<String, (Bytes, String)>>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    /// Base URL presigned links point at (e.g. `http://localhost:9013`).
    public_url: String,
    /// Key material for presigned links.
    credentials: SigningCredentials,
}

impl MemoryBackend {
    pub fn new(max_size_bytes: u64, public_url: &str, credentials: SigningCredentials) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            max_size_bytes,
            public_url: public_url.to_string(),
            credentials,
        }
    }

    /// Credentials used to sign and verify presigned links.
    pub fn credentials(&self) -> &SigningCredentials {
        &self.credentials
    }

    /// Remove the object at `key`, returning whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Insert `data` at `key`, enforcing the memory limit.  The caller
    /// holds the write lock.
    fn insert_locked(
        &self,
        objects: &mut HashMap<String, (Bytes, String)>,
        key: String,
        data: Bytes,
    ) -> Result<String, StoreError> {
        if self.max_size_bytes > 0 {
            let current: u64 = objects.values().map(|(d, _)| d.len() as u64).sum();
            let replaced = objects.get(&key).map(|(d, _)| d.len() as u64).unwrap_or(0);
            let after = current - replaced + data.len() as u64;
            if after > self.max_size_bytes {
                return Err(StoreError::Permanent(anyhow::anyhow!(
                    "Memory limit exceeded: would hold {after} bytes, max={}",
                    self.max_size_bytes
                )));
            }
        }
        let etag = Self::compute_etag(&data);
        objects.insert(key, (data, etag.clone()));
        Ok(etag)
    }
}

impl ObjectStore for MemoryBackend {
    fn get(&self, key: &str) -> StoreFuture<'_, ObjectReader> {
        let key = key.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            match objects.get(&key) {
                Some((data, _etag)) => {
                    let size = data.len() as u64;
                    Ok(ObjectReader::new(key, size, Cursor::new(data.clone())))
                }
                None => Err(StoreError::NotFound { key }),
            }
        })
    }

    fn put(&self, key: &str, data: Bytes) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            self.insert_locked(&mut objects, key, data)
        })
    }

    fn list(&self, prefix: &str) -> StoreFuture<'_, Vec<ObjectEntry>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, (data, _))| ObjectEntry {
                    key: key.clone(),
                    size: data.len() as u64,
                })
                .collect())
        })
    }

    fn compose(&self, dest: &str, sources: &[String]) -> StoreFuture<'_, String> {
        let dest = dest.to_string();
        let sources = sources.to_vec();
        Box::pin(async move {
            if sources.is_empty() {
                return Err(StoreError::Permanent(anyhow::anyhow!(
                    "compose of {dest} needs at least one source"
                )));
            }

            // One write lock for the whole operation keeps compose atomic.
            let mut objects = self.objects.write().await;

            let mut combined = Vec::new();
            for source in &sources {
                match objects.get(source) {
                    Some((data, _)) => combined.extend_from_slice(data),
                    None => return Err(StoreError::NotFound { key: source.clone() }),
                }
            }

            tracing::debug!(
                "Memory compose: dest={} sources={} bytes={}",
                dest,
                sources.len(),
                combined.len()
            );

            self.insert_locked(&mut objects, dest, Bytes::from(combined))
        })
    }

    fn presigned_url(&self, key: &str, expiry: Duration) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            if !self.objects.read().await.contains_key(&key) {
                return Err(StoreError::NotFound { key });
            }
            signing::presign_get_url(
                &self.public_url,
                &key,
                &self.credentials,
                chrono::Utc::now(),
                expiry,
            )
            .map_err(|e| StoreError::Permanent(e.into()))
        })
    }
}

// -- Tests -------------------------------------------------------------------
