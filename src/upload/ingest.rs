//! Idempotent single-chunk ingestion.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::keys;
use crate::errors::UploadError;
use crate::storage::backend::ObjectStore;

/// What [`ChunkIngestor::ingest`] did with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The payload was written to the chunk key.
    Stored,
    /// A chunk already existed at the key; the payload was discarded.
    AlreadyPresent,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Stored => "stored",
            IngestOutcome::AlreadyPresent => "already_present",
        }
    }
}

pub struct ChunkIngestor {
    store: Arc<dyn ObjectStore>,
    /// 0 means unlimited.
    max_chunk_size: u64,
}

impl ChunkIngestor {
    pub fn new(store: Arc<dyn ObjectStore>, max_chunk_size: u64) -> Self {
        Self {
            store,
            max_chunk_size,
        }
    }

    /// Store chunk `index` of `digest` unless it is already there.
    ///
    /// The first write for a `(digest, index)` wins; later payloads are
    /// not compared against it.  Store write failures are not retried.
    pub async fn ingest(
        &self,
        digest: &str,
        index: u32,
        data: Bytes,
        size: u64,
    ) -> Result<IngestOutcome, UploadError> {
        keys::validate_digest(digest)?;
        if index == 0 {
            return Err(UploadError::invalid("chunk index must be at least 1"));
        }
        if data.len() as u64 != size {
            return Err(UploadError::invalid(format!(
                "declared chunk size {size} does not match payload length {}",
                data.len()
            )));
        }
        if self.max_chunk_size > 0 && size > self.max_chunk_size {
            return Err(UploadError::ChunkTooLarge {
                size,
                max: self.max_chunk_size,
            });
        }

        let key = keys::chunk_key(digest, index);

        match self.store.get(&key).await {
            Ok(existing) => {
                debug!(
                    "Chunk {} already stored ({} bytes), discarding {} new bytes",
                    key,
                    existing.size(),
                    size
                );
                drop(existing);
                return Ok(IngestOutcome::AlreadyPresent);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                // Overwriting is harmless for content-stable chunks.
                warn!("Could not check chunk {} before writing: {}", key, e);
            }
        }

        self.store.put(&key, data).await.map_err(|source| {
            error!("Chunk upload failed for {}: {}", key, source);
            UploadError::ChunkUploadFailed {
                key: key.clone(),
                source,
            }
        })?;

        debug!("Stored chunk {} ({} bytes)", key, size);
        Ok(IngestOutcome::Stored)
    }
}
