//! Finalize: check for gaps, compose, and hand back a read URL.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::keys;
use super::sequence::{self, ChunkSequencer};
use crate::errors::UploadError;
use crate::storage::backend::ObjectStore;

/// Marker that prefixes a missing-chunk report on the wire.
pub const MISSING_CHUNK_MARKER: &str = "[miss_chunk]";

/// Outcome of [`MergeCoordinator::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The final object was composed; `url` grants time-limited read access.
    Completed { key: String, url: String },
    /// These indices must be (re)uploaded before the merge can succeed.
    Incomplete { missing: Vec<u32> },
}

/// Renders the wire form: the URL, or `[miss_chunk][2, 3]`.
impl fmt::Display for MergeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeResult::Completed { url, .. } => f.write_str(url),
            MergeResult::Incomplete { missing } => {
                let list = missing
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{MISSING_CHUNK_MARKER}[{list}]")
            }
        }
    }
}

pub struct MergeCoordinator {
    store: Arc<dyn ObjectStore>,
    sequencer: ChunkSequencer,
    url_expiry: Duration,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, url_expiry: Duration) -> Self {
        Self {
            sequencer: ChunkSequencer::new(Arc::clone(&store)),
            store,
            url_expiry,
        }
    }

    /// Compose chunks `1..=chunk_total` of `digest` into
    /// `files/{digest}{extension}`.
    ///
    /// Missing chunks are a normal `Incomplete` result.  Listing, compose
    /// and URL issuance are not transactional; a chunk removed in between
    /// surfaces as `MergeFailed` from the compose step.
    pub async fn merge(
        &self,
        digest: &str,
        chunk_total: u32,
        extension: &str,
    ) -> Result<MergeResult, UploadError> {
        keys::validate_digest(digest)?;
        keys::validate_extension(extension)?;
        if chunk_total == 0 {
            return Err(UploadError::invalid("chunk total must be at least 1"));
        }

        info!("Merging {} ({} chunks)", digest, chunk_total);

        let chunks = self.sequencer.list_chunks(digest).await?;
        let missing = sequence::missing(&chunks, chunk_total)?;
        if !missing.is_empty() {
            warn!("Merge of {} incomplete, missing chunks: {:?}", digest, missing);
            return Ok(MergeResult::Incomplete { missing });
        }

        let extra: Vec<u32> = chunks
            .iter()
            .map(|c| c.index)
            .filter(|&index| index > chunk_total)
            .collect();
        if !extra.is_empty() {
            return Err(UploadError::UnexpectedChunks { chunk_total, extra });
        }

        let dest = keys::final_key(digest, extension);
        let sources: Vec<String> = chunks.into_iter().map(|c| c.key).collect();

        self.store
            .compose(&dest, &sources)
            .await
            .map_err(|source| merge_failed(&dest, source))?;

        let url = self
            .store
            .presigned_url(&dest, self.url_expiry)
            .await
            .map_err(|source| merge_failed(&dest, source))?;

        info!("Merged {} chunks into {}", sources.len(), dest);
        Ok(MergeResult::Completed { key: dest, url })
    }
}

fn merge_failed(key: &str, source: crate::storage::backend::StoreError) -> UploadError {
    error!("Merge of {} failed: {}", key, source);
    UploadError::MergeFailed {
        key: key.to_string(),
        source,
    }
}
