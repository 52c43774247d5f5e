//! Chunk bookkeeping and merge protocol.
//!
//! Clients split a file into numbered chunks, upload them in any order
//! (re-sending after failures), then ask for a merge.  Everything here is
//! layered on a generic [`ObjectStore`]; no state is kept in process
//! apart from the optional per-key leases.

pub mod existence;
pub mod ingest;
pub mod keys;
pub mod lease;
pub mod merge;
pub mod sequence;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;

use crate::errors::UploadError;
use crate::metrics::{
    CHUNKS_INGESTED_TOTAL, CHUNK_BYTES_RECEIVED_TOTAL, EXISTENCE_CHECKS_TOTAL, MERGES_TOTAL,
};
use crate::storage::backend::ObjectStore;

pub use existence::{Existence, ExistenceChecker};
pub use ingest::{ChunkIngestor, IngestOutcome};
pub use lease::KeyedLeases;
pub use merge::{MergeCoordinator, MergeResult};
pub use sequence::{ChunkDescriptor, ChunkSequencer};

/// Tunables for [`UploadService`].
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Largest accepted chunk in bytes.  0 means unlimited.
    pub max_chunk_size: u64,
    /// Lifetime of the read URL returned by a completed merge.
    pub url_expiry: Duration,
    /// Serialize merges per digest, keep ingests out of a running merge
    /// of the same digest, and serialize ingests per chunk key.
    pub serialize: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 0,
            url_expiry: Duration::from_secs(86_400),
            serialize: true,
        }
    }
}

/// The three client-facing operations over one object store.
pub struct UploadService {
    existence: ExistenceChecker,
    ingestor: ChunkIngestor,
    merger: MergeCoordinator,
    leases: Option<Arc<KeyedLeases>>,
}

impl UploadService {
    pub fn new(store: Arc<dyn ObjectStore>, settings: UploadSettings) -> Self {
        Self {
            existence: ExistenceChecker::new(Arc::clone(&store)),
            ingestor: ChunkIngestor::new(Arc::clone(&store), settings.max_chunk_size),
            merger: MergeCoordinator::new(store, settings.url_expiry),
            leases: settings.serialize.then(KeyedLeases::new),
        }
    }

    /// Whether `files/{digest}{extension}` exists, with store failures
    /// reported separately from absence.
    pub async fn check_exists(
        &self,
        digest: &str,
        extension: &str,
    ) -> Result<Existence, UploadError> {
        let result = self.existence.check(digest, extension).await;
        let label = match &result {
            Ok(Existence::Present) => "present",
            Ok(Existence::Absent) => "absent",
            Err(_) => "error",
        };
        counter!(EXISTENCE_CHECKS_TOTAL, "result" => label).increment(1);
        result
    }

    /// Boolean form of [`Self::check_exists`]; failures read as `false`.
    pub async fn exists(&self, digest: &str, extension: &str) -> bool {
        existence::as_hint(
            self.check_exists(digest, extension).await,
            digest,
            extension,
        )
    }

    /// Store one chunk.
    ///
    /// With leases on, this holds the digest's lease shared (so ingests of
    /// one digest run in parallel but never during its merge) and the
    /// chunk key's lease exclusively.
    pub async fn upload_chunk(
        &self,
        digest: &str,
        index: u32,
        data: Bytes,
        size: u64,
    ) -> Result<IngestOutcome, UploadError> {
        let _leases = match &self.leases {
            Some(leases) => Some((
                leases.acquire_shared(&keys::chunk_prefix(digest)).await,
                leases.acquire(&keys::chunk_key(digest, index)).await,
            )),
            None => None,
        };

        let outcome = self.ingestor.ingest(digest, index, data, size).await?;
        counter!(CHUNKS_INGESTED_TOTAL, "outcome" => outcome.as_str()).increment(1);
        if outcome == IngestOutcome::Stored {
            counter!(CHUNK_BYTES_RECEIVED_TOTAL).increment(size);
        }
        Ok(outcome)
    }

    /// Merge the chunks of `digest`, holding its lease exclusively.
    pub async fn merge_chunks(
        &self,
        digest: &str,
        chunk_total: u32,
        extension: &str,
    ) -> Result<MergeResult, UploadError> {
        let _lease = match &self.leases {
            Some(leases) => Some(leases.acquire(&keys::chunk_prefix(digest)).await),
            None => None,
        };

        let result = self.merger.merge(digest, chunk_total, extension).await;
        let label = match &result {
            Ok(MergeResult::Completed { .. }) => "completed",
            Ok(MergeResult::Incomplete { .. }) => "incomplete",
            Err(_) => "failed",
        };
        counter!(MERGES_TOTAL, "outcome" => label).increment(1);
        result
    }
}
