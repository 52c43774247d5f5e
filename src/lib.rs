//! chunkyard library: resumable, deduplicated chunked uploads.
//!
//! Clients upload a file as numbered chunks keyed by the file's content
//! digest, resend whatever a merge reports as missing, and finally get a
//! time-limited URL to the composed object.  Chunks and final objects
//! live in a pluggable object store (in-memory or S3-compatible).

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod signing;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::storage::backend::ObjectStore;
use crate::storage::memory::MemoryBackend;
use crate::upload::{UploadService, UploadSettings};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Existence, ingest and merge over the configured store.
    pub uploads: UploadService,
    /// Set when the in-memory backend is active; serves `/objects/*key`.
    pub memory: Option<Arc<MemoryBackend>>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        memory: Option<Arc<MemoryBackend>>,
    ) -> Self {
        let settings = UploadSettings {
            max_chunk_size: config.server.max_chunk_size,
            url_expiry: config.upload.url_expiry(),
            serialize: config.upload.serialize_merges,
        };
        Self {
            uploads: UploadService::new(store, settings),
            config,
            memory,
        }
    }

    /// State backed by a fresh in-memory store.
    pub fn with_memory_backend(config: Config) -> Self {
        let memory = Arc::new(MemoryBackend::new(
            config.storage.memory.max_size_bytes,
            &config.memory_public_url(),
            signing::SigningCredentials {
                access_key: config.storage.memory.access_key.clone(),
                secret_key: config.storage.memory.secret_key.clone(),
                region: config.storage.memory.region.clone(),
            },
        ));
        let store: Arc<dyn ObjectStore> = memory.clone();
        Self::new(config, store, Some(memory))
    }
}
