//! Does a finalized object already exist for a digest?

use std::sync::Arc;

use tracing::{debug, warn};

use super::keys;
use crate::errors::UploadError;
use crate::storage::backend::ObjectStore;

/// Answer from [`ExistenceChecker::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Present,
    Absent,
}

pub struct ExistenceChecker {
    store: Arc<dyn ObjectStore>,
}

impl ExistenceChecker {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Look up `files/{digest}{extension}`.
    ///
    /// A store failure is returned as `StoreUnavailable` instead of being
    /// reported as absence.
    pub async fn check(&self, digest: &str, extension: &str) -> Result<Existence, UploadError> {
        keys::validate_digest(digest)?;
        keys::validate_extension(extension)?;

        let key = keys::final_key(digest, extension);
        match self.store.get(&key).await {
            Ok(reader) => {
                debug!("Final object present: {} ({} bytes)", key, reader.size());
                drop(reader);
                Ok(Existence::Present)
            }
            Err(e) if e.is_not_found() => Ok(Existence::Absent),
            Err(e) => Err(UploadError::StoreUnavailable(e)),
        }
    }

    /// Boolean fast-path hint: any failure reads as "not there".
    pub async fn exists(&self, digest: &str, extension: &str) -> bool {
        as_hint(self.check(digest, extension).await, digest, extension)
    }
}

/// Fold a [`ExistenceChecker::check`] result into the boolean hint.
pub(crate) fn as_hint(
    result: Result<Existence, UploadError>,
    digest: &str,
    extension: &str,
) -> bool {
    match result {
        Ok(existence) => existence == Existence::Present,
        Err(e) => {
            warn!("Existence check for {}{} failed: {}", digest, extension, e);
            false
        }
    }
}
