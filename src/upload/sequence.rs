//! Listing, ordering and gap detection for a digest's chunks.

use std::sync::Arc;

use super::keys;
use crate::errors::UploadError;
use crate::storage::backend::ObjectStore;

/// One stored chunk as observed by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub digest: String,
    /// 1-based position in the file.
    pub index: u32,
    pub size: u64,
    pub key: String,
}

pub struct ChunkSequencer {
    store: Arc<dyn ObjectStore>,
}

impl ChunkSequencer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// List the chunks stored for `digest`, sorted by numeric index.
    ///
    /// The listing is a point-in-time view and may race with concurrent
    /// ingestion.  Keys that do not parse as chunk keys fail the whole
    /// call with `MalformedKey`.
    pub async fn list_chunks(&self, digest: &str) -> Result<Vec<ChunkDescriptor>, UploadError> {
        keys::validate_digest(digest)?;

        let entries = self
            .store
            .list(&keys::chunk_prefix(digest))
            .await
            .map_err(UploadError::StoreUnavailable)?;

        let mut chunks = entries
            .into_iter()
            .map(|entry| {
                let index = keys::parse_chunk_key(digest, &entry.key)?;
                Ok(ChunkDescriptor {
                    digest: digest.to_string(),
                    index,
                    size: entry.size,
                    key: entry.key,
                })
            })
            .collect::<Result<Vec<_>, UploadError>>()?;

        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }
}

/// Indices in `1..=chunk_total` absent from `ordered`, ascending.
///
/// `ordered` must be sorted by index.  A repeated index is reported as
/// `CorruptChunkState`.  Indices above `chunk_total` are ignored here.
pub fn missing(ordered: &[ChunkDescriptor], chunk_total: u32) -> Result<Vec<u32>, UploadError> {
    let total = chunk_total as u64;
    let mut expected: u64 = 1;
    let mut report = Vec::new();

    for chunk in ordered {
        let index = chunk.index as u64;
        if index < expected {
            return Err(UploadError::CorruptChunkState {
                digest: chunk.digest.clone(),
                index: chunk.index,
            });
        }
        report.extend((expected..index.min(total + 1)).map(|i| i as u32));
        expected = index + 1;
    }

    if expected <= total {
        report.extend((expected..=total).map(|i| i as u32));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(indices: &[u32]) -> Vec<ChunkDescriptor> {
        indices
            .iter()
            .map(|&index| ChunkDescriptor {
                digest: "d".to_string(),
                index,
                size: 1,
                key: keys::chunk_key("d", index),
            })
            .collect()
    }

    #[test]
    fn test_missing_middle_gap() {
        assert_eq!(missing(&chunks(&[1, 3]), 3).unwrap(), vec![2]);
    }

    #[test]
    fn test_missing_when_nothing_uploaded() {
        assert_eq!(missing(&[], 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_missing_tail() {
        assert_eq!(missing(&chunks(&[1, 2]), 3).unwrap(), vec![3]);
    }

    #[test]
    fn test_missing_leading_and_scattered_gaps() {
        assert_eq!(
            missing(&chunks(&[3, 4, 7]), 8).unwrap(),
            vec![1, 2, 5, 6, 8]
        );
    }

    #[test]
    fn test_complete_set_has_nothing_missing() {
        assert!(missing(&chunks(&[1, 2, 3]), 3).unwrap().is_empty());
    }

    #[test]
    fn test_gaps_above_total_are_not_reported() {
        assert_eq!(missing(&chunks(&[1, 6]), 3).unwrap(), vec![2, 3]);
        assert!(missing(&chunks(&[1, 2, 3, 4]), 3).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_index_is_corrupt_state() {
        let err = missing(&chunks(&[1, 2, 2, 3]), 3).unwrap_err();
        assert!(matches!(
            err,
            UploadError::CorruptChunkState { index: 2, .. }
        ));
    }

    #[test]
    fn test_missing_is_ascending_and_unique_for_many_sets() {
        // Every subset of 1..=6 against every total up to 8.
        for mask in 0u32..64 {
            let present: Vec<u32> = (1..=6).filter(|i| mask & (1 << (i - 1)) != 0).collect();
            for total in 0..=8 {
                let report = missing(&chunks(&present), total).unwrap();
                assert!(report.windows(2).all(|w| w[0] < w[1]));
                let expected: Vec<u32> =
                    (1..=total).filter(|i| !present.contains(i)).collect();
                assert_eq!(report, expected, "present={present:?} total={total}");
            }
        }
    }
}
