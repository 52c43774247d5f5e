//! Storage key layout.
//!
//! ```text
//! chunks/{digest}/{index}      in-progress chunk, index is 1-based decimal
//! files/{digest}{extension}    finalized object
//! ```
//!
//! The layout is persisted state and must stay stable.

use crate::errors::UploadError;

pub const CHUNKS_PREFIX: &str = "chunks/";
pub const FILES_PREFIX: &str = "files/";

/// Characters that may not appear in a digest or extension.  `/` would
/// make the key mapping ambiguous; `%` would be read back as an escape
/// when the key is placed in a download URL.
const RESERVED: [char; 2] = ['/', '%'];

/// Reject digests that would make the key mapping ambiguous.
pub fn validate_digest(digest: &str) -> Result<(), UploadError> {
    if digest.is_empty() {
        return Err(UploadError::invalid("digest must not be empty"));
    }
    if let Some(c) = digest.chars().find(|c| RESERVED.contains(c)) {
        return Err(UploadError::invalid(format!(
            "digest must not contain '{c}': {digest}"
        )));
    }
    Ok(())
}

pub fn validate_extension(extension: &str) -> Result<(), UploadError> {
    if let Some(c) = extension.chars().find(|c| RESERVED.contains(c)) {
        return Err(UploadError::invalid(format!(
            "file extension must not contain '{c}': {extension}"
        )));
    }
    Ok(())
}

/// Listing prefix covering every chunk of `digest`.
pub fn chunk_prefix(digest: &str) -> String {
    format!("{CHUNKS_PREFIX}{digest}/")
}

pub fn chunk_key(digest: &str, index: u32) -> String {
    format!("{CHUNKS_PREFIX}{digest}/{index}")
}

pub fn final_key(digest: &str, extension: &str) -> String {
    format!("{FILES_PREFIX}{digest}{extension}")
}

/// Recover the chunk index from the trailing segment of a chunk key.
///
/// Only canonical renderings are accepted: ASCII digits, no sign, no
/// leading zero, value at least 1.  Anything else is `MalformedKey`.
pub fn parse_index(key: &str) -> Result<u32, UploadError> {
    let malformed = || UploadError::MalformedKey {
        key: key.to_string(),
    };

    let suffix = key.rsplit('/').next().unwrap_or(key);
    if suffix.is_empty() || suffix.starts_with('0') || !suffix.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }
    suffix.parse::<u32>().map_err(|_| malformed())
}

/// Parse a listed key that must sit directly under `chunk_prefix(digest)`.
pub fn parse_chunk_key(digest: &str, key: &str) -> Result<u32, UploadError> {
    match key.strip_prefix(&chunk_prefix(digest)) {
        Some(rest) if !rest.contains('/') => parse_index(key),
        _ => Err(UploadError::MalformedKey {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_layout() {
        assert_eq!(chunk_key("abc123", 1), "chunks/abc123/1");
        assert_eq!(chunk_key("abc123", 10), "chunks/abc123/10");
        assert_eq!(chunk_prefix("abc123"), "chunks/abc123/");
    }

    #[test]
    fn test_final_key_layout() {
        assert_eq!(final_key("abc123", ".png"), "files/abc123.png");
        assert_eq!(final_key("abc123", ""), "files/abc123");
    }

    #[test]
    fn test_parse_index_inverts_chunk_key() {
        for index in [1, 2, 9, 10, 4242, u32::MAX] {
            assert_eq!(parse_index(&chunk_key("d", index)).unwrap(), index);
        }
    }

    #[test]
    fn test_parse_index_rejects_non_canonical() {
        for key in [
            "chunks/d/",
            "chunks/d/0",
            "chunks/d/01",
            "chunks/d/+1",
            "chunks/d/-1",
            "chunks/d/1a",
            "chunks/d/ 1",
            "chunks/d/4294967296",
        ] {
            let err = parse_index(key).unwrap_err();
            assert!(matches!(err, UploadError::MalformedKey { .. }), "{key}");
        }
    }

    #[test]
    fn test_parse_chunk_key_rejects_nested_and_foreign_keys() {
        assert_eq!(parse_chunk_key("d", "chunks/d/3").unwrap(), 3);
        assert!(parse_chunk_key("d", "chunks/d/sub/3").is_err());
        assert!(parse_chunk_key("d", "chunks/other/3").is_err());
    }

    #[test]
    fn test_validate_digest() {
        assert!(validate_digest("abc123").is_ok());
        assert!(validate_digest("").is_err());
        assert!(validate_digest("a/1").is_err());
        assert!(validate_digest("abc%2F1").is_err());
    }

    #[test]
    fn test_validate_extension() {
        assert!(validate_extension(".png").is_ok());
        assert!(validate_extension("").is_ok());
        assert!(validate_extension("/x").is_err());
        assert!(validate_extension(".p%6Eg").is_err());
    }
}
