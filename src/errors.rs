//! Upload error types.
//!
//! Every variant maps to a stable error code and HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::InvalidArgument { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::storage::backend::StoreError;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors raised by the upload core and the HTTP boundary.
#[derive(Debug, Error)]
pub enum UploadError {
    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The chunk exceeds the configured maximum size.
    #[error("chunk of {size} bytes exceeds the maximum of {max} bytes")]
    ChunkTooLarge { size: u64, max: u64 },

    /// The request body was cut off at the body limit before the chunk
    /// could be read, so only the limit is known.
    #[error("request body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// Writing a chunk to the store failed.
    #[error("failed to store chunk {key}: {source}")]
    ChunkUploadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Composing the final object or issuing its URL failed.
    #[error("failed to merge {key}: {source}")]
    MergeFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// A stored chunk key does not follow the chunk key layout.
    #[error("malformed chunk key: {key}")]
    MalformedKey { key: String },

    /// The observed chunk set breaks the one-chunk-per-index invariant.
    #[error("corrupt chunk state for {digest}: index {index} stored more than once")]
    CorruptChunkState { digest: String, index: u32 },

    /// Chunks exist beyond the declared total.
    #[error("chunks {extra:?} exceed the declared total of {chunk_total}")]
    UnexpectedChunks { chunk_total: u32, extra: Vec<u32> },

    /// The store could not answer.
    #[error("object store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

}

impl UploadError {
    /// Return the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidArgument { .. } => "InvalidArgument",
            UploadError::ChunkTooLarge { .. } | UploadError::BodyTooLarge { .. } => {
                "ChunkTooLarge"
            }
            UploadError::ChunkUploadFailed { .. } => "ChunkUploadFailed",
            UploadError::MergeFailed { .. } => "MergeFailed",
            UploadError::MalformedKey { .. } => "MalformedKey",
            UploadError::CorruptChunkState { .. } => "CorruptChunkState",
            UploadError::UnexpectedChunks { .. } => "UnexpectedChunks",
            UploadError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            UploadError::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::ChunkUploadFailed { .. } => StatusCode::BAD_GATEWAY,
            UploadError::MergeFailed { .. } => StatusCode::BAD_GATEWAY,
            UploadError::MalformedKey { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::CorruptChunkState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::UnexpectedChunks { .. } => StatusCode::CONFLICT,
            UploadError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        UploadError::InvalidArgument {
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    request_id: &'a str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, code = self.code(), "{self}");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            request_id: &request_id,
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id.clone()),
            ],
            json,
        )
            .into_response()
    }
}
