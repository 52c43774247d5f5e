//! Chunk upload endpoints under `/minio`.
//!
//! - `GET  /minio/checkExits?md5=..&fileSuffix=..` -> JSON `true`/`false`
//! - `POST /minio/upload` (multipart: `md5`, `chunkIndex`, `chunk`) -> JSON `true`
//! - `POST /minio/merge?md5=..&chunkTotal=..&fileSuffix=..` -> URL or
//!   `[miss_chunk][..]` as plain text

use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use garde::Validate;
use serde::Deserialize;
use tracing::debug;

use crate::errors::UploadError;
use crate::upload::Existence;
use crate::AppState;

// -- Request parameters -------------------------------------------------------

/// Query for `GET /minio/checkExits`.
#[derive(Debug, Deserialize, Validate, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct CheckExistsQuery {
    /// Content digest of the whole file.
    #[garde(length(min = 1), pattern(r"^[^/%]+$"))]
    pub md5: String,
    /// Extension appended to the final object name, e.g. `.png`.
    #[garde(pattern(r"^[^/%]*$"))]
    #[serde(default)]
    pub file_suffix: String,
}

/// Query for `POST /minio/merge`.
#[derive(Debug, Deserialize, Validate, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct MergeQuery {
    #[garde(length(min = 1), pattern(r"^[^/%]+$"))]
    pub md5: String,
    /// Number of chunks the client split the file into.
    #[garde(range(min = 1))]
    pub chunk_total: u32,
    #[garde(pattern(r"^[^/%]*$"))]
    #[serde(default)]
    pub file_suffix: String,
}

/// Fields of the `POST /minio/upload` multipart form.
#[derive(Debug, Validate)]
pub struct ChunkForm {
    #[garde(length(min = 1), pattern(r"^[^/%]+$"))]
    pub md5: String,
    #[garde(range(min = 1))]
    pub chunk_index: u32,
    #[garde(skip)]
    pub chunk: Bytes,
}

/// Multipart body schema, for the OpenAPI document only.
#[allow(dead_code, non_snake_case)]
#[derive(utoipa::ToSchema)]
pub struct ChunkUpload {
    md5: String,
    #[schema(minimum = 1)]
    chunkIndex: u32,
    #[schema(value_type = String, format = Binary)]
    chunk: Vec<u8>,
}

fn validated<T: Validate<Context = ()>>(value: T) -> Result<T, UploadError> {
    value
        .validate()
        .map_err(|report| UploadError::invalid(report.to_string().trim().to_string()))?;
    Ok(value)
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, UploadError> {
    query
        .map(|Query(q)| q)
        .map_err(|rejection| UploadError::invalid(rejection.body_text()))
}

// -- Handlers -----------------------------------------------------------------

/// `GET /minio/checkExits` -- Whether the merged file already exists.
#[utoipa::path(
    get,
    path = "/minio/checkExits",
    tag = "Upload",
    operation_id = "CheckExists",
    params(CheckExistsQuery),
    responses(
        (status = 200, description = "true if the merged file exists", body = bool),
        (status = 400, description = "Invalid parameters"),
        (status = 503, description = "Object store unavailable")
    )
)]
pub async fn check_exists(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CheckExistsQuery>, QueryRejection>,
) -> Result<Response, UploadError> {
    let params = validated(query_params(query)?)?;

    let existence = state
        .uploads
        .check_exists(&params.md5, &params.file_suffix)
        .await?;
    Ok(Json(existence == Existence::Present).into_response())
}

/// `POST /minio/upload` -- Store one chunk; re-sending a stored chunk is a no-op.
#[utoipa::path(
    post,
    path = "/minio/upload",
    tag = "Upload",
    operation_id = "UploadChunk",
    request_body(content = ChunkUpload, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk stored or already present", body = bool),
        (status = 400, description = "Invalid form"),
        (status = 413, description = "Chunk too large"),
        (status = 502, description = "Object store rejected the write")
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, UploadError> {
    let multipart = multipart.map_err(|rejection| UploadError::invalid(rejection.body_text()))?;
    let limit = state.config.server.body_limit();
    let form = validated(read_chunk_form(multipart, limit).await?)?;
    let size = form.chunk.len() as u64;

    let outcome = state
        .uploads
        .upload_chunk(&form.md5, form.chunk_index, form.chunk, size)
        .await?;
    debug!(
        "Chunk {} of {}: {}",
        form.chunk_index,
        form.md5,
        outcome.as_str()
    );
    Ok(Json(true).into_response())
}

/// `POST /minio/merge` -- Compose the chunks into the final file.
///
/// Returns the access URL, or `[miss_chunk][i, j, ..]` listing the chunks
/// that must be uploaded first.  Both are `200 OK`.
#[utoipa::path(
    post,
    path = "/minio/merge",
    tag = "Upload",
    operation_id = "MergeChunks",
    params(MergeQuery),
    responses(
        (status = 200, description = "Access URL or missing-chunk report", body = String, content_type = "text/plain"),
        (status = 400, description = "Invalid parameters"),
        (status = 409, description = "Chunks stored beyond chunkTotal"),
        (status = 502, description = "Compose or URL issuance failed")
    )
)]
pub async fn merge_chunks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MergeQuery>, QueryRejection>,
) -> Result<Response, UploadError> {
    let params = validated(query_params(query)?)?;

    let result = state
        .uploads
        .merge_chunks(&params.md5, params.chunk_total, &params.file_suffix)
        .await?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        result.to_string(),
    )
        .into_response())
}

// -- Multipart parsing --------------------------------------------------------

async fn read_chunk_form(
    mut multipart: Multipart,
    limit: Option<u64>,
) -> Result<ChunkForm, UploadError> {
    let mut md5 = None;
    let mut chunk_index = None;
    let mut chunk = None;
    let read_error = |err| multipart_error(err, limit);

    while let Some(field) = multipart.next_field().await.map_err(read_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("md5") => md5 = Some(field.text().await.map_err(read_error)?),
            Some("chunkIndex") => {
                let text = field.text().await.map_err(read_error)?;
                let index = text.trim().parse::<u32>().map_err(|_| {
                    UploadError::invalid(format!("chunkIndex is not a valid index: {text}"))
                })?;
                chunk_index = Some(index);
            }
            Some("chunk") => chunk = Some(field.bytes().await.map_err(read_error)?),
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    Ok(ChunkForm {
        md5: md5.ok_or_else(|| UploadError::invalid("missing form field: md5"))?,
        chunk_index: chunk_index
            .ok_or_else(|| UploadError::invalid("missing form field: chunkIndex"))?,
        chunk: chunk.ok_or_else(|| UploadError::invalid("missing form field: chunk"))?,
    })
}

fn multipart_error(err: MultipartError, limit: Option<u64>) -> UploadError {
    match (err.status(), limit) {
        (StatusCode::PAYLOAD_TOO_LARGE, Some(limit)) => UploadError::BodyTooLarge { limit },
        _ => UploadError::invalid(format!("invalid multipart body: {}", err.body_text())),
    }
}
