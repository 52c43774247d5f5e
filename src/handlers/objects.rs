//! Presigned downloads for the in-memory backend.
//!
//! Merge results point at `GET /objects/{key}?X-Amz-...`.  The request is
//! served only when the query-string signature verifies and the link has
//! not expired.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::debug;

use crate::errors::generate_request_id;
use crate::signing::{self, PresignError};
use crate::storage::backend::ObjectStore;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DenyBody<'a> {
    code: &'a str,
    message: String,
    request_id: String,
}

fn deny(status: StatusCode, code: &str, message: String) -> Response {
    let request_id = generate_request_id();
    let body = DenyBody {
        code,
        message,
        request_id: request_id.clone(),
    };
    (
        status,
        [("x-request-id", request_id)],
        axum::Json(body),
    )
        .into_response()
}

/// `GET /objects/*key` -- Serve a stored object through a presigned link.
#[utoipa::path(
    get,
    path = "/objects/{key}",
    tag = "Objects",
    operation_id = "GetPresignedObject",
    params(("key" = String, Path, description = "Object key, e.g. files/abc123.png")),
    responses(
        (status = 200, description = "Object body", content_type = "application/octet-stream"),
        (status = 403, description = "Signature invalid or expired"),
        (status = 404, description = "No such object")
    )
)]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(memory) = state.memory.as_ref() else {
        return deny(
            StatusCode::NOT_FOUND,
            "NoSuchRoute",
            "objects are served by the upstream store".to_string(),
        );
    };

    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let query = uri.query().unwrap_or("");

    if let Err(e) = signing::verify_presigned(
        method.as_str(),
        uri.path(),
        query,
        host,
        memory.credentials(),
        chrono::Utc::now(),
    ) {
        debug!("Presigned request for {} rejected: {}", key, e);
        let code = match e {
            PresignError::Expired => "ExpiredRequest",
            PresignError::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            PresignError::UnknownAccessKey(_) => "InvalidAccessKeyId",
            PresignError::Malformed(_) => "AccessDenied",
        };
        return deny(StatusCode::FORBIDDEN, code, e.to_string());
    }

    let reader = match memory.get(&key).await {
        Ok(reader) => reader,
        Err(e) if e.is_not_found() => {
            return deny(StatusCode::NOT_FOUND, "NoSuchKey", e.to_string());
        }
        Err(e) => {
            return deny(StatusCode::SERVICE_UNAVAILABLE, "StoreUnavailable", e.to_string());
        }
    };

    match reader.read_to_bytes().await {
        Ok(data) => (
            StatusCode::OK,
            [("content-type", "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(e) => deny(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", e.to_string()),
    }
}
