//! Axum router construction.
//!
//! The [`app`] function wires the upload endpoints, the presigned
//! download route and the operational endpoints to their handlers and
//! returns a ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;

use crate::config::CorsConfig;
use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the chunk upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "chunkyard",
        version = "0.1.0",
        description = "Resumable, deduplicated chunked file upload"
    ),
    paths(
        health_check,
        crate::handlers::upload::check_exists,
        crate::handlers::upload::upload_chunk,
        crate::handlers::upload::merge_chunks,
        crate::handlers::objects::get_object,
    ),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Upload", description = "Chunked upload protocol"),
        (name = "Objects", description = "Presigned downloads (in-memory backend)"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with every route.
pub fn app(state: Arc<AppState>) -> Router {
    let observability = state.config.observability.clone();
    let cors = state.config.cors.clone();
    let body_limit = match state.config.server.body_limit() {
        None => DefaultBodyLimit::disable(),
        Some(limit) => DefaultBodyLimit::max(usize::try_from(limit).unwrap_or(usize::MAX)),
    };

    let mut router = Router::new()
        .route("/minio/checkExits", get(crate::handlers::upload::check_exists))
        .route("/minio/upload", post(crate::handlers::upload::upload_chunk))
        .route("/minio/merge", post(crate::handlers::upload::merge_chunks))
        .route("/objects/*key", get(crate::handlers::objects::get_object))
        .route("/openapi.json", get(openapi_json));

    if observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    let mut router = router
        .with_state(state)
        .layer(body_limit)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http());

    if cors.enabled {
        router = router.layer(cors_layer(&cors));
    }

    // Outermost so it captures the full request lifecycle.
    router.layer(middleware::from_fn(metrics_middleware))
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() || config.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

// -- Request ID middleware ----------------------------------------------------

/// Tag every response with an `x-request-id`.
///
/// Error responses carry the ID that also appears in their JSON body, so
/// an existing header is left alone.
async fn request_id_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    response
}

// -- Operational endpoints ----------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- The OpenAPI document.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use tower::ServiceExt;

    const BOUNDARY: &str = "chunkyard-test-boundary";

    fn test_app() -> Router {
        app(Arc::new(AppState::with_memory_backend(Config::default())))
    }

    fn multipart_body(md5: &str, index: &str, chunk: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in [("md5", md5), ("chunkIndex", index)] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(chunk);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(md5: &str, index: &str, chunk: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/minio/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(md5, index, chunk)))
            .unwrap()
    }

    fn merge_request(query: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/minio/merge?{query}"))
            .body(Body::empty())
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "localhost:9013")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let resp = test_app().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        assert_eq!(body_string(resp).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_openapi_lists_upload_routes() {
        let resp = test_app()
            .oneshot(get_request("/openapi.json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("/minio/checkExits"));
        assert!(body.contains("/minio/upload"));
        assert!(body.contains("/minio/merge"));
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let app = test_app();

        let resp = app
            .clone()
            .oneshot(get_request("/minio/checkExits?md5=abc123&fileSuffix=.png"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "false");

        for (index, data) in [("1", b"aaaa"), ("2", b"bbbb")] {
            let resp = app
                .clone()
                .oneshot(upload_request("abc123", index, data))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_string(resp).await, "true");
        }

        let resp = app
            .clone()
            .oneshot(merge_request("md5=abc123&chunkTotal=3&fileSuffix=.png"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "[miss_chunk][3]");

        let resp = app
            .clone()
            .oneshot(upload_request("abc123", "3", b"cc"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(merge_request("md5=abc123&chunkTotal=3&fileSuffix=.png"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let url = body_string(resp).await;
        assert!(url.starts_with("http://localhost:9013/objects/files/abc123.png?"));

        let resp = app
            .clone()
            .oneshot(get_request("/minio/checkExits?md5=abc123&fileSuffix=.png"))
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "true");

        // The returned link downloads the composed file.
        let path_and_query = url.trim_start_matches("http://localhost:9013");
        let resp = app.oneshot(get_request(path_and_query)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "aaaabbbbcc");
    }

    #[tokio::test]
    async fn test_reupload_is_accepted() {
        let app = test_app();
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(upload_request("d", "1", b"xyz"))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_check_exists_requires_md5() {
        let resp = test_app()
            .oneshot(get_request("/minio/checkExits?fileSuffix=.png"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers().contains_key("x-request-id"));
        let json: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["code"], "InvalidArgument");
    }

    #[tokio::test]
    async fn test_merge_rejects_zero_total() {
        let resp = test_app()
            .oneshot(merge_request("md5=d&chunkTotal=0&fileSuffix=.bin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_merge_with_extra_chunks_conflicts() {
        let app = test_app();
        for index in ["1", "2"] {
            app.clone()
                .oneshot(upload_request("d", index, b"x"))
                .await
                .unwrap();
        }
        let resp = app
            .oneshot(merge_request("md5=d&chunkTotal=1&fileSuffix=.bin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_upload_rejects_index_zero() {
        let resp = test_app()
            .oneshot(upload_request("d", "0", b"x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_chunk() {
        let mut config = Config::default();
        config.server.max_chunk_size = 4;
        let app = app(Arc::new(AppState::with_memory_backend(config)));

        let resp = app
            .oneshot(upload_request("d", "1", b"too large"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_upload_far_over_body_limit_is_payload_too_large() {
        let mut config = Config::default();
        config.server.max_chunk_size = 4;
        let app = app(Arc::new(AppState::with_memory_backend(config)));

        let chunk = vec![b'x'; 200 * 1024];
        let resp = app
            .clone()
            .oneshot(upload_request("d", "1", &chunk))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["code"], "ChunkTooLarge");

        // Nothing was stored, so the merge still reports the chunk missing.
        let resp = app
            .oneshot(merge_request("md5=d&chunkTotal=1&fileSuffix=.bin"))
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "[miss_chunk][1]");
    }

    #[tokio::test]
    async fn test_upload_without_multipart_is_bad_request() {
        let req = Request::builder()
            .method("POST")
            .uri("/minio/upload")
            .body(Body::from("md5=d"))
            .unwrap();
        let resp = test_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_objects_route_rejects_unsigned_request() {
        let app = test_app();
        app.clone()
            .oneshot(upload_request("d", "1", b"x"))
            .await
            .unwrap();
        app.clone()
            .oneshot(merge_request("md5=d&chunkTotal=1&fileSuffix=.bin"))
            .await
            .unwrap();

        let resp = app
            .oneshot(get_request("/objects/files/d.bin"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_cors_preflight_allowed() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/minio/merge")
            .header("origin", "https://app.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let resp = test_app().oneshot(req).await.unwrap();
        assert!(resp
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_health_can_be_disabled() {
        let mut config = Config::default();
        config.observability.health_check = false;
        let app = app(Arc::new(AppState::with_memory_backend(config)));
        let resp = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
