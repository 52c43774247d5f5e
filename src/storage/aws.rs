//! S3 storage backend (AWS S3 or any S3-compatible store such as MinIO).
//!
//! Key mapping: every storage key is stored as `{prefix}{key}` in a
//! single upstream bucket.
//!
//! Compose has no native S3 call; it is a multipart upload planned from
//! the source sizes.  Runs of sources that reach the S3 minimum part size
//! are copied server-side with `upload_part_copy`.  Smaller sources are
//! gathered with ranged reads into parts of exactly that minimum and sent
//! with `upload_part`, so at most one part is held in memory at a time.
//!
//! Credentials are resolved via the standard AWS credential chain unless
//! explicit keys are configured.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{ObjectEntry, ObjectReader, ObjectStore, StoreError, StoreFuture};
use crate::signing::s3_uri_encode;

/// S3 minimum size for every part of a multipart upload except the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 maximum number of parts in one multipart upload.
const MAX_PARTS: usize = 10_000;

/// S3 maximum size of one `upload_part_copy`.
const MAX_COPY_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Bytes `[start, end)` of the compose source at `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    source: usize,
    start: u64,
    end: u64,
}

impl Span {
    fn len(&self) -> u64 {
        self.end - self.start
    }

    /// `Range` / `x-amz-copy-source-range` value.
    fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// One part of the destination multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PartPlan {
    /// Copied server-side.
    Copy(Span),
    /// Read back and uploaded; never more than `MIN_PART_SIZE` bytes.
    Upload(Vec<Span>),
}

/// Object store backed by one S3 bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
    /// Key prefix for all objects in the upstream bucket.
    prefix: String,
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// Loads AWS credentials from the default credential chain unless
    /// `access_key_id`/`secret_access_key` are both given.
    pub async fn new(
        bucket: String,
        region: String,
        prefix: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "chunkyard-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);
        let client = Client::from_conf(s3_config.build());

        info!("S3 backend initialized: bucket={} prefix='{}'", bucket, prefix);

        Ok(Self::with_client(client, bucket, prefix))
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Map a storage key to an upstream S3 key.
    fn s3_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Map an upstream S3 key back to a storage key.
    fn storage_key<'a>(&self, s3_key: &'a str) -> &'a str {
        s3_key.strip_prefix(self.prefix.as_str()).unwrap_or(s3_key)
    }

    /// `x-amz-copy-source` value for a storage key.
    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, s3_uri_encode(&self.s3_key(key), false))
    }

    /// Size of every source, in order.  Fails with `NotFound` on the first
    /// missing source.
    async fn source_sizes(&self, sources: &[String]) -> Result<Vec<u64>, StoreError> {
        let mut sizes = Vec::with_capacity(sources.len());
        for source in sources {
            let head = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(self.s3_key(source))
                .send()
                .await
                .map_err(|e| classify_sdk_error("head_object", source, e))?;
            sizes.push(head.content_length().unwrap_or(0).max(0) as u64);
        }
        Ok(sizes)
    }

    /// Read `span` of its source.
    async fn read_span(&self, sources: &[String], span: Span) -> Result<Bytes, StoreError> {
        let source = &sources[span.source];
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.s3_key(source))
            .range(span.range_header())
            .send()
            .await
            .map_err(|e| classify_sdk_error("get_object", source, e))?;
        let body = resp.body.collect().await.map_err(|e| {
            StoreError::Transient(anyhow::anyhow!("S3 get_object {source}: {e}"))
        })?;
        Ok(body.into_bytes())
    }

    /// Compose `dest` as a multipart upload following `plan`.
    async fn compose_multipart(
        &self,
        dest: &str,
        sources: &[String],
        plan: &[PartPlan],
    ) -> Result<String, StoreError> {
        let dest_key = self.s3_key(dest);

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&dest_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", dest, e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StoreError::Permanent(anyhow::anyhow!("S3 did not return upload ID")))?
            .to_string();

        let result = self.write_parts(&dest_key, &upload_id, sources, plan).await;

        match result {
            Ok(etag) => Ok(etag),
            Err(e) => {
                warn!(
                    "Aborting S3 multipart upload {} due to error: {}",
                    upload_id, e
                );
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&dest_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort S3 multipart upload: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_parts(
        &self,
        dest_key: &str,
        upload_id: &str,
        sources: &[String],
        plan: &[PartPlan],
    ) -> Result<String, StoreError> {
        let mut completed_parts = Vec::with_capacity(plan.len());

        for (idx, part) in plan.iter().enumerate() {
            let part_number = (idx + 1) as i32;
            let etag = match part {
                PartPlan::Copy(span) => {
                    let source = &sources[span.source];
                    let copy = self
                        .client
                        .upload_part_copy()
                        .bucket(&self.bucket)
                        .key(dest_key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .copy_source(self.copy_source(source))
                        .copy_source_range(span.range_header())
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("upload_part_copy", source, e))?;
                    copy.copy_part_result()
                        .and_then(|r| r.e_tag())
                        .unwrap_or("")
                        .to_string()
                }
                PartPlan::Upload(spans) => {
                    let mut buf = Vec::with_capacity(MIN_PART_SIZE as usize);
                    for span in spans {
                        buf.extend_from_slice(&self.read_span(sources, *span).await?);
                    }
                    let len = buf.len() as i64;
                    let upload = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(dest_key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .content_length(len)
                        .body(ByteStream::from(buf))
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("upload_part", dest_key, e))?;
                    upload.e_tag().unwrap_or("").to_string()
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(etag)
                    .part_number(part_number)
                    .build(),
            );
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(dest_key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", dest_key, e))?;

        Ok(resp.e_tag().unwrap_or("").to_string())
    }
}

/// Lay out the parts of a compose over sources of the given sizes.
///
/// Every part but the last is at least `MIN_PART_SIZE`.  A source that
/// can stand alone as a part is copied; shorter runs are topped up from
/// the head of the next source until they reach the minimum.  Empty
/// sources contribute nothing, so an all-empty compose has no parts.
fn plan_parts(sizes: &[u64]) -> Vec<PartPlan> {
    let mut parts = Vec::new();
    let mut pending: Vec<Span> = Vec::new();
    let mut pending_len = 0;

    for (source, &size) in sizes.iter().enumerate() {
        let mut start = 0;
        if pending_len > 0 {
            let take = (MIN_PART_SIZE - pending_len).min(size);
            if take > 0 {
                pending.push(Span {
                    source,
                    start: 0,
                    end: take,
                });
                pending_len += take;
                start = take;
            }
            if pending_len < MIN_PART_SIZE {
                continue;
            }
            parts.push(PartPlan::Upload(std::mem::take(&mut pending)));
            pending_len = 0;
        }

        let rest = Span {
            source,
            start,
            end: size,
        };
        if rest.len() >= MIN_PART_SIZE {
            push_copies(&mut parts, rest);
        } else if rest.len() > 0 {
            pending_len = rest.len();
            pending.push(rest);
        }
    }

    // The last part may be short, so a lone leftover span is copied.
    match pending.as_slice() {
        [] => {}
        [only] => parts.push(PartPlan::Copy(*only)),
        _ => parts.push(PartPlan::Upload(pending)),
    }
    parts
}

/// Copy `span` (at least `MIN_PART_SIZE`) in pieces S3 accepts.
fn push_copies(parts: &mut Vec<PartPlan>, mut span: Span) {
    while span.len() > MAX_COPY_PART_SIZE {
        // Leave a remainder that is still a valid part.
        let piece = if span.len() - MAX_COPY_PART_SIZE >= MIN_PART_SIZE {
            MAX_COPY_PART_SIZE
        } else {
            span.len() - MIN_PART_SIZE
        };
        parts.push(PartPlan::Copy(Span {
            end: span.start + piece,
            ..span
        }));
        span.start += piece;
    }
    parts.push(PartPlan::Copy(span));
}

/// Map an SDK error to a [`StoreError`].
///
/// 404s become `NotFound`; timeouts, dispatch failures, throttling and
/// 5xx responses become `Transient`; everything else is `Permanent`.
fn classify_sdk_error<E>(context: &str, key: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status == 404 || matches!(ctx.err().code(), Some("NoSuchKey" | "NotFound")) {
                return StoreError::NotFound {
                    key: key.to_string(),
                };
            }
            status >= 500
                || status == 429
                || matches!(ctx.err().code(), Some("SlowDown" | "RequestTimeout"))
        }
        _ => false,
    };

    let err = anyhow::anyhow!("S3 {context} {key}: {}", DisplayErrorContext(&err));
    if transient {
        StoreError::Transient(err)
    } else {
        StoreError::Permanent(err)
    }
}

impl ObjectStore for S3Backend {
    fn get(&self, key: &str) -> StoreFuture<'_, ObjectReader> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);
            debug!("S3 get_object: bucket={} key={}", self.bucket, s3_key);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| classify_sdk_error("get_object", &key, e))?;

            let size = resp.content_length().unwrap_or(0).max(0) as u64;
            Ok(ObjectReader::new(key, size, resp.body.into_async_read()))
        })
    }

    fn put(&self, key: &str, data: Bytes) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);
            debug!(
                "S3 put_object: bucket={} key={} bytes={}",
                self.bucket,
                s3_key,
                data.len()
            );

            let len = data.len() as i64;
            let resp = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .content_length(len)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| classify_sdk_error("put_object", &key, e))?;

            Ok(resp.e_tag().unwrap_or("").to_string())
        })
    }

    fn list(&self, prefix: &str) -> StoreFuture<'_, Vec<ObjectEntry>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let s3_prefix = self.s3_key(&prefix);
            debug!("S3 list_objects_v2: bucket={} prefix={}", self.bucket, s3_prefix);

            let mut entries = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&s3_prefix);

                if let Some(ref token) = continuation_token {
                    req = req.continuation_token(token);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error("list_objects_v2", &prefix, e))?;

                for obj in resp.contents() {
                    if let Some(k) = obj.key() {
                        entries.push(ObjectEntry {
                            key: self.storage_key(k).to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                        });
                    }
                }

                match (resp.is_truncated(), resp.next_continuation_token()) {
                    (Some(true), Some(token)) => continuation_token = Some(token.to_string()),
                    _ => break,
                }
            }

            Ok(entries)
        })
    }

    fn compose(&self, dest: &str, sources: &[String]) -> StoreFuture<'_, String> {
        let dest = dest.to_string();
        let sources = sources.to_vec();
        Box::pin(async move {
            debug!(
                "S3 compose: bucket={} dest={} sources={}",
                self.bucket,
                self.s3_key(&dest),
                sources.len()
            );

            if sources.is_empty() {
                return Err(StoreError::Permanent(anyhow::anyhow!(
                    "compose of {dest} needs at least one source"
                )));
            }

            if let [only] = sources.as_slice() {
                let resp = self
                    .client
                    .copy_object()
                    .bucket(&self.bucket)
                    .key(self.s3_key(&dest))
                    .copy_source(self.copy_source(only))
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error("copy_object", only, e))?;
                return Ok(resp
                    .copy_object_result()
                    .and_then(|r| r.e_tag())
                    .unwrap_or("")
                    .to_string());
            }

            let sizes = self.source_sizes(&sources).await?;
            let plan = plan_parts(&sizes);
            if plan.is_empty() {
                return self.put(&dest, Bytes::new()).await;
            }
            if plan.len() > MAX_PARTS {
                return Err(StoreError::Permanent(anyhow::anyhow!(
                    "compose of {dest} needs {} parts, S3 allows {MAX_PARTS}",
                    plan.len()
                )));
            }
            debug!("S3 compose of {} in {} parts", dest, plan.len());
            self.compose_multipart(&dest, &sources, &plan).await
        })
    }

    fn presigned_url(&self, key: &str, expiry: Duration) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let config = PresigningConfig::expires_in(expiry)
                .map_err(|e| StoreError::Permanent(anyhow::anyhow!("presigning config: {e}")))?;

            let req = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(self.s3_key(&key))
                .presigned(config)
                .await
                .map_err(|e| classify_sdk_error("presign get_object", &key, e))?;

            Ok(req.uri().to_string())
        })
    }
}

// -- Tests -------------------------------------------------------------------
