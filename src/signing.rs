//! AWS Signature Version 4 query-string presigning.
//!
//! Issues and verifies presigned GET URLs of the form
//! `{base}/objects/{key}?X-Amz-Algorithm=AWS4-HMAC-SHA256&...` for
//! backends that cannot presign on their own (the in-memory store).
//!
//! The algorithm follows the AWS SigV4 specification:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute and compare the signature

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum presigned URL expiration (7 days).
pub const MAX_PRESIGNED_EXPIRES: u64 = 604_800;

/// Path prefix under which presigned objects are served.
pub const OBJECTS_PATH: &str = "/objects/";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Key material used to sign and verify URLs.
#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Reasons a presigned request is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("malformed presigned request: {0}")]
    Malformed(String),

    #[error("request has expired")]
    Expired,

    #[error("unknown access key: {0}")]
    UnknownAccessKey(String),

    #[error("signature does not match")]
    SignatureDoesNotMatch,
}

/// Parsed components from presigned URL query parameters.
#[derive(Debug, Clone)]
struct ParsedPresigned {
    access_key_id: String,
    date_stamp: String,
    region: String,
    service: String,
    credential_scope: String,
    signed_headers: String,
    signature: String,
    amz_date: String,
    expires: u64,
}

// ── Issuing ─────────────────────────────────────────────────────────

/// Build a presigned GET URL for `key` below `base_url`.
///
/// `expiry` is capped at [`MAX_PRESIGNED_EXPIRES`].
pub fn presign_get_url(
    base_url: &str,
    key: &str,
    creds: &SigningCredentials,
    now: DateTime<Utc>,
    expiry: Duration,
) -> Result<String, PresignError> {
    let base = base_url.trim_end_matches('/');
    let uri: http::Uri = base
        .parse()
        .map_err(|e| PresignError::Malformed(format!("invalid base url {base}: {e}")))?;
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| PresignError::Malformed(format!("base url has no host: {base}")))?;
    let base_path = uri.path().trim_end_matches('/');

    let expires = expiry.as_secs().clamp(1, MAX_PRESIGNED_EXPIRES);
    let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
    let date_stamp = &amz_date[..8];
    let credential_scope = format!("{date_stamp}/{}/{SERVICE}/aws4_request", creds.region);

    // The key is raw text, so it is encoded as-is; only the base path
    // arrives already encoded.
    let key_path = s3_uri_encode(&format!("{OBJECTS_PATH}{key}"), false);
    let path = match base_path {
        "" => key_path,
        base => format!("{}{key_path}", s3_uri_encode_path(base).trim_end_matches('/')),
    };

    let query = [
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{credential_scope}", creds.access_key),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", expires.to_string()),
        ("X-Amz-SignedHeaders", "host".to_string()),
    ]
    .iter()
    .map(|(k, v)| format!("{}={}", s3_uri_encode(k, true), s3_uri_encode(v, true)))
    .collect::<Vec<_>>()
    .join("&");

    let headers = vec![("host".to_string(), host.clone())];
    let canonical_request =
        build_canonical_request("GET", &path, &query, &headers, "host", UNSIGNED_PAYLOAD);
    let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
    let signing_key = derive_signing_key(&creds.secret_key, date_stamp, &creds.region, SERVICE);
    let signature = compute_signature(&signing_key, &string_to_sign);

    Ok(format!(
        "{}://{host}{path}?{query}&X-Amz-Signature={signature}",
        uri.scheme_str().unwrap_or("http")
    ))
}

// ── Verification ────────────────────────────────────────────────────

/// Verify a presigned request.
///
/// `path` and `query_string` are the raw (still percent-encoded) request
/// path and query; `host` is the request's `Host` header.
pub fn verify_presigned(
    method: &str,
    path: &str,
    query_string: &str,
    host: &str,
    creds: &SigningCredentials,
    now: DateTime<Utc>,
) -> Result<(), PresignError> {
    let params = parse_query_string(query_string);
    let parsed = parse_presigned_params(&params)?;

    if parsed.access_key_id != creds.access_key {
        return Err(PresignError::UnknownAccessKey(parsed.access_key_id));
    }

    let signed_at = parse_amz_date(&parsed.amz_date)
        .ok_or_else(|| PresignError::Malformed(format!("bad X-Amz-Date {}", parsed.amz_date)))?;
    if now.timestamp() > signed_at + parsed.expires as i64 {
        return Err(PresignError::Expired);
    }

    let headers = vec![("host".to_string(), host.to_string())];
    let canonical_request = build_canonical_request(
        method,
        &s3_uri_encode_path(path),
        query_string,
        &headers,
        &parsed.signed_headers,
        UNSIGNED_PAYLOAD,
    );
    let string_to_sign =
        build_string_to_sign(&parsed.amz_date, &parsed.credential_scope, &canonical_request);
    let signing_key = derive_signing_key(
        &creds.secret_key,
        &parsed.date_stamp,
        &parsed.region,
        &parsed.service,
    );

    let computed = compute_signature(&signing_key, &string_to_sign);
    if constant_time_eq(&computed, &parsed.signature) {
        Ok(())
    } else {
        Err(PresignError::SignatureDoesNotMatch)
    }
}

/// Parse presigned URL query parameters.
fn parse_presigned_params(
    params: &BTreeMap<String, String>,
) -> Result<ParsedPresigned, PresignError> {
    let get = |name: &str| {
        params
            .get(name)
            .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned())
            .ok_or_else(|| PresignError::Malformed(format!("missing {name}")))
    };

    let algorithm = get("X-Amz-Algorithm")?;
    if algorithm != ALGORITHM {
        return Err(PresignError::Malformed(format!(
            "unsupported algorithm {algorithm}"
        )));
    }

    let credential = get("X-Amz-Credential")?;
    let parts: Vec<&str> = credential.splitn(5, '/').collect();
    if parts.len() != 5 || parts[4] != "aws4_request" {
        return Err(PresignError::Malformed(format!(
            "bad credential {credential}"
        )));
    }

    let expires: u64 = get("X-Amz-Expires")?
        .parse()
        .map_err(|_| PresignError::Malformed("X-Amz-Expires is not a number".to_string()))?;
    if expires == 0 || expires > MAX_PRESIGNED_EXPIRES {
        return Err(PresignError::Malformed(format!(
            "X-Amz-Expires out of range: {expires}"
        )));
    }

    Ok(ParsedPresigned {
        access_key_id: parts[0].to_string(),
        date_stamp: parts[1].to_string(),
        region: parts[2].to_string(),
        service: parts[3].to_string(),
        credential_scope: parts[1..].join("/"),
        signed_headers: get("X-Amz-SignedHeaders")?,
        signature: get("X-Amz-Signature")?,
        amz_date: get("X-Amz-Date")?,
        expires,
    })
}

// ── Canonical request ───────────────────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
fn build_canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers_str: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = if uri.is_empty() { "/" } else { uri };
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers_str.split(';') {
        if let Some((hname, hval)) = headers.iter().find(|(n, _)| n == name) {
            canonical_headers.push_str(hname);
            canonical_headers.push(':');
            canonical_headers.push_str(hval.trim());
            canonical_headers.push('\n');
        }
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Build the canonical query string from a raw query string.
///
/// Parameters are decoded, re-encoded with S3 rules, sorted, and joined
/// with `&`.  `X-Amz-Signature` is excluded.
fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| part.split_once('=').unwrap_or((part, "")))
        .filter(|(k, _)| *k != "X-Amz-Signature")
        .map(|(k, v)| {
            let k = percent_decode_str(k).decode_utf8_lossy();
            let v = percent_decode_str(v).decode_utf8_lossy();
            (s3_uri_encode(&k, true), s3_uri_encode(&v, true))
        })
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the string to sign.
fn build_string_to_sign(timestamp: &str, credential_scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

// ── Signing key derivation ──────────────────────────────────────────

/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Compare two signature strings in constant time.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── URI encoding ────────────────────────────────────────────────────

/// S3-compatible URI encoding (RFC 3986 unreserved set).
///
/// If `encode_slash` is false, `/` is left as is (for paths).
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Decode then re-encode each path segment of an already-encoded request
/// path, preserving `/`.
pub fn s3_uri_encode_path(raw_path: &str) -> String {
    if raw_path.is_empty() || raw_path == "/" {
        return "/".to_string();
    }
    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
    let result = decoded
        .split('/')
        .map(|seg| s3_uri_encode(seg, false))
        .collect::<Vec<_>>()
        .join("/");
    if result.starts_with('/') {
        result
    } else {
        format!("/{result}")
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse a raw query string into a BTreeMap without decoding.
fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (k.to_string(), v.to_string())
        })
        .collect()
}

/// Parse an X-Amz-Date string (YYYYMMDDTHHMMSSZ) into a Unix timestamp.
fn parse_amz_date(date: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(date, AMZ_DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

// ── Tests ───────────────────────────────────────────────────────────
