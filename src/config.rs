//! Configuration loading and types for chunkyard.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! service: networking, object storage, the upload protocol, logging,
//! observability, and CORS.

use anyhow::bail;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::signing::MAX_PRESIGNED_EXPIRES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chunk upload and merge settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Cross-origin settings for browser clients.
    #[serde(default)]
    pub cors: CorsConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Largest accepted chunk in bytes (default 64 MiB, 0 = unlimited).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

/// Room for multipart boundaries and the non-file form fields.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

impl ServerConfig {
    /// Request body limit for chunk uploads, `None` when chunks are unlimited.
    pub fn body_limit(&self) -> Option<u64> {
        match self.max_chunk_size {
            0 => None,
            max => Some(max.saturating_add(MULTIPART_OVERHEAD)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.  Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` endpoint.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// CORS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed origins.  Empty or `["*"]` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: Vec::new(),
        }
    }
}

/// Upload protocol settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Lifetime of the URL returned by a completed merge (default 1 day).
    #[serde(default = "default_url_expiry")]
    pub url_expiry_seconds: u64,

    /// Serialize merges per digest (ingests of that digest wait for the
    /// merge) and chunk writes per chunk key.
    #[serde(default = "default_true")]
    pub serialize_merges: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url_expiry_seconds: default_url_expiry(),
            serialize_merges: true,
        }
    }
}

impl UploadConfig {
    pub fn url_expiry(&self) -> Duration {
        Duration::from_secs(self.url_expiry_seconds)
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory` or `s3`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// S3 / MinIO configuration.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            memory: MemoryStorageConfig::default(),
            s3: None,
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,

    /// Base URL that presigned links point at.  Defaults to
    /// `http://{server.host}:{server.port}` when empty.
    #[serde(default)]
    pub public_url: String,

    /// Key pair used to sign download links.
    #[serde(alias = "access_key_id", default = "default_access_key")]
    pub access_key: String,

    #[serde(alias = "secret_access_key", default = "default_secret_key")]
    pub secret_key: String,

    /// Region placed in the signing scope.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 0,
            public_url: String::new(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            region: default_region(),
        }
    }
}

/// S3 (or S3-compatible, e.g. MinIO) backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Bucket holding chunks and final objects.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix in the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl Config {
    /// Reject combinations that cannot start.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.storage.backend.as_str() {
            "memory" => {}
            "s3" => match &self.storage.s3 {
                None => bail!("storage.backend is 's3' but no storage.s3 section is configured"),
                Some(s3) if s3.bucket.is_empty() => bail!("storage.s3.bucket must not be empty"),
                Some(_) => {}
            },
            other => bail!("unknown storage backend '{other}' (expected 'memory' or 's3')"),
        }

        if self.upload.url_expiry_seconds == 0
            || self.upload.url_expiry_seconds > MAX_PRESIGNED_EXPIRES
        {
            bail!(
                "upload.url_expiry_seconds must be between 1 and {MAX_PRESIGNED_EXPIRES}, got {}",
                self.upload.url_expiry_seconds
            );
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => bail!("unknown logging.format '{other}' (expected 'text' or 'json')"),
        }

        Ok(())
    }

    /// Take the listener address from a `host:port` override so that
    /// links derived from `server.host`/`server.port` follow it.
    pub fn apply_bind(&mut self, bind: &str) -> anyhow::Result<()> {
        let Some((host, port)) = bind.rsplit_once(':') else {
            bail!("bind address '{bind}' must be host:port");
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("bind address '{bind}' has no host");
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("bind address '{bind}' has an invalid port"))?;
        self.server.host = host.to_string();
        self.server.port = port;
        Ok(())
    }

    /// Address the listener binds, `host:port` (IPv6 hosts bracketed).
    pub fn bind_addr(&self) -> String {
        if self.server.host.contains(':') {
            format!("[{}]:{}", self.server.host, self.server.port)
        } else {
            format!("{}:{}", self.server.host, self.server.port)
        }
    }

    /// Base URL for memory-backend presigned links.
    pub fn memory_public_url(&self) -> String {
        if self.storage.memory.public_url.is_empty() {
            let host = match self.server.host.as_str() {
                "0.0.0.0" | "::" => "localhost",
                host => host,
            };
            format!("http://{}:{}", host, self.server.port)
        } else {
            self.storage.memory.public_url.trim_end_matches('/').to_string()
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9013
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    "chunkyard".to_string()
}

fn default_secret_key() -> String {
    "chunkyard-secret".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_url_expiry() -> u64 {
    86_400 // 1 day
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let file = write_config("{}\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9013);
        assert_eq!(config.server.max_chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.upload.url_expiry(), Duration::from_secs(86_400));
        assert!(config.upload.serialize_merges);
        assert!(config.cors.enabled);
        assert!(config.observability.metrics);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_full_s3_config() {
        let file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
  max_chunk_size: 1048576
storage:
  backend: s3
  s3:
    bucket: uploads
    region: eu-west-1
    endpoint_url: http://minio:9000
    use_path_style: true
    access_key_id: minioadmin
    secret_access_key: minioadmin
upload:
  url_expiry_seconds: 3600
  serialize_merges: false
logging:
  level: debug
  format: json
cors:
  allowed_origins: ["https://app.example.com"]
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_chunk_size, 1_048_576);
        let s3 = config.storage.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "uploads");
        assert_eq!(s3.region, "eu-west-1");
        assert!(s3.use_path_style);
        assert_eq!(s3.prefix, "");
        assert_eq!(config.upload.url_expiry_seconds, 3600);
        assert!(!config.upload.serialize_merges);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.cors.allowed_origins, vec!["https://app.example.com"]);
    }

    #[test]
    fn test_s3_backend_requires_section() {
        let file = write_config("storage:\n  backend: s3\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("storage.s3"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let file = write_config("storage:\n  backend: local\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_expiry_over_seven_days_rejected() {
        let file = write_config("upload:\n  url_expiry_seconds: 604801\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config("upload:\n  url_expiry_seconds: 604800\n");
        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn test_memory_public_url() {
        let mut config = Config::default();
        assert_eq!(config.memory_public_url(), "http://localhost:9013");

        config.storage.memory.public_url = "https://files.example.com/".to_string();
        assert_eq!(config.memory_public_url(), "https://files.example.com");
    }

    #[test]
    fn test_bind_override_moves_public_url() {
        let mut config = Config::default();
        config.apply_bind("0.0.0.0:8080").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.memory_public_url(), "http://localhost:8080");

        config.apply_bind("127.0.0.1:9100").unwrap();
        assert_eq!(config.memory_public_url(), "http://127.0.0.1:9100");

        config.apply_bind("[::]:7000").unwrap();
        assert_eq!(config.server.host, "::");
        assert_eq!(config.bind_addr(), "[::]:7000");
        assert_eq!(config.memory_public_url(), "http://localhost:7000");

        // An explicit public_url is left alone.
        config.storage.memory.public_url = "https://files.example.com".to_string();
        config.apply_bind("0.0.0.0:8081").unwrap();
        assert_eq!(config.memory_public_url(), "https://files.example.com");
    }

    #[test]
    fn test_bind_override_rejects_garbage() {
        let mut config = Config::default();
        assert!(config.apply_bind("8080").is_err());
        assert!(config.apply_bind("localhost:http").is_err());
        assert!(config.apply_bind(":8080").is_err());
        assert_eq!(config.server.port, 9013);
    }

    #[test]
    fn test_body_limit() {
        let mut config = Config::default();
        assert_eq!(
            config.server.body_limit(),
            Some(64 * 1024 * 1024 + 64 * 1024)
        );
        config.server.max_chunk_size = 0;
        assert_eq!(config.server.body_limit(), None);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config("/nonexistent/chunkyard.yaml").is_err());
    }
}
