//! chunkyard -- resumable, deduplicated chunked upload server.
//!
//! All upload state lives in the object store, so a restart needs no
//! recovery step.  SIGTERM/SIGINT stop accepting connections and wait for
//! in-flight requests up to `server.shutdown_timeout` seconds.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkyard::config::Config;
use chunkyard::storage::aws::S3Backend;
use chunkyard::storage::backend::ObjectStore;
use chunkyard::AppState;

/// Command-line arguments for the chunkyard server.
#[derive(Parser, Debug)]
#[command(
    name = "chunkyard",
    version,
    about = "Resumable, deduplicated chunked upload server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "chunkyard.example.yaml")]
    config: String,

    /// Override the bind address (host:port); also moves the memory
    /// backend's download links unless `public_url` is set.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = chunkyard::config::load_config(&cli.config)?;
    if let Some(bind) = &cli.bind {
        config.apply_bind(bind)?;
    }
    init_tracing(&config);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = config.bind_addr();

    if config.observability.metrics && chunkyard::metrics::init_metrics().is_some() {
        chunkyard::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let state = build_state(config.clone()).await?;
    let app = chunkyard::server::app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("chunkyard listening on {}", bind_addr);

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let (stopping_tx, stopping_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = stopping_tx.send(());
    });

    // Drain in-flight requests, but not forever.
    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            let _ = stopping_rx.await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!(
                "In-flight requests still running after {}s, exiting",
                shutdown_timeout.as_secs()
            );
        }
    }

    info!("chunkyard shut down");
    Ok(())
}

/// Text or JSON output per `logging.format`; `RUST_LOG` wins over
/// `logging.level`.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_state(config: Config) -> anyhow::Result<AppState> {
    match config.storage.backend.as_str() {
        "s3" => {
            let s3 = config.storage.s3.clone().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 's3' but storage.s3 config section is missing")
            })?;
            let non_empty = |value: String| (!value.is_empty()).then_some(value);
            let backend = S3Backend::new(
                s3.bucket.clone(),
                s3.region.clone(),
                s3.prefix.clone(),
                non_empty(s3.endpoint_url),
                s3.use_path_style,
                non_empty(s3.access_key_id),
                non_empty(s3.secret_access_key),
            )
            .await?;
            info!(
                "S3 storage backend initialized: bucket={} region={} prefix='{}'",
                s3.bucket, s3.region, s3.prefix
            );
            let store: Arc<dyn ObjectStore> = Arc::new(backend);
            Ok(AppState::new(config, store, None))
        }
        _ => {
            info!(
                "Memory storage backend initialized (limit {} bytes, links at {})",
                config.storage.memory.max_size_bytes,
                config.memory_public_url()
            );
            Ok(AppState::with_memory_backend(config))
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
