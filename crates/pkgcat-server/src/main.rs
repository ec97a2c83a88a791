//! # pkgcat-server
//!
//! Package catalog synchronization service.
//!
//! The service discovers catalog sources from a sources file, keeps one
//! monitored connection per source and maintains the in-memory package
//! manifest cache.
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness check (200 once the first discovery pass completed)
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Usage
//!
//! ```bash
//! pkgcat-server serve --port 8080 --sources-file /etc/pkgcat/sources.json
//! ```
//!
//! Synchronizer settings are read from `PKGCAT_*` environment variables
//! (see `SyncConfig::from_env`).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod discovery;
mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pkgcat_core::observability::{LogFormat, init_logging};
use pkgcat_sync::registry::http::HttpDialer;
use pkgcat_sync::{SyncConfig, Synchronizer};

use crate::discovery::SourceDiscovery;

// ============================================================================
// CLI Arguments
// ============================================================================

const EVENT_BUFFER: usize = 256;

/// pkgcat synchronization service.
#[derive(Debug, Parser)]
#[command(name = "pkgcat-server")]
#[command(about = "Aggregates package manifests from remote catalog sources")]
#[command(version)]
struct Args {
    /// Emit human readable logs instead of JSON.
    #[arg(long, env = "PKGCAT_DEBUG", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the synchronizer with health endpoints.
    Serve {
        /// HTTP port for health and metrics endpoints.
        #[arg(long, env = "PKGCAT_PORT", default_value = "8080")]
        port: u16,

        /// JSON file listing the catalog sources to synchronize.
        #[arg(long, env = "PKGCAT_SOURCES_FILE")]
        sources_file: PathBuf,

        /// Interval between sources file polls in seconds.
        #[arg(long, env = "PKGCAT_POLL_INTERVAL_SECS", default_value = "30")]
        poll_interval_secs: u64,
    },
}

// ============================================================================
// Service State
// ============================================================================

struct ServiceState {
    discovered: Arc<AtomicBool>,
    sync: Arc<Synchronizer>,
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    connections: usize,
    cached_manifests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Readiness check.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let ready = state.discovered.load(Ordering::Acquire);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            connections: state.sync.connections().len(),
            cached_manifests: state.sync.cache().len(),
            message: (!ready).then(|| "Waiting for first discovery pass".to_string()),
        }),
    )
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    match args.command {
        Commands::Serve {
            port,
            sources_file,
            poll_interval_secs,
        } => serve(port, sources_file, poll_interval_secs).await,
    }
}

async fn serve(port: u16, sources_file: PathBuf, poll_interval_secs: u64) -> Result<()> {
    if poll_interval_secs == 0 {
        anyhow::bail!("PKGCAT_POLL_INTERVAL_SECS must be greater than 0");
    }
    let config = SyncConfig::from_env()?;
    metrics::init_metrics()?;

    tracing::info!(
        port = port,
        poll_interval_secs = poll_interval_secs,
        global_namespace = %config.global_namespace,
        refresh_timeout_secs = config.refresh_timeout.as_secs(),
        "Starting pkgcat server"
    );

    let dialer = HttpDialer::new(config.dial_timeout, config.dial_timeout);
    let sync = Arc::new(Synchronizer::new(config, Arc::new(dialer)));
    let shutdown = CancellationToken::new();
    let discovered = Arc::new(AtomicBool::new(false));

    let (events, rx) = mpsc::channel(EVENT_BUFFER);
    let control = tokio::spawn(Arc::clone(&sync).run(rx, shutdown.clone()));

    let discovery = SourceDiscovery::new(sources_file, Duration::from_secs(poll_interval_secs));
    tracing::info!(path = %discovery.path().display(), "Watching sources file");
    let discovery = tokio::spawn(discovery.run(events, Arc::clone(&discovered), shutdown.clone()));

    let state = Arc::new(ServiceState {
        discovered,
        sync: Arc::clone(&sync),
    });
    let router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(address = %addr, "Starting health server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    discovery.await?;
    control.await??;
    tracing::info!("pkgcat server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or when `shutdown` is cancelled elsewhere, then cancels it.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
