//! Observability infrastructure for pkgcat.
//!
//! Structured logging with consistent spans: every operation scoped to one
//! catalog source runs inside a [`source_span`], so log lines emitted by
//! concurrent refresh cycles can be told apart.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::source::SourceKey;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `pkgcat_sync=debug`)
///
/// # Example
///
/// ```rust
/// use pkgcat_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Initializes test logging. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pkgcat=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Creates a span for an operation scoped to one catalog source.
///
/// # Example
///
/// ```rust
/// use pkgcat_core::SourceKey;
/// use pkgcat_core::observability::source_span;
///
/// let key = SourceKey::new("olm", "community");
/// let span = source_span("refresh", &key);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn source_span(operation: &str, key: &SourceKey) -> Span {
    tracing::info_span!(
        "catalog_source",
        op = operation,
        namespace = %key.namespace,
        name = %key.name,
    )
}
