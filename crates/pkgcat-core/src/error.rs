//! Error types and result aliases for pkgcat.
//!
//! This module defines the shared error types used across all pkgcat components.
//! Errors are structured so callers can tell apart failures that are local to a
//! single package or channel (absorbed during a refresh) from failures that stop
//! all progress for a catalog source (propagated to the lifecycle handler).

use crate::source::{CacheKey, SourceKey};

/// The result type used throughout pkgcat.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pkgcat operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A connection to a catalog source could not be opened or broke mid-call.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The remote registry answered with an error.
    #[error("registry error ({status}): {message}")]
    Registry {
        /// Status code reported by the registry (HTTP status or 0 if unknown).
        status: u16,
        /// Description of the registry failure.
        message: String,
    },

    /// A payload returned by the registry could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    /// Every declared channel of a package was elided during the build.
    #[error("no valid channels for package {package}")]
    NoValidChannels {
        /// The package that could not be built.
        package: String,
    },

    /// The catalog source has a type this engine does not aggregate.
    #[error("unsupported source type {source_type:?} for catalog source {source_key}")]
    UnsupportedSourceType {
        /// The catalog source that was refused.
        source_key: SourceKey,
        /// The type discriminator reported by the source.
        source_type: String,
    },

    /// No live connection exists for the catalog source.
    #[error("catalog source {source_key} is not connected")]
    NotConnected {
        /// The catalog source without a connection.
        source_key: SourceKey,
    },

    /// The cache and its source index disagree about an entry.
    #[error("cache inconsistency for {key}")]
    CacheInconsistent {
        /// The entry whose bookkeeping was inconsistent.
        key: CacheKey,
    },

    /// One or more garbage-collection deletions failed.
    #[error("garbage collection for {source_key} failed for {} entries: {}", .failures.len(), .failures.join("; "))]
    GcFailed {
        /// The catalog source whose entries were being collected.
        source_key: SourceKey,
        /// One message per failed deletion.
        failures: Vec<String>,
    },

    /// A label selector could not be parsed.
    #[error("invalid label selector {selector:?}: {message}")]
    InvalidSelector {
        /// The selector text as given.
        selector: String,
        /// What made it invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new connection error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new connection error with a source cause.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new registry error.
    #[must_use]
    pub fn registry(status: u16, message: impl Into<String>) -> Self {
        Self::Registry {
            status,
            message: message.into(),
        }
    }

    /// Creates a new decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the error is a transport-level failure.
    ///
    /// Transport failures end a package listing early instead of failing it.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}
