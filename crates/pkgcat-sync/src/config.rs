//! Synchronizer configuration.

use std::time::Duration;

use pkgcat_core::env::{env_list, env_secs, env_string};
use pkgcat_core::source::SOURCE_TYPE_GRPC;
use pkgcat_core::{Error, Result};

/// Namespace whose catalog is visible from every namespace by default.
pub const DEFAULT_GLOBAL_NAMESPACE: &str = "openshift-marketplace";

/// Runtime configuration of the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Namespace whose manifests are listed for every namespace.
    pub global_namespace: String,
    /// Deadline of one refresh cycle.
    pub refresh_timeout: Duration,
    /// Interval between connectivity probes of one connection.
    pub probe_interval: Duration,
    /// Per-request timeout of registry clients.
    pub dial_timeout: Duration,
    /// Source types this engine refreshes. Others are refused.
    pub supported_source_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            global_namespace: DEFAULT_GLOBAL_NAMESPACE.to_string(),
            refresh_timeout: Duration::from_secs(5 * 60),
            probe_interval: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            supported_source_types: vec![SOURCE_TYPE_GRPC.to_string()],
        }
    }
}

impl SyncConfig {
    /// Loads configuration from environment variables, starting from defaults.
    ///
    /// Supported variables:
    /// - `PKGCAT_GLOBAL_NAMESPACE`
    /// - `PKGCAT_REFRESH_TIMEOUT_SECS`
    /// - `PKGCAT_PROBE_INTERVAL_SECS`
    /// - `PKGCAT_DIAL_TIMEOUT_SECS`
    /// - `PKGCAT_SUPPORTED_SOURCE_TYPES` (comma-separated)
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(namespace) = env_string("PKGCAT_GLOBAL_NAMESPACE") {
            config.global_namespace = namespace;
        }
        if let Some(timeout) = env_secs("PKGCAT_REFRESH_TIMEOUT_SECS")? {
            config.refresh_timeout = timeout;
        }
        if let Some(interval) = env_secs("PKGCAT_PROBE_INTERVAL_SECS")? {
            config.probe_interval = interval;
        }
        if let Some(timeout) = env_secs("PKGCAT_DIAL_TIMEOUT_SECS")? {
            config.dial_timeout = timeout;
        }
        if let Some(types) = env_list("PKGCAT_SUPPORTED_SOURCE_TYPES") {
            config.supported_source_types = types;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that individual fields cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.global_namespace.trim().is_empty() {
            return Err(Error::InvalidInput(
                "global namespace must not be empty".to_string(),
            ));
        }
        if self.supported_source_types.is_empty() {
            return Err(Error::InvalidInput(
                "at least one source type must be supported".to_string(),
            ));
        }
        for (name, value) in [
            ("refresh timeout", self.refresh_timeout),
            ("probe interval", self.probe_interval),
            ("dial timeout", self.dial_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidInput(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Returns true if sources of `source_type` are refreshed by this engine.
    #[must_use]
    pub fn supports(&self, source_type: &str) -> bool {
        self.supported_source_types.iter().any(|t| t == source_type)
    }
}
