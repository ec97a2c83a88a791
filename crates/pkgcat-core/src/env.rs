//! Environment variable helpers for configuration loading.
//!
//! Blank values are treated as unset. Values that are present but malformed
//! yield [`Error::InvalidInput`] naming the offending variable.

use std::time::Duration;

use crate::error::{Error, Result};

/// Reads a trimmed, non-empty string variable.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| non_blank(&v))
}

/// Reads a non-zero duration expressed in whole seconds.
///
/// # Errors
///
/// Returns an error if the variable is set but is not a positive integer.
pub fn env_secs(name: &str) -> Result<Option<Duration>> {
    parse_secs(name, env_string(name).as_deref())
}

/// Splits a comma-separated list variable, dropping blank items.
#[must_use]
pub fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| v.split(',').filter_map(non_blank).collect())
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_u64(name: &str, value: Option<&str>) -> Result<Option<u64>> {
    let Some(v) = value else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn parse_secs(name: &str, value: Option<&str>) -> Result<Option<Duration>> {
    match parse_u64(name, value)? {
        None => Ok(None),
        Some(0) => Err(Error::InvalidInput(format!(
            "{name} must be greater than 0"
        ))),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
    }
}
