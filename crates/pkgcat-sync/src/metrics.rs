//! Synchronization metrics.
//!
//! Provides metrics for refresh cycles, manifest builds, garbage collection and
//! connection state. These complement the structured logging already in place.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Refresh Metrics
// ============================================================================

/// Refresh cycle counter, labelled by outcome.
pub const REFRESH_TOTAL: &str = "pkgcat_refresh_total";

/// Refresh cycle duration histogram.
pub const REFRESH_DURATION: &str = "pkgcat_refresh_duration_seconds";

/// Manifests built counter.
pub const PACKAGES_BUILT: &str = "pkgcat_packages_built_total";

/// Package build failure counter.
pub const PACKAGE_BUILD_FAILURES: &str = "pkgcat_package_build_failures_total";

/// Elided channel counter.
pub const CHANNELS_ELIDED: &str = "pkgcat_channels_elided_total";

// ============================================================================
// GC Metrics
// ============================================================================

/// GC deleted entries counter.
pub const GC_ENTRIES_DELETED: &str = "pkgcat_gc_entries_deleted_total";

/// GC errors counter.
pub const GC_ERRORS: &str = "pkgcat_gc_errors_total";

/// Cached manifests gauge.
pub const CACHED_MANIFESTS: &str = "pkgcat_cached_manifests";

// ============================================================================
// Connection Metrics
// ============================================================================

/// Connection state transition counter, labelled by new state.
pub const CONNECTION_TRANSITIONS: &str = "pkgcat_connection_transitions_total";

/// Dial failure counter.
pub const DIAL_FAILURES: &str = "pkgcat_dial_failures_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all synchronization metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(REFRESH_TOTAL, "Total refresh cycles by outcome");
    describe_histogram!(REFRESH_DURATION, "Duration of refresh cycles in seconds");
    describe_counter!(PACKAGES_BUILT, "Total package manifests built");
    describe_counter!(PACKAGE_BUILD_FAILURES, "Total package manifest build failures");
    describe_counter!(CHANNELS_ELIDED, "Total channels elided from manifests");
    describe_counter!(GC_ENTRIES_DELETED, "Total cache entries deleted by GC");
    describe_counter!(GC_ERRORS, "Total GC deletion errors");
    describe_gauge!(CACHED_MANIFESTS, "Manifests currently cached");
    describe_counter!(CONNECTION_TRANSITIONS, "Total connection state transitions");
    describe_counter!(DIAL_FAILURES, "Total catalog source dial failures");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a finished refresh cycle.
pub fn record_refresh(outcome: &'static str, built: u64, failed: u64, duration_secs: f64) {
    counter!(REFRESH_TOTAL, "outcome" => outcome).increment(1);
    counter!(PACKAGES_BUILT).increment(built);
    counter!(PACKAGE_BUILD_FAILURES).increment(failed);
    histogram!(REFRESH_DURATION).record(duration_secs);
}

/// Records an elided channel.
pub fn record_channel_elided() {
    counter!(CHANNELS_ELIDED).increment(1);
}

/// Records a GC run.
pub fn record_gc(deleted: u64, errors: u64) {
    counter!(GC_ENTRIES_DELETED).increment(deleted);
    if errors > 0 {
        counter!(GC_ERRORS).increment(errors);
    }
}

/// Records the current cache size.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_manifests(count: usize) {
    gauge!(CACHED_MANIFESTS).set(count as f64);
}

/// Records a connection state transition.
pub fn record_transition(state: &'static str) {
    counter!(CONNECTION_TRANSITIONS, "state" => state).increment(1);
}

/// Records a dial failure.
pub fn record_dial_failure() {
    counter!(DIAL_FAILURES).increment(1);
}
