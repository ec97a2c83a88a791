//! Catalog-source discovery from a sources file.
//!
//! The sources file is a JSON array of catalog sources:
//!
//! ```json
//! [
//!   {
//!     "namespace": "openshift-marketplace",
//!     "name": "community-operators",
//!     "sourceType": "grpc",
//!     "address": "community-operators.openshift-marketplace.svc:50051",
//!     "displayName": "Community Operators",
//!     "publisher": "Red Hat"
//!   }
//! ]
//! ```
//!
//! [`SourceDiscovery`] polls the file and turns every difference from the
//! previous snapshot into a lifecycle event. Unchanged sources are re-announced
//! as updates on every poll so their caches are refreshed periodically. A file
//! that cannot be read or parsed is skipped and the previous snapshot kept.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pkgcat_core::{CatalogSource, Error, Result, SourceEvent, SourceKey};

type Snapshot = BTreeMap<SourceKey, CatalogSource>;

/// Parses a sources document. Later duplicates of a key replace earlier ones.
///
/// # Errors
///
/// Returns a decode error if `json` is not an array of catalog sources.
pub fn parse_sources(json: &str) -> Result<Snapshot> {
    let sources: Vec<CatalogSource> = serde_json::from_str(json)?;
    let mut snapshot = Snapshot::new();
    for source in sources {
        if let Some(previous) = snapshot.insert(source.key.clone(), source) {
            tracing::warn!(source = %previous.key, "duplicate catalog source entry; last one wins");
        }
    }
    Ok(snapshot)
}

/// Returns the events leading from `previous` to `next`.
///
/// Sources only in `next` are added, sources in both are updated, and sources
/// only in `previous` are deleted.
#[must_use]
pub fn diff(previous: &Snapshot, next: &Snapshot) -> Vec<SourceEvent> {
    let mut events: Vec<SourceEvent> = previous
        .keys()
        .filter(|key| !next.contains_key(*key))
        .map(|key| SourceEvent::Deleted(key.clone()))
        .collect();
    events.extend(next.iter().map(|(key, source)| {
        if previous.contains_key(key) {
            SourceEvent::Updated(source.clone())
        } else {
            SourceEvent::Added(source.clone())
        }
    }));
    events
}

/// Polls a sources file and emits lifecycle events.
#[derive(Debug)]
pub struct SourceDiscovery {
    path: PathBuf,
    interval: Duration,
    snapshot: Snapshot,
}

impl SourceDiscovery {
    /// Creates a discovery over `path` polling every `interval`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            snapshot: Snapshot::new(),
        }
    }

    /// Returns the sources file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file once and returns the events since the last poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed; the snapshot is
    /// then unchanged.
    pub async fn poll_once(&mut self) -> Result<Vec<SourceEvent>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::InvalidInput(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let next = parse_sources(&contents)?;
        let events = diff(&self.snapshot, &next);
        self.snapshot = next;
        Ok(events)
    }

    /// Polls until `shutdown` is cancelled or the event receiver is dropped.
    ///
    /// `ready` is set once the first poll delivered its events.
    pub async fn run(
        mut self,
        events: mpsc::Sender<SourceEvent>,
        ready: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(batch) => {
                    tracing::debug!(
                        path = %self.path.display(),
                        events = batch.len(),
                        "sources polled"
                    );
                    for event in batch {
                        if events.send(event).await.is_err() {
                            tracing::info!("synchronizer gone; discovery stopped");
                            return;
                        }
                    }
                    if !ready.swap(true, Ordering::AcqRel) {
                        tracing::info!(sources = self.snapshot.len(), "initial discovery complete");
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to load sources; keeping previous snapshot"
                    );
                }
            }
        }
        tracing::info!("discovery stopped");
    }
}
