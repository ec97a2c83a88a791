//! Connection management for catalog sources.
//!
//! The [`ConnectionManager`] owns at most one live registry connection per
//! [`SourceKey`]. Every connection has a monitor task that probes the source at
//! a fixed interval and reports state changes to a [`ConnectivityObserver`].
//!
//! ## State machine
//!
//! ```text
//!   Connecting ──► Ready ◄──┐
//!       │            │      │
//!       ▼            ▼      │
//!   TransientFailure ──► Connecting
//!       │            │
//!       └──► Shutdown ◄┘   (terminal)
//! ```
//!
//! A monitor reports its transitions one at a time, in order. Closing a
//! connection (replacement or removal) waits for its monitor to stop, so a
//! closed connection never reports after its successor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pkgcat_core::{Error, Result, SourceKey};

use crate::registry::{RegistryClient, RegistryDialer};

/// Connectivity state of one catalog source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// The connection is being established.
    Connecting,
    /// The source is reachable.
    Ready,
    /// The source is currently unreachable.
    TransientFailure,
    /// The source announced it is going away. Terminal.
    Shutdown,
}

impl ConnectivityState {
    /// Returns the state name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::TransientFailure => "transient_failure",
            Self::Shutdown => "shutdown",
        }
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Ready | Self::TransientFailure)
                | (Self::Ready, Self::TransientFailure | Self::Shutdown)
                | (Self::TransientFailure, Self::Connecting | Self::Shutdown)
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the legal sequence of states leading from `from` to an observed state.
///
/// Empty when nothing changed.
fn transition_path(from: ConnectivityState, observed: ConnectivityState) -> Vec<ConnectivityState> {
    use ConnectivityState::{Connecting, Ready, Shutdown, TransientFailure};

    match (from, observed) {
        (_, Connecting) => Vec::new(),
        (from, observed) if from == observed => Vec::new(),
        (TransientFailure, Ready) => vec![Connecting, Ready],
        (Connecting, Shutdown) => vec![TransientFailure, Shutdown],
        (Shutdown, _) => Vec::new(),
        (_, observed) => vec![observed],
    }
}

/// A connectivity state change for one catalog source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// The catalog source whose connection changed.
    pub key: SourceKey,
    /// The new state.
    pub state: ConnectivityState,
}

/// Receives connectivity state changes.
///
/// Implementations must not block: they are called from connection monitors.
pub trait ConnectivityObserver: Send + Sync + 'static {
    /// Called once per state change.
    fn notify(&self, change: StateChange);
}

impl ConnectivityObserver for mpsc::UnboundedSender<StateChange> {
    fn notify(&self, change: StateChange) {
        if self.send(change).is_err() {
            tracing::debug!("connectivity receiver dropped; state change discarded");
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Address the connection was opened against.
    pub address: String,
    /// Current connectivity state.
    pub state: ConnectivityState,
    /// When the current state was entered.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct StateCell {
    state: ConnectivityState,
    since: DateTime<Utc>,
}

struct SourceConnection {
    address: String,
    client: Arc<dyn RegistryClient>,
    state: Arc<Mutex<StateCell>>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

impl SourceConnection {
    fn state(&self) -> StateCell {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn close(self, key: &SourceKey) -> Result<()> {
        self.cancel.cancel();
        match self.monitor.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "connection monitor for {key} panicked: {e}"
            ))),
        }
    }
}

/// Owns one registry connection per catalog source.
pub struct ConnectionManager {
    dialer: Arc<dyn RegistryDialer>,
    observer: Arc<dyn ConnectivityObserver>,
    probe_interval: Duration,
    connections: RwLock<HashMap<SourceKey, SourceConnection>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("probe_interval", &self.probe_interval)
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a connection manager.
    ///
    /// `observer` receives every state change of every connection.
    #[must_use]
    pub fn new(
        dialer: Arc<dyn RegistryDialer>,
        observer: Arc<dyn ConnectivityObserver>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            dialer,
            observer,
            probe_interval,
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Opens a connection for `key`, replacing any connection to a different
    /// address.
    ///
    /// Idempotent: when a live connection to the same address exists it is
    /// returned unchanged. A connection in the terminal `Shutdown` state is
    /// redialed.
    ///
    /// # Errors
    ///
    /// Returns a connection error if dialing fails. The key is then left
    /// without a connection; any previous connection has already been closed.
    pub async fn add(&self, key: &SourceKey, address: &str) -> Result<Arc<dyn RegistryClient>> {
        if let Some(client) = self.reusable(key, address) {
            return Ok(client);
        }

        let previous = self.write().remove(key);
        if let Some(previous) = previous {
            tracing::info!(
                source = %key,
                old_address = %previous.address,
                new_address = %address,
                "closing stale catalog source connection"
            );
            previous.close(key).await?;
        }

        let client = match self.dialer.dial(address).await {
            Ok(client) => client,
            Err(e) => {
                crate::metrics::record_dial_failure();
                return Err(e);
            }
        };

        let state = Arc::new(Mutex::new(StateCell {
            state: ConnectivityState::Connecting,
            since: Utc::now(),
        }));
        let cancel = self.shutdown.child_token();
        let monitor = tokio::spawn(monitor(
            key.clone(),
            Arc::clone(&client),
            Arc::clone(&state),
            Arc::clone(&self.observer),
            self.probe_interval,
            cancel.clone(),
        ));

        let connection = SourceConnection {
            address: address.to_string(),
            client: Arc::clone(&client),
            state,
            cancel,
            monitor,
        };
        let replaced = self.write().insert(key.clone(), connection);
        if let Some(replaced) = replaced {
            replaced.close(key).await?;
        }

        tracing::info!(source = %key, address = %address, "opened catalog source connection");
        Ok(client)
    }

    /// Returns the address and state of the connection for `key`, if any.
    #[must_use]
    pub fn get_meta(&self, key: &SourceKey) -> Option<ConnectionMeta> {
        self.read().get(key).map(|connection| {
            let cell = connection.state();
            ConnectionMeta {
                address: connection.address.clone(),
                state: cell.state,
                since: cell.since,
            }
        })
    }

    /// Returns the client for `key`, if connected.
    #[must_use]
    pub fn client(&self, key: &SourceKey) -> Option<Arc<dyn RegistryClient>> {
        self.read()
            .get(key)
            .map(|connection| Arc::clone(&connection.client))
    }

    /// Closes and forgets the connection for `key`. No-op for unknown keys.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the connection's monitor task panicked.
    pub async fn remove(&self, key: &SourceKey) -> Result<()> {
        let removed = self.write().remove(key);
        match removed {
            Some(connection) => {
                tracing::info!(
                    source = %key,
                    address = %connection.address,
                    "closing catalog source connection"
                );
                connection.close(key).await
            }
            None => Ok(()),
        }
    }

    /// Returns the number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let connections: Vec<_> = self.write().drain().collect();
        for (key, connection) in connections {
            if let Err(e) = connection.close(&key).await {
                tracing::warn!(
                    source = %key,
                    error = %e,
                    "connection close failed during shutdown"
                );
            }
        }
    }

    fn reusable(&self, key: &SourceKey, address: &str) -> Option<Arc<dyn RegistryClient>> {
        let connections = self.read();
        let connection = connections.get(key)?;
        (connection.address == address && connection.state().state != ConnectivityState::Shutdown)
            .then(|| Arc::clone(&connection.client))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SourceKey, SourceConnection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SourceKey, SourceConnection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Probes one connection until cancelled or shut down.
async fn monitor(
    key: SourceKey,
    client: Arc<dyn RegistryClient>,
    state: Arc<Mutex<StateCell>>,
    observer: Arc<dyn ConnectivityObserver>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let observed = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            observed = client.probe() => observed,
        };

        let current = state.lock().unwrap_or_else(PoisonError::into_inner).state;
        for next in transition_path(current, observed) {
            if cancel.is_cancelled() {
                return;
            }
            {
                let mut cell = state.lock().unwrap_or_else(PoisonError::into_inner);
                debug_assert!(cell.state.can_transition_to(next));
                cell.state = next;
                cell.since = Utc::now();
            }
            tracing::info!(source = %key, state = %next, "catalog source connectivity changed");
            crate::metrics::record_transition(next.as_str());
            observer.notify(StateChange {
                key: key.clone(),
                state: next,
            });
        }

        if observed == ConnectivityState::Shutdown {
            tracing::info!(source = %key, "catalog source shut down; monitor stopped");
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::{InMemoryDialer, InMemoryRegistry};
    use super::ConnectivityState::{Connecting, Ready, Shutdown, TransientFailure};

    fn manager(
        dialer: InMemoryDialer,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager =
            ConnectionManager::new(Arc::new(dialer), Arc::new(tx), Duration::from_millis(10));
        (manager, rx)
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<StateChange>) -> ConnectivityState {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("state change in time")
            .expect("channel open")
            .state
    }

    #[test]
    fn transition_paths_follow_state_machine() {
        assert_eq!(transition_path(Connecting, Ready), vec![Ready]);
        assert_eq!(transition_path(TransientFailure, Ready), vec![Connecting, Ready]);
        assert_eq!(transition_path(Connecting, Shutdown), vec![TransientFailure, Shutdown]);
        assert_eq!(transition_path(Ready, Ready), Vec::<ConnectivityState>::new());
        assert_eq!(transition_path(Shutdown, Ready), Vec::<ConnectivityState>::new());

        for from in [Connecting, Ready, TransientFailure] {
            for observed in [Ready, TransientFailure, Shutdown] {
                let mut current = from;
                for next in transition_path(from, observed) {
                    assert!(current.can_transition_to(next), "{current} -> {next}");
                    current = next;
                }
            }
        }
    }

    #[tokio::test]
    async fn add_reports_ready_and_is_idempotent() {
        let registry = Arc::new(InMemoryRegistry::new());
        let dialer =
            InMemoryDialer::new().with_registry("registry:50051", Arc::clone(&registry));
        let (manager, mut rx) = manager(dialer.clone());
        let key = SourceKey::new("olm", "community");

        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(next_state(&mut rx).await, Ready);

        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(dialer.dial_count("registry:50051"), 1);
        assert_eq!(manager.get_meta(&key).unwrap().state, Ready);
    }

    #[tokio::test]
    async fn address_change_replaces_connection() {
        let dialer = InMemoryDialer::new()
            .with_registry("old:50051", Arc::new(InMemoryRegistry::new()))
            .with_registry("new:50051", Arc::new(InMemoryRegistry::new()));
        let (manager, mut rx) = manager(dialer);
        let key = SourceKey::new("olm", "community");

        manager.add(&key, "old:50051").await.unwrap();
        assert_eq!(next_state(&mut rx).await, Ready);

        manager.add(&key, "new:50051").await.unwrap();
        assert_eq!(manager.get_meta(&key).unwrap().address, "new:50051");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn dial_failure_leaves_key_unconnected() {
        let (manager, _rx) = manager(InMemoryDialer::new());
        let key = SourceKey::new("olm", "community");

        let result = manager.add(&key, "nowhere:50051").await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert!(manager.get_meta(&key).is_none());
        assert!(manager.client(&key).is_none());
    }

    #[tokio::test]
    async fn failure_and_recovery_pass_through_connecting() {
        let registry = Arc::new(InMemoryRegistry::new());
        let dialer =
            InMemoryDialer::new().with_registry("registry:50051", Arc::clone(&registry));
        let (manager, mut rx) = manager(dialer);
        let key = SourceKey::new("olm", "community");

        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(next_state(&mut rx).await, Ready);

        registry.set_probe_state(TransientFailure);
        assert_eq!(next_state(&mut rx).await, TransientFailure);

        registry.set_probe_state(Ready);
        assert_eq!(next_state(&mut rx).await, Connecting);
        assert_eq!(next_state(&mut rx).await, Ready);

        registry.set_probe_state(Shutdown);
        assert_eq!(next_state(&mut rx).await, Shutdown);
    }

    #[tokio::test]
    async fn shutdown_connection_is_redialed() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.set_probe_state(Shutdown);
        let dialer =
            InMemoryDialer::new().with_registry("registry:50051", Arc::clone(&registry));
        let (manager, mut rx) = manager(dialer.clone());
        let key = SourceKey::new("olm", "community");

        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(next_state(&mut rx).await, TransientFailure);
        assert_eq!(next_state(&mut rx).await, Shutdown);

        registry.set_probe_state(Ready);
        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(dialer.dial_count("registry:50051"), 2);
        assert_eq!(next_state(&mut rx).await, Ready);
    }

    #[tokio::test]
    async fn remove_is_noop_for_unknown_key_and_stops_reports() {
        let registry = Arc::new(InMemoryRegistry::new());
        let dialer =
            InMemoryDialer::new().with_registry("registry:50051", Arc::clone(&registry));
        let (manager, mut rx) = manager(dialer);
        let key = SourceKey::new("olm", "community");

        manager.remove(&SourceKey::new("olm", "unknown")).await.unwrap();

        manager.add(&key, "registry:50051").await.unwrap();
        assert_eq!(next_state(&mut rx).await, Ready);
        manager.remove(&key).await.unwrap();
        assert!(manager.is_empty());

        registry.set_probe_state(TransientFailure);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let dialer = InMemoryDialer::new()
            .with_registry("a:50051", Arc::new(InMemoryRegistry::new()))
            .with_registry("b:50051", Arc::new(InMemoryRegistry::new()));
        let (manager, _rx) = manager(dialer);

        manager.add(&SourceKey::new("olm", "a"), "a:50051").await.unwrap();
        manager.add(&SourceKey::new("olm", "b"), "b:50051").await.unwrap();
        assert_eq!(manager.len(), 2);

        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
