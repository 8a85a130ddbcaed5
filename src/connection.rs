use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Identifier assigned to a connection when the tracker registers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Control handle for one accepted transport connection.
///
/// The server inserts a clone into the extensions of every request served on the
/// connection, which is how the drain middleware tells connections apart.
#[derive(Clone, Debug, Default)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug, Default)]
struct ConnectionInner {
    last_request_started: AtomicBool,
    retire: CancellationToken,
    destroy: CancellationToken,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the single request this connection may still run while draining.
    ///
    /// Returns `true` only for the first caller.
    pub(crate) fn begin_last_request(&self) -> bool {
        !self.inner.last_request_started.swap(true, Ordering::SeqCst)
    }

    /// Whether the connection already used its final request.
    pub fn last_request_started(&self) -> bool {
        self.inner.last_request_started.load(Ordering::SeqCst)
    }

    /// Asks the server to stop reading new requests from the connection.
    ///
    /// Requests already in flight still get their response. The server then closes
    /// the connection: HTTP/1 stops keeping it alive and HTTP/2 sends `GOAWAY`.
    pub fn retire(&self) {
        self.inner.retire.cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retire.is_cancelled()
    }

    /// Completes once [`Connection::retire`] has been called.
    pub fn retired(&self) -> WaitForCancellationFuture<'_> {
        self.inner.retire.cancelled()
    }

    /// Asks the server to drop the connection without waiting for in-flight requests.
    pub fn destroy(&self) {
        self.inner.destroy.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroy.is_cancelled()
    }

    /// Completes once [`Connection::destroy`] has been called.
    pub fn destroyed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.destroy.cancelled()
    }
}

/// Registry of live connections, used to force them closed on hard exit.
///
/// Insertion and removal are constant time. Entries are removed when the server
/// reports the connection closed; the tracker never closes a connection unless
/// [`ConnectionTracker::destroy_all`] is called.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    count: AtomicUsize,
}

impl TrackerInner {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection` under a fresh identifier.
    pub fn open(&self, connection: &Connection) -> ConnectionId {
        let id = ConnectionId::generate();
        let mut connections = self.inner.connections();
        connections.insert(id, connection.clone());
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        id
    }

    /// Forgets the connection registered under `id`.
    ///
    /// Returns `false` if it was never registered or is already gone.
    pub fn close(&self, id: &ConnectionId) -> bool {
        let mut connections = self.inner.connections();
        if connections.remove(id).is_some() {
            self.inner.count.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Number of live tracked connections.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.connections().contains_key(id)
    }

    /// Destroys every tracked connection and returns how many were signalled.
    ///
    /// Entries stay registered until the server reports each connection closed.
    pub fn destroy_all(&self) -> usize {
        let connections = self.inner.connections();
        for connection in connections.values() {
            connection.destroy();
        }
        connections.len()
    }
}
