use crate::connection::{Connection, ConnectionId, ConnectionTracker};
use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, OnceLock,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The listening side of a server, as seen by the shutdown sequence.
///
/// [`Handle`] implements this for servers started with [`serve`](crate::serve).
/// Other servers can implement it to reuse the shutdown sequence.
pub trait Listener: Send + Sync {
    /// Number of connections currently open.
    fn connection_count(&self) -> usize;

    /// Stops accepting new connections. Must be safe to call more than once.
    fn close(&self);

    /// Completes once the listener is closed and its last connection has ended.
    fn closed(&self) -> BoxFuture<'static, ()>;

    /// Registers every connection opened from now on with `tracker`.
    fn on_connection(&self, tracker: ConnectionTracker);
}

/// A handle to observe and close a running server.
///
/// `Handle` provides the number of active connections, closes the listener, and
/// lets a [`ConnectionTracker`] follow connection lifecycles.
#[derive(Clone, Debug, Default)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

#[derive(Debug, Default)]
struct HandleInner {
    conn_count: AtomicUsize,
    stopped: AtomicBool,
    closing: CancellationToken,
    conn_end: CancellationToken,
    tracker: OnceLock<ConnectionTracker>,
}

impl Handle {
    /// Create a new handle for the server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of active connections to the server.
    pub fn connection_count(&self) -> usize {
        self.inner.conn_count.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections.
    ///
    /// Connections already accepted stay open until their peer closes them, the
    /// server answers with `Connection: close`, or they are destroyed.
    pub fn close(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            trace!("closing listener");
        }
        self.inner.closing.cancel();
        if self.connection_count() == 0 {
            self.inner.conn_end.cancel();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the listener is closed and every connection has ended.
    pub async fn closed(&self) {
        self.inner.closing.cancelled().await;
        self.inner.conn_end.cancelled().await;
    }

    /// Follow connection lifecycles with `tracker`. Only the first tracker is kept.
    pub fn track(&self, tracker: ConnectionTracker) -> bool {
        self.inner.tracker.set(tracker).is_ok()
    }

    /// Internal method to wait until the listener is asked to close.
    pub(crate) async fn wait_closing(&self) {
        self.inner.closing.cancelled().await;
    }

    /// Creates a watcher for a newly accepted connection.
    ///
    /// Returns `None` if the handle was closed in the meantime. A concurrent
    /// `close` may already have seen zero connections and resolved `closed`, so
    /// the connection must not be served.
    pub(crate) fn watcher(&self) -> Option<Watcher> {
        let watcher = Watcher::new(self.clone());
        if self.is_closing() {
            return None;
        }
        Some(watcher)
    }
}

impl Listener for Handle {
    fn connection_count(&self) -> usize {
        Handle::connection_count(self)
    }

    fn close(&self) {
        Handle::close(self)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let handle = self.clone();
        Box::pin(async move { handle.closed().await })
    }

    fn on_connection(&self, tracker: ConnectionTracker) {
        self.track(tracker);
    }
}

/// Keeps one accepted connection accounted for while it is being served.
pub(crate) struct Watcher {
    handle: Handle,
    connection: Connection,
    tracked: Option<ConnectionId>,
}

impl Watcher {
    fn new(handle: Handle) -> Self {
        handle.inner.conn_count.fetch_add(1, Ordering::SeqCst);

        let connection = Connection::new();
        let tracked = handle
            .inner
            .tracker
            .get()
            .map(|tracker| tracker.open(&connection));

        Self {
            handle,
            connection,
            tracked,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for Watcher {
    /// Releases the connection.
    ///
    /// If this was the last connection and the listener is closing, the server is
    /// notified that all connections have ended.
    fn drop(&mut self) {
        if let (Some(id), Some(tracker)) = (self.tracked, self.handle.inner.tracker.get()) {
            tracker.close(&id);
        }

        let count = self.handle.inner.conn_count.fetch_sub(1, Ordering::SeqCst) - 1;

        if count == 0 && self.handle.is_closing() {
            self.handle.inner.conn_end.cancel();
        }
    }
}
