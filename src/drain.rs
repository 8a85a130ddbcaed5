use crate::config::{Fallback, RequestPolicy};
use crate::connection::Connection;
use crate::error::Error;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, OnceLock, PoisonError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared shutdown state for one server instance.
///
/// Written by the shutdown sequence, read by the drain middleware. Every flag only
/// ever moves from `false` to `true`.
#[derive(Clone, Debug, Default)]
pub struct DrainState {
    inner: Arc<DrainInner>,
}

#[derive(Debug, Default)]
struct DrainInner {
    requested_at: OnceLock<Instant>,
    policy: OnceLock<RequestPolicy>,
    draining: AtomicBool,
    listener_closed: AtomicBool,
    connections_closed: AtomicBool,
    terminal_invoked: AtomicBool,
    hard_exit_timer: Mutex<Option<CancellationToken>>,
}

/// What the middleware does with a request.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Not draining; the request runs untouched.
    Pass,
    /// The connection's one remaining request. It runs, and the response closes
    /// the connection.
    LastRequest,
    /// Refused with an error response.
    Reject(Error),
    /// Ended with an empty response.
    Drop,
}

impl DrainInner {
    fn hard_exit_timer(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.hard_exit_timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DrainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// When shutdown was requested, if it has been.
    pub fn requested_at(&self) -> Option<Instant> {
        self.inner.requested_at.get().copied()
    }

    pub fn listener_closed(&self) -> bool {
        self.inner.listener_closed.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> bool {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    pub fn terminal_invoked(&self) -> bool {
        self.inner.terminal_invoked.load(Ordering::SeqCst)
    }

    /// Records the shutdown request. Returns `None` if one was already recorded.
    pub(crate) fn request_shutdown(&self) -> Option<Instant> {
        let now = Instant::now();
        self.inner.requested_at.set(now).ok().map(|()| now)
    }

    /// Publishes the request policy, then starts draining.
    pub(crate) fn start_draining(&self, policy: RequestPolicy) {
        let _ = self.inner.policy.set(policy);
        self.inner.draining.store(true, Ordering::SeqCst);
    }

    /// Returns `true` for the one caller allowed to close the listener.
    pub(crate) fn close_listener_once(&self) -> bool {
        !self.inner.listener_closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_connections_closed(&self) {
        self.inner.connections_closed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` for the one caller allowed to run the terminal action.
    pub(crate) fn begin_terminal(&self) -> bool {
        self.inner
            .terminal_invoked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn arm_hard_exit_timer(&self, timer: CancellationToken) {
        *self.inner.hard_exit_timer() = Some(timer);
    }

    pub(crate) fn clear_hard_exit_timer(&self) {
        if let Some(timer) = self.inner.hard_exit_timer().take() {
            timer.cancel();
        }
    }

    /// Whether the hard exit watchdog is currently armed.
    pub fn hard_exit_timer_armed(&self) -> bool {
        self.inner.hard_exit_timer().is_some()
    }

    /// Whether every request from now on is answered without the inner service.
    pub(crate) fn short_circuits_all(&self) -> bool {
        self.is_draining()
            && self
                .inner
                .policy
                .get()
                .map_or(true, |policy| !policy.perform_last_request)
    }

    /// Decides how a request arriving on `connection` is handled.
    pub(crate) fn admit(&self, connection: Option<&Connection>) -> Admission {
        if !self.is_draining() {
            return Admission::Pass;
        }

        let Some(policy) = self.inner.policy.get() else {
            return Admission::Drop;
        };

        if policy.perform_last_request
            && connection.is_some_and(|connection| connection.begin_last_request())
        {
            return Admission::LastRequest;
        }

        match policy.fallback {
            Fallback::RejectWithError => Admission::Reject((policy.rejection_error)()),
            Fallback::DropSilently => Admission::Drop,
        }
    }
}
