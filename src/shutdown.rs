//! The shutdown sequence.
//!
//! ```text
//! idle -> drain requested -> awaiting close window -> listener closing
//!      -> connections draining -> terminated
//! ```
//!
//! A watchdog armed when the listener closes can jump straight to `terminated`
//! from any earlier state. Both paths funnel into a single terminal action
//! guarded by [`DrainState`], so the callback and process exit happen once.

use crate::channel;
use crate::config::{ConfigWarning, ShutdownConfig, ShutdownOptions};
use crate::connection::ConnectionTracker;
use crate::diagnostics::Diagnostics;
use crate::drain::DrainState;
use crate::error::{Error, Kind};
use crate::handle::Listener;
use crate::middleware::DrainLayer;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How often the open connection count is checked while waiting to close the listener.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every connection closed in time.
    Drained,
    /// The hard exit timeout fired first.
    HardExit,
}

impl Outcome {
    /// The process exit code for this outcome.
    pub fn code(self) -> i32 {
        match self {
            Outcome::Drained => 0,
            Outcome::HardExit => 1,
        }
    }
}

/// Application-side anchor for graceful exit.
///
/// Holds the drain state installed by [`middleware`] and the connection tracker
/// enabled by [`track_connections`]. Create one per server instance.
#[derive(Clone, Debug, Default)]
pub struct GracefulExit {
    inner: Arc<AppInner>,
}

#[derive(Debug, Default)]
struct AppInner {
    drain: OnceLock<DrainState>,
    tracker: OnceLock<ConnectionTracker>,
    outcome: OnceLock<Outcome>,
    terminated: CancellationToken,
}

impl GracefulExit {
    pub fn new() -> Self {
        Self::default()
    }

    /// The drain state, if [`middleware`] has been installed.
    pub fn drain_state(&self) -> Option<&DrainState> {
        self.inner.drain.get()
    }

    /// Whether [`track_connections`] has been called.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracker.get().is_some()
    }

    /// The outcome of the shutdown, once the terminal action has run.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.get().copied()
    }
}

/// Installs the drain state on `app` and returns the layer that enforces it.
///
/// Calling this more than once returns layers sharing the same state.
pub fn middleware(app: &GracefulExit) -> DrainLayer {
    DrainLayer::new(app.inner.drain.get_or_init(DrainState::new).clone())
}

/// Starts tracking every connection `server` opens from now on, so they can be
/// destroyed when the hard exit timeout fires.
///
/// Only useful together with
/// [`destroy_sockets_on_hard_exit`](ShutdownOptions::destroy_sockets_on_hard_exit).
pub fn track_connections<L>(server: &L, app: &GracefulExit)
where
    L: Listener + ?Sized,
{
    let tracker = app.inner.tracker.get_or_init(ConnectionTracker::new);
    server.on_connection(tracker.clone());
    debug!("tracking connections for hard exit");
}

/// Drains `server` and runs the terminal action exactly once.
///
/// Meant to be called from a termination signal handler. Returns the outcome
/// once the terminal action has run, unless the configuration asks to exit the
/// process, in which case this never returns. Returns `None` without doing
/// anything if a shutdown is already in progress on `app`, or if [`middleware`]
/// was never installed on it.
pub async fn initiate_shutdown<L>(
    app: &GracefulExit,
    server: &L,
    options: &ShutdownOptions,
) -> Option<Outcome>
where
    L: Listener + ?Sized,
{
    let Some(state) = app.drain_state() else {
        let e = Error::new(Kind::MissingState);
        error!(error = %e, "cannot shut down");
        options.diagnostics().warn(&e);
        return None;
    };

    let Some(requested_at) = state.request_shutdown() else {
        warn!("shutdown already in progress, ignoring");
        options
            .diagnostics()
            .log("Shutdown already in progress, ignoring repeated request");
        return None;
    };

    let (config, warnings) = options.resolve();
    let config = Arc::new(config);
    let diagnostics = config.diagnostics.clone();

    state.start_draining(config.request_policy());
    diagnostics.log("Closing down the http server");

    for warning in warnings {
        diagnostics.warn(warning);
    }

    let tracker = app.inner.tracker.get().cloned();
    match (tracker.is_some(), config.destroy_sockets_on_hard_exit) {
        (true, false) => diagnostics.warn(ConfigWarning::TrackingWithoutDestroy),
        (false, true) => diagnostics.warn(ConfigWarning::DestroyWithoutTracking),
        _ => {}
    }

    let terminal = Terminal {
        app: app.clone(),
        state: state.clone(),
        config: config.clone(),
        tracker,
    };

    tokio::select! {
        result = drain_server(server, &terminal, requested_at) => match result {
            Ok(()) => terminal.finish(Outcome::Drained).await,
            Err(e) => {
                error!(error = %e, "graceful shutdown failed, waiting for hard exit");
                diagnostics.log(format!("Graceful shutdown failed: {}", e));
            }
        },
        _ = app.inner.terminated.cancelled() => {},
    }

    // Whichever path won, the outcome is recorded before this resolves.
    app.inner.terminated.cancelled().await;
    app.outcome()
}

/// Steps from the close window to the last connection ending.
async fn drain_server<L>(
    server: &L,
    terminal: &Terminal,
    requested_at: Instant,
) -> Result<(), Error>
where
    L: Listener + ?Sized,
{
    let config = &terminal.config;
    let diagnostics = &config.diagnostics;

    if let Some(min) = config.min_close_delay {
        diagnostics.log(format!("Keeping the listener open for at least {:?}", min));
        sleep_until(requested_at + min).await;
    }

    let ceiling = config.max_close_delay.min(config.hard_exit_timeout);
    while server.connection_count() > 0 && requested_at.elapsed() < ceiling {
        sleep(POLL_INTERVAL).await;
    }

    if terminal.state.close_listener_once() {
        diagnostics.log(format!(
            "Closing the listener with {} open connections",
            server.connection_count()
        ));
        server.close();
    }

    let remaining = config
        .hard_exit_timeout
        .saturating_sub(requested_at.elapsed());
    terminal.arm_watchdog(remaining);

    server.closed().await;
    diagnostics.log("No more connections, listener closed");

    if let Some(channel) = &config.channel {
        let disconnected = channel::teardown(channel.as_ref())?;
        diagnostics.log(format!("Disconnected {} auxiliary clients", disconnected));
    }

    terminal.state.mark_connections_closed();
    Ok(())
}

/// Everything the terminal action needs, detached from the caller's borrows so the
/// watchdog task can own a copy.
#[derive(Clone)]
struct Terminal {
    app: GracefulExit,
    state: DrainState,
    config: Arc<ShutdownConfig>,
    tracker: Option<ConnectionTracker>,
}

impl Terminal {
    fn diagnostics(&self) -> &Diagnostics {
        &self.config.diagnostics
    }

    /// Spawns the hard exit countdown. A zero budget fires on the next tick.
    fn arm_watchdog(&self, remaining: Duration) {
        let timer = CancellationToken::new();
        self.state.arm_hard_exit_timer(timer.clone());

        let terminal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {},
                _ = sleep(remaining) => terminal.hard_exit().await,
            }
        });
    }

    async fn hard_exit(&self) {
        self.diagnostics()
            .log("Could not close connections in time, hard exiting");

        if self.config.destroy_sockets_on_hard_exit {
            match &self.tracker {
                Some(tracker) => {
                    let destroyed = tracker.destroy_all();
                    self.diagnostics()
                        .log(format!("Destroyed {} open connections", destroyed));
                }
                None => self
                    .diagnostics()
                    .log("Connections are not tracked, none can be destroyed"),
            }
        }

        self.finish(Outcome::HardExit).await;
    }

    /// The terminal action. Only the first caller gets past the guard.
    async fn finish(&self, outcome: Outcome) {
        if !self.state.begin_terminal() {
            return;
        }

        let _ = self.app.inner.outcome.set(outcome);

        if let Some(callback) = &self.config.callback {
            callback(outcome);
        }

        self.state.clear_hard_exit_timer();

        if self.config.exit_process {
            self.diagnostics()
                .log(format!("Exiting process with code {}", outcome.code()));
            sleep(self.config.exit_delay).await;
            std::process::exit(outcome.code());
        }

        self.app.inner.terminated.cancel();
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
