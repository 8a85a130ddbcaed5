use crate::channel::AuxiliaryChannel;
use crate::diagnostics::{Diagnostics, LogSink};
use crate::error::Error;
use crate::shutdown::Outcome;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Invoked once with the outcome of the shutdown.
pub type Callback = Arc<dyn Fn(Outcome) + Send + Sync>;

/// Builds the error handed to requests refused while draining.
pub type RejectionFactory = Arc<dyn Fn() -> Error + Send + Sync>;

const DEFAULT_MAX_CLOSE_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_HARD_EXIT_TIMEOUT: Duration = Duration::from_secs(130);
const DEFAULT_EXIT_DELAY: Duration = Duration::from_millis(10);

fn default_rejection() -> RejectionFactory {
    Arc::new(Error::unavailable)
}

/// What happens to a drained request that does not get to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Respond with the configured rejection error.
    RejectWithError,
    /// End the response immediately with an empty body.
    DropSilently,
}

/// Options for a single shutdown attempt.
///
/// Every field is optional; [`ShutdownOptions::resolve`] fills the gaps with defaults.
#[derive(Clone, Default)]
pub struct ShutdownOptions {
    log: Option<bool>,
    logger: Option<LogSink>,
    perform_last_request: Option<bool>,
    reject_during_shutdown: Option<bool>,
    rejection_error: Option<RejectionFactory>,
    min_close_delay: Option<Duration>,
    max_close_delay: Option<Duration>,
    hard_exit_timeout: Option<Duration>,
    exit_process: Option<bool>,
    exit_delay: Option<Duration>,
    destroy_sockets_on_hard_exit: Option<bool>,
    callback: Option<Callback>,
    channel: Option<Arc<dyn AuxiliaryChannel>>,
    suicide_timeout: Option<Duration>,
    force: Option<bool>,
}

impl ShutdownOptions {
    /// Creates empty options; every setting falls back to its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables diagnostic logging.
    ///
    /// Default is `false`, unless a custom logger is supplied.
    pub fn log(&mut self, val: bool) -> &mut Self {
        self.log = Some(val);
        self
    }

    /// Routes diagnostics to a custom sink instead of `tracing`.
    ///
    /// Supplying a sink without calling [`ShutdownOptions::log`] enables logging.
    pub fn logger(&mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.logger = Some(Arc::new(sink));
        self
    }

    /// Lets the first request on each open connection after draining begins run normally.
    ///
    /// Subsequent requests on the same connection get the fallback behavior.
    ///
    /// Default is `false`.
    pub fn perform_last_request(&mut self, val: bool) -> &mut Self {
        self.perform_last_request = Some(val);
        self
    }

    /// Refuses drained requests with an error response instead of an empty one.
    ///
    /// Default is `false`.
    pub fn reject_during_shutdown(&mut self, val: bool) -> &mut Self {
        self.reject_during_shutdown = Some(val);
        self
    }

    /// Replaces the default `503 Service Unavailable` rejection.
    pub fn rejection_error(
        &mut self,
        factory: impl Fn() -> Error + Send + Sync + 'static,
    ) -> &mut Self {
        self.rejection_error = Some(Arc::new(factory));
        self
    }

    /// Keeps the listener open for at least this long after shutdown is requested,
    /// even if no connection is open.
    ///
    /// Default is `None`.
    pub fn min_close_delay(&mut self, val: Duration) -> &mut Self {
        self.min_close_delay = Some(val);
        self
    }

    /// Closes the listener after this long even if connections are still open.
    ///
    /// Default is 60 seconds.
    pub fn max_close_delay(&mut self, val: Duration) -> &mut Self {
        self.max_close_delay = Some(val);
        self
    }

    /// Gives up on open connections after this long and exits with a failure code.
    ///
    /// Default is 130 seconds.
    pub fn hard_exit_timeout(&mut self, val: Duration) -> &mut Self {
        self.hard_exit_timeout = Some(val);
        self
    }

    /// Terminates the process once shutdown completes.
    ///
    /// Default is `true`.
    pub fn exit_process(&mut self, val: bool) -> &mut Self {
        self.exit_process = Some(val);
        self
    }

    /// Pause between the terminal callback and process exit, to let output flush.
    ///
    /// Default is 10 milliseconds.
    pub fn exit_delay(&mut self, val: Duration) -> &mut Self {
        self.exit_delay = Some(val);
        self
    }

    /// Forcibly drops every tracked connection when the hard exit timeout fires.
    ///
    /// Requires [`track_connections`](crate::track_connections) to be active.
    ///
    /// Default is `false`.
    pub fn destroy_sockets_on_hard_exit(&mut self, val: bool) -> &mut Self {
        self.destroy_sockets_on_hard_exit = Some(val);
        self
    }

    /// Called exactly once with the outcome of the shutdown.
    pub fn callback(
        &mut self,
        callback: impl Fn(Outcome) + Send + Sync + 'static,
    ) -> &mut Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// A group of persistent connections outside the HTTP listener to disconnect
    /// once the listener has closed.
    pub fn channel(&mut self, channel: Arc<dyn AuxiliaryChannel>) -> &mut Self {
        self.channel = Some(channel);
        self
    }

    /// Former name of [`ShutdownOptions::hard_exit_timeout`].
    #[deprecated(note = "use `hard_exit_timeout`")]
    pub fn suicide_timeout(&mut self, val: Duration) -> &mut Self {
        self.suicide_timeout = Some(val);
        self
    }

    /// Former name of [`ShutdownOptions::destroy_sockets_on_hard_exit`].
    #[deprecated(note = "use `destroy_sockets_on_hard_exit`")]
    pub fn force(&mut self, val: bool) -> &mut Self {
        self.force = Some(val);
        self
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        let enabled = self.log.unwrap_or(self.logger.is_some());
        Diagnostics::new(enabled, self.logger.clone())
    }

    /// Produces the configuration used for the rest of the attempt.
    ///
    /// Resolution never fails. Inconsistent settings are corrected where a safe
    /// correction exists and reported as warnings.
    pub fn resolve(&self) -> (ShutdownConfig, Vec<ConfigWarning>) {
        let mut warnings = Vec::new();

        let mut hard_exit_timeout = self
            .hard_exit_timeout
            .or(self.suicide_timeout)
            .unwrap_or(DEFAULT_HARD_EXIT_TIMEOUT);
        if hard_exit_timeout.is_zero() {
            warnings.push(ConfigWarning::ZeroHardExitTimeout);
            hard_exit_timeout = DEFAULT_HARD_EXIT_TIMEOUT;
        }

        let max_close_delay = self.max_close_delay.unwrap_or(DEFAULT_MAX_CLOSE_DELAY);
        let min_close_delay = self.min_close_delay.map(|min| {
            if min > max_close_delay {
                warnings.push(ConfigWarning::MinDelayExceedsMax {
                    min,
                    max: max_close_delay,
                });
                max_close_delay
            } else {
                min
            }
        });

        let perform_last_request = self.perform_last_request.unwrap_or(false);
        let reject = self.reject_during_shutdown.unwrap_or(false);
        if !perform_last_request && !reject {
            warnings.push(ConfigWarning::DropWithoutError);
        }

        let config = ShutdownConfig {
            diagnostics: self.diagnostics(),
            perform_last_request,
            fallback: if reject {
                Fallback::RejectWithError
            } else {
                Fallback::DropSilently
            },
            rejection_error: self
                .rejection_error
                .clone()
                .unwrap_or_else(default_rejection),
            min_close_delay,
            max_close_delay,
            hard_exit_timeout,
            exit_process: self.exit_process.unwrap_or(true),
            exit_delay: self.exit_delay.unwrap_or(DEFAULT_EXIT_DELAY),
            destroy_sockets_on_hard_exit: self
                .destroy_sockets_on_hard_exit
                .or(self.force)
                .unwrap_or(false),
            callback: self.callback.clone(),
            channel: self.channel.clone(),
        };

        (config, warnings)
    }
}

impl fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOptions")
            .field("log", &self.log)
            .field("perform_last_request", &self.perform_last_request)
            .field("reject_during_shutdown", &self.reject_during_shutdown)
            .field("min_close_delay", &self.min_close_delay)
            .field("max_close_delay", &self.max_close_delay)
            .field("hard_exit_timeout", &self.hard_exit_timeout)
            .field("exit_process", &self.exit_process)
            .field("exit_delay", &self.exit_delay)
            .field("destroy_sockets_on_hard_exit", &self.destroy_sockets_on_hard_exit)
            .finish_non_exhaustive()
    }
}

/// Fully resolved shutdown settings. Immutable for the rest of the attempt.
#[derive(Clone)]
pub struct ShutdownConfig {
    pub(crate) diagnostics: Diagnostics,
    pub(crate) perform_last_request: bool,
    pub(crate) fallback: Fallback,
    pub(crate) rejection_error: RejectionFactory,
    pub(crate) min_close_delay: Option<Duration>,
    pub(crate) max_close_delay: Duration,
    pub(crate) hard_exit_timeout: Duration,
    pub(crate) exit_process: bool,
    pub(crate) exit_delay: Duration,
    pub(crate) destroy_sockets_on_hard_exit: bool,
    pub(crate) callback: Option<Callback>,
    pub(crate) channel: Option<Arc<dyn AuxiliaryChannel>>,
}

impl ShutdownConfig {
    pub fn min_close_delay(&self) -> Option<Duration> {
        self.min_close_delay
    }

    pub fn max_close_delay(&self) -> Duration {
        self.max_close_delay
    }

    pub fn hard_exit_timeout(&self) -> Duration {
        self.hard_exit_timeout
    }

    pub fn perform_last_request(&self) -> bool {
        self.perform_last_request
    }

    pub fn fallback(&self) -> Fallback {
        self.fallback
    }

    pub fn exit_process(&self) -> bool {
        self.exit_process
    }

    pub fn destroy_sockets_on_hard_exit(&self) -> bool {
        self.destroy_sockets_on_hard_exit
    }

    /// The request-facing part of the configuration, handed to the middleware.
    pub(crate) fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            perform_last_request: self.perform_last_request,
            fallback: self.fallback,
            rejection_error: self.rejection_error.clone(),
        }
    }
}

impl fmt::Debug for ShutdownConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownConfig")
            .field("diagnostics", &self.diagnostics)
            .field("perform_last_request", &self.perform_last_request)
            .field("fallback", &self.fallback)
            .field("min_close_delay", &self.min_close_delay)
            .field("max_close_delay", &self.max_close_delay)
            .field("hard_exit_timeout", &self.hard_exit_timeout)
            .field("exit_process", &self.exit_process)
            .field("exit_delay", &self.exit_delay)
            .field("destroy_sockets_on_hard_exit", &self.destroy_sockets_on_hard_exit)
            .field("callback", &self.callback.is_some())
            .field("channel", &self.channel.is_some())
            .finish()
    }
}

/// How drained requests are treated.
#[derive(Clone)]
pub(crate) struct RequestPolicy {
    pub(crate) perform_last_request: bool,
    pub(crate) fallback: Fallback,
    pub(crate) rejection_error: RejectionFactory,
}

impl fmt::Debug for RequestPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPolicy")
            .field("perform_last_request", &self.perform_last_request)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// A setting combination that is allowed but probably not what was intended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The minimum close delay was longer than the maximum and has been clamped.
    MinDelayExceedsMax { min: Duration, max: Duration },
    /// A zero hard exit timeout was replaced by the default.
    ZeroHardExitTimeout,
    /// Drained requests are neither run nor rejected; they complete with an empty 200.
    DropWithoutError,
    /// Connections are tracked, but nothing will ever destroy them.
    TrackingWithoutDestroy,
    /// Destroying connections on hard exit was requested without connection tracking.
    DestroyWithoutTracking,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::MinDelayExceedsMax { min, max } => write!(
                f,
                "minimum close delay {:?} exceeds maximum {:?}, using the maximum",
                min, max
            ),
            ConfigWarning::ZeroHardExitTimeout => {
                f.write_str("hard exit timeout must be positive, using the default")
            }
            ConfigWarning::DropWithoutError => f.write_str(
                "requests during shutdown are neither performed nor rejected, they will complete with an empty 200",
            ),
            ConfigWarning::TrackingWithoutDestroy => f.write_str(
                "connections are tracked but destroy_sockets_on_hard_exit is off, tracking is wasted",
            ),
            ConfigWarning::DestroyWithoutTracking => f.write_str(
                "destroy_sockets_on_hard_exit has no effect because track_connections was not called",
            ),
        }
    }
}
