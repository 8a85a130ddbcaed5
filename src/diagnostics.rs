use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// A user supplied log sink. Receives every diagnostic line once logging is enabled.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Conditional pass-through logger used by the shutdown sequence.
///
/// Nothing written here affects control flow.
#[derive(Clone, Default)]
pub(crate) struct Diagnostics {
    enabled: bool,
    sink: Option<LogSink>,
}

impl Diagnostics {
    pub(crate) fn new(enabled: bool, sink: Option<LogSink>) -> Self {
        Self { enabled, sink }
    }

    pub(crate) fn log(&self, message: impl fmt::Display) {
        if !self.enabled {
            return;
        }
        match &self.sink {
            Some(sink) => sink(&message.to_string()),
            None => info!(target: "hyper_graceful_exit", "{}", message),
        }
    }

    /// Warnings reach `tracing` even when logging is off, unless a custom sink takes them.
    pub(crate) fn warn(&self, message: impl fmt::Display) {
        match (&self.sink, self.enabled) {
            (Some(sink), true) => sink(&format!("warning: {}", message)),
            _ => warn!(target: "hyper_graceful_exit", "{}", message),
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.enabled)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}
