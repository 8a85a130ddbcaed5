use crate::BoxError;
use http::StatusCode;
use std::borrow::Cow;
use std::ops::ControlFlow;
use std::{error::Error as StdError, fmt, io};
use tracing::debug;

/// Decides whether an accept error should stop the accept loop.
///
/// Transient failures (the peer aborting mid-handshake, interrupted syscalls,
/// a spurious wake-up) keep the listener alive. Anything else is treated as
/// fatal and handed back to the caller of `serve`.
///
/// # Returns
///
/// * [`ControlFlow::Continue(())`] if the listener should keep accepting.
/// * [`ControlFlow::Break(BoxError)`] if the listener should stop.
pub(crate) fn handle_accept_error(e: impl Into<BoxError>) -> ControlFlow<BoxError> {
    let e = e.into();

    debug!(error = %e, "connection accept loop error");

    if let Some(e) = e.downcast_ref::<io::Error>() {
        if matches!(
            e.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        ) {
            return ControlFlow::Continue(());
        }
    }

    ControlFlow::Break(e)
}

/// Represents errors produced while draining a server.
///
/// Rejections handed to clients during shutdown are also values of this type,
/// which is why an error can carry an HTTP status and a client-facing message.
pub struct Error {
    inner: ErrorImpl,
}

struct ErrorImpl {
    kind: Kind,
    status: Option<StatusCode>,
    message: Option<Cow<'static, str>>,
    source: Option<BoxError>,
}

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A request arrived while the server was draining and was refused.
    Unavailable,
    /// Tearing down the auxiliary channel failed.
    Channel,
    /// Shutdown was requested on an application that never installed the middleware.
    MissingState,
}

impl Error {
    /// Creates a new error of the given kind.
    pub fn new(kind: Kind) -> Self {
        Self {
            inner: ErrorImpl {
                kind,
                status: None,
                message: None,
                source: None,
            },
        }
    }

    /// Attaches a source error.
    pub fn with(mut self, source: impl Into<BoxError>) -> Self {
        self.inner.source = Some(source.into());
        self
    }

    /// Overrides the message shown by `Display` and sent to rejected clients.
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.inner.message = Some(message.into());
        self
    }

    /// Overrides the HTTP status used when this error is rendered as a response.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.inner.status = Some(status);
        self
    }

    /// The rejection handed to requests arriving while the server drains.
    pub fn unavailable() -> Self {
        Error::new(Kind::Unavailable)
    }

    /// A failure to disconnect an auxiliary client or close its group.
    pub fn channel(source: impl Into<BoxError>) -> Self {
        Error::new(Kind::Channel).with(source)
    }

    /// Returns the error's kind.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        if let Some(status) = self.inner.status {
            return status;
        }
        match self.inner.kind {
            Kind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn description(&self) -> &str {
        if let Some(message) = &self.inner.message {
            return message;
        }
        match &self.inner.kind {
            Kind::Unavailable => "Server unavailable, no new requests accepted during shutdown",
            Kind::Channel => "failed to tear down auxiliary channel",
            Kind::MissingState => "drain state not installed, call middleware() first",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hyper_graceful_exit::Error");

        f.field(&self.inner.kind);

        if let Some(message) = &self.inner.message {
            f.field(message);
        }

        if let Some(source) = &self.inner.source {
            f.field(source);
        }

        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}
