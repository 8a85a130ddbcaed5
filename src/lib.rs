//! Graceful exit for hyper and tower servers.
//!
//! On a termination request the server stops taking on new work, lets in-flight
//! requests finish within bounded windows, and is guaranteed to reach a terminal
//! action exactly once, even if some connections never close.
//!
//! The pieces:
//!
//! * [`middleware`] installs a [`DrainLayer`] that, once draining, marks every
//!   response `Connection: close` and runs, rejects or drops requests.
//! * [`serve`] runs a hyper server whose [`Handle`] the shutdown sequence can close.
//! * [`track_connections`] lets the hard exit path destroy connections that never close.
//! * [`initiate_shutdown`] drives the whole sequence.

mod channel;
mod config;
mod connection;
mod diagnostics;
mod drain;
mod error;
mod handle;
mod incoming;
mod middleware;
mod server;
mod shutdown;

pub use channel::{AuxiliaryChannel, Disconnect};
pub use config::{
    Callback, ConfigWarning, Fallback, RejectionFactory, ShutdownConfig, ShutdownOptions,
};
pub use connection::{Connection, ConnectionId, ConnectionTracker};
pub use diagnostics::LogSink;
pub use drain::DrainState;
pub use error::{Error, Kind};
pub use handle::{Handle, Listener};
pub use middleware::{Drain, DrainBody, DrainLayer, ResponseFuture};
pub use server::serve;
pub use shutdown::{initiate_shutdown, middleware, track_connections, GracefulExit, Outcome};

/// Boxed error returned by [`serve`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
