//! Persistent client connections that live outside the HTTP listener.
//!
//! Push-style fleets (websocket hubs, server-sent event broadcasters, pub/sub
//! gateways) keep their own connections open indefinitely. Once the listener has
//! closed, the shutdown sequence disconnects every member of such a group and then
//! closes the group itself.

use crate::error::Error;
use std::sync::Arc;

/// A single member of an [`AuxiliaryChannel`].
pub trait Disconnect: Send + Sync {
    /// Drops the client. Called at most once per shutdown.
    fn disconnect(&self) -> Result<(), Error>;
}

/// A group of persistent client connections.
pub trait AuxiliaryChannel: Send + Sync {
    /// Snapshot of the currently connected clients.
    fn connections(&self) -> Vec<Arc<dyn Disconnect>>;

    /// Closes the group after every member has been disconnected.
    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Disconnects every member of `channel`, then closes it.
///
/// Returns how many clients were disconnected. The first failure aborts the teardown.
pub(crate) fn teardown(channel: &dyn AuxiliaryChannel) -> Result<usize, Error> {
    let connections = channel.connections();
    for connection in &connections {
        connection.disconnect()?;
    }
    channel.close()?;
    Ok(connections.len())
}
