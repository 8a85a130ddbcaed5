use crate::error::handle_accept_error;
use crate::handle::Handle;
use crate::BoxError;
use std::ops::ControlFlow;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::{Stream, StreamExt};

/// Yields accepted connections until the handle's listener is closed.
///
/// Non-fatal accept errors are logged and skipped. A fatal error is yielded once
/// and ends the stream. When the handle is closed the underlying stream, and with
/// it the listening socket, is dropped.
///
/// # Type Parameters
///
/// * `IO`: the connection type, usually a `tokio::net::TcpStream`.
/// * `IE`: the accept error type, usually `std::io::Error`.
pub(crate) fn accept_until_closed<IO, IE>(
    incoming: impl Stream<Item = Result<IO, IE>> + Send + 'static,
    handle: Handle,
) -> impl Stream<Item = Result<IO, BoxError>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    IE: Into<BoxError> + Send + 'static,
{
    async_stream::stream! {
        let mut incoming = Box::pin(incoming);

        loop {
            let item = tokio::select! {
                biased;
                _ = handle.wait_closing() => break,
                item = incoming.next() => item,
            };

            match item {
                Some(Ok(io)) => yield Ok(io),
                Some(Err(e)) => match handle_accept_error(e) {
                    ControlFlow::Continue(()) => continue,
                    ControlFlow::Break(e) => {
                        yield Err(e);
                        break;
                    }
                },
                None => break,
            }
        }
    }
}
