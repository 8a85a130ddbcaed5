use crate::connection::Connection;
use crate::handle::{Handle, Watcher};
use crate::incoming::accept_until_closed;
use crate::BoxError;
use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::{
    rt::TokioIo,
    server::conn::auto::{Builder as HttpConnectionBuilder, HttpServerConnExec},
};
use std::pin::pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::{Stream, StreamExt as _};
use tracing::{debug, trace};

/// Inserts the serving connection's [`Connection`] into every request's extensions.
#[derive(Clone, Debug)]
pub(crate) struct WithConnection<S> {
    inner: S,
    connection: Connection,
}

impl<S, B> Service<Request<B>> for WithConnection<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.connection.clone());
        self.inner.call(req)
    }
}

/// Serves a single HTTP connection until it ends or is destroyed.
///
/// The watcher keeps the connection counted on the handle for as long as the
/// spawned task runs. Retiring the connection shuts it down gracefully, which
/// for HTTP/2 sends `GOAWAY`.
fn serve_connection<B, IO, S, E>(
    io: IO,
    service: S,
    builder: HttpConnectionBuilder<E>,
    watcher: Watcher,
) where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    E: HttpServerConnExec<S::Future, B> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        {
            let connection = watcher.connection().clone();
            let service = WithConnection {
                inner: service,
                connection: connection.clone(),
            };

            let mut conn = pin!(builder.serve_connection_with_upgrades(TokioIo::new(io), service));
            let mut retiring = false;

            loop {
                tokio::select! {
                    rv = &mut conn => {
                        if let Err(err) = rv {
                            debug!("failed serving HTTP connection: {:#}", err);
                        }
                        break;
                    },
                    _ = connection.retired(), if !retiring => {
                        trace!("retiring HTTP connection");
                        conn.as_mut().graceful_shutdown();
                        retiring = true;
                    },
                    // Dropping the connection future closes the socket without
                    // waiting for in-flight requests.
                    _ = connection.destroyed() => {
                        debug!("HTTP connection destroyed");
                        break;
                    },
                }
            }
        }

        drop(watcher);
        trace!("HTTP connection closed");
    });
}

/// Serves HTTP requests from `incoming` until `handle` is closed and every
/// connection has ended.
///
/// Closing the handle stops accepting and drops the listening stream. Connections
/// already accepted are left alone: they end when the peer goes away, when they
/// are retired (see [`DrainLayer`](crate::DrainLayer)), or when they are destroyed
/// through a [`ConnectionTracker`](crate::ConnectionTracker).
///
/// # Errors
///
/// Returns the accept error if the listening stream fails in a way that is not
/// recoverable. Connections already accepted are still waited for.
///
/// # Examples
///
/// ```rust,no_run
/// use std::convert::Infallible;
/// use bytes::Bytes;
/// use http_body_util::Full;
/// use hyper::body::Incoming;
/// use hyper::{Request, Response};
/// use hyper_util::rt::TokioExecutor;
/// use hyper_util::server::conn::auto::Builder as HttpConnectionBuilder;
/// use hyper_util::service::TowerToHyperService;
/// use tokio::net::TcpListener;
/// use tokio_stream::wrappers::TcpListenerStream;
/// use tower::ServiceBuilder;
///
/// use hyper_graceful_exit::{middleware, serve, GracefulExit, Handle};
///
/// async fn hello(_: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
///     Ok(Response::new(Full::new(Bytes::from("Hello, World!"))))
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let listener = TcpListener::bind("127.0.0.1:8080").await?;
///     let app = GracefulExit::new();
///     let handle = Handle::new();
///
///     let svc = ServiceBuilder::new()
///         .layer(middleware(&app))
///         .service_fn(hello);
///
///     serve(
///         TowerToHyperService::new(svc),
///         TcpListenerStream::new(listener),
///         HttpConnectionBuilder::new(TokioExecutor::new()),
///         handle,
///     )
///     .await
/// }
/// ```
pub async fn serve<E, I, IO, IE, ResBody, S>(
    service: S,
    incoming: I,
    builder: HttpConnectionBuilder<E>,
    handle: Handle,
) -> Result<(), BoxError>
where
    I: Stream<Item = Result<IO, IE>> + Send + 'static,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    IE: Into<BoxError> + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
    E: HttpServerConnExec<S::Future, ResBody> + Clone + Send + Sync + 'static,
{
    let mut incoming = pin!(accept_until_closed(incoming, handle.clone()));
    let mut result = Ok(());

    while let Some(io) = incoming.next().await {
        let io = match io {
            Ok(io) => io,
            Err(e) => {
                result = Err(e);
                break;
            }
        };

        trace!("connection accepted");

        let Some(watcher) = handle.watcher() else {
            trace!("listener closed while accepting, dropping connection");
            break;
        };
        serve_connection(io, service.clone(), builder.clone(), watcher);
    }

    trace!(
        "listener closed, waiting for {} connections to close",
        handle.connection_count()
    );

    // A fatal accept error closes the listener too, so `closed` can resolve.
    handle.close();
    handle.closed().await;

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::client::conn::http1::{self, SendRequest};
    use hyper::client::conn::http2;
    use hyper::StatusCode;
    use hyper_util::rt::TokioExecutor;
    use hyper_util::service::TowerToHyperService;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_stream::wrappers::TcpListenerStream;

    pub(crate) async fn hello(
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = if req.extensions().get::<Connection>().is_some() {
            "Hello, World!"
        } else {
            "no connection"
        };
        Ok(Response::new(Full::new(Bytes::from(body))))
    }

    /// Answers, then retires the connection it was served on.
    async fn hello_and_retire(
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        if let Some(connection) = req.extensions().get::<Connection>() {
            connection.retire();
        }
        hello(req).await
    }

    pub(crate) fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    pub(crate) async fn setup_test_server(addr: SocketAddr) -> (TcpListenerStream, SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let incoming = TcpListenerStream::new(listener);
        (incoming, server_addr)
    }

    /// Opens an HTTP/1 client connection. The returned task ends when the
    /// connection closes.
    pub(crate) async fn connect(
        addr: SocketAddr,
    ) -> (SendRequest<Empty<Bytes>>, JoinHandle<()>) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
        let task = tokio::spawn(async move {
            let _ = conn.await;
        });
        (sender, task)
    }

    pub(crate) async fn get(sender: &mut SendRequest<Empty<Bytes>>) -> Response<Incoming> {
        sender.ready().await.unwrap();
        sender
            .send_request(Request::builder().uri("/").body(Empty::new()).unwrap())
            .await
            .unwrap()
    }

    /// Opens an HTTP/2 client connection. The returned task ends when the
    /// connection closes.
    pub(crate) async fn connect_h2(
        addr: SocketAddr,
    ) -> (http2::SendRequest<Empty<Bytes>>, JoinHandle<()>) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .unwrap();
        let task = tokio::spawn(async move {
            let _ = conn.await;
        });
        (sender, task)
    }

    pub(crate) async fn get_h2(
        sender: &mut http2::SendRequest<Empty<Bytes>>,
        addr: SocketAddr,
    ) -> Response<Incoming> {
        sender.ready().await.unwrap();
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Empty::new())
            .unwrap();
        sender.send_request(req).await.unwrap()
    }

    fn start<F, Fut>(
        handle: Handle,
        incoming: TcpListenerStream,
        handler: F,
    ) -> JoinHandle<Result<(), BoxError>>
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<Response<Full<Bytes>>, Infallible>>
            + Send
            + 'static,
    {
        let svc = TowerToHyperService::new(tower::service_fn(handler));
        tokio::spawn(serve(
            svc,
            incoming,
            HttpConnectionBuilder::new(TokioExecutor::new()),
            handle,
        ))
    }

    #[tokio::test]
    async fn serves_requests_with_connection_extension() {
        let (incoming, addr) = setup_test_server(loopback()).await;
        let handle = Handle::new();
        let server = start(handle.clone(), incoming, hello);

        let (mut sender, _conn) = connect(addr).await;
        let res = get(&mut sender).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(handle.connection_count(), 1);
        let body = res.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello, World!");

        drop(sender);
        handle.close();
        timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_stops_accepting_but_keeps_open_connections() {
        let (incoming, addr) = setup_test_server(loopback()).await;
        let handle = Handle::new();
        let server = start(handle.clone(), incoming, hello);

        let (mut sender, conn) = connect(addr).await;
        assert_eq!(get(&mut sender).await.status(), StatusCode::OK);

        handle.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(TcpStream::connect(addr).await.is_err());
        // The keep-alive connection accepted before closing still works.
        assert_eq!(get(&mut sender).await.status(), StatusCode::OK);
        assert!(!server.is_finished());

        drop(sender);
        timeout(Duration::from_secs(1), conn).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.connection_count(), 0);
    }

    #[tokio::test]
    async fn destroyed_connections_are_dropped() {
        let (incoming, addr) = setup_test_server(loopback()).await;
        let handle = Handle::new();
        let tracker = crate::ConnectionTracker::new();
        handle.track(tracker.clone());
        let server = start(handle.clone(), incoming, hello);

        let (mut sender, conn) = connect(addr).await;
        assert_eq!(get(&mut sender).await.status(), StatusCode::OK);
        assert_eq!(tracker.count(), 1);

        handle.close();
        assert_eq!(tracker.destroy_all(), 1);

        timeout(Duration::from_secs(1), conn).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn retired_http1_connection_closes_after_response() {
        let (incoming, addr) = setup_test_server(loopback()).await;
        let handle = Handle::new();
        let server = start(handle.clone(), incoming, hello_and_retire);

        let (mut sender, conn) = connect(addr).await;
        let res = get(&mut sender).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello, World!");

        timeout(Duration::from_secs(1), conn).await.unwrap().unwrap();
        handle.close();
        timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.connection_count(), 0);
    }

    #[tokio::test]
    async fn retired_http2_connection_goes_away_after_response() {
        let (incoming, addr) = setup_test_server(loopback()).await;
        let handle = Handle::new();
        let server = start(handle.clone(), incoming, hello_and_retire);

        let (mut sender, conn) = connect_h2(addr).await;
        let res = get_h2(&mut sender, addr).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello, World!");

        timeout(Duration::from_secs(1), conn).await.unwrap().unwrap();
        handle.close();
        timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.connection_count(), 0);
    }
}
