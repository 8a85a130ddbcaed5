//! An HTTP server that drains on Ctrl+C or SIGTERM.
//!
//! Requests arriving while the server drains get a 503. Connections that are
//! still open when the hard exit timeout fires are destroyed, and the process
//! exits with code 1 instead of 0.

use hyper::{
    body::{Bytes, Incoming},
    Request, Response,
};
use http_body_util::Full;
use hyper_graceful_exit::{
    initiate_shutdown, middleware, serve, track_connections, GracefulExit, Handle,
    ShutdownOptions,
};
use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto::Builder as HttpConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use std::{convert::Infallible, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tower::ServiceBuilder;
use tracing::info;

/// Responds with "Hello, World!" after a short pause, so a request can be in
/// flight when the signal arrives.
async fn hello(_: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(Response::new(Full::new(Bytes::from("Hello, World!"))))
}

/// Waits for Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().init();

    let addr = SocketAddr::from(([127, 0, 0, 1], 54321));
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    let app = GracefulExit::new();
    let handle = Handle::new();
    track_connections(&handle, &app);

    let svc = ServiceBuilder::new()
        .layer(middleware(&app))
        .service_fn(hello);

    let server = tokio::spawn(serve(
        TowerToHyperService::new(svc),
        TcpListenerStream::new(listener),
        HttpConnectionBuilder::new(TokioExecutor::new()),
        handle.clone(),
    ));

    shutdown_signal().await;

    let mut options = ShutdownOptions::new();
    options
        .log(true)
        .reject_during_shutdown(true)
        .min_close_delay(Duration::from_millis(500))
        .max_close_delay(Duration::from_secs(5))
        .hard_exit_timeout(Duration::from_secs(10))
        .destroy_sockets_on_hard_exit(true)
        .callback(|outcome| info!(?outcome, "shutdown finished"));

    // Exits the process once the server has drained or the hard exit fires.
    initiate_shutdown(&app, &handle, &options).await;

    server.await?
}
