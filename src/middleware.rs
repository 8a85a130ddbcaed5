//! Tower middleware that intercepts requests once the server starts draining.
//!
//! Outside of shutdown the wrapped service sees every request untouched. While
//! draining, each response carries `Connection: close` and requests are run,
//! rejected or dropped according to the resolved shutdown policy.

use crate::connection::Connection;
use crate::drain::{Admission, DrainState};
use crate::error::Error;
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::{Request, Response};
use http_body::Body;
use http_body_util::{Either, Full};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::{Layer, Service};
use tracing::trace;

/// Response body produced by [`Drain`]: the inner service's body, or one built
/// by the middleware when it answers on its own.
pub type DrainBody<B> = Either<B, Full<Bytes>>;

/// Layer installing [`Drain`]. Obtained from [`middleware`](crate::middleware).
#[derive(Clone, Debug)]
pub struct DrainLayer {
    state: DrainState,
}

impl DrainLayer {
    pub(crate) fn new(state: DrainState) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for DrainLayer {
    type Service = Drain<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Drain {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Middleware applying the drain policy in front of `S`.
#[derive(Clone, Debug)]
pub struct Drain<S> {
    inner: S,
    state: DrainState,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Drain<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Body<Data = Bytes>,
{
    type Response = Response<DrainBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    /// Once the middleware answers every request itself, the inner service is no
    /// longer readied. Capacity the inner service reserved before that point, such
    /// as a `ConcurrencyLimit` permit, is only released when this service is dropped.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.state.short_circuits_all() {
            return Poll::Ready(Ok(()));
        }
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let connection = req.extensions().get::<Connection>().cloned();
        let admission = self.state.admit(connection.as_ref());

        // Nothing else will be read from this connection. HTTP/2 peers ignore
        // `Connection: close`, so the server is told directly.
        if let (false, Some(connection)) = (matches!(admission, Admission::Pass), &connection) {
            connection.retire();
        }

        match admission {
            Admission::Pass => ResponseFuture::Inner {
                future: self.inner.call(req),
                close: false,
            },
            Admission::LastRequest => {
                trace!("serving last request on draining connection");
                ResponseFuture::Inner {
                    future: self.inner.call(req),
                    close: true,
                }
            }
            Admission::Reject(error) => {
                trace!(status = %error.status(), "rejecting request during shutdown");
                ResponseFuture::Ready {
                    response: Some(rejection(&error)),
                }
            }
            // The inner service is never called here: calling it could let the
            // request run to completion while the listener is closing.
            Admission::Drop => {
                trace!("dropping request during shutdown");
                ResponseFuture::Ready {
                    response: Some(dropped()),
                }
            }
        }
    }
}

/// Response future for [`Drain`].
#[pin_project(project = ResponseFutureProj)]
pub enum ResponseFuture<F> {
    Inner {
        #[pin]
        future: F,
        close: bool,
    },
    Ready {
        response: Option<Response<Full<Bytes>>>,
    },
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<DrainBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Inner { future, close } => {
                let mut response = ready!(future.poll(cx))?.map(Either::Left);
                if *close {
                    close_connection(&mut response);
                }
                Poll::Ready(Ok(response))
            }
            // Like a fused future, a completed response stays pending forever.
            ResponseFutureProj::Ready { response } => match response.take() {
                Some(response) => Poll::Ready(Ok(response.map(Either::Right))),
                None => Poll::Pending,
            },
        }
    }
}

fn close_connection<B>(response: &mut Response<B>) {
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
}

fn rejection(error: &Error) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(error.to_string())));
    *response.status_mut() = error.status();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    close_connection(&mut response);
    response
}

fn dropped() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    close_connection(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownOptions;
    use http::StatusCode;
    use http_body_util::{BodyExt, Empty};
    use std::convert::Infallible;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    impl Hits {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    type Req = Request<Empty<Bytes>>;
    type Res = Response<Full<Bytes>>;

    fn app(hits: Hits) -> impl Service<Req, Response = Res, Error = Infallible> + Clone {
        tower::service_fn(move |_req: Req| {
            let hits = hits.clone();
            async move {
                hits.0.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("Hello, World!"))))
            }
        })
    }

    /// Counts how often it is readied.
    #[derive(Clone, Default)]
    struct Readiness(Arc<AtomicUsize>);

    impl Service<Req> for Readiness {
        type Response = Res;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Res, Infallible>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _: Req) -> Self::Future {
            std::future::ready(Ok(Response::new(Full::new(Bytes::new()))))
        }
    }

    fn request(connection: Option<&Connection>) -> Request<Empty<Bytes>> {
        let mut req = Request::new(Empty::new());
        if let Some(connection) = connection {
            req.extensions_mut().insert(connection.clone());
        }
        req
    }

    fn draining(options: &ShutdownOptions) -> DrainState {
        let state = DrainState::new();
        state.request_shutdown().unwrap();
        state.start_draining(options.resolve().0.request_policy());
        state
    }

    async fn body(response: Response<DrainBody<Full<Bytes>>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn passes_through_before_shutdown() {
        let hits = Hits::default();
        let svc = DrainLayer::new(DrainState::new()).layer(app(hits.clone()));

        let response = svc.oneshot(request(Some(&Connection::new()))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONNECTION).is_none());
        assert_eq!(&body(response).await[..], b"Hello, World!");
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn rejects_with_default_error() {
        let hits = Hits::default();
        let state = draining(ShutdownOptions::new().reject_during_shutdown(true));
        let svc = DrainLayer::new(state).layer(app(hits.clone()));

        let response = svc.oneshot(request(Some(&Connection::new()))).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONNECTION], "close");
        assert_eq!(
            &body(response).await[..],
            b"Server unavailable, no new requests accepted during shutdown"
        );
        assert_eq!(hits.count(), 0);
    }

    #[tokio::test]
    async fn rejects_with_custom_error() {
        let hits = Hits::default();
        let state = draining(
            ShutdownOptions::new()
                .reject_during_shutdown(true)
                .rejection_error(|| {
                    Error::unavailable()
                        .with_status(StatusCode::GONE)
                        .with_message("moved on")
                }),
        );
        let svc = DrainLayer::new(state).layer(app(hits.clone()));

        let response = svc.oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(&body(response).await[..], b"moved on");
        assert_eq!(hits.count(), 0);
    }

    #[tokio::test]
    async fn last_request_runs_once_per_connection() {
        let hits = Hits::default();
        let state = draining(
            ShutdownOptions::new()
                .perform_last_request(true)
                .reject_during_shutdown(true),
        );
        let svc = DrainLayer::new(state).layer(app(hits.clone()));
        let connection = Connection::new();

        let first = svc
            .clone()
            .oneshot(request(Some(&connection)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[CONNECTION], "close");
        assert_eq!(&body(first).await[..], b"Hello, World!");

        for _ in 0..2 {
            let next = svc
                .clone()
                .oneshot(request(Some(&connection)))
                .await
                .unwrap();
            assert_eq!(next.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(next.headers()[CONNECTION], "close");
        }

        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn drops_silently_with_empty_200() {
        let hits = Hits::default();
        let state = draining(&ShutdownOptions::new());
        let svc = DrainLayer::new(state).layer(app(hits.clone()));

        let response = svc.oneshot(request(Some(&Connection::new()))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONNECTION], "close");
        assert!(body(response).await.is_empty());
        assert_eq!(hits.count(), 0);
    }

    #[tokio::test]
    async fn answered_requests_retire_the_connection() {
        let hits = Hits::default();
        let state = DrainState::new();
        let svc = DrainLayer::new(state.clone()).layer(app(hits.clone()));
        let connection = Connection::new();

        svc.clone().oneshot(request(Some(&connection))).await.unwrap();
        assert!(!connection.is_retired());

        state.request_shutdown().unwrap();
        let options = ShutdownOptions::new().perform_last_request(true).clone();
        state.start_draining(options.resolve().0.request_policy());

        let last = svc.oneshot(request(Some(&connection))).await.unwrap();
        assert_eq!(last.status(), StatusCode::OK);
        assert!(connection.is_retired());
        assert!(!connection.is_destroyed());
        assert_eq!(hits.count(), 2);
    }

    #[tokio::test]
    async fn inner_service_is_not_readied_once_everything_short_circuits() {
        let readiness = Readiness::default();
        let state = DrainState::new();
        let mut svc = DrainLayer::new(state.clone()).layer(readiness.clone());

        svc.ready().await.unwrap();
        assert_eq!(readiness.0.load(Ordering::SeqCst), 1);

        state.request_shutdown().unwrap();
        let options = ShutdownOptions::new().reject_during_shutdown(true).clone();
        state.start_draining(options.resolve().0.request_policy());

        let response = svc.ready().await.unwrap().call(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readiness.0.load(Ordering::SeqCst), 1);
    }
}
