use crate::metrics::http::HttpMetrics;
use axum::http::{Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use pin_project::pin_project;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::debug;

/// A middleware for call metrics. Uses [`HttpMetrics`].
#[derive(Clone)]
pub struct HttpCallMetrics<S> {
    inner: S,
}

/// A layer for call metrics. Uses [`HttpCallMetrics`].
#[derive(Clone, Default)]
pub struct HttpCallMetricsLayer;

impl<S> Layer<S> for HttpCallMetricsLayer {
    type Service = HttpCallMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpCallMetrics { inner }
    }
}

impl<S, B> Service<Request<B>> for HttpCallMetrics<S>
where
    S: Service<Request<B>>,
    S::Response: IntoResponse,
{
    type Response = Response;
    type Error = S::Error;
    type Future = HttpCallMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // We start tracking request time before the first call to the future.
        let tracker = HttpCallMetricTracker::start(&request);
        HttpCallMetricsFuture {
            future: self.inner.call(request),
            tracker,
        }
    }
}

/// A future returned from the [`HttpCallMetrics`].
#[pin_project]
pub struct HttpCallMetricsFuture<F> {
    #[pin]
    future: F,
    tracker: HttpCallMetricTracker,
}

impl<F, R, E> Future for HttpCallMetricsFuture<F>
where
    F: Future<Output = Result<R, E>>,
    R: IntoResponse,
{
    type Output = Result<Response, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = match this.future.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };

        Poll::Ready(match result {
            Ok(reply) => {
                let response = reply.into_response();
                this.tracker
                    .set_state(ResultState::Result(response.status(), response.version()));
                Ok(response)
            }
            Err(e) => {
                this.tracker.set_state(ResultState::Failed);
                Err(e)
            }
        })
    }
}

/// A metrics tracker. Will call [`HttpMetrics::inc_in_flight`]
/// on construction and [`HttpMetrics::dec_in_flight`] on drop.
///
/// [`HttpCallMetricsFuture`] cannot implement [`Drop`] itself because of
/// [`pin_project`](pin_project::pin_project).
struct HttpCallMetricTracker {
    version: Version,
    method: Method,
    path: String,
    start: Instant,
    state: Cell<ResultState>,
}

enum ResultState {
    /// The result was already processed.
    None,
    /// Request was started.
    Started,
    /// The result failed with an error.
    Failed,
    /// The result is an actual HTTP response.
    Result(StatusCode, Version),
}

impl HttpCallMetricTracker {
    fn start<B>(request: &Request<B>) -> Self {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let version = request.version();

        debug!("Start processing {version:?} {method} {path}");
        HttpMetrics::inc_in_flight(&path);
        Self {
            version,
            method,
            path,
            start: Instant::now(),
            state: Cell::new(ResultState::Started),
        }
    }

    fn set_state(&self, state: ResultState) {
        self.state.set(state)
    }

    fn duration(&self) -> Duration {
        Instant::now() - self.start
    }
}

impl Drop for HttpCallMetricTracker {
    fn drop(&mut self) {
        match self.state.replace(ResultState::None) {
            ResultState::None => return,
            ResultState::Started => {
                // The request was dropped before it produced a result.
            }
            ResultState::Failed => {
                let duration = self.duration();
                debug!(
                    "Fail processing {version:?} {method} {path} - {duration:?}",
                    version = self.version,
                    method = self.method,
                    path = self.path
                );
                HttpMetrics::track(&self.path, &self.method, 0, duration);
            }
            ResultState::Result(status, version) => {
                let duration = self.duration();
                debug!(
                    "Done processing {request_version:?} {method} {path}: {version:?} {status} - {duration:?}",
                    request_version = self.version,
                    method = self.method,
                    path = self.path
                );
                HttpMetrics::track(&self.path, &self.method, status.as_u16(), duration);
            }
        }

        HttpMetrics::dec_in_flight(&self.path);
    }
}
