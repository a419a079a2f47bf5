use std::{convert::Infallible, time::Duration};

use axum::{
    http::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::warn;

use crate::server::ApiError;

/// Upper bound on the time a single request may spend inside the router.
/// Requests that exceed it are answered with a 500.
#[derive(Clone, Copy, Debug)]
pub struct RequestTimeoutLayer {
    timeout: Duration,
}

pub fn request_timeout_layer(timeout: Duration) -> RequestTimeoutLayer {
    RequestTimeoutLayer { timeout }
}

impl<S> Layer<S> for RequestTimeoutLayer {
    type Service = RequestTimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestTimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Clone)]
pub struct RequestTimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RequestTimeoutService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let timeout = self.timeout;
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        Box::pin(async move {
            match tokio::time::timeout(timeout, inner.call(request)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(
                        %method,
                        path,
                        timeout_ms = timeout.as_millis() as u64,
                        "request timed out"
                    );
                    Ok(ApiError::internal("request timed out").into_response())
                }
            }
        })
    }
}
