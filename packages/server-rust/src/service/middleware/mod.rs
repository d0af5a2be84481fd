//! Stock operation middleware, written as tower layers.
//!
//! [`from_layer`] adapts any `tower::Layer` over [`NextService`] into a
//! switchyard [`Middleware`], so the rest of a chain can be treated as a
//! `Service<Invocation>`.
//!
//! - [`timeout`]: per-call deadline (504)
//! - [`load_shed`]: semaphore-based concurrency limit (503)
//! - [`metrics`]: span plus counters and duration histogram
//! - [`pipeline`]: all three, from a [`ServiceConfig`](crate::service::ServiceConfig)

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use switchyard_core::{HandlerResult, Invocation, Middleware, Next, ProcedureError, Reply};
use tower::{Layer, Service, ServiceExt};

pub use self::load_shed::LoadShedLayer;
pub use self::metrics::MetricsLayer;
pub use self::pipeline::standard_middleware;
pub use self::timeout::TimeoutLayer;

/// The remainder of a middleware chain as a tower service.
#[derive(Debug, Clone)]
pub struct NextService {
    next: Next,
}

impl Service<Invocation> for NextService {
    type Response = Reply;
    type Error = ProcedureError;
    type Future = BoxFuture<'static, HandlerResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        self.next.run(inv)
    }
}

/// Wraps a tower layer as operation middleware. The layer is applied once
/// per call; state it holds (semaphores, counters) is shared across calls.
pub fn from_layer<L>(name: &'static str, layer: L) -> Middleware
where
    L: Layer<NextService> + Send + Sync + 'static,
    L::Service: Service<Invocation, Response = Reply, Error = ProcedureError> + Send + 'static,
    <L::Service as Service<Invocation>>::Future: Send + 'static,
{
    Middleware::new(name, move |inv, next| layer.layer(NextService { next }).oneshot(inv))
}

/// Fails calls that run longer than `duration` with a 504.
#[must_use]
pub fn timeout(duration: Duration) -> Middleware {
    from_layer("timeout", TimeoutLayer::new(duration))
}

/// Rejects calls with a 503 while `max_concurrent` calls through this
/// middleware instance are already running.
#[must_use]
pub fn concurrency_limit(max_concurrent: u32) -> Middleware {
    from_layer("concurrency_limit", LoadShedLayer::new(max_concurrent))
}

/// Records a span, a call counter, and a duration histogram per call.
#[must_use]
pub fn metrics() -> Middleware {
    from_layer("metrics", MetricsLayer)
}
