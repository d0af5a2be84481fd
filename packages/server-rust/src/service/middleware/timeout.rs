//! Per-call deadline.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use switchyard_core::{Invocation, ProcedureError, Reply};
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Fails a call with `ProcedureError::Timeout` once `duration` elapses. The
/// inner future is dropped at that point.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    duration: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            duration: self.duration,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    duration: Duration,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = Reply, Error = ProcedureError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = ProcedureError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, ProcedureError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let duration = self.duration;
        let fut = self.inner.call(inv);
        Box::pin(async move {
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProcedureError::Timeout {
                    timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}
