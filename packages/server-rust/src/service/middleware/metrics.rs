//! Span, counter, and duration histogram per call.
//!
//! Emits through the `metrics` facade; with no recorder installed the
//! counters are no-ops and only the tracing output remains.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::{Invocation, ProcedureError, Reply, Transport};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

pub const OPERATIONS_TOTAL: &str = "switchyard_operations_total";
pub const OPERATION_DURATION_SECONDS: &str = "switchyard_operation_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let operation = inv.operation.to_string();
        let transport = match inv.ctx.transport() {
            Transport::Request(_) => "request",
            Transport::Connection(_) => "connection",
        };
        let span = info_span!(
            "operation",
            operation = %operation,
            transport,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(inv);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok".to_owned(),
                    Err(err) => err.name().to_owned(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome.as_str());

                metrics::counter!(
                    OPERATIONS_TOTAL,
                    "operation" => operation.clone(),
                    "outcome" => outcome.clone(),
                )
                .increment(1);
                metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation.clone())
                    .record(elapsed.as_secs_f64());

                tracing::info!(operation = %operation, duration_ms, outcome = %outcome, "operation complete");
                result
            }
            .instrument(span),
        )
    }
}
