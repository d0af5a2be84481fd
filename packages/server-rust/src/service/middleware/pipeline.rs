//! The stock middleware stack as a single chain entry.

use switchyard_core::Middleware;
use tower::ServiceBuilder;

use super::from_layer;
use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServiceConfig;

/// Load shedding, then the deadline, then metrics, as one middleware.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded, before any work
/// 2. `TimeoutLayer` -- enforce the per-call deadline
/// 3. `MetricsLayer` -- time and count the call, closest to the handler
///
/// Shed and timed-out calls therefore never reach the metrics layer.
#[must_use]
pub fn standard_middleware(config: &ServiceConfig) -> Middleware {
    let stack = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .layer(TimeoutLayer::new(config.operation_timeout()))
        .layer(MetricsLayer);
    from_layer("standard", stack)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use switchyard_core::{compose, handler_fn, Invocation, ProcedureError, Reply};

    use super::super::test_support::invocation;
    use super::*;

    #[tokio::test]
    async fn runs_calls_through_every_layer() {
        let handler = handler_fn(|inv: Invocation| async move {
            Ok(Reply::Value(json!({ "op": inv.operation.as_str() })))
        });
        let chain = compose(vec![standard_middleware(&ServiceConfig::default())], handler);
        let reply = chain(invocation("math.add", json!(null))).await.unwrap();
        assert_eq!(reply.into_value(), json!({ "op": "math.add" }));
    }

    #[tokio::test(start_paused = true)]
    async fn applies_configured_deadline() {
        let handler = handler_fn(|_inv: Invocation| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Reply::Empty)
        });
        let config = ServiceConfig {
            default_operation_timeout_ms: 100,
            ..ServiceConfig::default()
        };
        let chain = compose(vec![standard_middleware(&config)], handler);
        let err = chain(invocation("slow", json!(null))).await.unwrap_err();
        assert!(matches!(err, ProcedureError::Timeout { timeout_ms: 100 }));
    }

    #[test]
    fn named_standard() {
        assert_eq!(standard_middleware(&ServiceConfig::default()).name(), "standard");
    }
}
