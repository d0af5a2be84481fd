//! Dispatch entry points: request/reply routes and the message transport.

pub mod body;
pub mod http;
pub mod websocket;

pub use self::http::mount_routes;
pub use self::websocket::ws_upgrade_handler;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use switchyard_core::{CompiledModule, OperationId, ProcedureError, ServerEvent, ServerInstance};

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};

/// State shared by every axum handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub compiled: Arc<CompiledModule>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// What handlers see as `ctx.server()`.
    pub instance: Arc<dyn ServerInstance>,
}

impl AppState {
    /// Emits an `Error` event for a failed call.
    pub(crate) fn report(&self, operation: Option<OperationId>, error: ProcedureError) -> Arc<ProcedureError> {
        let error = Arc::new(error);
        self.compiled.events().emit(&ServerEvent::Error {
            operation,
            error: Arc::clone(&error),
        });
        error
    }
}

/// The running server as seen from inside an operation.
#[derive(Debug)]
pub struct ServerHandle {
    registry: Arc<ConnectionRegistry>,
    started: Instant,
}

impl ServerHandle {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            started: Instant::now(),
        }
    }
}

impl ServerInstance for ServerHandle {
    fn connection_count(&self) -> usize {
        self.registry.count()
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Runs `call`, turning a panic into an internal error so nothing escapes
/// an entry point.
pub(crate) async fn guarded<T, F>(call: F) -> Result<T, ProcedureError>
where
    F: Future<Output = Result<T, ProcedureError>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(ProcedureError::Internal(anyhow::anyhow!(
                "operation panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}


#[cfg(test)]
mod tests {
    use switchyard_core::{Reply, ServerInstance};

    use super::*;

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let result = guarded(async {
            if true {
                panic!("boom");
            }
            Ok(Reply::Empty)
        })
        .await;
        let err = result.err().unwrap();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn server_handle_reports_connection_count() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = ServerHandle::new(Arc::clone(&registry));
        let (_conn, _rx) = registry.register(&NetworkConfig::default().connection, Default::default());
        assert_eq!(handle.connection_count(), 1);
    }
}
