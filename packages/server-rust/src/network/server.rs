//! Server lifecycle over a compiled module.
//!
//! `new()` compiles the module and allocates shared state, `start()` binds
//! the listener, and `serve()` accepts connections until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use switchyard_core::{CompiledModule, ConfigError, Module, ServerEvent, ServerInstance};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::handlers::{mount_routes, ws_upgrade_handler, AppState, ServerHandle};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves a compiled module over request/reply routes and the message
/// transport.
pub struct Server {
    config: NetworkConfig,
    compiled: Arc<CompiledModule>,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    instance: Arc<dyn ServerInstance>,
}

impl Server {
    /// Compiles `module` (freezing it) and prepares shared state. Nothing is
    /// bound yet.
    ///
    /// # Errors
    ///
    /// Returns the module's `ConfigError`, `InvalidPath` when a route path
    /// or the message-transport path uses router capture syntax, or
    /// `DuplicateRoute` when an exposed operation claims the
    /// message-transport path.
    pub fn new(module: &Module, config: NetworkConfig) -> Result<Self, ConfigError> {
        let compiled = module.build()?;
        check_path(&config.ws_path)?;
        for route in compiled.routes() {
            check_path(&route.path)?;
        }
        if let Some(route) = compiled.routes().iter().find(|r| r.path == config.ws_path) {
            return Err(ConfigError::DuplicateRoute {
                method: route.method_label().to_owned(),
                path: route.path.clone(),
            });
        }

        let registry = Arc::new(ConnectionRegistry::new());
        Ok(Self {
            instance: Arc::new(ServerHandle::new(Arc::clone(&registry))),
            config,
            compiled,
            listener: None,
            registry,
            shutdown: Arc::new(ShutdownController::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn compiled(&self) -> Arc<CompiledModule> {
        Arc::clone(&self.compiled)
    }

    fn state(&self) -> AppState {
        AppState {
            compiled: Arc::clone(&self.compiled),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            instance: Arc::clone(&self.instance),
        }
    }

    /// Operation routes (only when some operation is exposed), the upgrade
    /// route, and the HTTP layer stack.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new();
        if self.compiled.serves_requests() {
            router = mount_routes(router, self.compiled.routes());
        }
        router
            .route(&self.config.ws_path, get(ws_upgrade_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state())
    }

    /// Binds the listener and emits `Started`. Returns the bound address,
    /// which carries the OS-assigned port when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let address = listener.local_addr()?;
        info!(%address, request_reply = self.compiled.serves_requests(), "listener bound");

        self.listener = Some(listener);
        self.compiled.events().emit(&ServerEvent::Started { address });
        Ok(address)
    }

    /// Serves until `shutdown` resolves, then closes live connections, waits
    /// for in-flight calls, and emits `Stopped`.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called or the listener hits a fatal I/O
    /// error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);
        controller.set_ready();

        let signal = {
            let controller = Arc::clone(&controller);
            async move {
                shutdown.await;
                info!("shutdown requested");
                controller.trigger_shutdown();
            }
        };
        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        drain_connections(&self.registry, &controller).await;
        self.compiled.events().emit(&ServerEvent::Stopped);
        Ok(())
    }
}

/// Route paths are mounted literally: they must start with `/` and no
/// segment may look like a capture (`{id}`, `*rest`, `:id`).
fn check_path(path: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };
    if !path.starts_with('/') {
        return Err(invalid("must start with `/`"));
    }
    for segment in path.split('/') {
        if segment.contains(['{', '}']) {
            return Err(invalid("braces are reserved for captures"));
        }
        if segment.starts_with(['*', ':']) {
            return Err(invalid("segments may not start with `*` or `:`"));
        }
    }
    Ok(())
}

/// Closes whatever connections remain and waits for in-flight calls.
async fn drain_connections(registry: &ConnectionRegistry, controller: &ShutdownController) {
    controller.trigger_shutdown();

    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!(connections = handles.len(), "closing remaining connections");
        for handle in &handles {
            let _ = handle.try_send(OutboundMessage::Close(Some("server shutting down".to_string())));
        }
    }

    if controller.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("drained");
    } else {
        warn!(
            in_flight = controller.in_flight_count(),
            "drain timed out with calls still in flight"
        );
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use switchyard_core::{OperationTree, Reply};

    use super::*;
    use crate::network::HealthState;

    fn echo_module(path: Option<&'static str>) -> Module {
        Module::new("echo").procedures(move |f| {
            let op = f
                .operation()
                .handler_raw(|inv| async move { Ok(Reply::Value(inv.input)) });
            let op = match path {
                Some(path) => op.path(path),
                None => op,
            };
            OperationTree::new().operation("echo", op)
        })
    }

    #[test]
    fn new_compiles_and_freezes_module() {
        let module = echo_module(None);
        let server = Server::new(&module, NetworkConfig::default()).unwrap();
        assert!(module.is_frozen());
        assert!(server.compiled().contains("echo"));
        assert!(!server.compiled().serves_requests());
        assert!(Arc::ptr_eq(&server.registry(), &server.registry()));
    }

    #[test]
    fn new_rejects_invalid_module() {
        let module = Module::new("broken").procedures(|f| {
            OperationTree::new().operation("missing", f.operation().method(Method::GET))
        });
        assert!(matches!(
            Server::new(&module, NetworkConfig::default()),
            Err(ConfigError::MissingHandler { .. })
        ));
    }

    #[test]
    fn new_rejects_route_on_transport_path() {
        let result = Server::new(&echo_module(Some("/ws")), NetworkConfig::default());
        assert!(matches!(result, Err(ConfigError::DuplicateRoute { path, .. }) if path == "/ws"));
    }

    #[test]
    fn new_rejects_capture_syntax_in_route_paths() {
        for key in ["*all", "{id}", ":id"] {
            let module = Module::new("captures").procedures(move |f| {
                OperationTree::new().operation(
                    key,
                    f.operation()
                        .expose()
                        .handler_raw(|_inv| async { Ok(Reply::Empty) }),
                )
            });
            let result = Server::new(&module, NetworkConfig::default());
            assert!(
                matches!(&result, Err(ConfigError::InvalidPath { path, .. }) if path == &format!("/{key}")),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn new_rejects_relative_transport_path() {
        let config = NetworkConfig {
            ws_path: "ws".to_string(),
            ..NetworkConfig::default()
        };
        let result = Server::new(&echo_module(None), config);
        assert!(matches!(result, Err(ConfigError::InvalidPath { path, .. }) if path == "ws"));
    }

    #[test]
    fn valid_paths_build_a_router() {
        let server = Server::new(&echo_module(Some("/api/echo")), NetworkConfig::default()).unwrap();
        let _router = server.build_router();
    }

    #[tokio::test]
    async fn start_binds_os_assigned_port() {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut server = Server::new(&echo_module(None), config).unwrap();
        let address = server.start().await.unwrap();
        assert!(address.port() > 0);
    }

    #[tokio::test]
    async fn serve_without_start_fails() {
        let server = Server::new(&echo_module(None), NetworkConfig::default()).unwrap();
        let err = server.serve(async {}).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_when_signalled() {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut server = Server::new(&echo_module(Some("/echo")), config).unwrap();
        server.start().await.unwrap();
        let controller = server.shutdown_controller();

        server.serve(async {}).await.unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
