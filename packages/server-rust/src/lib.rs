//! Switchyard server: serves a compiled [`switchyard_core::Module`] over
//! HTTP request/reply routes and a `WebSocket` message transport.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use switchyard_core::{Module, OperationTree, Reply};
//! use switchyard_server::{NetworkConfig, Server};
//!
//! let module = Module::new("app").procedures(|f| {
//!     OperationTree::new().operation(
//!         "echo",
//!         f.operation().handler_raw(|inv| async move { Ok(Reply::Value(inv.input)) }),
//!     )
//! });
//! let mut server = Server::new(&module, NetworkConfig::default())?;
//! server.start().await?;
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod network;
pub mod service;

pub use network::{
    AppState, ConnectionConfig, ConnectionHandle, ConnectionId, ConnectionRegistry, HealthState,
    NetworkConfig, OutboundMessage, Server, ServerHandle, ShutdownController,
};
pub use service::{standard_middleware, ServiceConfig};
