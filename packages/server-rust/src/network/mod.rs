//! Transport surfaces, configuration, connection tracking, and shutdown.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use handlers::{AppState, ServerHandle};
pub use server::Server;
pub use shutdown::*;
