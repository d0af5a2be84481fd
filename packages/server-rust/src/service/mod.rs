//! Operation-level middleware built on tower.
//!
//! These layers run inside an operation's chain, after context derivation
//! and before validation, and apply equally to both transports.

pub mod config;
pub mod middleware;

pub use config::ServiceConfig;
pub use middleware::{
    concurrency_limit, from_layer, metrics, standard_middleware, timeout, NextService,
};
