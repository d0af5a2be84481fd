//! Switchyard Core: typed operation declaration, middleware composition, and
//! module compilation into a transport-independent dispatch table.
//!
//! ```text
//! Module --build--> CompiledModule { operation path -> Handler, routes, events }
//! ```

pub mod context;
pub mod envelope;
pub mod error;
pub mod events;
pub mod manifest;
pub mod middleware;
pub mod module;
pub mod procedure;
pub mod schema;
pub mod signing;
pub mod types;

pub use context::{
    to_values, ConnectionMeta, ContextValues, Derivation, ExecutionContext, RequestMeta,
    ServerInstance, Transport, UpgradeData, UpgradeDerivation,
};
pub use envelope::{Envelope, EnvelopeResponse};
pub use error::{ConfigError, Issue, PathSegment, ProcedureError, TransportError, ValidationFailure};
pub use events::{EventBus, EventKind, Listener, ServerEvent};
pub use manifest::ManifestNode;
pub use middleware::{compose, handler_fn, Handler, HandlerResult, Invocation, Middleware, Next, Reply};
pub use module::{CompiledModule, Module, RouteDescriptor};
pub use procedure::{Exposure, OperationBuilder, OperationFactory, OperationTree};
pub use schema::{serde_schema, FnSchema, Schema, SerdeSchema, ValidationResult};
pub use types::{DeclId, OperationId};
