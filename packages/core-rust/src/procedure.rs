//! Operations: declaration, tree flattening, and compilation.
//!
//! An [`OperationBuilder`] collects an optional input schema, an optional
//! output schema, a handler, operation-scoped middleware, and exposure
//! metadata. [`OperationBuilder::compile_with`] turns it into a single
//! [`Handler`]:
//!
//! ```text
//! outer middleware .. own middleware -> input validation -> handler -> output validation
//! ```

use std::future::Future;
use std::sync::Arc;

use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{ConfigError, ProcedureError, ValidationFailure};
use crate::middleware::{compose, handler_fn, Handler, HandlerResult, Invocation, Middleware, Reply};
use crate::schema::{validate, Schema, SharedSchema};
use crate::types::OperationId;

// ---------------------------------------------------------------------------
// Exposure
// ---------------------------------------------------------------------------

/// Request/reply exposure metadata for an operation.
///
/// Every operation is reachable over the message transport; `enabled`
/// additionally registers it as a request/reply route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exposure {
    pub enabled: bool,
    /// Restricts the route to one method. `None` accepts any method.
    pub method: Option<Method>,
    /// Overrides the route path (defaults to `/<operation path>`).
    pub path: Option<String>,
}

// ---------------------------------------------------------------------------
// OperationBuilder
// ---------------------------------------------------------------------------

/// Fluent declaration of a single operation.
#[derive(Clone, Default)]
pub struct OperationBuilder {
    input: Option<SharedSchema>,
    output: Option<SharedSchema>,
    handler: Option<Handler>,
    handler_redefined: bool,
    middleware: Vec<Middleware>,
    exposure: Exposure,
}

impl OperationBuilder {
    /// Creates an operation with the given exposure defaults.
    #[must_use]
    pub fn new(exposure: Exposure) -> Self {
        Self {
            exposure,
            ..Self::default()
        }
    }

    /// Validates (and possibly transforms) the input before the handler runs.
    #[must_use]
    pub fn input(mut self, schema: impl Schema + 'static) -> Self {
        self.input = Some(Arc::new(schema));
        self
    }

    /// Validates (and possibly transforms) the handler's result.
    #[must_use]
    pub fn output(mut self, schema: impl Schema + 'static) -> Self {
        self.output = Some(Arc::new(schema));
        self
    }

    /// Sets a handler over the raw [`Invocation`].
    ///
    /// An operation takes exactly one handler; setting a second one makes
    /// compilation fail with [`ConfigError::HandlerRedefined`].
    #[must_use]
    pub fn handler_raw<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.set_handler(handler_fn(f))
    }

    /// Sets a typed handler. The input is deserialized into `I` (failing as a
    /// validation error) and the output serialized from `O`.
    #[must_use]
    pub fn handle<I, O, F, Fut>(self, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize,
        F: Fn(I, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ProcedureError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.set_handler(handler_fn(move |inv: Invocation| {
            let f = Arc::clone(&f);
            async move {
                let input: I = serde_json::from_value(inv.input)
                    .map_err(|err| ValidationFailure::single(err.to_string()))?;
                let output = f(input, inv.ctx).await?;
                let value = serde_json::to_value(output).map_err(anyhow::Error::from)?;
                Ok(Reply::Value(value))
            }
        }))
    }

    fn set_handler(mut self, handler: Handler) -> Self {
        if self.handler.is_some() {
            self.handler_redefined = true;
        }
        self.handler = Some(handler);
        self
    }

    /// Adds operation-scoped middleware. Runs inside module-level middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Registers the operation as a request/reply route.
    #[must_use]
    pub fn expose(mut self) -> Self {
        self.exposure.enabled = true;
        self
    }

    /// Keeps the operation off the request/reply surface.
    #[must_use]
    pub fn hide(mut self) -> Self {
        self.exposure.enabled = false;
        self
    }

    /// Exposes the operation for one method only.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.exposure.enabled = true;
        self.exposure.method = Some(method);
        self
    }

    /// Exposes the operation under a custom route path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.exposure.enabled = true;
        self.exposure.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn exposure(&self) -> &Exposure {
        &self.exposure
    }

    /// Compiles the operation with only its own middleware.
    ///
    /// # Errors
    ///
    /// See [`OperationBuilder::compile_with`].
    pub fn compile(&self, operation: &OperationId) -> Result<Handler, ConfigError> {
        self.compile_with(operation, &[])
    }

    /// Compiles the operation with `outer` middleware wrapped around its own.
    ///
    /// With no schemas and no middleware at all the raw handler is returned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingHandler` when no handler was set and
    /// `ConfigError::HandlerRedefined` when more than one was.
    pub fn compile_with(
        &self,
        operation: &OperationId,
        outer: &[Middleware],
    ) -> Result<Handler, ConfigError> {
        let Some(handler) = self.handler.clone() else {
            return Err(ConfigError::MissingHandler {
                operation: operation.to_string(),
            });
        };
        if self.handler_redefined {
            return Err(ConfigError::HandlerRedefined {
                operation: operation.to_string(),
            });
        }

        let mut layers: Vec<Middleware> = outer.to_vec();
        layers.extend(self.middleware.iter().cloned());
        if self.input.is_none() && self.output.is_none() && layers.is_empty() {
            return Ok(handler);
        }

        let validated = with_validation(handler, self.input.clone(), self.output.clone());
        Ok(compose(layers, validated))
    }
}

/// Wraps `handler` with input validation before it and output validation
/// after it.
fn with_validation(
    handler: Handler,
    input: Option<SharedSchema>,
    output: Option<SharedSchema>,
) -> Handler {
    if input.is_none() && output.is_none() {
        return handler;
    }
    handler_fn(move |mut inv: Invocation| {
        let handler = Arc::clone(&handler);
        let input = input.clone();
        let output = output.clone();
        async move {
            if let Some(schema) = &input {
                inv.input = validate(schema.as_ref(), inv.input).await?;
            }
            let reply = handler(inv).await?;
            let Some(schema) = &output else {
                return Ok(reply);
            };
            match reply {
                Reply::Value(value) => Ok(Reply::Value(validate(schema.as_ref(), value).await?)),
                Reply::Empty => Ok(Reply::Value(validate(schema.as_ref(), Value::Null).await?)),
                raw @ Reply::Raw(_) => Ok(raw),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// OperationFactory
// ---------------------------------------------------------------------------

/// Creates operation builders bound to a module's exposure defaults.
#[derive(Debug, Clone, Default)]
pub struct OperationFactory {
    defaults: Exposure,
}

impl OperationFactory {
    #[must_use]
    pub fn new(defaults: Exposure) -> Self {
        Self { defaults }
    }

    /// A fresh operation with no input schema.
    #[must_use]
    pub fn operation(&self) -> OperationBuilder {
        OperationBuilder::new(self.defaults.clone())
    }

    /// A fresh operation validating its input with `schema`.
    #[must_use]
    pub fn with_input(&self, schema: impl Schema + 'static) -> OperationBuilder {
        self.operation().input(schema)
    }
}

// ---------------------------------------------------------------------------
// OperationTree
// ---------------------------------------------------------------------------

/// Node of an operation tree.
#[derive(Clone)]
pub enum TreeNode {
    Operation(OperationBuilder),
    Branch(OperationTree),
}

/// Ordered mapping from keys to operations or nested trees.
#[derive(Clone, Default)]
pub struct OperationTree {
    entries: Vec<(String, TreeNode)>,
}

impl OperationTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn operation(mut self, key: impl Into<String>, operation: OperationBuilder) -> Self {
        self.entries.push((key.into(), TreeNode::Operation(operation)));
        self
    }

    #[must_use]
    pub fn branch(mut self, key: impl Into<String>, tree: OperationTree) -> Self {
        self.entries.push((key.into(), TreeNode::Branch(tree)));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flattens depth-first, joining ancestor keys with `/`. Duplicates are
    /// preserved so the module compiler can report them.
    #[must_use]
    pub fn flatten(self) -> Vec<(OperationId, OperationBuilder)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        flatten_into(self, &mut prefix, &mut out);
        out
    }
}

fn flatten_into(
    tree: OperationTree,
    prefix: &mut Vec<String>,
    out: &mut Vec<(OperationId, OperationBuilder)>,
) {
    for (key, node) in tree.entries {
        prefix.push(key);
        match node {
            TreeNode::Operation(op) => out.push((OperationId::from_segments(prefix), op)),
            TreeNode::Branch(sub) => flatten_into(sub, prefix, out),
        }
        prefix.pop();
    }
}
