//! Middleware chain compiler.
//!
//! A [`Middleware`] receives the [`Invocation`] and a [`Next`] continuation.
//! [`compose`] turns `[m1, m2, ..., mn]` plus a terminal handler into a single
//! [`Handler`] where `m1` runs first and `mn`'s `next` reaches the handler.
//!
//! `Next` is a plain value: not calling it short-circuits the chain, calling
//! it twice runs the inner chain twice. Errors propagate outward unchanged.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::ProcedureError;
use crate::types::{DeclId, OperationId};

// ---------------------------------------------------------------------------
// Invocation / Reply
// ---------------------------------------------------------------------------

/// Input to a single call: the operation being invoked, its raw (or already
/// validated) input, and the execution context.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub operation: OperationId,
    pub input: Value,
    pub ctx: ExecutionContext,
}

/// Value returned by a handler.
#[derive(Debug)]
pub enum Reply {
    /// JSON result.
    Value(Value),
    /// No result (empty success).
    Empty,
    /// A transport response passed through unchanged on request/reply.
    Raw(http::Response<Vec<u8>>),
}

impl Reply {
    /// The JSON view of this reply, used by message-based transports.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Empty => Value::Null,
            Self::Raw(response) => {
                Value::String(String::from_utf8_lossy(response.body()).into_owned())
            }
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Outcome of a handler or middleware layer.
pub type HandlerResult = Result<Reply, ProcedureError>;

/// Compiled, type-erased callable for one operation.
pub type Handler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |inv| Box::pin(f(inv)))
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

type MiddlewareFn = dyn Fn(Invocation, Next) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A middleware layer with a stable identity.
///
/// Clones share the identity, so registering the same middleware through
/// several modules contributes it once.
#[derive(Clone)]
pub struct Middleware {
    id: DeclId,
    name: &'static str,
    func: Arc<MiddlewareFn>,
}

impl Middleware {
    /// Creates a named middleware from an async closure.
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(Invocation, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            id: DeclId::next(),
            name,
            func: Arc::new(move |inv, next| Box::pin(f(inv, next))),
        }
    }

    #[must_use]
    pub fn id(&self) -> DeclId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Continuation into the next-innermost layer of a composed chain.
#[derive(Clone)]
pub struct Next {
    layers: Arc<[Middleware]>,
    index: usize,
    terminal: Handler,
}

impl Next {
    /// Runs the rest of the chain with `inv`.
    pub fn run(&self, inv: Invocation) -> BoxFuture<'static, HandlerResult> {
        match self.layers.get(self.index) {
            Some(layer) => {
                let next = Self {
                    layers: Arc::clone(&self.layers),
                    index: self.index + 1,
                    terminal: Arc::clone(&self.terminal),
                };
                (layer.func)(inv, next)
            }
            None => (self.terminal)(inv),
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.layers.len().saturating_sub(self.index))
            .finish()
    }
}

/// Composes `layers` around `terminal` in registration order (first
/// registered is outermost). An empty chain returns `terminal` itself.
#[must_use]
pub fn compose(layers: Vec<Middleware>, terminal: Handler) -> Handler {
    if layers.is_empty() {
        return terminal;
    }
    let entry = Next {
        layers: layers.into(),
        index: 0,
        terminal,
    };
    Arc::new(move |inv| entry.run(inv))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::context::test_support::request_ctx;

    fn invocation(input: Value) -> Invocation {
        Invocation {
            operation: OperationId::from("test"),
            input,
            ctx: request_ctx(),
        }
    }

    fn tracing_layer(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        Middleware::new(label, move |inv, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{label}-enter"));
                let result = next.run(inv).await;
                log.lock().push(format!("{label}-exit"));
                result
            }
        })
    }

    #[tokio::test]
    async fn layers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let handler = handler_fn(move |inv| {
            let log = Arc::clone(&handler_log);
            async move {
                log.lock().push("h".to_owned());
                Ok(Reply::Value(inv.input))
            }
        });
        let composed = compose(
            vec![
                tracing_layer("m1", Arc::clone(&log)),
                tracing_layer("m2", Arc::clone(&log)),
                tracing_layer("m3", Arc::clone(&log)),
            ],
            handler,
        );

        let reply = composed(invocation(json!(1))).await.unwrap();
        assert!(matches!(reply, Reply::Value(v) if v == json!(1)));
        assert_eq!(
            *log.lock(),
            vec!["m1-enter", "m2-enter", "m3-enter", "h", "m3-exit", "m2-exit", "m1-exit"]
        );
    }

    #[tokio::test]
    async fn skipping_next_short_circuits() {
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        let handler = handler_fn(move |_inv| {
            let flag = Arc::clone(&flag);
            async move {
                *flag.lock() = true;
                Ok(Reply::Empty)
            }
        });
        let guard = Middleware::new("guard", |_inv, _next| async {
            Ok(Reply::Value(json!("cached")))
        });
        let composed = compose(vec![guard], handler);
        let reply = composed(invocation(Value::Null)).await.unwrap();
        assert_eq!(reply.into_value(), json!("cached"));
        assert!(!*reached.lock());
    }

    #[tokio::test]
    async fn calling_next_twice_reruns_inner_chain() {
        let calls = Arc::new(Mutex::new(0_u32));
        let counted = Arc::clone(&calls);
        let handler = handler_fn(move |_inv| {
            let counted = Arc::clone(&counted);
            async move {
                *counted.lock() += 1;
                Ok(Reply::Empty)
            }
        });
        let retry = Middleware::new("twice", |inv: Invocation, next: Next| async move {
            next.run(inv.clone()).await?;
            next.run(inv).await
        });
        compose(vec![retry], handler)(invocation(Value::Null)).await.unwrap();
        assert_eq!(*calls.lock(), 2);
    }

    #[tokio::test]
    async fn middleware_can_rewrite_input_and_context() {
        let handler = handler_fn(|inv| async move {
            let who = inv.ctx.get("who").cloned().unwrap_or(Value::Null);
            Ok(Reply::Value(json!([inv.input, who])))
        });
        let enrich = Middleware::new("enrich", |mut inv: Invocation, next: Next| async move {
            inv.ctx.insert("who", json!("mw"));
            inv.input = json!("rewritten");
            next.run(inv).await
        });
        let reply = compose(vec![enrich], handler)(invocation(json!("orig"))).await.unwrap();
        assert_eq!(reply.into_value(), json!(["rewritten", "mw"]));
    }

    #[tokio::test]
    async fn handler_errors_propagate_through_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_fn(|_inv| async { Err(ProcedureError::not_found("gone")) });
        let composed = compose(vec![tracing_layer("m1", Arc::clone(&log))], handler);
        let err = composed(invocation(Value::Null)).await.unwrap_err();
        assert!(matches!(err, ProcedureError::NotFound { .. }));
        assert_eq!(*log.lock(), vec!["m1-enter", "m1-exit"]);
    }

    #[test]
    fn empty_chain_returns_terminal() {
        let handler = handler_fn(|_inv| async { Ok(Reply::Empty) });
        let composed = compose(Vec::new(), Arc::clone(&handler));
        assert!(Arc::ptr_eq(&handler, &composed));
    }

    #[test]
    fn clones_share_identity() {
        let mw = Middleware::new("noop", |inv, next: Next| next.run(inv));
        let copy = mw.clone();
        assert_eq!(mw.id(), copy.id());
        assert_eq!(copy.name(), "noop");
    }
}
