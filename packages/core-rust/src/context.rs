//! Per-invocation execution context and the derivation steps that enrich it.
//!
//! Derivation steps run strictly in registration order; each one observes the
//! values merged by the steps before it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ProcedureError;
use crate::types::DeclId;

/// Key/value bag contributed by derivation steps.
pub type ContextValues = Map<String, Value>;

/// Converts a JSON object into [`ContextValues`]. Non-object values yield an
/// empty map.
#[must_use]
pub fn to_values(value: Value) -> ContextValues {
    match value {
        Value::Object(map) => map,
        _ => ContextValues::new(),
    }
}

// ---------------------------------------------------------------------------
// Transport handles
// ---------------------------------------------------------------------------

/// The serving instance, as seen by middleware and handlers.
pub trait ServerInstance: Send + Sync + fmt::Debug {
    /// Number of open message-based connections.
    fn connection_count(&self) -> usize;

    /// Time since the server started.
    fn uptime(&self) -> Duration;
}

/// Request-like handle for request/reply invocations and connection upgrades.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Correlation id assigned by the transport, if any.
    pub request_id: Option<String>,
}

/// Connection-like handle for message-based invocations.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Registry-assigned connection id.
    pub id: u64,
    /// Persistent data produced by upgrade derivation.
    pub data: ContextValues,
}

/// Which transport an invocation arrived on.
#[derive(Debug, Clone)]
pub enum Transport {
    Request(Arc<RequestMeta>),
    Connection(Arc<ConnectionMeta>),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Context threaded through every middleware layer and handler.
///
/// Owned by a single invocation; cloning is shallow for the transport and
/// server handles.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    server: Arc<dyn ServerInstance>,
    transport: Transport,
    values: ContextValues,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(server: Arc<dyn ServerInstance>, transport: Transport) -> Self {
        Self {
            server,
            transport,
            values: ContextValues::new(),
        }
    }

    /// Handle to the serving instance.
    #[must_use]
    pub fn server(&self) -> &Arc<dyn ServerInstance> {
        &self.server
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Request handle, when invoked over request/reply.
    #[must_use]
    pub fn request(&self) -> Option<&RequestMeta> {
        match &self.transport {
            Transport::Request(meta) => Some(meta),
            Transport::Connection(_) => None,
        }
    }

    /// Connection handle, when invoked over a persistent connection.
    #[must_use]
    pub fn connection(&self) -> Option<&ConnectionMeta> {
        match &self.transport {
            Transport::Connection(meta) => Some(meta),
            Transport::Request(_) => None,
        }
    }

    /// Looks up a derived value. Falls back to the connection's persistent
    /// data for message-based invocations.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values
            .get(key)
            .or_else(|| self.connection().and_then(|conn| conn.data.get(key)))
    }

    /// Looks up a derived value and deserializes it.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Derived values merged so far.
    #[must_use]
    pub fn values(&self) -> &ContextValues {
        &self.values
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Shallow merge: later keys replace earlier ones.
    pub fn merge(&mut self, values: ContextValues) {
        self.values.extend(values);
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

type DeriveFn =
    dyn Fn(&ExecutionContext) -> BoxFuture<'static, Result<ContextValues, ProcedureError>> + Send + Sync;

#[derive(Clone)]
enum DeriveKind {
    Static(ContextValues),
    Computed(Arc<DeriveFn>),
}

/// A context-derivation step: a static value bag or a function of the
/// context built so far.
#[derive(Clone)]
pub struct Derivation {
    id: DeclId,
    kind: DeriveKind,
}

impl Derivation {
    /// Contributes a fixed set of values.
    #[must_use]
    pub fn value(values: ContextValues) -> Self {
        Self {
            id: DeclId::next(),
            kind: DeriveKind::Static(values),
        }
    }

    /// Contributes values computed synchronously from the context.
    pub fn from_fn<F>(derive: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<ContextValues, ProcedureError> + Send + Sync + 'static,
    {
        Self::computed(Arc::new(move |ctx| Box::pin(std::future::ready(derive(ctx)))))
    }

    /// Contributes values computed asynchronously. The closure receives the
    /// context by reference and must move what it needs into the future.
    pub fn from_async<F, Fut>(derive: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ContextValues, ProcedureError>> + Send + 'static,
    {
        Self::computed(Arc::new(move |ctx| Box::pin(derive(ctx))))
    }

    fn computed(derive: Arc<DeriveFn>) -> Self {
        Self {
            id: DeclId::next(),
            kind: DeriveKind::Computed(derive),
        }
    }

    #[must_use]
    pub fn id(&self) -> DeclId {
        self.id
    }

    async fn apply(&self, ctx: &ExecutionContext) -> Result<ContextValues, ProcedureError> {
        match &self.kind {
            DeriveKind::Static(values) => Ok(values.clone()),
            DeriveKind::Computed(derive) => derive(ctx).await,
        }
    }
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeriveKind::Static(_) => "static",
            DeriveKind::Computed(_) => "computed",
        };
        f.debug_struct("Derivation")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

/// Applies `steps` to `ctx` one after another.
///
/// # Errors
///
/// Stops at the first failing step and returns its error.
pub async fn derive_context(
    mut ctx: ExecutionContext,
    steps: &[Derivation],
) -> Result<ExecutionContext, ProcedureError> {
    for step in steps {
        let produced = step.apply(&ctx).await?;
        ctx.merge(produced);
    }
    Ok(ctx)
}

// ---------------------------------------------------------------------------
// Upgrade derivation
// ---------------------------------------------------------------------------

/// Data computed once when a connection upgrades to message mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeData {
    /// Persistent per-connection data.
    pub data: ContextValues,
    /// Extra headers for the upgrade response.
    pub headers: HeaderMap,
}

impl UpgradeData {
    /// Merges `other` into `self`; `data` and `headers` merge independently
    /// and later entries replace earlier ones.
    pub fn merge(&mut self, other: UpgradeData) {
        self.data.extend(other.data);
        self.headers.extend(other.headers);
    }
}

type UpgradeFn =
    dyn Fn(&ExecutionContext) -> BoxFuture<'static, Result<UpgradeData, ProcedureError>> + Send + Sync;

#[derive(Clone)]
enum UpgradeKind {
    Static(UpgradeData),
    Computed(Arc<UpgradeFn>),
}

/// A connection-upgrade derivation step.
#[derive(Clone)]
pub struct UpgradeDerivation {
    id: DeclId,
    kind: UpgradeKind,
}

impl UpgradeDerivation {
    #[must_use]
    pub fn value(data: UpgradeData) -> Self {
        Self {
            id: DeclId::next(),
            kind: UpgradeKind::Static(data),
        }
    }

    pub fn from_fn<F>(derive: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<UpgradeData, ProcedureError> + Send + Sync + 'static,
    {
        Self {
            id: DeclId::next(),
            kind: UpgradeKind::Computed(Arc::new(move |ctx| {
                Box::pin(std::future::ready(derive(ctx)))
            })),
        }
    }

    pub fn from_async<F, Fut>(derive: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UpgradeData, ProcedureError>> + Send + 'static,
    {
        Self {
            id: DeclId::next(),
            kind: UpgradeKind::Computed(Arc::new(move |ctx| Box::pin(derive(ctx)))),
        }
    }

    #[must_use]
    pub fn id(&self) -> DeclId {
        self.id
    }
}

impl fmt::Debug for UpgradeDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeDerivation").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Runs upgrade steps in order. Each step sees the context with the `data`
/// merged so far layered on top of its derived values.
///
/// # Errors
///
/// Stops at the first failing step and returns its error.
pub async fn derive_upgrade(
    ctx: &ExecutionContext,
    steps: &[UpgradeDerivation],
) -> Result<UpgradeData, ProcedureError> {
    let mut merged = UpgradeData::default();
    let mut working = ctx.clone();
    for step in steps {
        let produced = match &step.kind {
            UpgradeKind::Static(data) => data.clone(),
            UpgradeKind::Computed(derive) => derive(&working).await?,
        };
        working.merge(produced.data.clone());
        merged.merge(produced);
    }
    Ok(merged)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use http::{HeaderMap, Method, Uri};

    use super::{ExecutionContext, RequestMeta, ServerInstance, Transport};

    #[derive(Debug)]
    pub struct StubServer;

    impl ServerInstance for StubServer {
        fn connection_count(&self) -> usize {
            0
        }

        fn uptime(&self) -> Duration {
            Duration::ZERO
        }
    }

    pub fn request_ctx() -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(StubServer),
            Transport::Request(Arc::new(RequestMeta {
                method: Method::POST,
                uri: Uri::from_static("/test"),
                headers: HeaderMap::new(),
                request_id: None,
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use serde_json::json;

    use super::test_support::{request_ctx, StubServer};
    use super::*;

    #[tokio::test]
    async fn derivations_run_in_order_and_see_earlier_values() {
        let steps = vec![
            Derivation::value(to_values(json!({"auth": true}))),
            Derivation::from_fn(|ctx| {
                let role = if ctx.get("auth") == Some(&json!(true)) { "admin" } else { "guest" };
                Ok(to_values(json!({ "role": role })))
            }),
        ];
        let ctx = derive_context(request_ctx(), &steps).await.unwrap();
        assert_eq!(ctx.get("role"), Some(&json!("admin")));
    }

    #[tokio::test]
    async fn later_steps_override_earlier_keys() {
        let steps = vec![
            Derivation::value(to_values(json!({"n": 1}))),
            Derivation::from_async(|ctx| {
                let n = ctx.get_as::<i64>("n").unwrap_or_default();
                async move { Ok(to_values(json!({ "n": n + 1 }))) }
            }),
        ];
        let ctx = derive_context(request_ctx(), &steps).await.unwrap();
        assert_eq!(ctx.get_as::<i64>("n"), Some(2));
    }

    #[tokio::test]
    async fn failing_step_stops_derivation() {
        let steps = vec![
            Derivation::from_fn(|_| Err(ProcedureError::unauthorized("no token"))),
            Derivation::from_fn(|_| panic!("must not run")),
        ];
        let err = derive_context(request_ctx(), &steps).await.unwrap_err();
        assert!(matches!(err, ProcedureError::Unauthorized { .. }));
    }

    #[test]
    fn connection_data_is_visible_through_get() {
        let ctx = ExecutionContext::new(
            Arc::new(StubServer),
            Transport::Connection(Arc::new(ConnectionMeta {
                id: 7,
                data: to_values(json!({"user": "ada"})),
            })),
        );
        assert_eq!(ctx.get("user"), Some(&json!("ada")));
        assert!(ctx.request().is_none());
        assert_eq!(ctx.connection().map(|c| c.id), Some(7));
    }

    #[tokio::test]
    async fn upgrade_steps_merge_data_and_headers_independently() {
        let mut first_headers = HeaderMap::new();
        first_headers.insert("x-session", HeaderValue::from_static("one"));
        let steps = vec![
            UpgradeDerivation::value(UpgradeData {
                data: to_values(json!({"user": "ada", "tier": "free"})),
                headers: first_headers,
            }),
            UpgradeDerivation::from_fn(|ctx| {
                let mut headers = HeaderMap::new();
                headers.insert("x-session", HeaderValue::from_static("two"));
                let user = ctx.get("user").cloned().unwrap_or(Value::Null);
                Ok(UpgradeData {
                    data: to_values(json!({"tier": "pro", "greeting": user})),
                    headers,
                })
            }),
        ];
        let merged = derive_upgrade(&request_ctx(), &steps).await.unwrap();
        assert_eq!(Value::Object(merged.data), json!({"user": "ada", "tier": "pro", "greeting": "ada"}));
        assert_eq!(merged.headers.get("x-session").unwrap(), "two");
    }
}
