//! Module composition and compilation.
//!
//! A [`Module`] accumulates declarations: operation-tree initializers (each
//! with its own scoped middleware), global middleware, context derivations,
//! upgrade derivations, event listeners, and other modules. Incorporating a
//! module records a reference to it; [`Module::build`] walks the resulting
//! graph once, keeping each declaration the first time its identity is seen,
//! and produces a [`CompiledModule`]:
//!
//! - a dispatch table `{operation path -> compiled handler}`
//! - route descriptors for operations exposed over request/reply
//! - the ordered derivation steps and the event bus
//!
//! Effective middleware for an operation is
//! `[global ..] ++ [initializer-scoped ..] ++ [operation-scoped ..]`.
//!
//! Lifecycle: declaring -> compiled. Once built, the module and every module
//! it reaches are frozen; further declarations panic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::{
    derive_context, derive_upgrade, ContextValues, Derivation, ExecutionContext, ServerInstance,
    Transport, UpgradeData, UpgradeDerivation,
};
use crate::error::{ConfigError, ProcedureError};
use crate::events::{EventBus, EventKind, Listener, ServerEvent};
use crate::manifest::ManifestNode;
use crate::middleware::{Handler, HandlerResult, Invocation, Middleware};
use crate::procedure::{Exposure, OperationFactory, OperationTree};
use crate::types::{DeclId, OperationId};

type InitFn = dyn Fn(&OperationFactory) -> OperationTree + Send + Sync;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Declaration {
    Procedures {
        id: DeclId,
        init: Arc<InitFn>,
        scoped: Vec<Middleware>,
    },
    Middleware(Middleware),
    Derive(Derivation),
    Upgrade(UpgradeDerivation),
    Listener(Listener),
    Module(Module),
}

impl Declaration {
    fn id(&self) -> DeclId {
        match self {
            Self::Procedures { id, .. } => *id,
            Self::Middleware(m) => m.id(),
            Self::Derive(d) => d.id(),
            Self::Upgrade(u) => u.id(),
            Self::Listener(l) => l.id(),
            Self::Module(m) => m.id(),
        }
    }
}

/// Something a module can incorporate: middleware or another module.
pub enum Component {
    Middleware(Middleware),
    Module(Module),
}

impl From<Middleware> for Component {
    fn from(value: Middleware) -> Self {
        Self::Middleware(value)
    }
}

impl From<Module> for Component {
    fn from(value: Module) -> Self {
        Self::Module(value)
    }
}

impl From<&Module> for Component {
    fn from(value: &Module) -> Self {
        Self::Module(value.clone())
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

struct ModuleState {
    declarations: Vec<Declaration>,
    defaults: Exposure,
    frozen: bool,
    compiled: Option<Arc<CompiledModule>>,
}

struct ModuleInner {
    id: DeclId,
    name: String,
    state: Mutex<ModuleState>,
}

/// Composable container of operations, middleware, and derivation steps.
///
/// Cloning yields another handle to the same module; identity is shared.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                id: DeclId::next(),
                name: name.into(),
                state: Mutex::new(ModuleState {
                    declarations: Vec::new(),
                    defaults: Exposure::default(),
                    frozen: false,
                    compiled: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> DeclId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this module has been compiled, directly or as part of a
    /// parent, and no longer accepts declarations.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    fn mutate(self, f: impl FnOnce(&mut ModuleState)) -> Self {
        {
            let mut state = self.inner.state.lock();
            assert!(
                !state.frozen,
                "module `{}` is frozen: declarations are not accepted after compilation",
                self.inner.name
            );
            f(&mut state);
        }
        self
    }

    fn declare(self, declaration: Declaration) -> Self {
        self.mutate(|state| state.declarations.push(declaration))
    }

    /// Sets whether operations created by this module's factory are exposed
    /// over request/reply unless they say otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn expose_by_default(self, enabled: bool) -> Self {
        self.mutate(|state| state.defaults.enabled = enabled)
    }

    /// Registers an operation-tree initializer. It runs once per compilation.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn procedures<F>(self, init: F) -> Self
    where
        F: Fn(&OperationFactory) -> OperationTree + Send + Sync + 'static,
    {
        self.scoped_procedures(Vec::new(), init)
    }

    /// Registers an initializer whose operations, and only those, run inside
    /// `middleware` (after global middleware, before operation middleware).
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn scoped_procedures<F>(self, middleware: Vec<Middleware>, init: F) -> Self
    where
        F: Fn(&OperationFactory) -> OperationTree + Send + Sync + 'static,
    {
        self.declare(Declaration::Procedures {
            id: DeclId::next(),
            init: Arc::new(init),
            scoped: middleware,
        })
    }

    /// Incorporates global middleware or another module.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn with(self, component: impl Into<Component>) -> Self {
        match component.into() {
            Component::Middleware(m) => self.declare(Declaration::Middleware(m)),
            Component::Module(m) => self.declare(Declaration::Module(m)),
        }
    }

    /// Adds a context-derivation step.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn derive(self, step: Derivation) -> Self {
        self.declare(Declaration::Derive(step))
    }

    /// Adds a derivation step contributing fixed values.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn derive_value(self, values: ContextValues) -> Self {
        self.derive(Derivation::value(values))
    }

    /// Adds a derivation step computed from the context built so far.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn derive_fn<F>(self, f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<ContextValues, ProcedureError> + Send + Sync + 'static,
    {
        self.derive(Derivation::from_fn(f))
    }

    /// Adds a connection-upgrade derivation step.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn upgrade(self, step: UpgradeDerivation) -> Self {
        self.declare(Declaration::Upgrade(step))
    }

    /// Registers a listener for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn on<F>(self, kind: EventKind, f: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.listen(Listener::new(kind, f))
    }

    /// Registers a pre-built listener. The same listener registered in
    /// several merged modules fires once.
    ///
    /// # Panics
    ///
    /// Panics if the module is frozen.
    #[must_use]
    pub fn listen(self, listener: Listener) -> Self {
        self.declare(Declaration::Listener(listener))
    }

    /// Compiles the module graph.
    ///
    /// The first successful build freezes this module and every module it
    /// incorporates; later calls return the same compiled module.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a missing or redefined handler, a duplicate
    /// operation path anywhere in the graph, or two operations claiming the
    /// same request/reply route. No dispatch table is produced.
    pub fn build(&self) -> Result<Arc<CompiledModule>, ConfigError> {
        if let Some(compiled) = self.inner.state.lock().compiled.clone() {
            return Ok(compiled);
        }

        let mut collected = Collected::default();
        collected.visit(self, &mut HashSet::new());
        let modules = std::mem::take(&mut collected.modules);
        let compiled = Arc::new(compile(collected)?);

        for module in &modules {
            module.inner.state.lock().frozen = true;
        }
        let mut state = self.inner.state.lock();
        if let Some(existing) = &state.compiled {
            return Ok(Arc::clone(existing));
        }
        state.compiled = Some(Arc::clone(&compiled));
        info!(
            module = %self.inner.name,
            operations = compiled.len(),
            routes = compiled.routes.len(),
            merged_modules = modules.len(),
            "module compiled"
        );
        Ok(compiled)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Graph walk
// ---------------------------------------------------------------------------

struct Initializer {
    init: Arc<InitFn>,
    scoped: Vec<Middleware>,
    factory: OperationFactory,
}

#[derive(Default)]
struct Collected {
    modules: Vec<Module>,
    initializers: Vec<Initializer>,
    middleware: Vec<Middleware>,
    derivations: Vec<Derivation>,
    upgrades: Vec<UpgradeDerivation>,
    listeners: Vec<Listener>,
}

impl Collected {
    /// Depth-first walk in declaration order. `seen` holds the identity of
    /// every module and declaration already taken.
    fn visit(&mut self, module: &Module, seen: &mut HashSet<DeclId>) {
        if !seen.insert(module.id()) {
            return;
        }
        self.modules.push(module.clone());

        // Snapshot so the lock is not held while visiting children.
        let (declarations, defaults) = {
            let state = module.inner.state.lock();
            (state.declarations.clone(), state.defaults.clone())
        };

        for declaration in declarations {
            if let Declaration::Module(child) = &declaration {
                self.visit(child, seen);
                continue;
            }
            if !seen.insert(declaration.id()) {
                continue;
            }
            match declaration {
                Declaration::Procedures { init, scoped, .. } => self.initializers.push(Initializer {
                    init,
                    scoped,
                    factory: OperationFactory::new(defaults.clone()),
                }),
                Declaration::Middleware(m) => self.middleware.push(m),
                Declaration::Derive(d) => self.derivations.push(d),
                Declaration::Upgrade(u) => self.upgrades.push(u),
                Declaration::Listener(l) => self.listeners.push(l),
                Declaration::Module(_) => {}
            }
        }
    }
}

fn compile(collected: Collected) -> Result<CompiledModule, ConfigError> {
    let mut operations: HashMap<OperationId, CompiledOperation> = HashMap::new();
    let mut order = Vec::new();
    let mut routes: Vec<RouteDescriptor> = Vec::new();

    for initializer in &collected.initializers {
        let tree = (initializer.init)(&initializer.factory);
        let mut outer = collected.middleware.clone();
        outer.extend(initializer.scoped.iter().cloned());

        for (id, op) in tree.flatten() {
            if operations.contains_key(&id) {
                return Err(ConfigError::DuplicatePath {
                    path: id.to_string(),
                });
            }
            let handler = op.compile_with(&id, &outer)?;
            let exposure = op.exposure().clone();

            if exposure.enabled {
                let route = RouteDescriptor::new(&id, &exposure, Arc::clone(&handler));
                if let Some(taken) = routes.iter().find(|r| r.overlaps(&route)) {
                    return Err(ConfigError::DuplicateRoute {
                        method: taken.method_label().to_owned(),
                        path: taken.path.clone(),
                    });
                }
                debug!(operation = %id, method = route.method_label(), path = %route.path, "route registered");
                routes.push(route);
            }

            order.push(id.clone());
            operations.insert(id, CompiledOperation { handler, exposure });
        }
    }

    Ok(CompiledModule {
        operations,
        order,
        routes,
        derivations: collected.derivations,
        upgrades: collected.upgrades,
        events: EventBus::new(collected.listeners),
    })
}

// ---------------------------------------------------------------------------
// Compiled output
// ---------------------------------------------------------------------------

/// An entry of the dispatch table.
#[derive(Clone)]
pub struct CompiledOperation {
    pub handler: Handler,
    pub exposure: Exposure,
}

/// Request/reply registration derived from an exposed operation.
#[derive(Clone)]
pub struct RouteDescriptor {
    pub operation: OperationId,
    /// `None` accepts any method.
    pub method: Option<Method>,
    pub path: String,
    pub handler: Handler,
}

impl RouteDescriptor {
    fn new(operation: &OperationId, exposure: &Exposure, handler: Handler) -> Self {
        let path = match &exposure.path {
            Some(custom) if custom.starts_with('/') => custom.clone(),
            Some(custom) => format!("/{custom}"),
            None => format!("/{operation}"),
        };
        Self {
            operation: operation.clone(),
            method: exposure.method.clone(),
            path,
            handler,
        }
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.path == other.path
            && match (&self.method, &other.method) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Method name, or `*` when any method is accepted.
    #[must_use]
    pub fn method_label(&self) -> &str {
        self.method.as_ref().map_or("*", Method::as_str)
    }
}

impl fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("operation", &self.operation)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Read-only result of compiling a module graph.
pub struct CompiledModule {
    operations: HashMap<OperationId, CompiledOperation>,
    order: Vec<OperationId>,
    routes: Vec<RouteDescriptor>,
    derivations: Vec<Derivation>,
    upgrades: Vec<UpgradeDerivation>,
    events: EventBus,
}

impl CompiledModule {
    /// Compiled handler for `operation`.
    #[must_use]
    pub fn handler(&self, operation: &str) -> Option<&Handler> {
        self.operations.get(operation).map(|op| &op.handler)
    }

    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Operation ids in declaration order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationId> {
        self.order.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    /// Whether the request/reply surface is needed at all.
    #[must_use]
    pub fn serves_requests(&self) -> bool {
        !self.routes.is_empty()
    }

    #[must_use]
    pub fn derivations(&self) -> &[Derivation] {
        &self.derivations
    }

    #[must_use]
    pub fn upgrades(&self) -> &[UpgradeDerivation] {
        &self.upgrades
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Builds an execution context by applying every derivation step.
    ///
    /// # Errors
    ///
    /// Returns the first derivation failure.
    pub async fn context(
        &self,
        server: Arc<dyn ServerInstance>,
        transport: Transport,
    ) -> Result<ExecutionContext, ProcedureError> {
        derive_context(ExecutionContext::new(server, transport), &self.derivations).await
    }

    /// Runs every upgrade derivation step against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the first upgrade-derivation failure.
    pub async fn upgrade_data(&self, ctx: &ExecutionContext) -> Result<UpgradeData, ProcedureError> {
        derive_upgrade(ctx, &self.upgrades).await
    }

    /// Invokes `operation` with an already-derived context.
    ///
    /// # Errors
    ///
    /// Returns `ProcedureError::NotFound` for unknown operations, otherwise
    /// whatever the compiled chain fails with.
    pub async fn call(&self, operation: &str, input: Value, ctx: ExecutionContext) -> HandlerResult {
        let Some(handler) = self.handler(operation) else {
            return Err(ProcedureError::not_found(format!("no operation `{operation}`")));
        };
        handler(Invocation {
            operation: OperationId::from(operation),
            input,
            ctx,
        })
        .await
    }

    /// Recursive description of the operation tree.
    #[must_use]
    pub fn manifest(&self) -> ManifestNode {
        ManifestNode::from_routes(
            self.order.iter().map(|id| {
                let route = self.routes.iter().find(|r| &r.operation == id);
                (id, route)
            }),
        )
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("operations", &self.order)
            .field("routes", &self.routes)
            .field("derivations", &self.derivations.len())
            .field("upgrades", &self.upgrades.len())
            .finish_non_exhaustive()
    }
}
