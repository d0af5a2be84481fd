//! Lifecycle and observability events.
//!
//! Listeners are registered on modules, merged by identity like every other
//! declaration, and compiled into a read-only [`EventBus`].

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use http::Method;

use crate::error::{ProcedureError, TransportError};
use crate::types::{DeclId, OperationId};

/// Kinds of events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    TransportError,
    Request,
    Open,
    Message,
    Close,
    Started,
    Stopped,
}

/// An event emitted by the dispatch entry points or the server lifecycle.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A middleware, handler, or context derivation failed.
    Error {
        operation: Option<OperationId>,
        error: Arc<ProcedureError>,
    },
    /// The transport failed outside of any operation.
    TransportError {
        connection: Option<u64>,
        error: TransportError,
    },
    /// An inbound request/reply call was observed.
    Request { method: Method, path: String },
    Open { connection: u64 },
    Message { connection: u64, size: usize },
    Close {
        connection: u64,
        code: Option<u16>,
        reason: Option<String>,
    },
    Started { address: SocketAddr },
    Stopped,
}

impl ServerEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Error { .. } => EventKind::Error,
            Self::TransportError { .. } => EventKind::TransportError,
            Self::Request { .. } => EventKind::Request,
            Self::Open { .. } => EventKind::Open,
            Self::Message { .. } => EventKind::Message,
            Self::Close { .. } => EventKind::Close,
            Self::Started { .. } => EventKind::Started,
            Self::Stopped => EventKind::Stopped,
        }
    }
}

type ListenerFn = dyn Fn(&ServerEvent) + Send + Sync;

/// A listener for one kind of event.
#[derive(Clone)]
pub struct Listener {
    id: DeclId,
    kind: EventKind,
    func: Arc<ListenerFn>,
}

impl Listener {
    pub fn new<F>(kind: EventKind, f: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        Self {
            id: DeclId::next(),
            kind,
            func: Arc::new(f),
        }
    }

    #[must_use]
    pub fn id(&self) -> DeclId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Compiled set of listeners.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    #[must_use]
    pub fn new(listeners: Vec<Listener>) -> Self {
        Self { listeners }
    }

    /// Number of listeners for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.iter().filter(|l| l.kind == kind).count()
    }

    /// Logs `event` and delivers it to every listener of its kind, in
    /// registration order. A panicking listener is logged and skipped; the
    /// remaining listeners still run.
    pub fn emit(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Error { operation, error } => {
                tracing::error!(operation = ?operation, error = %error, "operation failed");
            }
            ServerEvent::TransportError { connection, error } => {
                tracing::warn!(connection = ?connection, error = %error, "transport error");
            }
            other => tracing::debug!(event = ?other.kind(), "server event"),
        }
        let kind = event.kind();
        for listener in self.listeners.iter().filter(|l| l.kind == kind) {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| (listener.func)(event))) {
                tracing::error!(
                    listener = listener.id.get(),
                    event = ?kind,
                    panic = panic_message(panic.as_ref()),
                    "event listener panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
