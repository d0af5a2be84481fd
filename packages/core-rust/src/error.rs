//! Error taxonomy for declaration, validation, dispatch, and transport.
//!
//! - [`ConfigError`]: fatal declaration mistakes detected while compiling a module
//! - [`ValidationFailure`]: per-call schema rejection carrying structured issues
//! - [`ProcedureError`]: anything a middleware or handler can fail with; knows
//!   its status code and how to render itself for a transport
//! - [`TransportError`]: connection-level failures (upgrade, closed socket)

use http::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One step of a path into a validated value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_owned())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// A single problem reported by a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Human-readable description.
    pub message: String,
    /// Location of the offending value; empty for the root.
    pub path: Vec<PathSegment>,
}

impl Issue {
    /// Creates an issue at the given path.
    pub fn new(message: impl Into<String>, path: Vec<PathSegment>) -> Self {
        Self {
            message: message.into(),
            path,
        }
    }

    /// Creates an issue located at the root of the value.
    pub fn root(message: impl Into<String>) -> Self {
        Self::new(message, Vec::new())
    }
}

/// Schema rejection of an input or output value.
///
/// Never transient: callers surface it immediately as a 422-class failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed with {} issue(s)", .issues.len())]
pub struct ValidationFailure {
    /// Ordered list of issues as reported by the schema.
    pub issues: Vec<Issue>,
}

impl ValidationFailure {
    /// Wraps a list of issues.
    #[must_use]
    pub fn new(issues: Vec<Issue>) -> Self {
        Self { issues }
    }

    /// Failure carrying one root-level issue.
    pub fn single(message: impl Into<String>) -> Self {
        Self::new(vec![Issue::root(message)])
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fatal declaration errors raised while compiling a module.
///
/// These are never recovered from: a module that fails to compile produces
/// no dispatch table and serves nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("operation `{operation}` has no handler")]
    MissingHandler { operation: String },
    #[error("operation `{operation}` declares its handler more than once")]
    HandlerRedefined { operation: String },
    #[error("duplicate operation path `{path}`")]
    DuplicatePath { path: String },
    #[error("route `{method} {path}` is claimed by more than one operation")]
    DuplicateRoute { method: String, path: String },
    #[error("route path `{path}` is not servable: {reason}")]
    InvalidPath { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// Procedure errors
// ---------------------------------------------------------------------------

/// Errors produced while running an operation's middleware chain or handler.
#[derive(Debug, thiserror::Error)]
pub enum ProcedureError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// Application-defined failure with an explicit status and name.
    #[error("{message}")]
    Status {
        status: StatusCode,
        name: String,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProcedureError {
    /// Authorization failure (401).
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Missing resource (404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Malformed request (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::custom(StatusCode::BAD_REQUEST, "BadRequest", message)
    }

    /// Application-defined failure.
    pub fn custom(status: StatusCode, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Status code carried by this failure kind.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Status { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error name used in response bodies.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::NotFound { .. } => "NotFound",
            Self::Overloaded => "Overloaded",
            Self::Timeout { .. } => "Timeout",
            Self::Status { name, .. } => name,
            Self::Internal(_) => "InternalServerError",
        }
    }

    /// Message safe to send to a client. Internal causes are not exposed.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal Server Error".to_owned(),
            Self::Unauthorized { message } | Self::NotFound { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Request/reply body: `{"error": {"name", "message"}}`, plus `issues`
    /// for validation failures.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut error = json!({
            "name": self.name(),
            "message": self.public_message(),
        });
        if let (Self::Validation(failure), Some(obj)) = (self, error.as_object_mut()) {
            obj.insert("issues".to_owned(), json!(failure.issues));
        }
        json!({ "error": error })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Connection-level failures surfaced by the message transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection upgrade rejected: {reason}")]
    UpgradeRejected { reason: String },
    #[error("connection is not open")]
    NotOpen,
    #[error("send timed out")]
    SendTimeout,
    #[error("socket error: {reason}")]
    Socket { reason: String },
}
