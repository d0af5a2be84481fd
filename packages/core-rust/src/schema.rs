//! Validation adapter over pluggable schema capabilities.
//!
//! A [`Schema`] is any external validator that turns a raw JSON value into
//! either a (possibly transformed) value or a list of issues. [`validate`]
//! normalizes that outcome into `Result<Value, ValidationFailure>`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Issue, ValidationFailure};

/// Raw outcome reported by a schema capability.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The value conforms; carries the (possibly coerced) value.
    Valid(Value),
    /// The value violates one or more constraints.
    Invalid {
        /// Issues in the order the schema reported them.
        issues: Vec<Issue>,
    },
}

/// Pluggable schema capability.
///
/// Always awaited, even when the implementation is synchronous.
#[async_trait]
pub trait Schema: Send + Sync {
    /// Checks `value` and returns the validated value or the issues found.
    async fn check(&self, value: Value) -> ValidationResult;
}

/// Shared, type-erased schema.
pub type SharedSchema = Arc<dyn Schema>;

/// Runs `schema` against `value`, normalizing its outcome.
///
/// # Errors
///
/// Returns `ValidationFailure` when the schema reports issues. A schema that
/// rejects without describing why yields a single root-level issue.
pub async fn validate(schema: &dyn Schema, value: Value) -> Result<Value, ValidationFailure> {
    match schema.check(value).await {
        ValidationResult::Valid(value) => Ok(value),
        ValidationResult::Invalid { issues } if issues.is_empty() => {
            Err(ValidationFailure::single("value rejected by schema"))
        }
        ValidationResult::Invalid { issues } => {
            tracing::debug!(issues = issues.len(), "schema rejected value");
            Err(ValidationFailure::new(issues))
        }
    }
}

// ---------------------------------------------------------------------------
// SerdeSchema
// ---------------------------------------------------------------------------

/// Uses a Rust type as a schema: the value must deserialize into `T`, and
/// the validated value is `T` serialized back (so defaults and renames
/// apply).
pub struct SerdeSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSchema<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerdeSchema")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

#[async_trait]
impl<T> Schema for SerdeSchema<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    async fn check(&self, value: Value) -> ValidationResult {
        let typed: T = match serde_json::from_value(value) {
            Ok(typed) => typed,
            Err(err) => {
                return ValidationResult::Invalid {
                    issues: vec![Issue::root(err.to_string())],
                }
            }
        };
        match serde_json::to_value(&typed) {
            Ok(value) => ValidationResult::Valid(value),
            Err(err) => ValidationResult::Invalid {
                issues: vec![Issue::root(err.to_string())],
            },
        }
    }
}

/// Shorthand for `SerdeSchema::<T>::new()`.
#[must_use]
pub fn serde_schema<T>() -> SerdeSchema<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    SerdeSchema::new()
}

// ---------------------------------------------------------------------------
// FnSchema
// ---------------------------------------------------------------------------

/// Schema backed by a synchronous closure.
pub struct FnSchema<F> {
    check: F,
}

impl<F> FnSchema<F>
where
    F: Fn(Value) -> Result<Value, Vec<Issue>> + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F> Schema for FnSchema<F>
where
    F: Fn(Value) -> Result<Value, Vec<Issue>> + Send + Sync,
{
    async fn check(&self, value: Value) -> ValidationResult {
        match (self.check)(value) {
            Ok(value) => ValidationResult::Valid(value),
            Err(issues) => ValidationResult::Invalid { issues },
        }
    }
}
