use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A malformed schema artifact. Fatal: the run aborts before any write.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Schema artifact is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Node entry {index} has no label")]
    MissingLabel { index: usize },

    #[error("Relationship entry {index} has no type")]
    MissingType { index: usize },

    #[error("Unsupported schema shape: {0}")]
    Shape(String),

    #[error("Cannot derive property names for {entry}: {reason}")]
    Properties { entry: String, reason: String },

    #[error("Unsafe identifier in schema: {value:?}")]
    UnsafeIdentifier { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single descriptor could not be applied.
///
/// These never abort a batch; they are accumulated into
/// [`UpsertResult::errors`](crate::UpsertResult) and written to run reports.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemError {
    #[error("Missing identity value for key {identity_key:?}")]
    MissingIdentity { identity_key: String },

    #[error("Identity mismatch: descriptor says {expected:?}, properties say {found:?}")]
    InconsistentIdentity { expected: String, found: String },

    #[error("Unsafe identifier: {value:?}")]
    UnsafeIdentifier { value: String },

    #[error("Endpoint not found: ({from}) -> ({to})")]
    EndpointNotFound { from: String, to: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Query timed out after {millis} ms")]
    Timeout { millis: u64 },
}

impl ItemError {
    /// Whether a caller may reasonably retry the item unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Query { .. } | Self::Timeout { .. })
    }
}

/// A unique-constraint declaration that the store rejected. Non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Constraint on {label}.{property} failed: {reason}")]
pub struct ConstraintError {
    pub label: String,
    pub property: String,
    pub reason: String,
}
