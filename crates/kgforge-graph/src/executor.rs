//! The narrow query interface the upsert engine talks to.
//!
//! An executor accepts a query plus named parameters and returns result
//! rows. Everything the writer needs from a store goes through
//! [`QueryExecutor::execute`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Named query parameters.
pub type Params = BTreeMap<String, Value>;

/// One result record, column name to value.
pub type ResultRow = BTreeMap<String, Value>;

/// Failure reported by the store for a single query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The logical operation a statement performs.
///
/// Carried alongside the query text for structured logging, and so that
/// stores which do not speak Cypher (see [`MemoryGraph`](crate::MemoryGraph))
/// can apply the same semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Params: `identity`, `properties`.
    MergeNode { label: String, key: String },
    /// Params: `rows` = `[{identity, properties}]`.
    MergeNodes { label: String, key: String },
    /// Params: `from`, `to`, `properties`. Returns `merged`.
    MergeRelationship {
        rel_type: String,
        from_label: Option<String>,
        to_label: Option<String>,
        key: String,
    },
    /// Params: `rows` = `[{index, from, to, properties}]`. Returns one `index` per merged row.
    MergeRelationships {
        rel_type: String,
        from_label: Option<String>,
        to_label: Option<String>,
        key: String,
    },
    /// Params: `properties`. Returns `linked`.
    LinkByProperty {
        rel_type: String,
        from_label: String,
        to_label: String,
        from_property: String,
        to_property: String,
    },
    CreateUniqueConstraint { label: String, property: String },
    /// Returns `count`.
    CountNodes { label: Option<String> },
    /// Returns `count`.
    CountRelationships { rel_type: Option<String> },
    /// Params: `value`. Returns `properties` for each match.
    FindNode { label: String, key: String },
    /// Returns `properties` for every node of the label.
    NodeProperties { label: String },
    /// Returns `type` and `properties` for every relationship of the type.
    RelationshipProperties { rel_type: String },
    /// Returns `name`, `labels` and `properties` per constraint.
    ShowConstraints { label: Option<String> },
    /// Returns `name` per database.
    ShowDatabases,
    /// Detach-deletes matching nodes. Returns `deleted`.
    DeleteNodes {
        label: Option<String>,
        having_property: Option<String>,
    },
    Raw,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MergeNode { .. } => "merge_node",
            Self::MergeNodes { .. } => "merge_nodes",
            Self::MergeRelationship { .. } => "merge_relationship",
            Self::MergeRelationships { .. } => "merge_relationships",
            Self::LinkByProperty { .. } => "link_by_property",
            Self::CreateUniqueConstraint { .. } => "create_unique_constraint",
            Self::CountNodes { .. } => "count_nodes",
            Self::CountRelationships { .. } => "count_relationships",
            Self::FindNode { .. } => "find_node",
            Self::NodeProperties { .. } => "node_properties",
            Self::RelationshipProperties { .. } => "relationship_properties",
            Self::ShowConstraints { .. } => "show_constraints",
            Self::ShowDatabases => "show_databases",
            Self::DeleteNodes { .. } => "delete_nodes",
            Self::Raw => "raw",
        }
    }
}

/// A parameterized query ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub cypher: String,
    pub params: Params,
    pub operation: Operation,
}

impl Statement {
    pub fn new(cypher: impl Into<String>, operation: Operation) -> Self {
        Self {
            cypher: cypher.into(),
            params: Params::new(),
            operation,
        }
    }

    /// An untagged query, e.g. for ad-hoc reads.
    pub fn raw(cypher: impl Into<String>) -> Self {
        Self::new(cypher, Operation::Raw)
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Something that can run a [`Statement`] against a graph store.
///
/// Implementations must be safe to call from several tasks at once, either
/// through an internal connection pool or internal locking.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError>;
}

#[async_trait]
impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
        (**self).execute(statement).await
    }
}

/// Read an integer column from the first row, defaulting to zero.
pub fn first_count(rows: &[ResultRow], column: &str) -> i64 {
    rows.first()
        .and_then(|row| row.get(column))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statement_builder_collects_params() {
        let stmt = Statement::raw("RETURN $x AS x")
            .param("x", 1)
            .param("name", "Alice");
        assert_eq!(stmt.params.get("x"), Some(&json!(1)));
        assert_eq!(stmt.params.get("name"), Some(&json!("Alice")));
        assert_eq!(stmt.operation.name(), "raw");
    }

    #[test]
    fn first_count_defaults_to_zero() {
        let rows: Vec<ResultRow> = vec![[("count".to_string(), json!(7))].into()];
        assert_eq!(first_count(&rows, "count"), 7);
        assert_eq!(first_count(&rows, "missing"), 0);
        assert_eq!(first_count(&[], "count"), 0);
    }
}
