//! Upsert descriptors and batch results.
//!
//! Descriptors are the in-memory intermediate between the adapter (which
//! builds them from source records) and the writer (which turns each one
//! into an idempotent MERGE).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ItemError;

/// One raw source row: column name to value. CSV rows hold only strings.
pub type Record = BTreeMap<String, Value>;

/// Property map carried by a descriptor. Values are scalars or lists of scalars.
pub type Properties = BTreeMap<String, Value>;

// ── Value normalisation ───────────────────────────────────────────

/// Normalise a raw record value into a storable property value.
///
/// Nulls and blank strings count as absent. Objects and mixed lists are
/// stored as their JSON text since the store only accepts primitives and
/// homogeneous primitive lists.
pub fn property_value(raw: &Value) -> Option<Value> {
    match raw {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Some(raw.clone()),
        Value::Array(items) if is_primitive_list(items) => Some(raw.clone()),
        Value::Array(_) | Value::Object(_) => Some(Value::String(raw.to_string())),
    }
}

fn is_primitive_list(items: &[Value]) -> bool {
    let Some(first) = items.first() else {
        return true;
    };
    let same_kind = |v: &Value| {
        matches!(
            (first, v),
            (Value::Bool(_), Value::Bool(_))
                | (Value::Number(_), Value::Number(_))
                | (Value::String(_), Value::String(_))
        )
    };
    items.iter().all(same_kind)
}

/// Read a usable identity out of a raw value: non-blank strings (trimmed)
/// and numbers. Anything else has no identity.
pub fn identity_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Descriptors ───────────────────────────────────────────────────

/// An intended node merge keyed by `(label, identity_key = identity_value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub label: String,
    pub identity_key: String,
    pub identity_value: String,
    pub properties: Properties,
}

impl NodeUpsert {
    /// Build a descriptor; the identity is always mirrored into `properties`.
    pub fn new(
        label: impl Into<String>,
        identity_key: impl Into<String>,
        identity_value: impl Into<String>,
        mut properties: Properties,
    ) -> Self {
        let identity_key = identity_key.into();
        let identity_value = identity_value.into();
        properties.insert(identity_key.clone(), Value::String(identity_value.clone()));
        Self {
            label: label.into(),
            identity_key,
            identity_value,
            properties,
        }
    }

    /// `Label{key: value}` form used in logs and failure reports.
    pub fn describe(&self) -> String {
        format!(
            "{}{{{}: {:?}}}",
            self.label, self.identity_key, self.identity_value
        )
    }

    /// Check that `properties[identity_key]`, when present, agrees with the identity.
    pub fn check_identity(&self) -> Result<(), ItemError> {
        if self.identity_value.trim().is_empty() {
            return Err(ItemError::MissingIdentity {
                identity_key: self.identity_key.clone(),
            });
        }
        match self.properties.get(&self.identity_key) {
            Some(value) => match identity_text(value) {
                Some(found) if found == self.identity_value => Ok(()),
                _ => Err(ItemError::InconsistentIdentity {
                    expected: self.identity_value.clone(),
                    found: value.to_string(),
                }),
            },
            None => Ok(()),
        }
    }
}

/// An intended relationship merge `(from)-[rel_type]->(to)`.
///
/// Endpoints are located by identity value; the labels narrow the match
/// when the rule or schema knows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpsert {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub from_identity: String,
    pub to_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl RelationshipUpsert {
    pub fn new(
        rel_type: impl Into<String>,
        from_identity: impl Into<String>,
        to_identity: impl Into<String>,
    ) -> Self {
        Self {
            rel_type: rel_type.into(),
            from_identity: from_identity.into(),
            to_identity: to_identity.into(),
            from_label: None,
            to_label: None,
            properties: Properties::new(),
        }
    }

    /// Restrict endpoint matching to the given labels.
    pub fn with_labels(mut self, from_label: Option<String>, to_label: Option<String>) -> Self {
        self.from_label = from_label;
        self.to_label = to_label;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// `(from)-[:TYPE]->(to)` form used in logs and failure reports.
    pub fn describe(&self) -> String {
        format!(
            "({})-[:{}]->({})",
            self.from_identity, self.rel_type, self.to_identity
        )
    }
}

// ── Results ───────────────────────────────────────────────────────

/// A single failed descriptor, with enough context to retry or report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Position of the descriptor in the submitted sequence.
    pub index: usize,
    /// Human-readable identity of the descriptor.
    pub item: String,
    pub reason: ItemError,
}

/// Outcome of one upsert call.
///
/// `attempted == succeeded + failed`. Items never dispatched because the
/// run was cancelled are counted in `not_dispatched` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default)]
    pub not_dispatched: usize,
    pub errors: Vec<ItemFailure>,
}

impl UpsertResult {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, index: usize, item: String, reason: ItemError) {
        self.attempted += 1;
        self.failed += 1;
        self.errors.push(ItemFailure {
            index,
            item,
            reason,
        });
    }

    /// Fold a sub-result into this one. `index_map[i]` is the position in
    /// this result's sequence of item `i` of the sub-result.
    pub fn absorb(&mut self, other: UpsertResult, index_map: &[usize]) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.not_dispatched += other.not_dispatched;
        self.errors.extend(other.errors.into_iter().map(|mut failure| {
            failure.index = index_map.get(failure.index).copied().unwrap_or(failure.index);
            failure
        }));
        self.errors.sort_by_key(|f| f.index);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.not_dispatched == 0
    }
}

/// A source record the adapter could not turn into a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub label: String,
    pub record_index: usize,
    pub reason: ItemError,
}
