//! The labeled-graph schema: node kinds and relationship kinds.
//!
//! Loaded once from a JSON artifact of the form
//!
//! ```json
//! {
//!   "nodes": [{"labels": ["Genome"], "properties": ["name", "size"]}],
//!   "relationships": [{"type": "CONTAINS", "from": "Genome", "to": "BGC", "properties": []}]
//! }
//! ```
//!
//! and immutable afterwards. The first element of `labels` is authoritative.
//! `properties` may be a list of names or an object whose keys are the names.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;
use crate::identifier::is_safe_identifier;
use crate::payload::Payload;

/// A node label and the properties it may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKind {
    pub label: String,
    pub property_names: Vec<String>,
}

impl NodeKind {
    pub fn has_property(&self, name: &str) -> bool {
        self.property_names.iter().any(|p| p == name)
    }
}

/// A relationship type, its endpoint labels (when declared), and its properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipKind {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source_label: Option<String>,
    pub target_label: Option<String>,
    pub property_names: Vec<String>,
}

/// The immutable schema for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModel {
    nodes: Vec<NodeKind>,
    relationships: Vec<RelationshipKind>,
}

// ── Raw artifact shape ────────────────────────────────────────────

#[derive(Deserialize)]
struct RawSchema {
    #[serde(default)]
    nodes: Option<Value>,
    #[serde(default)]
    relationships: Option<Value>,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    properties: Option<Value>,
}

#[derive(Deserialize)]
struct RawRelationship {
    #[serde(default, rename = "type")]
    rel_type: Option<String>,
    #[serde(default, alias = "from", alias = "source", alias = "start_label")]
    source_label: Option<String>,
    #[serde(default, alias = "to", alias = "target", alias = "end_label")]
    target_label: Option<String>,
    #[serde(default)]
    properties: Option<Value>,
}

impl SchemaModel {
    /// Parse and validate a schema artifact.
    pub fn load(artifact: &str) -> Result<Self, SchemaError> {
        let raw: RawSchema = serde_json::from_str(artifact)?;
        Self::from_raw(raw)
    }

    /// Read and parse a schema artifact from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::load(&text)
    }

    /// Build a schema directly from kinds, applying the same checks as `load`.
    pub fn new(
        nodes: Vec<NodeKind>,
        relationships: Vec<RelationshipKind>,
    ) -> Result<Self, SchemaError> {
        let mut schema = Self::default();
        for (index, kind) in nodes.into_iter().enumerate() {
            if kind.label.trim().is_empty() {
                return Err(SchemaError::MissingLabel { index });
            }
            schema.push_node(kind.label, kind.property_names)?;
        }
        for (index, kind) in relationships.into_iter().enumerate() {
            if kind.rel_type.trim().is_empty() {
                return Err(SchemaError::MissingType { index });
            }
            schema.push_relationship(kind)?;
        }
        Ok(schema)
    }

    /// Derive a schema from an ingestion payload: one node kind per first
    /// label with the union of property keys seen, one relationship kind per type.
    pub fn from_payload(payload: &Payload) -> Result<Self, SchemaError> {
        let mut schema = Self::default();
        for (index, node) in payload.nodes.iter().enumerate() {
            let label = node
                .labels
                .first()
                .filter(|l| !l.trim().is_empty())
                .ok_or(SchemaError::MissingLabel { index })?;
            schema.push_node(label.clone(), node.properties.keys().cloned().collect())?;
        }
        for (index, rel) in payload.relationships.iter().enumerate() {
            if rel.rel_type.trim().is_empty() {
                return Err(SchemaError::MissingType { index });
            }
            schema.push_relationship(RelationshipKind {
                rel_type: rel.rel_type.clone(),
                source_label: None,
                target_label: None,
                property_names: rel.properties.keys().cloned().collect(),
            })?;
        }
        Ok(schema)
    }

    fn from_raw(raw: RawSchema) -> Result<Self, SchemaError> {
        let mut schema = Self::default();

        for (index, value) in array_section(raw.nodes, "nodes")?.into_iter().enumerate() {
            let node: RawNode = serde_json::from_value(value)?;
            let label = node
                .labels
                .into_iter()
                .next()
                .or(node.label)
                .filter(|l| !l.trim().is_empty())
                .ok_or(SchemaError::MissingLabel { index })?;
            let names = property_names(&label, node.properties)?;
            schema.push_node(label, names)?;
        }

        for (index, value) in array_section(raw.relationships, "relationships")?
            .into_iter()
            .enumerate()
        {
            let rel: RawRelationship = serde_json::from_value(value)?;
            let rel_type = rel
                .rel_type
                .filter(|t| !t.trim().is_empty())
                .ok_or(SchemaError::MissingType { index })?;
            let property_names = property_names(&rel_type, rel.properties)?;
            schema.push_relationship(RelationshipKind {
                rel_type,
                source_label: rel.source_label.filter(|l| !l.is_empty()),
                target_label: rel.target_label.filter(|l| !l.is_empty()),
                property_names,
            })?;
        }

        tracing::debug!(
            node_kinds = schema.nodes.len(),
            relationship_kinds = schema.relationships.len(),
            "Schema loaded"
        );
        Ok(schema)
    }

    /// Add a node kind; a repeated label extends the existing property list.
    fn push_node(&mut self, label: String, names: Vec<String>) -> Result<(), SchemaError> {
        check_identifier(&label)?;
        for name in &names {
            check_identifier(name)?;
        }
        let index = match self.nodes.iter().position(|k| k.label == label) {
            Some(index) => index,
            None => {
                self.nodes.push(NodeKind {
                    label,
                    property_names: Vec::new(),
                });
                self.nodes.len() - 1
            }
        };
        let kind = &mut self.nodes[index];
        for name in names {
            if kind.has_property(&name) {
                tracing::debug!(label = %kind.label, property = %name, "Duplicate property ignored");
            } else {
                kind.property_names.push(name);
            }
        }
        Ok(())
    }

    fn push_relationship(&mut self, mut kind: RelationshipKind) -> Result<(), SchemaError> {
        check_identifier(&kind.rel_type)?;
        for label in kind.source_label.iter().chain(kind.target_label.iter()) {
            check_identifier(label)?;
        }
        for name in &kind.property_names {
            check_identifier(name)?;
        }
        let mut seen = Vec::with_capacity(kind.property_names.len());
        kind.property_names.retain(|p| {
            if seen.contains(p) {
                false
            } else {
                seen.push(p.clone());
                true
            }
        });
        match self
            .relationships
            .iter_mut()
            .find(|k| k.rel_type == kind.rel_type)
        {
            Some(existing) => {
                for name in kind.property_names {
                    if !existing.property_names.contains(&name) {
                        existing.property_names.push(name);
                    }
                }
            }
            None => self.relationships.push(kind),
        }
        Ok(())
    }

    // ── Lookup ───────────────────────────────────────────────────

    pub fn node_kind(&self, label: &str) -> Option<&NodeKind> {
        self.nodes.iter().find(|k| k.label == label)
    }

    /// First relationship kind declared with this type.
    pub fn relationship_kind(&self, rel_type: &str) -> Option<&RelationshipKind> {
        self.relationships.iter().find(|k| k.rel_type == rel_type)
    }

    pub fn node_kinds(&self) -> &[NodeKind] {
        &self.nodes
    }

    pub fn relationship_kinds(&self) -> &[RelationshipKind] {
        &self.relationships
    }
}

fn check_identifier(name: &str) -> Result<(), SchemaError> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(SchemaError::UnsafeIdentifier {
            value: name.to_string(),
        })
    }
}

/// A top-level section must be a list (or absent). The older mapping-shaped
/// `relationships` section is rejected rather than guessed at.
fn array_section(section: Option<Value>, name: &str) -> Result<Vec<Value>, SchemaError> {
    match section {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(SchemaError::Shape(format!(
            "`{name}` must be a list, found {}",
            json_kind(&other)
        ))),
    }
}

fn property_names(entry: &str, properties: Option<Value>) -> Result<Vec<String>, SchemaError> {
    match properties {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map.into_iter().map(|(k, _)| k).collect()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Ok(s),
                other => Err(SchemaError::Properties {
                    entry: entry.to_string(),
                    reason: format!("expected a property name, found {}", json_kind(&other)),
                }),
            })
            .collect(),
        Some(other) => Err(SchemaError::Properties {
            entry: entry.to_string(),
            reason: format!("expected a list or object, found {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(s) if s.trim().is_empty() => "an empty string",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
