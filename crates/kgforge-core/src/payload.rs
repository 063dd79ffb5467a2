//! The intermediate ingestion payload.
//!
//! A self-contained JSON document of nodes and relationships that can be
//! produced from CSV rows, inspected or edited, and loaded later:
//!
//! ```json
//! {
//!   "nodes": [{"id": "n0", "labels": ["Genome"], "properties": {"name": "G1"}}],
//!   "relationships": [{"from": "G1", "to": "B1", "type": "CONTAINS"}]
//! }
//! ```
//!
//! Relationship endpoints refer to node identity values, not to payload ids.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{NodeUpsert, Properties, RelationshipUpsert};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub nodes: Vec<PayloadNode>,
    #[serde(default)]
    pub relationships: Vec<PayloadRelationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadNode {
    pub id: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRelationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl Payload {
    /// Assemble a payload from descriptors, numbering nodes `n0`, `n1`, ...
    pub fn from_descriptors(nodes: &[NodeUpsert], relationships: &[RelationshipUpsert]) -> Self {
        let nodes = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| PayloadNode {
                id: format!("n{i}"),
                labels: vec![node.label.clone()],
                properties: node.properties.clone(),
            })
            .collect();

        let relationships = relationships
            .iter()
            .map(|rel| PayloadRelationship {
                from: rel.from_identity.clone(),
                to: rel.to_identity.clone(),
                rel_type: rel.rel_type.clone(),
                properties: rel.properties.clone(),
            })
            .collect();

        Self {
            nodes,
            relationships,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PayloadError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the payload as pretty-printed JSON.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), PayloadError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(
            path = %path.display(),
            nodes = self.nodes.len(),
            relationships = self.relationships.len(),
            "Payload written"
        );
        Ok(())
    }
}

/// Errors reading or writing payload files.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
