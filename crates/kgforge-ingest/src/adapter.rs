//! Maps raw records onto upsert descriptors.
//!
//! The adapter is deterministic and side-effect free: the same schema,
//! settings and records always yield the same descriptors in the same
//! order. Records that cannot produce a node are skipped and reported in
//! [`NodeMapping::skipped`], never treated as errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kgforge_core::types::{identity_text, property_value};
use kgforge_core::{
    ItemError, NodeKind, NodeUpsert, Payload, Properties, Record, RelationshipUpsert,
    SchemaModel, SkippedRecord,
};

use crate::config::IngestConfig;
use crate::source::RecordSet;

/// Namespace for identities generated under [`MissingIdentity::Derive`].
const DERIVED_IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6b67_666f_7267_6500_8000_0000_6964_656e);

/// Where the identity of a node is read from in a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// The record's value at the identity key.
    #[default]
    Key,
    /// The column named after the node's label. One flat row then yields one
    /// node per label, each named by its own column.
    LabelColumn,
}

/// Policy for records that have no usable identity value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingIdentity {
    #[default]
    Skip,
    /// Generate a stable UUIDv5 from the label and the record's properties.
    /// Records with no properties at all are still skipped.
    Derive,
}

/// A column-presence rule: when every required column holds a value, emit
/// `(record[from_column])-[rel_type]->(record[to_column])`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRule {
    /// Columns that must be present and non-empty besides the two endpoints.
    #[serde(default)]
    pub required_columns: Vec<String>,
    pub from_column: String,
    pub to_column: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub from_label: Option<String>,
    #[serde(default)]
    pub to_label: Option<String>,
    /// Columns copied onto the relationship.
    #[serde(default)]
    pub property_columns: Vec<String>,
}

impl RelationshipRule {
    pub fn new(
        from_column: impl Into<String>,
        to_column: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            required_columns: Vec::new(),
            from_column: from_column.into(),
            to_column: to_column.into(),
            rel_type: rel_type.into(),
            from_label: None,
            to_label: None,
            property_columns: Vec::new(),
        }
    }

    pub fn requiring<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// The endpoint identities if `record` satisfies this rule.
    fn endpoints(&self, record: &Record) -> Option<(String, String)> {
        let filled = self
            .required_columns
            .iter()
            .all(|c| record.get(c).and_then(property_value).is_some());
        if !filled {
            return None;
        }
        let from = record.get(&self.from_column).and_then(identity_text)?;
        let to = record.get(&self.to_column).and_then(identity_text)?;
        Some((from, to))
    }
}

/// Node descriptors for a record set, plus the records that produced none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMapping {
    pub nodes: Vec<NodeUpsert>,
    pub skipped: Vec<SkippedRecord>,
}

/// Everything mapped out of an ingestion payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadMapping {
    pub nodes: NodeMapping,
    pub relationships: Vec<RelationshipUpsert>,
}

/// Schema-driven record-to-descriptor mapping.
#[derive(Debug, Clone)]
pub struct GraphAdapter {
    schema: SchemaModel,
    identity_key: String,
    identity_source: IdentitySource,
    missing_identity: MissingIdentity,
    rules: Vec<RelationshipRule>,
}

impl GraphAdapter {
    /// An adapter keyed on `name`, skipping records without one, with no rules.
    pub fn new(schema: SchemaModel) -> Self {
        Self {
            schema,
            identity_key: "name".to_string(),
            identity_source: IdentitySource::Key,
            missing_identity: MissingIdentity::Skip,
            rules: Vec::new(),
        }
    }

    pub fn from_config(schema: SchemaModel, config: &IngestConfig) -> Self {
        Self::new(schema)
            .with_identity_key(&config.identity_key)
            .with_identity_source(config.identity_source)
            .with_missing_identity(config.missing_identity)
            .with_rules(config.rules.clone())
    }

    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = key.into();
        self
    }

    pub fn with_identity_source(mut self, source: IdentitySource) -> Self {
        self.identity_source = source;
        self
    }

    pub fn with_missing_identity(mut self, policy: MissingIdentity) -> Self {
        self.missing_identity = policy;
        self
    }

    pub fn with_rules(mut self, rules: Vec<RelationshipRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn schema(&self) -> &SchemaModel {
        &self.schema
    }

    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    // ── Nodes ────────────────────────────────────────────────────

    /// Map records to node descriptors.
    ///
    /// Flat rows yield one descriptor per node kind the row mentions (any
    /// of the kind's properties, or its label column); a row without a
    /// usable identity is skipped once per such kind. Partitioned records
    /// yield one descriptor per record of each known label. Properties are
    /// the record fields named by the kind, blanks dropped.
    pub fn map_nodes(&self, records: &RecordSet) -> NodeMapping {
        let mut mapping = NodeMapping::default();
        match records {
            RecordSet::Rows(rows) => {
                for (index, record) in rows.iter().enumerate() {
                    for kind in self.kinds_for(record) {
                        let identity = match self.identity_source {
                            IdentitySource::Key => record.get(&self.identity_key),
                            IdentitySource::LabelColumn => record.get(&kind.label),
                        };
                        self.map_node(kind, record, identity, index, &mut mapping);
                    }
                }
            }
            RecordSet::Partitioned(parts) => {
                for label in parts.keys() {
                    if self.schema.node_kind(label).is_none() {
                        tracing::warn!(label = %label, "Records for a label missing from the schema are ignored");
                    }
                }
                for kind in self.schema.node_kinds() {
                    let Some(records) = parts.get(&kind.label) else {
                        continue;
                    };
                    for (index, record) in records.iter().enumerate() {
                        let identity = match self.identity_source {
                            IdentitySource::Key => record.get(&self.identity_key),
                            IdentitySource::LabelColumn => record
                                .get(&kind.label)
                                .or_else(|| record.get(&self.identity_key)),
                        };
                        self.map_node(kind, record, identity, index, &mut mapping);
                    }
                }
            }
        }

        tracing::debug!(
            nodes = mapping.nodes.len(),
            skipped = mapping.skipped.len(),
            "Records mapped to nodes"
        );
        mapping
    }

    /// Node kinds a flat row maps onto. A row that mentions no kind still
    /// counts against the kinds holding the identity key (all kinds when
    /// none does), so it is reported as skipped rather than vanishing.
    fn kinds_for(&self, record: &Record) -> Vec<&NodeKind> {
        let kinds = self.schema.node_kinds();
        let mentioned: Vec<&NodeKind> = kinds.iter().filter(|k| self.mentions(k, record)).collect();
        if !mentioned.is_empty() {
            return mentioned;
        }

        let owning: Vec<&NodeKind> = match self.identity_source {
            IdentitySource::Key => kinds
                .iter()
                .filter(|k| k.has_property(&self.identity_key))
                .collect(),
            IdentitySource::LabelColumn => Vec::new(),
        };
        if owning.is_empty() {
            kinds.iter().collect()
        } else {
            owning
        }
    }

    fn mentions(&self, kind: &NodeKind, record: &Record) -> bool {
        let by_label = self.identity_source == IdentitySource::LabelColumn
            && record.contains_key(&kind.label);
        by_label || kind.property_names.iter().any(|p| record.contains_key(p))
    }

    fn map_node(
        &self,
        kind: &NodeKind,
        record: &Record,
        identity: Option<&serde_json::Value>,
        record_index: usize,
        mapping: &mut NodeMapping,
    ) {
        let properties: Properties = kind
            .property_names
            .iter()
            .filter_map(|p| {
                record
                    .get(p)
                    .and_then(property_value)
                    .map(|v| (p.clone(), v))
            })
            .collect();

        match self.resolve_identity(&kind.label, identity, &properties) {
            Some(identity) => mapping.nodes.push(NodeUpsert::new(
                &kind.label,
                &self.identity_key,
                identity,
                properties,
            )),
            None => mapping.skipped.push(SkippedRecord {
                label: kind.label.clone(),
                record_index,
                reason: ItemError::MissingIdentity {
                    identity_key: self.identity_key.clone(),
                },
            }),
        }
    }

    fn resolve_identity(
        &self,
        label: &str,
        raw: Option<&serde_json::Value>,
        properties: &Properties,
    ) -> Option<String> {
        match (raw.and_then(identity_text), self.missing_identity) {
            (Some(identity), _) => Some(identity),
            (None, MissingIdentity::Derive) if !properties.is_empty() => {
                Some(derive_identity(label, properties))
            }
            (None, _) => None,
        }
    }

    // ── Relationships ────────────────────────────────────────────

    /// Evaluate every rule against every record; each satisfied rule emits
    /// exactly one descriptor.
    ///
    /// Endpoint labels come from the rule, then the schema's relationship
    /// kind, then (with label columns) the endpoint column names themselves.
    pub fn map_relationships(&self, records: &RecordSet) -> Vec<RelationshipUpsert> {
        let mut out = Vec::new();
        for record in records.records() {
            for rule in &self.rules {
                let Some((from, to)) = rule.endpoints(record) else {
                    continue;
                };
                let kind = self.schema.relationship_kind(&rule.rel_type);

                let from_label = rule
                    .from_label
                    .clone()
                    .or_else(|| kind.and_then(|k| k.source_label.clone()))
                    .or_else(|| self.column_label(&rule.from_column));
                let to_label = rule
                    .to_label
                    .clone()
                    .or_else(|| kind.and_then(|k| k.target_label.clone()))
                    .or_else(|| self.column_label(&rule.to_column));

                let property_names = rule
                    .property_columns
                    .iter()
                    .chain(kind.into_iter().flat_map(|k| k.property_names.iter()));
                let mut properties = Properties::new();
                for name in property_names {
                    if let Some(value) = record.get(name).and_then(property_value) {
                        properties.insert(name.clone(), value);
                    }
                }

                out.push(
                    RelationshipUpsert::new(&rule.rel_type, from, to)
                        .with_labels(from_label, to_label)
                        .with_properties(properties),
                );
            }
        }

        tracing::debug!(relationships = out.len(), "Records mapped to relationships");
        out
    }

    fn column_label(&self, column: &str) -> Option<String> {
        (self.identity_source == IdentitySource::LabelColumn)
            .then(|| self.schema.node_kind(column))
            .flatten()
            .map(|kind| kind.label.clone())
    }

    // ── Payloads ─────────────────────────────────────────────────

    /// Map an ingestion payload. The first label of each node is its label;
    /// its identity is `properties[identity_key]`. Labels known to the schema
    /// keep only schema properties; others keep everything.
    pub fn map_payload(&self, payload: &Payload) -> PayloadMapping {
        let mut mapping = PayloadMapping::default();
        let mut labels_by_identity: HashMap<String, Option<String>> = HashMap::new();

        for (index, node) in payload.nodes.iter().enumerate() {
            let Some(label) = node.labels.first().filter(|l| !l.trim().is_empty()) else {
                mapping.nodes.skipped.push(SkippedRecord {
                    label: String::new(),
                    record_index: index,
                    reason: ItemError::UnsafeIdentifier {
                        value: String::new(),
                    },
                });
                continue;
            };

            let kind = self.schema.node_kind(label);
            let properties: Properties = node
                .properties
                .iter()
                .filter(|(k, _)| kind.map_or(true, |kind| kind.has_property(k)))
                .filter_map(|(k, v)| property_value(v).map(|v| (k.clone(), v)))
                .collect();

            let raw = node.properties.get(&self.identity_key);
            match self.resolve_identity(label, raw, &properties) {
                Some(identity) => {
                    labels_by_identity
                        .entry(identity.clone())
                        .and_modify(|known| {
                            if known.as_deref() != Some(label.as_str()) {
                                *known = None;
                            }
                        })
                        .or_insert_with(|| Some(label.clone()));
                    mapping.nodes.nodes.push(NodeUpsert::new(
                        label,
                        &self.identity_key,
                        identity,
                        properties,
                    ));
                }
                None => mapping.nodes.skipped.push(SkippedRecord {
                    label: label.clone(),
                    record_index: index,
                    reason: ItemError::MissingIdentity {
                        identity_key: self.identity_key.clone(),
                    },
                }),
            }
        }

        // Endpoints named by exactly one label in the payload are matched on
        // that label; the rest are matched on identity alone.
        let label_of = |identity: &str| labels_by_identity.get(identity).cloned().flatten();
        for rel in &payload.relationships {
            let properties: Properties = rel
                .properties
                .iter()
                .filter_map(|(k, v)| property_value(v).map(|v| (k.clone(), v)))
                .collect();
            mapping.relationships.push(
                RelationshipUpsert::new(&rel.rel_type, &rel.from, &rel.to)
                    .with_labels(label_of(&rel.from), label_of(&rel.to))
                    .with_properties(properties),
            );
        }

        mapping
    }

    /// Map records into a self-contained ingestion payload.
    pub fn to_payload(&self, records: &RecordSet) -> (Payload, Vec<SkippedRecord>) {
        let nodes = self.map_nodes(records);
        let relationships = self.map_relationships(records);
        (
            Payload::from_descriptors(&nodes.nodes, &relationships),
            nodes.skipped,
        )
    }
}

fn derive_identity(label: &str, properties: &Properties) -> String {
    let canonical = serde_json::to_string(properties).unwrap_or_default();
    let name = format!("{label}\u{1f}{canonical}");
    Uuid::new_v5(&DERIVED_IDENTITY_NAMESPACE, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const BGC_SCHEMA: &str = r#"{
        "nodes": [
            {"labels": ["Genome"], "properties": ["name", "Genome_size"]},
            {"labels": ["Taxonomy"], "properties": ["name"]},
            {"labels": ["BGC"], "properties": ["name", "BGC_class"]},
            {"labels": ["product"], "properties": ["name"]}
        ],
        "relationships": [
            {"type": "CONTAINS", "properties": []},
            {"type": "PRODUCES", "from": "BGC", "to": "product", "properties": []}
        ]
    }"#;

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    fn rows(values: Vec<Value>) -> RecordSet {
        RecordSet::Rows(values.into_iter().map(record).collect())
    }

    fn person_adapter() -> GraphAdapter {
        let schema = SchemaModel::load(
            r#"{"nodes": [{"labels": ["Person"], "properties": ["name", "age"]}],
                "relationships": []}"#,
        )
        .unwrap();
        GraphAdapter::new(schema)
    }

    fn bgc_adapter() -> GraphAdapter {
        GraphAdapter::new(SchemaModel::load(BGC_SCHEMA).unwrap())
            .with_identity_source(IdentitySource::LabelColumn)
            .with_rules(vec![
                RelationshipRule::new("Genome", "BGC", "CONTAINS").requiring(["Genome", "BGC"]),
                RelationshipRule::new("Taxonomy", "BGC", "CONTAINS"),
                RelationshipRule::new("BGC", "product", "PRODUCES"),
            ])
    }

    #[test]
    fn maps_people_by_name() {
        let records = rows(vec![
            json!({"name": "Alice", "age": "30"}),
            json!({"name": "Bob", "age": "25"}),
        ]);
        let mapping = person_adapter().map_nodes(&records);

        assert!(mapping.skipped.is_empty());
        assert_eq!(mapping.nodes.len(), 2);
        assert_eq!(mapping.nodes[0].identity_value, "Alice");
        assert_eq!(mapping.nodes[0].properties["age"], json!("30"));
        assert_eq!(mapping.nodes[1].identity_value, "Bob");
        assert_eq!(mapping.nodes[1].properties["name"], json!("Bob"));
    }

    #[test]
    fn records_without_identity_are_skipped_and_counted() {
        let records = rows(vec![
            json!({"name": "Alice", "age": "30"}),
            json!({"age": "25"}),
            json!({"name": "  ", "age": "41"}),
            json!({"name": null}),
        ]);
        let mapping = person_adapter().map_nodes(&records);

        assert_eq!(mapping.nodes.len(), 1);
        assert_eq!(mapping.skipped.len(), 3);
        let indices: Vec<usize> = mapping.skipped.iter().map(|s| s.record_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(matches!(
            mapping.skipped[0].reason,
            ItemError::MissingIdentity { .. }
        ));
    }

    #[test]
    fn rows_without_schema_columns_are_still_counted() {
        let records = rows(vec![
            json!({"name": "Alice"}),
            json!({"nickname": "B"}),
            json!({}),
        ]);
        let mapping = person_adapter().map_nodes(&records);

        assert_eq!(mapping.nodes.len(), 1);
        let skipped: Vec<(&str, usize)> = mapping
            .skipped
            .iter()
            .map(|s| (s.label.as_str(), s.record_index))
            .collect();
        assert_eq!(skipped, vec![("Person", 1), ("Person", 2)]);

        // Only the kinds that hold the identity key are charged.
        let schema = SchemaModel::load(
            r#"{"nodes": [{"labels": ["Person"], "properties": ["name"]},
                          {"labels": ["Tag"], "properties": ["colour"]}]}"#,
        )
        .unwrap();
        let mapping = GraphAdapter::new(schema).map_nodes(&rows(vec![json!({"note": "x"})]));
        assert_eq!(mapping.skipped.len(), 1);
        assert_eq!(mapping.skipped[0].label, "Person");
    }

    #[test]
    fn derive_policy_is_deterministic() {
        let adapter = person_adapter().with_missing_identity(MissingIdentity::Derive);
        let records = rows(vec![json!({"age": "25"}), json!({"age": "25"}), json!({"name": ""})]);

        let mapping = adapter.map_nodes(&records);
        assert_eq!(mapping.nodes.len(), 2);
        assert_eq!(mapping.nodes[0].identity_value, mapping.nodes[1].identity_value);
        assert!(Uuid::parse_str(&mapping.nodes[0].identity_value).is_ok());
        assert_eq!(mapping.skipped.len(), 1);
    }

    #[test]
    fn rule_fires_only_when_columns_are_filled() {
        let adapter = GraphAdapter::new(SchemaModel::default()).with_rules(vec![
            RelationshipRule::new("Genome", "BGC", "CONTAINS").requiring(["Genome", "BGC"]),
        ]);

        let rels = adapter.map_relationships(&rows(vec![json!({"Genome": "G1", "BGC": "B1"})]));
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].from_identity, "G1");
        assert_eq!(rels[0].to_identity, "B1");
        assert_eq!(rels[0].rel_type, "CONTAINS");

        assert!(adapter
            .map_relationships(&rows(vec![json!({"Genome": "G1"})]))
            .is_empty());
        assert!(adapter
            .map_relationships(&rows(vec![json!({"Genome": "G1", "BGC": ""})]))
            .is_empty());
    }

    #[test]
    fn flattened_rows_yield_one_node_per_label_column() {
        let adapter = bgc_adapter();
        let records = rows(vec![json!({
            "Genome": "G1", "Genome_size": "5.1", "Taxonomy": "Streptomyces",
            "BGC": "B1", "BGC_class": "NRPS", "product": "",
        })]);

        let mapping = adapter.map_nodes(&records);
        let labels: Vec<&str> = mapping.nodes.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["Genome", "Taxonomy", "BGC"]);
        assert_eq!(mapping.nodes[0].properties["name"], json!("G1"));
        assert_eq!(mapping.nodes[0].properties["Genome_size"], json!("5.1"));
        assert_eq!(mapping.skipped.len(), 1);
        assert_eq!(mapping.skipped[0].label, "product");

        let rels = adapter.map_relationships(&records);
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].from_label.as_deref(), Some("Genome"));
        assert_eq!(rels[0].to_label.as_deref(), Some("BGC"));
        assert_eq!(rels[1].from_identity, "Streptomyces");
    }

    #[test]
    fn partitioned_records_use_their_label() {
        let adapter = bgc_adapter().with_identity_source(IdentitySource::Key);
        let mut parts = std::collections::BTreeMap::new();
        parts.insert("Genome".to_string(), vec![record(json!({"name": "G1"}))]);
        parts.insert("Unknown".to_string(), vec![record(json!({"name": "U1"}))]);

        let mapping = adapter.map_nodes(&RecordSet::Partitioned(parts));
        assert_eq!(mapping.nodes.len(), 1);
        assert_eq!(mapping.nodes[0].label, "Genome");
    }

    #[test]
    fn payload_round_trip_through_adapter() {
        let adapter = bgc_adapter();
        let records = rows(vec![json!({"Genome": "G1", "BGC": "B1", "product": "P1"})]);
        let (payload, skipped) = adapter.to_payload(&records);

        assert!(skipped.is_empty());
        assert_eq!(payload.nodes[0].id, "n0");
        assert_eq!(payload.relationships.len(), 2);

        let mapped = adapter.map_payload(&payload);
        assert_eq!(mapped.nodes.nodes.len(), 3);
        assert_eq!(mapped.relationships[0].from_label.as_deref(), Some("Genome"));
        assert_eq!(mapped.relationships[1].to_label.as_deref(), Some("product"));
    }

    #[test]
    fn payload_nodes_without_identity_are_skipped() {
        let payload: Payload = serde_json::from_value(json!({
            "nodes": [
                {"id": "n0", "labels": ["Genome"], "properties": {"name": "G1"}},
                {"id": "n1", "labels": ["Genome"], "properties": {}},
                {"id": "n2", "labels": [], "properties": {"name": "X"}}
            ],
            "relationships": [{"from": "G1", "to": "G9", "type": "RELATED_TO"}]
        }))
        .unwrap();

        let mapped = bgc_adapter().map_payload(&payload);
        assert_eq!(mapped.nodes.nodes.len(), 1);
        assert_eq!(mapped.nodes.skipped.len(), 2);
        assert_eq!(mapped.relationships[0].from_label.as_deref(), Some("Genome"));
        assert_eq!(mapped.relationships[0].to_label, None);
    }
}
