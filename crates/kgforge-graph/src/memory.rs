//! In-memory graph store.
//!
//! Interprets the [`Operation`] tag of each statement with the same
//! merge/overlay semantics the Cypher text expresses. Used for dry runs and
//! as the backing store in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use kgforge_core::Properties;

use crate::cypher::constraint_name;
use crate::executor::{Operation, Params, QueryError, QueryExecutor, ResultRow, Statement};

/// A node held by [`MemoryGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub label: String,
    pub properties: Properties,
}

type RelKey = (usize, String, usize);

#[derive(Debug, Default)]
struct State {
    nodes: Vec<StoredNode>,
    relationships: BTreeMap<RelKey, Properties>,
    constraints: BTreeSet<(String, String)>,
}

/// Mutex-guarded in-memory graph implementing [`QueryExecutor`].
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<State>,
    executed: AtomicUsize,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.lock().relationships.len()
    }

    /// Number of statements executed so far, including failed ones.
    pub fn statements_executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Look up a node by label and identity.
    pub fn node(&self, label: &str, key: &str, value: &str) -> Option<StoredNode> {
        let state = self.lock();
        let wanted = Value::String(value.to_string());
        state
            .nodes
            .iter()
            .find(|n| n.label == label && n.properties.get(key) == Some(&wanted))
            .cloned()
    }

    /// Properties of the relationship `(from)-[rel_type]->(to)`, endpoints located by `key`.
    pub fn relationship(
        &self,
        rel_type: &str,
        key: &str,
        from: &str,
        to: &str,
    ) -> Option<Properties> {
        let state = self.lock();
        let from_ids = state.matching(None, key, from);
        let to_ids = state.matching(None, key, to);
        state
            .relationships
            .iter()
            .find(|((a, t, b), _)| t == rel_type && from_ids.contains(a) && to_ids.contains(b))
            .map(|(_, props)| props.clone())
    }

    pub fn constraints(&self) -> Vec<(String, String)> {
        self.lock().constraints.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves the maps structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueryExecutor for MemoryGraph {
    async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.apply(&statement.operation, &statement.params)
    }
}

impl State {
    fn apply(&mut self, op: &Operation, params: &Params) -> Result<Vec<ResultRow>, QueryError> {
        match op {
            Operation::MergeNode { label, key } => {
                let identity = str_param(params, "identity")?;
                let properties = props_param(params, "properties")?;
                self.merge_node(label, key, &identity, properties)?;
                Ok(Vec::new())
            }
            Operation::MergeNodes { label, key } => {
                let rows = rows_param(params)?
                    .iter()
                    .map(|row| Ok((str_param(row, "identity")?, props_param(row, "properties")?)))
                    .collect::<Result<Vec<_>, QueryError>>()?;

                // A statement is atomic: a clash on any row undoes the earlier rows.
                let snapshot = self.nodes.clone();
                for (identity, properties) in rows {
                    if let Err(e) = self.merge_node(label, key, &identity, properties) {
                        self.nodes = snapshot;
                        return Err(e);
                    }
                }
                Ok(Vec::new())
            }
            Operation::MergeRelationship {
                rel_type,
                from_label,
                to_label,
                key,
            } => {
                let from = str_param(params, "from")?;
                let to = str_param(params, "to")?;
                let properties = props_param(params, "properties")?;
                let merged = self.merge_relationship(
                    rel_type,
                    from_label.as_deref(),
                    to_label.as_deref(),
                    key,
                    &from,
                    &to,
                    &properties,
                );
                Ok(vec![row("merged", json!(merged))])
            }
            Operation::MergeRelationships {
                rel_type,
                from_label,
                to_label,
                key,
            } => {
                let rows = rows_param(params)?
                    .iter()
                    .map(|row| {
                        let index = row
                            .get("index")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| QueryError::new("row without index"))?;
                        Ok((
                            index,
                            str_param(row, "from")?,
                            str_param(row, "to")?,
                            props_param(row, "properties")?,
                        ))
                    })
                    .collect::<Result<Vec<_>, QueryError>>()?;

                let mut out = Vec::new();
                for (index, from, to, properties) in rows {
                    let merged = self.merge_relationship(
                        rel_type,
                        from_label.as_deref(),
                        to_label.as_deref(),
                        key,
                        &from,
                        &to,
                        &properties,
                    );
                    if merged > 0 {
                        out.push(row("index", json!(index)));
                    }
                }
                Ok(out)
            }
            Operation::LinkByProperty {
                rel_type,
                from_label,
                to_label,
                from_property,
                to_property,
            } => {
                let properties = props_param(params, "properties")?;
                let mut pairs = Vec::new();
                for (a, from_node) in self.nodes.iter().enumerate() {
                    if &from_node.label != from_label {
                        continue;
                    }
                    let Some(value) = from_node.properties.get(from_property) else {
                        continue;
                    };
                    for (b, to_node) in self.nodes.iter().enumerate() {
                        if &to_node.label == to_label
                            && to_node.properties.get(to_property) == Some(value)
                        {
                            pairs.push((a, b));
                        }
                    }
                }
                for &(a, b) in &pairs {
                    self.overlay_relationship(a, rel_type, b, &properties);
                }
                Ok(vec![row("linked", json!(pairs.len()))])
            }
            Operation::CreateUniqueConstraint { label, property } => {
                self.constraints.insert((label.clone(), property.clone()));
                Ok(Vec::new())
            }
            Operation::CountNodes { label } => {
                let count = self
                    .nodes
                    .iter()
                    .filter(|n| label.as_ref().map_or(true, |l| &n.label == l))
                    .count();
                Ok(vec![row("count", json!(count))])
            }
            Operation::CountRelationships { rel_type } => {
                let count = self
                    .relationships
                    .keys()
                    .filter(|(_, t, _)| rel_type.as_ref().map_or(true, |r| t == r))
                    .count();
                Ok(vec![row("count", json!(count))])
            }
            Operation::FindNode { label, key } => {
                let value = str_param(params, "value")?;
                Ok(self
                    .matching(Some(label), key, &value)
                    .into_iter()
                    .map(|i| row("properties", properties_value(&self.nodes[i].properties)))
                    .collect())
            }
            Operation::NodeProperties { label } => Ok(self
                .nodes
                .iter()
                .filter(|n| &n.label == label)
                .map(|n| row("properties", properties_value(&n.properties)))
                .collect()),
            Operation::RelationshipProperties { rel_type } => Ok(self
                .relationships
                .iter()
                .filter(|((_, t, _), _)| t == rel_type)
                .map(|((_, t, _), props)| {
                    let mut out = row("type", json!(t));
                    out.insert("properties".to_string(), properties_value(props));
                    out
                })
                .collect()),
            Operation::ShowConstraints { label } => Ok(self
                .constraints
                .iter()
                .filter(|(c_label, _)| label.as_ref().map_or(true, |l| l == c_label))
                .map(|(c_label, property)| {
                    let mut out = row("name", json!(constraint_name(c_label, property)));
                    out.insert("labels".to_string(), json!([c_label]));
                    out.insert("properties".to_string(), json!([property]));
                    out
                })
                .collect()),
            Operation::ShowDatabases => Ok(vec![row("name", json!("memory"))]),
            Operation::DeleteNodes {
                label,
                having_property,
            } => {
                let deleted = self.delete_nodes(label.as_deref(), having_property.as_deref());
                Ok(vec![row("deleted", json!(deleted))])
            }
            Operation::Raw => Err(QueryError::new(
                "in-memory graph cannot run untagged statements",
            )),
        }
    }

    fn matching(&self, label: Option<&str>, key: &str, value: &str) -> Vec<usize> {
        let wanted = Value::String(value.to_string());
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| label.map_or(true, |l| n.label == l))
            .filter(|(_, n)| n.properties.get(key) == Some(&wanted))
            .map(|(i, _)| i)
            .collect()
    }

    fn merge_node(
        &mut self,
        label: &str,
        key: &str,
        identity: &str,
        properties: Properties,
    ) -> Result<(), QueryError> {
        let existing = self.matching(Some(label), key, identity).first().copied();
        self.check_constraints(existing, label, &properties)?;

        let index = match existing {
            Some(index) => index,
            None => {
                let mut initial = Properties::new();
                initial.insert(key.to_string(), Value::String(identity.to_string()));
                self.nodes.push(StoredNode {
                    label: label.to_string(),
                    properties: initial,
                });
                self.nodes.len() - 1
            }
        };
        self.nodes[index].properties.extend(properties);
        Ok(())
    }

    /// Reject an overlay that would give two nodes of a label the same value
    /// for a uniquely constrained property. `existing` is the node being
    /// overlaid, if it is already stored.
    fn check_constraints(
        &self,
        existing: Option<usize>,
        label: &str,
        properties: &Properties,
    ) -> Result<(), QueryError> {
        let clash = self
            .constraints
            .iter()
            .filter(|(c_label, _)| c_label == label)
            .find_map(|(_, c_property)| {
                let value = properties.get(c_property)?;
                self.nodes
                    .iter()
                    .enumerate()
                    .any(|(i, n)| {
                        Some(i) != existing
                            && n.label == label
                            && n.properties.get(c_property) == Some(value)
                    })
                    .then(|| (c_property.clone(), value.clone()))
            });

        match clash {
            Some((property, value)) => Err(QueryError::new(format!(
                "Node already exists with label `{label}` and property `{property}` = {value}"
            ))),
            None => Ok(()),
        }
    }

    fn delete_nodes(&mut self, label: Option<&str>, having_property: Option<&str>) -> usize {
        let doomed: BTreeSet<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| label.map_or(true, |l| n.label == l))
            .filter(|(_, n)| having_property.map_or(true, |p| n.properties.contains_key(p)))
            .map(|(i, _)| i)
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        // Relationship keys hold node positions; renumber the survivors.
        let mut remap = BTreeMap::new();
        let mut kept = Vec::with_capacity(self.nodes.len() - doomed.len());
        for (i, node) in std::mem::take(&mut self.nodes).into_iter().enumerate() {
            if !doomed.contains(&i) {
                remap.insert(i, kept.len());
                kept.push(node);
            }
        }
        self.nodes = kept;
        self.relationships = std::mem::take(&mut self.relationships)
            .into_iter()
            .filter_map(|((a, t, b), props)| Some(((*remap.get(&a)?, t, *remap.get(&b)?), props)))
            .collect();
        doomed.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_relationship(
        &mut self,
        rel_type: &str,
        from_label: Option<&str>,
        to_label: Option<&str>,
        key: &str,
        from: &str,
        to: &str,
        properties: &Properties,
    ) -> usize {
        let sources = self.matching(from_label, key, from);
        let targets = self.matching(to_label, key, to);
        let mut merged = 0;
        for &a in &sources {
            for &b in &targets {
                self.overlay_relationship(a, rel_type, b, properties);
                merged += 1;
            }
        }
        merged
    }

    fn overlay_relationship(&mut self, a: usize, rel_type: &str, b: usize, properties: &Properties) {
        self.relationships
            .entry((a, rel_type.to_string(), b))
            .or_default()
            .extend(properties.clone());
    }
}

fn row(column: &str, value: Value) -> ResultRow {
    let mut row = ResultRow::new();
    row.insert(column.to_string(), value);
    row
}

fn properties_value(properties: &Properties) -> Value {
    Value::Object(properties.clone().into_iter().collect())
}

fn str_param(params: &Params, key: &str) -> Result<String, QueryError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| QueryError::new(format!("missing string parameter `{key}`")))
}

fn props_param(params: &Params, key: &str) -> Result<Properties, QueryError> {
    match params.get(key) {
        Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
        None | Some(Value::Null) => Ok(Properties::new()),
        Some(_) => Err(QueryError::new(format!("parameter `{key}` is not a map"))),
    }
}

fn rows_param(params: &Params) -> Result<Vec<Params>, QueryError> {
    match params.get("rows") {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| match row {
                Value::Object(map) => Ok(map.clone().into_iter().collect()),
                _ => Err(QueryError::new("`rows` entries must be maps")),
            })
            .collect(),
        _ => Err(QueryError::new("missing list parameter `rows`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypher;
    use kgforge_core::{NodeUpsert, RelationshipUpsert};

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn merge_node_creates_then_overlays() {
        let graph = MemoryGraph::new();
        let first = NodeUpsert::new("Person", "name", "Alice", props(&[("age", "30")]));
        let second = NodeUpsert::new("Person", "name", "Alice", props(&[("city", "Oslo")]));

        graph.execute(cypher::merge_node(&first).unwrap()).await.unwrap();
        graph.execute(cypher::merge_node(&second).unwrap()).await.unwrap();

        assert_eq!(graph.node_count(), 1);
        let alice = graph.node("Person", "name", "Alice").unwrap();
        assert_eq!(alice.properties["age"], json!("30"));
        assert_eq!(alice.properties["city"], json!("Oslo"));
    }

    #[tokio::test]
    async fn relationship_requires_both_endpoints() {
        let graph = MemoryGraph::new();
        let g1 = NodeUpsert::new("Genome", "name", "G1", Properties::new());
        graph.execute(cypher::merge_node(&g1).unwrap()).await.unwrap();

        let rel = RelationshipUpsert::new("CONTAINS", "G1", "B1");
        let rows = graph
            .execute(cypher::merge_relationship(&rel, "name").unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0]["merged"], json!(0));
        assert_eq!(graph.relationship_count(), 0);

        let b1 = NodeUpsert::new("BGC", "name", "B1", Properties::new());
        graph.execute(cypher::merge_node(&b1).unwrap()).await.unwrap();
        let rows = graph
            .execute(cypher::merge_relationship(&rel, "name").unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0]["merged"], json!(1));
        assert!(graph.relationship("CONTAINS", "name", "G1", "B1").is_some());
    }

    #[tokio::test]
    async fn unique_constraint_rejects_clash() {
        let graph = MemoryGraph::new();
        graph
            .execute(cypher::create_unique_constraint("Person", "email").unwrap())
            .await
            .unwrap();

        let alice = NodeUpsert::new("Person", "name", "Alice", props(&[("email", "a@x")]));
        let bob = NodeUpsert::new("Person", "name", "Bob", props(&[("email", "a@x")]));
        graph.execute(cypher::merge_node(&alice).unwrap()).await.unwrap();
        let err = graph
            .execute(cypher::merge_node(&bob).unwrap())
            .await
            .unwrap_err();
        assert!(err.message.contains("email"));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.constraints(), vec![("Person".into(), "email".into())]);
    }

    #[tokio::test]
    async fn clash_on_identity_only_node_keeps_it() {
        let graph = MemoryGraph::new();
        graph
            .execute(cypher::create_unique_constraint("Person", "email").unwrap())
            .await
            .unwrap();
        let alice = NodeUpsert::new("Person", "name", "Alice", props(&[("email", "a@x")]));
        let bob = NodeUpsert::new("Person", "name", "Bob", Properties::new());
        graph.execute(cypher::merge_node(&alice).unwrap()).await.unwrap();
        graph.execute(cypher::merge_node(&bob).unwrap()).await.unwrap();

        let bob_email = NodeUpsert::new("Person", "name", "Bob", props(&[("email", "a@x")]));
        assert!(graph.execute(cypher::merge_node(&bob_email).unwrap()).await.is_err());

        assert_eq!(graph.node_count(), 2);
        let bob = graph.node("Person", "name", "Bob").unwrap();
        assert!(!bob.properties.contains_key("email"));
    }

    #[tokio::test]
    async fn clashing_batch_applies_no_rows() {
        let graph = MemoryGraph::new();
        graph
            .execute(cypher::create_unique_constraint("Person", "email").unwrap())
            .await
            .unwrap();
        let alice = NodeUpsert::new("Person", "name", "Alice", props(&[("email", "a@x")]));
        graph.execute(cypher::merge_node(&alice).unwrap()).await.unwrap();

        let carol = NodeUpsert::new("Person", "name", "Carol", props(&[("email", "c@x")]));
        let bob = NodeUpsert::new("Person", "name", "Bob", props(&[("email", "a@x")]));
        let batch = cypher::merge_nodes("Person", "name", &[&carol, &bob]).unwrap();
        assert!(graph.execute(batch).await.is_err());

        assert_eq!(graph.node_count(), 1);
        assert!(graph.node("Person", "name", "Carol").is_none());
    }

    #[tokio::test]
    async fn link_by_property_and_counts() {
        let graph = MemoryGraph::new();
        for (label, name, key) in [
            ("Compound", "water", "cpd1"),
            ("Reaction", "rxn1", "cpd1"),
            ("Reaction", "rxn2", "cpd9"),
        ] {
            let node = NodeUpsert::new(label, "name", name, props(&[("compound", key)]));
            graph.execute(cypher::merge_node(&node).unwrap()).await.unwrap();
        }

        let stmt = cypher::link_by_property(
            "PARTICIPATES_IN",
            "Compound",
            "Reaction",
            "compound",
            "compound",
            &Properties::new(),
        )
        .unwrap();
        let rows = graph.execute(stmt).await.unwrap();
        assert_eq!(rows[0]["linked"], json!(1));

        let rows = graph
            .execute(cypher::count_nodes(Some("Reaction")).unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0]["count"], json!(2));
        let rows = graph
            .execute(cypher::count_relationships(None).unwrap())
            .await
            .unwrap();
        assert_eq!(rows[0]["count"], json!(1));
    }

    #[tokio::test]
    async fn raw_statements_are_rejected() {
        let graph = MemoryGraph::new();
        assert!(graph.execute(Statement::raw("MATCH (n) RETURN n")).await.is_err());
        assert_eq!(graph.statements_executed(), 1);
    }
}
