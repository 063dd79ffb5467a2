//! The upsert engine.
//!
//! Turns descriptors into idempotent MERGE statements and tracks the outcome
//! of every item. A failing item is recorded and processing moves on; only
//! the caller decides what to do with the accumulated failures.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use kgforge_core::identifier::ensure_safe;
use kgforge_core::{
    ConstraintError, ItemError, NodeUpsert, Properties, RelationshipUpsert, SchemaModel,
    UpsertResult,
};

use crate::cypher;
use crate::executor::{first_count, QueryExecutor, ResultRow, Statement};

fn default_identity_key() -> String {
    "name".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

/// Writer behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Property nodes are merged on.
    #[serde(default = "default_identity_key")]
    pub identity_key: String,

    /// Property relationship endpoints are matched on. Falls back to `identity_key`.
    #[serde(default)]
    pub endpoint_key: Option<String>,

    /// Descriptors per statement. `1` issues one MERGE per descriptor.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deadline for every individual query.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            endpoint_key: None,
            batch_size: default_batch_size(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl WriterConfig {
    pub fn endpoint_key(&self) -> &str {
        self.endpoint_key.as_deref().unwrap_or(&self.identity_key)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Connect nodes of two labels whose properties hold equal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyJoin {
    pub from_label: String,
    pub to_label: String,
    pub from_property: String,
    pub to_property: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Issues merges through a [`QueryExecutor`] and accumulates per-item results.
///
/// Clone is cheap; clones share the executor and the cancellation token.
#[derive(Clone)]
pub struct GraphWriter {
    executor: Arc<dyn QueryExecutor>,
    config: WriterConfig,
    cancel: CancellationToken,
}

impl GraphWriter {
    pub fn new(executor: Arc<dyn QueryExecutor>, config: WriterConfig) -> Self {
        Self {
            executor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token`: once cancelled, no further items are dispatched.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one statement under the configured deadline.
    async fn run(&self, statement: Statement) -> Result<Vec<ResultRow>, ItemError> {
        let operation = statement.operation.name();
        tracing::debug!(operation, cypher = %statement.cypher, "Executing statement");

        match tokio::time::timeout(
            self.config.query_timeout(),
            self.executor.execute(statement),
        )
        .await
        {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(ItemError::Query { message: e.message }),
            Err(_) => Err(ItemError::Timeout {
                millis: self.config.query_timeout_ms,
            }),
        }
    }

    // ── Nodes ────────────────────────────────────────────────────

    /// Merge every descriptor by `(label, identity)`, overlaying properties.
    pub async fn upsert_nodes(&self, nodes: &[NodeUpsert]) -> UpsertResult {
        let result = if self.config.batch_size > 1 {
            self.upsert_nodes_batched(nodes).await
        } else {
            let mut result = UpsertResult::default();
            for (index, node) in nodes.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    result.not_dispatched += nodes.len() - index;
                    break;
                }
                self.record_node(&mut result, index, node, self.upsert_node(node).await);
            }
            result
        };

        tracing::info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            not_dispatched = result.not_dispatched,
            "Node upsert complete"
        );
        result
    }

    async fn upsert_node(&self, node: &NodeUpsert) -> Result<(), ItemError> {
        validate_node(node)?;
        let statement = cypher::merge_node(node)?;
        self.run(statement).await.map(|_| ())
    }

    async fn upsert_nodes_batched(&self, nodes: &[NodeUpsert]) -> UpsertResult {
        let mut result = UpsertResult::default();

        let mut groups: Vec<((&str, &str), Vec<usize>)> = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            if let Err(reason) = validate_node(node) {
                self.record_node(&mut result, index, node, Err(reason));
                continue;
            }
            let key = (node.label.as_str(), node.identity_key.as_str());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(index),
                None => groups.push((key, vec![index])),
            }
        }

        let mut pending: usize = groups.iter().map(|(_, m)| m.len()).sum();
        'groups: for ((label, key), members) in &groups {
            for chunk in members.chunks(self.config.batch_size) {
                if self.cancel.is_cancelled() {
                    result.not_dispatched += pending;
                    break 'groups;
                }
                let batch: Vec<&NodeUpsert> = chunk.iter().map(|&i| &nodes[i]).collect();
                let outcome = match cypher::merge_nodes(label, key, &batch) {
                    Ok(statement) => self.run(statement).await.map(|_| ()),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(()) => {
                        tracing::debug!(label, size = chunk.len(), "Node batch merged");
                        for _ in chunk {
                            result.record_success();
                        }
                        pending -= chunk.len();
                    }
                    Err(e) => {
                        tracing::warn!(label, size = chunk.len(), error = %e, "Node batch failed, replaying items singly");
                        for &index in chunk {
                            if self.cancel.is_cancelled() {
                                result.not_dispatched += pending;
                                break 'groups;
                            }
                            let node = &nodes[index];
                            self.record_node(&mut result, index, node, self.upsert_node(node).await);
                            pending -= 1;
                        }
                    }
                }
            }
        }

        result.errors.sort_by_key(|f| f.index);
        result
    }

    fn record_node(
        &self,
        result: &mut UpsertResult,
        index: usize,
        node: &NodeUpsert,
        outcome: Result<(), ItemError>,
    ) {
        match outcome {
            Ok(()) => {
                tracing::debug!(node = %node.describe(), "Node merged");
                result.record_success();
            }
            Err(reason) => {
                tracing::warn!(node = %node.describe(), error = %reason, retryable = reason.is_retryable(), "Node upsert failed");
                result.record_failure(index, node.describe(), reason);
            }
        }
    }

    // ── Relationships ────────────────────────────────────────────

    /// Match both endpoints and merge the relationship between them.
    ///
    /// A missing endpoint fails that item with `EndpointNotFound`; the rest
    /// of the sequence is still processed.
    pub async fn upsert_relationships(&self, relationships: &[RelationshipUpsert]) -> UpsertResult {
        let result = if self.config.batch_size > 1 {
            self.upsert_relationships_batched(relationships).await
        } else {
            let mut result = UpsertResult::default();
            for (index, rel) in relationships.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    result.not_dispatched += relationships.len() - index;
                    break;
                }
                let outcome = self.upsert_relationship(rel).await;
                self.record_relationship(&mut result, index, rel, outcome);
            }
            result
        };

        tracing::info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            not_dispatched = result.not_dispatched,
            "Relationship upsert complete"
        );
        result
    }

    async fn upsert_relationship(&self, rel: &RelationshipUpsert) -> Result<(), ItemError> {
        let key = self.config.endpoint_key();
        validate_relationship(rel, key)?;
        let statement = cypher::merge_relationship(rel, key)?;
        let rows = self.run(statement).await?;
        if first_count(&rows, "merged") == 0 {
            return Err(endpoint_not_found(rel));
        }
        Ok(())
    }

    async fn upsert_relationships_batched(
        &self,
        relationships: &[RelationshipUpsert],
    ) -> UpsertResult {
        let key = self.config.endpoint_key();
        let mut result = UpsertResult::default();

        type GroupKey<'a> = (&'a str, Option<&'a str>, Option<&'a str>);
        let mut groups: Vec<(GroupKey<'_>, Vec<usize>)> = Vec::new();
        for (index, rel) in relationships.iter().enumerate() {
            if let Err(reason) = validate_relationship(rel, key) {
                self.record_relationship(&mut result, index, rel, Err(reason));
                continue;
            }
            let group = (
                rel.rel_type.as_str(),
                rel.from_label.as_deref(),
                rel.to_label.as_deref(),
            );
            match groups.iter_mut().find(|(k, _)| *k == group) {
                Some((_, members)) => members.push(index),
                None => groups.push((group, vec![index])),
            }
        }

        let mut pending: usize = groups.iter().map(|(_, m)| m.len()).sum();
        'groups: for ((rel_type, from_label, to_label), members) in &groups {
            for chunk in members.chunks(self.config.batch_size) {
                if self.cancel.is_cancelled() {
                    result.not_dispatched += pending;
                    break 'groups;
                }
                let rows: Vec<(usize, &RelationshipUpsert)> =
                    chunk.iter().map(|&i| (i, &relationships[i])).collect();
                let outcome =
                    match cypher::merge_relationships(rel_type, *from_label, *to_label, key, &rows) {
                        Ok(statement) => self.run(statement).await,
                        Err(e) => Err(e),
                    };

                match outcome {
                    Ok(returned) => {
                        tracing::debug!(rel_type, size = chunk.len(), "Relationship batch merged");
                        let merged: Vec<u64> = returned
                            .iter()
                            .filter_map(|row| row.get("index").and_then(|v| v.as_u64()))
                            .collect();
                        for &index in chunk {
                            let rel = &relationships[index];
                            let outcome = if merged.contains(&(index as u64)) {
                                Ok(())
                            } else {
                                Err(endpoint_not_found(rel))
                            };
                            self.record_relationship(&mut result, index, rel, outcome);
                        }
                        pending -= chunk.len();
                    }
                    Err(e) => {
                        tracing::warn!(rel_type, size = chunk.len(), error = %e, "Relationship batch failed, replaying items singly");
                        for &index in chunk {
                            if self.cancel.is_cancelled() {
                                result.not_dispatched += pending;
                                break 'groups;
                            }
                            let rel = &relationships[index];
                            let outcome = self.upsert_relationship(rel).await;
                            self.record_relationship(&mut result, index, rel, outcome);
                            pending -= 1;
                        }
                    }
                }
            }
        }

        result.errors.sort_by_key(|f| f.index);
        result
    }

    fn record_relationship(
        &self,
        result: &mut UpsertResult,
        index: usize,
        rel: &RelationshipUpsert,
        outcome: Result<(), ItemError>,
    ) {
        match outcome {
            Ok(()) => {
                tracing::debug!(relationship = %rel.describe(), "Relationship merged");
                result.record_success();
            }
            Err(reason) => {
                tracing::warn!(relationship = %rel.describe(), error = %reason, retryable = reason.is_retryable(), "Relationship upsert failed");
                result.record_failure(index, rel.describe(), reason);
            }
        }
    }

    // ── Constraints and joins ────────────────────────────────────

    /// Declare `label.property` unique, if not already declared.
    pub async fn declare_unique_constraint(
        &self,
        label: &str,
        property: &str,
    ) -> Result<(), ConstraintError> {
        let failed = |reason: String| ConstraintError {
            label: label.to_string(),
            property: property.to_string(),
            reason,
        };

        let statement =
            cypher::create_unique_constraint(label, property).map_err(|e| failed(e.to_string()))?;
        self.run(statement).await.map_err(|e| failed(e.to_string()))?;

        tracing::info!(label, property, "Unique constraint declared");
        Ok(())
    }

    /// Declare an identity-key uniqueness constraint for every node kind.
    /// Failures are logged and returned; none of them stops the others.
    pub async fn declare_constraints(&self, schema: &SchemaModel) -> Vec<ConstraintError> {
        let mut failures = Vec::new();
        for kind in schema.node_kinds() {
            if let Err(e) = self
                .declare_unique_constraint(&kind.label, &self.config.identity_key)
                .await
            {
                tracing::warn!(label = %e.label, property = %e.property, reason = %e.reason, "Constraint declaration failed");
                failures.push(e);
            }
        }
        failures
    }

    /// Merge `join.rel_type` between every matching pair. Returns the number linked.
    pub async fn link_by_property(&self, join: &PropertyJoin) -> Result<i64, ItemError> {
        let statement = cypher::link_by_property(
            &join.rel_type,
            &join.from_label,
            &join.to_label,
            &join.from_property,
            &join.to_property,
            &join.properties,
        )?;
        let rows = self.run(statement).await?;
        let linked = first_count(&rows, "linked");
        tracing::info!(
            rel_type = %join.rel_type,
            from_label = %join.from_label,
            to_label = %join.to_label,
            linked,
            "Property join complete"
        );
        Ok(linked)
    }

    /// Detach-delete nodes, optionally only those with `label` and carrying
    /// `having_property`. Returns the number deleted.
    pub async fn delete_nodes(
        &self,
        label: Option<&str>,
        having_property: Option<&str>,
    ) -> Result<i64, ItemError> {
        let statement = cypher::delete_nodes(label, having_property)?;
        let rows = self.run(statement).await?;
        let deleted = first_count(&rows, "deleted");
        tracing::warn!(label, having_property, deleted, "Nodes deleted");
        Ok(deleted)
    }
}

fn validate_node(node: &NodeUpsert) -> Result<(), ItemError> {
    ensure_safe(&node.label)?;
    ensure_safe(&node.identity_key)?;
    node.check_identity()
}

fn validate_relationship(rel: &RelationshipUpsert, key: &str) -> Result<(), ItemError> {
    ensure_safe(&rel.rel_type)?;
    ensure_safe(key)?;
    for label in [&rel.from_label, &rel.to_label].into_iter().flatten() {
        ensure_safe(label)?;
    }
    if rel.from_identity.trim().is_empty() || rel.to_identity.trim().is_empty() {
        return Err(ItemError::MissingIdentity {
            identity_key: key.to_string(),
        });
    }
    Ok(())
}

fn endpoint_not_found(rel: &RelationshipUpsert) -> ItemError {
    ItemError::EndpointNotFound {
        from: rel.from_identity.clone(),
        to: rel.to_identity.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryError;
    use crate::MemoryGraph;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Fails any statement that mentions `poison` as an identity.
    struct Poisoned {
        inner: MemoryGraph,
        poison: &'static str,
    }

    #[async_trait]
    impl QueryExecutor for Poisoned {
        async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
            let poison = json!(self.poison);
            let hit = statement.params.get("identity") == Some(&poison)
                || statement.params.get("from") == Some(&poison)
                || statement
                    .params
                    .get("rows")
                    .and_then(Value::as_array)
                    .is_some_and(|rows| {
                        rows.iter()
                            .any(|r| r.get("identity") == Some(&poison) || r.get("from") == Some(&poison))
                    });
            if hit {
                return Err(QueryError::new("store rejected the write"));
            }
            self.inner.execute(statement).await
        }
    }

    struct Slow;

    #[async_trait]
    impl QueryExecutor for Slow {
        async fn execute(&self, _statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    /// Cancels the token after the first statement it runs.
    struct CancelAfterFirst {
        inner: MemoryGraph,
        token: CancellationToken,
    }

    #[async_trait]
    impl QueryExecutor for CancelAfterFirst {
        async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
            let rows = self.inner.execute(statement).await;
            self.token.cancel();
            rows
        }
    }

    fn person(name: &str, age: &str) -> NodeUpsert {
        let mut props = Properties::new();
        props.insert("age".into(), json!(age));
        NodeUpsert::new("Person", "name", name, props)
    }

    fn people() -> Vec<NodeUpsert> {
        vec![person("Alice", "30"), person("Bob", "25"), person("Carol", "41")]
    }

    fn batched(size: usize) -> WriterConfig {
        WriterConfig {
            batch_size: size,
            ..WriterConfig::default()
        }
    }

    #[test]
    fn config_defaults() {
        let config: WriterConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.identity_key, "name");
        assert_eq!(config.endpoint_key(), "name");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.query_timeout(), Duration::from_secs(30));

        let config: WriterConfig =
            serde_json::from_value(json!({"identity_key": "id", "endpoint_key": "uid"})).unwrap();
        assert_eq!(config.endpoint_key(), "uid");
    }

    #[tokio::test]
    async fn upserting_twice_is_idempotent() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());

        let first = writer.upsert_nodes(&people()).await;
        let after_once = graph.node("Person", "name", "Alice").unwrap();
        let second = writer.upsert_nodes(&people()).await;

        assert!(first.is_clean() && second.is_clean());
        assert_eq!(second.succeeded, 3);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node("Person", "name", "Alice").unwrap(), after_once);
    }

    #[tokio::test]
    async fn overlay_keeps_unmentioned_properties() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());

        writer.upsert_nodes(&[person("Alice", "30")]).await;
        let mut props = Properties::new();
        props.insert("city".into(), json!("Oslo"));
        writer
            .upsert_nodes(&[NodeUpsert::new("Person", "name", "Alice", props)])
            .await;

        let alice = graph.node("Person", "name", "Alice").unwrap();
        assert_eq!(alice.properties["age"], json!("30"));
        assert_eq!(alice.properties["city"], json!("Oslo"));
    }

    #[tokio::test]
    async fn failing_item_does_not_stop_the_rest() {
        for size in [1, 10] {
            let executor = Arc::new(Poisoned {
                inner: MemoryGraph::new(),
                poison: "Bob",
            });
            let writer = GraphWriter::new(executor.clone(), batched(size));

            let result = writer.upsert_nodes(&people()).await;

            assert_eq!(result.attempted, 3);
            assert_eq!(result.succeeded, 2, "batch_size {size}");
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].index, 1);
            assert!(matches!(result.errors[0].reason, ItemError::Query { .. }));
            assert_eq!(executor.inner.node_count(), 2);
        }
    }

    #[tokio::test]
    async fn unsafe_label_never_reaches_executor() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());

        let bad = NodeUpsert::new("Foo; DROP", "name", "x", Properties::new());
        let result = writer.upsert_nodes(&[bad]).await;

        assert_eq!(result.failed, 1);
        assert_eq!(
            result.errors[0].reason,
            ItemError::UnsafeIdentifier {
                value: "Foo; DROP".into()
            }
        );
        assert_eq!(graph.statements_executed(), 0);

        let rel = RelationshipUpsert::new("KNOWS]->() //", "a", "b");
        let result = writer.upsert_relationships(&[rel]).await;
        assert_eq!(result.failed, 1);
        assert_eq!(graph.statements_executed(), 0);
    }

    #[tokio::test]
    async fn missing_endpoint_is_recorded_per_item() {
        for size in [1, 10] {
            let graph = Arc::new(MemoryGraph::new());
            let writer = GraphWriter::new(graph.clone(), batched(size));
            writer.upsert_nodes(&people()).await;

            let rels = vec![
                RelationshipUpsert::new("KNOWS", "Alice", "Bob"),
                RelationshipUpsert::new("KNOWS", "Alice", "Zed"),
                RelationshipUpsert::new("KNOWS", "Bob", "Carol"),
            ];
            let result = writer.upsert_relationships(&rels).await;

            assert_eq!(result.succeeded, 2, "batch_size {size}");
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].index, 1);
            assert_eq!(
                result.errors[0].reason,
                ItemError::EndpointNotFound {
                    from: "Alice".into(),
                    to: "Zed".into()
                }
            );
            assert_eq!(graph.relationship_count(), 2);
        }
    }

    #[tokio::test]
    async fn endpoint_key_is_configurable() {
        let graph = Arc::new(MemoryGraph::new());
        let config = WriterConfig {
            endpoint_key: Some("code".into()),
            ..WriterConfig::default()
        };
        let writer = GraphWriter::new(graph.clone(), config);

        let mut a = Properties::new();
        a.insert("code".into(), json!("A1"));
        let mut b = Properties::new();
        b.insert("code".into(), json!("B1"));
        writer
            .upsert_nodes(&[
                NodeUpsert::new("Item", "name", "first", a),
                NodeUpsert::new("Item", "name", "second", b),
            ])
            .await;

        let result = writer
            .upsert_relationships(&[RelationshipUpsert::new("NEXT", "A1", "B1")])
            .await;
        assert!(result.is_clean());
        assert!(graph.relationship("NEXT", "code", "A1", "B1").is_some());
    }

    #[tokio::test]
    async fn slow_query_times_out_per_item() {
        let config = WriterConfig {
            query_timeout_ms: 20,
            ..WriterConfig::default()
        };
        let writer = GraphWriter::new(Arc::new(Slow), config);

        let result = writer.upsert_nodes(&people()[..2]).await;

        assert_eq!(result.failed, 2);
        assert!(result
            .errors
            .iter()
            .all(|f| f.reason == ItemError::Timeout { millis: 20 } && f.reason.is_retryable()));
    }

    #[tokio::test]
    async fn batched_timeout_is_attributed_per_item() {
        let config = WriterConfig {
            query_timeout_ms: 20,
            batch_size: 10,
            ..WriterConfig::default()
        };
        let writer = GraphWriter::new(Arc::new(Slow), config);

        let result = writer.upsert_nodes(&people()).await;

        assert_eq!(result.attempted, 3);
        assert_eq!(result.succeeded, 0);
        let indices: Vec<usize> = result.errors.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(result
            .errors
            .iter()
            .all(|f| f.reason == ItemError::Timeout { millis: 20 }));

        let rels = vec![
            RelationshipUpsert::new("KNOWS", "Alice", "Bob"),
            RelationshipUpsert::new("KNOWS", "Bob", "Carol"),
        ];
        let result = writer.upsert_relationships(&rels).await;
        assert_eq!(result.failed, 2);
        assert!(result.errors.iter().all(|f| f.reason.is_retryable()));
    }

    #[tokio::test]
    async fn delete_nodes_detaches_relationships() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());

        let mut marked = Properties::new();
        marked.insert("test".into(), json!(true));
        writer
            .upsert_nodes(&[
                person("Alice", "30"),
                person("Bob", "25"),
                NodeUpsert::new("Team", "name", "core", marked),
            ])
            .await;
        writer
            .upsert_relationships(&[
                RelationshipUpsert::new("KNOWS", "Alice", "Bob"),
                RelationshipUpsert::new("MEMBER_OF", "Bob", "core"),
            ])
            .await;

        assert_eq!(writer.delete_nodes(None, Some("test")).await.unwrap(), 1);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.relationship_count(), 1);
        assert!(graph.relationship("KNOWS", "name", "Alice", "Bob").is_some());

        assert_eq!(writer.delete_nodes(Some("Person"), None).await.unwrap(), 2);
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.relationship_count(), 0);

        assert!(writer.delete_nodes(Some("Person) //"), None).await.is_err());
    }

    #[tokio::test]
    async fn constraint_clash_keeps_the_existing_node() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());
        writer.declare_unique_constraint("Person", "email").await.unwrap();

        let mut email = Properties::new();
        email.insert("email".into(), json!("a@x"));
        writer
            .upsert_nodes(&[
                NodeUpsert::new("Person", "name", "Alice", email.clone()),
                NodeUpsert::new("Person", "name", "Bob", Properties::new()),
            ])
            .await;

        let result = writer
            .upsert_nodes(&[NodeUpsert::new("Person", "name", "Bob", email)])
            .await;

        assert_eq!(result.failed, 1);
        assert_eq!(graph.node_count(), 2);
        let bob = graph.node("Person", "name", "Bob").unwrap();
        assert!(!bob.properties.contains_key("email"));
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let token = CancellationToken::new();
        token.cancel();
        let graph = Arc::new(MemoryGraph::new());
        let writer =
            GraphWriter::new(graph.clone(), WriterConfig::default()).with_cancellation(token);

        let result = writer.upsert_nodes(&people()).await;
        assert_eq!(result.attempted, 0);
        assert_eq!(result.not_dispatched, 3);
        assert_eq!(graph.statements_executed(), 0);
    }

    #[tokio::test]
    async fn in_flight_item_completes_after_cancellation() {
        for (size, merged) in [(1, 1), (2, 2)] {
            let token = CancellationToken::new();
            let executor = Arc::new(CancelAfterFirst {
                inner: MemoryGraph::new(),
                token: token.clone(),
            });
            let writer = GraphWriter::new(executor.clone(), batched(size)).with_cancellation(token);

            let result = writer.upsert_nodes(&people()).await;

            assert_eq!(result.succeeded, merged);
            assert_eq!(result.not_dispatched, 3 - merged);
            assert_eq!(executor.inner.node_count(), merged);
        }
    }

    #[tokio::test]
    async fn constraints_and_joins() {
        let graph = Arc::new(MemoryGraph::new());
        let writer = GraphWriter::new(graph.clone(), WriterConfig::default());

        let schema = SchemaModel::load(
            r#"{"nodes": [{"labels": ["Person"], "properties": ["name", "team"]},
                          {"labels": ["Team"], "properties": ["name"]}],
                "relationships": []}"#,
        )
        .unwrap();
        assert!(writer.declare_constraints(&schema).await.is_empty());
        assert_eq!(graph.constraints().len(), 2);

        let err = writer
            .declare_unique_constraint("Person", "bad key")
            .await
            .unwrap_err();
        assert_eq!(err.property, "bad key");

        let mut props = Properties::new();
        props.insert("team".into(), json!("core"));
        writer
            .upsert_nodes(&[
                NodeUpsert::new("Person", "name", "Alice", props),
                NodeUpsert::new("Team", "name", "core", Properties::new()),
            ])
            .await;

        let join = PropertyJoin {
            from_label: "Person".into(),
            to_label: "Team".into(),
            from_property: "team".into(),
            to_property: "name".into(),
            rel_type: "MEMBER_OF".into(),
            properties: Properties::new(),
        };
        assert_eq!(writer.link_by_property(&join).await.unwrap(), 1);
        assert_eq!(writer.link_by_property(&join).await.unwrap(), 1);
        assert_eq!(graph.relationship_count(), 1);
    }
}
