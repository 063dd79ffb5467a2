//! Read operations against the knowledge graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kgforge_core::Properties;

use crate::cypher;
use crate::executor::{first_count, QueryError, QueryExecutor, ResultRow};

/// Total node and relationship counts, as printed after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub nodes: i64,
    pub relationships: i64,
}

/// Count nodes, optionally restricted to one label.
pub async fn count_nodes(
    executor: &dyn QueryExecutor,
    label: Option<&str>,
) -> Result<i64, QueryError> {
    let statement = cypher::count_nodes(label).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(first_count(&rows, "count"))
}

/// Count relationships, optionally restricted to one type.
pub async fn count_relationships(
    executor: &dyn QueryExecutor,
    rel_type: Option<&str>,
) -> Result<i64, QueryError> {
    let statement =
        cypher::count_relationships(rel_type).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(first_count(&rows, "count"))
}

pub async fn counts(executor: &dyn QueryExecutor) -> Result<GraphCounts, QueryError> {
    Ok(GraphCounts {
        nodes: count_nodes(executor, None).await?,
        relationships: count_relationships(executor, None).await?,
    })
}

/// Properties of the node `(:label {key: value})`, if it exists.
pub async fn find_node(
    executor: &dyn QueryExecutor,
    label: &str,
    key: &str,
    value: &str,
) -> Result<Option<Properties>, QueryError> {
    let statement =
        cypher::find_node(label, key, value).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(rows.into_iter().next().and_then(take_properties))
}

/// Property maps of every node with `label`.
pub async fn node_properties(
    executor: &dyn QueryExecutor,
    label: &str,
) -> Result<Vec<Properties>, QueryError> {
    let statement = cypher::node_properties(label).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(rows.into_iter().filter_map(take_properties).collect())
}

/// Property maps of every relationship of `rel_type`.
pub async fn relationship_properties(
    executor: &dyn QueryExecutor,
    rel_type: &str,
) -> Result<Vec<Properties>, QueryError> {
    let statement =
        cypher::relationship_properties(rel_type).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(rows.into_iter().filter_map(take_properties).collect())
}

/// A constraint as listed by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub labels: Vec<String>,
    pub properties: Vec<String>,
}

/// Constraints declared in the store, optionally only those on `label`.
pub async fn constraints(
    executor: &dyn QueryExecutor,
    label: Option<&str>,
) -> Result<Vec<ConstraintInfo>, QueryError> {
    let statement = cypher::show_constraints(label).map_err(|e| QueryError::new(e.to_string()))?;
    let rows = executor.execute(statement).await?;
    Ok(rows
        .into_iter()
        .map(|row| ConstraintInfo {
            name: row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels: strings(row.get("labels")),
            properties: strings(row.get("properties")),
        })
        .collect())
}

pub async fn databases(executor: &dyn QueryExecutor) -> Result<Vec<String>, QueryError> {
    let rows = executor.execute(cypher::show_databases()).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

fn take_properties(mut row: ResultRow) -> Option<Properties> {
    match row.remove("properties")? {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
