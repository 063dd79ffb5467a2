//! Neo4j connection management and the Bolt-backed query executor.

use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::{BoltNull, BoltType, ConfigBuilder, Graph, Query};
use serde::Deserialize;
use serde_json::Value;

use crate::executor::{QueryError, QueryExecutor, ResultRow, Statement};

/// Errors establishing a graph connection.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),
}

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Target database; the server default when unset.
    pub database: Option<String>,
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
            database: None,
            max_connections: 16,
            fetch_size: 256,
        }
    }
}

/// Thread-safe Neo4j graph client with connection pooling.
///
/// Clone is cheap (inner Arc). Concurrent callers check connections in and
/// out of the neo4rs pool, bounded by `max_connections`.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given configuration.
    ///
    /// neo4rs creates its pool lazily, so a `RETURN 1` ping forces a real
    /// handshake and surfaces bad credentials here instead of mid-run.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let mut builder = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size);
        if let Some(db) = &config.database {
            builder = builder.db(db.as_str());
        }
        let neo_config = builder
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        graph
            .run(neo4rs::query("RETURN 1"))
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }
}

#[async_trait]
impl QueryExecutor for GraphClient {
    async fn execute(&self, statement: Statement) -> Result<Vec<ResultRow>, QueryError> {
        let query = to_query(&statement);
        let mut stream = self
            .graph
            .execute(query)
            .await
            .map_err(|e| QueryError::new(e.to_string()))?;

        let mut rows = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| QueryError::new(e.to_string()))?
        {
            let record: ResultRow = row
                .to()
                .map_err(|e| QueryError::new(format!("Failed to decode row: {e}")))?;
            rows.push(record);
        }
        Ok(rows)
    }
}

fn to_query(statement: &Statement) -> Query {
    statement
        .params
        .iter()
        .fold(neo4rs::query(&statement.cypher), |q, (key, value)| {
            q.param(key, to_bolt(value))
        })
}

/// Convert a JSON parameter into its Bolt representation.
fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) => s.clone().into(),
        Value::Array(items) => items.iter().map(to_bolt).collect::<Vec<BoltType>>().into(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), to_bolt(v)))
            .collect::<HashMap<String, BoltType>>()
            .into(),
    }
}
