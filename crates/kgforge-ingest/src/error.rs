//! Error types for the kgforge-ingest crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Schema error: {0}")]
    Schema(#[from] kgforge_core::SchemaError),

    #[error("Payload error: {0}")]
    Payload(#[from] kgforge_core::PayloadError),

    #[error("Failed to read CSV input: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to parse JSON records: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported record layout in {path}: {reason}")]
    Layout { path: String, reason: String },

    #[error("Graph error: {0}")]
    Graph(#[from] kgforge_graph::GraphError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Report store error: {0}")]
    Report(#[from] crate::report::ReportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
