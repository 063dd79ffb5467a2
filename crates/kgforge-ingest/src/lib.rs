//! kgforge-ingest: Schema-driven loader for the kgforge knowledge graph.
//!
//! Reads CSV and JSON records, maps them through the schema onto node and
//! relationship descriptors, writes them with idempotent merges, and
//! records a hash-sealed report for every run.

pub mod adapter;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod source;

pub use adapter::{
    GraphAdapter, IdentitySource, MissingIdentity, NodeMapping, PayloadMapping, RelationshipRule,
};
pub use config::{CsvOptions, IngestConfig};
pub use error::{IngestError, Result};
pub use pipeline::Pipeline;
pub use report::{JoinOutcome, ReportError, ReportStore, RunId, RunReport};
pub use source::{CsvSource, Input, InputFormat, JsonSource, RecordSet, RecordSource};
