//! kgforge-graph: idempotent upserts against a labeled-graph store.
//!
//! This crate is the single mutation point for the target graph. Every
//! write is a MERGE issued through a [`QueryExecutor`], so re-running an
//! ingestion converges on the same graph instead of duplicating it.

pub mod client;
pub mod cypher;
pub mod executor;
pub mod memory;
pub mod queries;
pub mod writer;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use executor::{Operation, Params, QueryError, QueryExecutor, ResultRow, Statement};
pub use memory::MemoryGraph;
pub use queries::{ConstraintInfo, GraphCounts};
pub use writer::{GraphWriter, PropertyJoin, WriterConfig};
