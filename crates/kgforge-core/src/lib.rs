//! kgforge-core: Shared types and error handling for the kgforge graph loader.
//!
//! This crate provides the foundational types used across all kgforge components:
//! - The schema model (node kinds and relationship kinds)
//! - Upsert descriptors produced by the adapter and consumed by the writer
//! - The ingestion payload format
//! - Safe-identifier validation for labels and relationship types
//! - Common error types

pub mod error;
pub mod identifier;
pub mod payload;
pub mod schema;
pub mod types;

pub use error::{ConstraintError, ItemError, SchemaError};
pub use payload::{Payload, PayloadError, PayloadNode, PayloadRelationship};
pub use schema::{NodeKind, RelationshipKind, SchemaModel};
pub use types::{
    ItemFailure, NodeUpsert, Properties, Record, RelationshipUpsert, SkippedRecord, UpsertResult,
};
