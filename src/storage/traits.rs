//! Storage traits and error types
//!
//! This module defines the trait interface for metadata backends and the
//! error type shared by all stores.

use crate::model::{MetadataRecord, NodeId, SampleAttributes};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Keyed store of per-node attribute records
///
/// Records are replaced wholesale. Reads return either a complete record or
/// `None`, never a partially written one. Writes are visible to reads at once
/// but only become durable on [`MetadataStore::flush`]; a store dropped
/// without flushing keeps the state of its last flush.
pub trait MetadataStore {
    /// Inserts or replaces the attribute record of `id`
    fn upsert_node(&mut self, id: NodeId, attributes: &SampleAttributes) -> StorageResult<()>;

    /// Upserts many records atomically: either all become visible or none do
    fn batch_upsert_nodes(&mut self, records: &[(NodeId, SampleAttributes)]) -> StorageResult<()>;

    /// Gets the record of `id`, if stored
    fn get_node(&self, id: NodeId) -> StorageResult<Option<MetadataRecord>>;

    /// Deletes the record of `id`; returns whether one existed
    fn remove_node(&mut self, id: NodeId) -> StorageResult<bool>;

    /// Checks whether a record exists without decoding it
    fn contains(&self, id: NodeId) -> StorageResult<bool>;

    /// Number of stored records
    fn count(&self) -> StorageResult<u64>;

    /// All stored ids in ascending order
    fn all_ids(&self) -> StorageResult<Vec<NodeId>>;

    /// All stored records in ascending id order
    fn all_records(&self) -> StorageResult<Vec<MetadataRecord>>;

    /// Commits pending writes and makes them durable
    fn flush(&mut self) -> StorageResult<()>;
}
