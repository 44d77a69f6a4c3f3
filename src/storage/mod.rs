//! Storage module for persisting graph data
//!
//! This module handles the two data stores of the crawler:
//! - A keyed SQLite metadata store for per-node attribute records
//! - A compact JSON topology store for nodes and typed edges
//! - Atomic file replacement shared with the checkpoint writer

mod atomic;
mod schema;
mod sqlite;
mod topology;
mod traits;

pub use atomic::{temp_path, write_atomic};
pub use sqlite::SqliteMetadataStore;
pub use topology::{TopologyNode, TopologyStore, TOPOLOGY_VERSION};
pub use traits::{MetadataStore, StorageError, StorageResult};

use std::path::Path;

/// Opens or creates the metadata database at `path`
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteMetadataStore)` - Successfully opened store
/// * `Err(StorageError)` - Failed to open the database
pub fn open_metadata(path: &Path) -> StorageResult<SqliteMetadataStore> {
    SqliteMetadataStore::open(path)
}
