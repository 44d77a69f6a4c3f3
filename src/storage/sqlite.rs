//! SQLite metadata store
//!
//! This module provides a SQLite-based implementation of the MetadataStore
//! trait. Attribute records are stored as JSON next to a few indexed columns.
//!
//! Writes go into one open transaction that `flush` commits, so the database
//! only moves forward together with the checkpoint that flushes it.

use crate::model::{MetadataRecord, NodeId, SampleAttributes};
use crate::storage::schema::{initialize_schema, stored_schema_version, SCHEMA_VERSION};
use crate::storage::traits::{MetadataStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite metadata backend
pub struct SqliteMetadataStore {
    conn: Connection,
}

impl SqliteMetadataStore {
    /// Opens or creates the metadata database at `path`
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteMetadataStore)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database or the schema is newer
    ///   than this build understands
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        ",
        )?;

        Self::from_connection(conn)
    }

    /// Creates an in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        initialize_schema(&conn)?;

        if let Some(version) = stored_schema_version(&conn)? {
            if version > SCHEMA_VERSION {
                return Err(StorageError::Database(format!(
                    "metadata schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                )));
            }
        }

        Ok(Self { conn })
    }

    /// Opens the pending transaction unless one is already open
    fn begin_pending(&mut self) -> StorageResult<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Whether writes are waiting for the next flush
    pub fn has_pending(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn write_record(
        conn: &Connection,
        id: NodeId,
        attributes: &SampleAttributes,
        now: &str,
    ) -> StorageResult<()> {
        let json = serde_json::to_string(attributes)?;
        conn.execute(
            "INSERT INTO node_metadata (node_id, attributes, username, pack, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(node_id) DO UPDATE SET
                attributes = excluded.attributes,
                username = excluded.username,
                pack = excluded.pack,
                updated_at = excluded.updated_at",
            params![
                id.0 as i64,
                json,
                attributes.username,
                attributes.pack_key(),
                now
            ],
        )?;
        Ok(())
    }

    fn read_record(row: &Row<'_>) -> rusqlite::Result<(i64, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    }

    fn decode((id, json, updated_at): (i64, String, String)) -> StorageResult<MetadataRecord> {
        let attributes: SampleAttributes = serde_json::from_str(&json)?;
        let updated_at = updated_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| StorageError::Serialization(format!("bad timestamp for {}: {}", id, e)))?;

        Ok(MetadataRecord {
            id: NodeId(id as u64),
            attributes,
            updated_at,
        })
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn upsert_node(&mut self, id: NodeId, attributes: &SampleAttributes) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.begin_pending()?;
        Self::write_record(&self.conn, id, attributes, &now)
    }

    fn batch_upsert_nodes(&mut self, records: &[(NodeId, SampleAttributes)]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        self.begin_pending()?;
        // Dropping the savepoint without commit rolls back every record.
        let sp = self.conn.savepoint()?;
        for (id, attributes) in records {
            Self::write_record(&sp, *id, attributes, &now)?;
        }
        sp.commit()?;

        Ok(())
    }

    fn get_node(&self, id: NodeId) -> StorageResult<Option<MetadataRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT node_id, attributes, updated_at FROM node_metadata WHERE node_id = ?1",
                params![id.0 as i64],
                Self::read_record,
            )
            .optional()?;

        row.map(Self::decode).transpose()
    }

    fn remove_node(&mut self, id: NodeId) -> StorageResult<bool> {
        self.begin_pending()?;
        let removed = self.conn.execute(
            "DELETE FROM node_metadata WHERE node_id = ?1",
            params![id.0 as i64],
        )?;
        Ok(removed > 0)
    }

    fn contains(&self, id: NodeId) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM node_metadata WHERE node_id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM node_metadata", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn all_ids(&self) -> StorageResult<Vec<NodeId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id FROM node_metadata ORDER BY node_id")?;

        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|id| NodeId(id as u64)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn all_records(&self) -> StorageResult<Vec<MetadataRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, attributes, updated_at FROM node_metadata ORDER BY node_id",
        )?;

        let rows = stmt
            .query_map([], Self::read_record)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Self::decode).collect()
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.has_pending() {
            self.conn.execute_batch("COMMIT")?;
        }
        // Folds the WAL back into the main database file.
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(username: &str, tags: &[&str]) -> SampleAttributes {
        SampleAttributes {
            name: Some(format!("{}-sample", username)),
            username: Some(username.to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_in_memory() {
        assert!(SqliteMetadataStore::open_in_memory().is_ok());
    }

    #[test]
    fn test_get_missing_node() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        assert!(store.get_node(NodeId(1)).unwrap().is_none());
        assert!(!store.contains(NodeId(1)).unwrap());
    }

    #[test]
    fn test_upsert_replaces_wholesale() {
        let mut store = SqliteMetadataStore::open_in_memory().unwrap();

        let mut first = attrs("alice", &["rain"]);
        first.pack = Some("Storms".to_string());
        store.upsert_node(NodeId(1), &first).unwrap();

        let second = attrs("bob", &["wind"]);
        store.upsert_node(NodeId(1), &second).unwrap();

        let record = store.get_node(NodeId(1)).unwrap().unwrap();
        assert_eq!(record.attributes, second);
        assert!(record.attributes.pack.is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_extension_fields_round_trip() {
        let mut store = SqliteMetadataStore::open_in_memory().unwrap();
        let mut attributes = attrs("alice", &[]);
        attributes
            .extra
            .insert("bitdepth".to_string(), serde_json::json!(24));

        store.upsert_node(NodeId(3), &attributes).unwrap();
        let record = store.get_node(NodeId(3)).unwrap().unwrap();
        assert_eq!(record.attributes.extra["bitdepth"], 24);
    }

    #[test]
    fn test_batch_upsert() {
        let mut store = SqliteMetadataStore::open_in_memory().unwrap();
        let records: Vec<_> = (1..=5)
            .map(|i| (NodeId(i), attrs("alice", &["a"])))
            .collect();

        store.batch_upsert_nodes(&records).unwrap();

        assert_eq!(store.count().unwrap(), 5);
        assert_eq!(
            store.all_ids().unwrap(),
            (1..=5).map(NodeId).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_batch_upsert_is_all_or_nothing() {
        let mut store = SqliteMetadataStore::open_in_memory().unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_13 BEFORE INSERT ON node_metadata
                 WHEN NEW.node_id = 13 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let records: Vec<_> = [11, 12, 13, 14]
            .into_iter()
            .map(|i| (NodeId(i), attrs("bob", &[])))
            .collect();

        assert!(store.batch_upsert_nodes(&records).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_node() {
        let mut store = SqliteMetadataStore::open_in_memory().unwrap();
        store.upsert_node(NodeId(9), &attrs("carol", &[])).unwrap();

        assert!(store.remove_node(NodeId(9)).unwrap());
        assert!(!store.remove_node(NodeId(9)).unwrap());
        assert!(store.get_node(NodeId(9)).unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.sqlite3");

        {
            let mut store = SqliteMetadataStore::open(&path).unwrap();
            store.upsert_node(NodeId(77), &attrs("dave", &["x"])).unwrap();
            store.flush().unwrap();
        }

        let store = SqliteMetadataStore::open(&path).unwrap();
        let record = store.get_node(NodeId(77)).unwrap().unwrap();
        assert_eq!(record.attributes.username.as_deref(), Some("dave"));
    }

    #[test]
    fn test_unflushed_writes_are_discarded_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.sqlite3");

        {
            let mut store = SqliteMetadataStore::open(&path).unwrap();
            store.upsert_node(NodeId(1), &attrs("erin", &[])).unwrap();
            store.upsert_node(NodeId(2), &attrs("erin", &[])).unwrap();
            store.flush().unwrap();
            assert!(!store.has_pending());

            store.remove_node(NodeId(1)).unwrap();
            store.upsert_node(NodeId(3), &attrs("erin", &[])).unwrap();
            assert!(store.has_pending());
            // Pending writes are visible before the flush
            assert!(store.get_node(NodeId(1)).unwrap().is_none());
            assert_eq!(store.count().unwrap(), 2);
        }

        let store = SqliteMetadataStore::open(&path).unwrap();
        assert_eq!(store.all_ids().unwrap(), vec![NodeId(1), NodeId(2)]);
    }
}
