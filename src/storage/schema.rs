//! Database schema definitions for the metadata store
//!
//! Only attribute records live in SQLite. Graph structure and crawl control
//! state are kept in their own files so they can be loaded without touching
//! the (much larger) metadata.

/// SQL schema for the metadata database
pub const SCHEMA_SQL: &str = r#"
-- One attribute record per node, keyed for point lookup
CREATE TABLE IF NOT EXISTS node_metadata (
    node_id INTEGER PRIMARY KEY,
    attributes TEXT NOT NULL,
    username TEXT,
    pack TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_node_metadata_username ON node_metadata(username);
CREATE INDEX IF NOT EXISTS idx_node_metadata_pack ON node_metadata(pack);

-- Schema bookkeeping
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Current schema version of the metadata database
pub const SCHEMA_VERSION: u32 = 1;

/// Initializes the database schema and records its version
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_info (key, value) VALUES ('version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Reads the schema version stored in the database
pub fn stored_schema_version(conn: &rusqlite::Connection) -> Result<Option<u32>, rusqlite::Error> {
    use rusqlite::OptionalExtension;

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value.and_then(|v| v.parse().ok()))
}
