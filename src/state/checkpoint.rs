//! Crawl bookkeeping and checkpoint persistence
//!
//! A checkpoint is three artifacts under the data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `topology.json` | nodes and edges |
//! | `metadata.sqlite3` | attribute records |
//! | `crawl_state.json` | frontier, visited set, budgets, logs, snapshot |
//!
//! Each file is replaced atomically. The control state is written last, so
//! the visited set it records never refers to progress that was not saved.

use crate::model::{FrontierSnapshot, NodeId};
use crate::storage::{write_atomic, MetadataStore, SqliteMetadataStore, StorageError, TopologyStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current version of the crawl state document
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const STATE_FILE: &str = "crawl_state.json";
const TOPOLOGY_FILE: &str = "topology.json";
const METADATA_FILE: &str = "metadata.sqlite3";

/// Errors raised while loading or saving a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint file {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Checkpoint file {path} has schema version {found}, this build supports up to {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Failed to write checkpoint file {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Checkpoint IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Metadata store error: {0}")]
    Storage(#[from] StorageError),
}

/// Record of a node removed because the API reported it gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionEvent {
    pub id: NodeId,
    pub detected_at: DateTime<Utc>,
}

/// Summary of a saved checkpoint for milestone checks and backup tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Fully fetched nodes; equals the visited set size
    pub node_count: u64,
    /// Nodes known only through edges
    pub stub_count: u64,
    pub edge_count: u64,
    pub frontier_len: u64,
    pub lifetime_requests: u64,
    pub last_saved: DateTime<Utc>,
    pub schema_version: u32,
    pub generation: u64,
}

/// Crawl control state carried between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    /// Incremented on every successful save
    #[serde(default)]
    pub generation: u64,
    /// Hash of the configuration file of the last session
    #[serde(default)]
    pub config_hash: Option<String>,

    /// Nodes fetched at least once
    #[serde(default)]
    pub visited: BTreeSet<NodeId>,
    #[serde(default)]
    pub frontier: FrontierSnapshot,

    #[serde(default)]
    pub sessions: u64,
    #[serde(default)]
    pub lifetime_requests: u64,
    /// Requests charged to the current (or last) session
    #[serde(default)]
    pub session_requests: u64,
    /// Wall-clock time of the current (or last) session, milliseconds
    #[serde(default)]
    pub session_elapsed_ms: u64,
    /// Fetched node count at the end of the previous session
    #[serde(default)]
    pub last_node_count: u64,

    /// Consecutive refreshes that yielded nothing new, per node
    #[serde(default)]
    pub unchanged_refreshes: BTreeMap<NodeId, u32>,
    /// Consecutive fetches that exhausted their retries, per node
    #[serde(default)]
    pub failures: BTreeMap<NodeId, u32>,
    #[serde(default)]
    pub deletions: Vec<DeletionEvent>,
}

impl CheckpointState {
    /// Creates the empty state of a first run
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_saved: None,
            generation: 0,
            config_hash: None,
            visited: BTreeSet::new(),
            frontier: FrontierSnapshot::default(),
            sessions: 0,
            lifetime_requests: 0,
            session_requests: 0,
            session_elapsed_ms: 0,
            last_node_count: 0,
            unchanged_refreshes: BTreeMap::new(),
            failures: BTreeMap::new(),
            deletions: Vec::new(),
        }
    }

    /// Resets the per-session counters
    pub fn begin_session(&mut self) {
        self.sessions += 1;
        self.session_requests = 0;
        self.session_elapsed_ms = 0;
    }

    /// Charges requests to the session and lifetime counters
    pub fn charge_requests(&mut self, count: u64) {
        self.session_requests += count;
        self.lifetime_requests += count;
    }

    /// Records session wall-clock time; never moves backwards
    pub fn set_elapsed(&mut self, elapsed_ms: u64) {
        self.session_elapsed_ms = self.session_elapsed_ms.max(elapsed_ms);
    }

    pub fn is_visited(&self, id: NodeId) -> bool {
        self.visited.contains(&id)
    }

    /// Marks `id` fetched and clears its failure streak
    pub fn mark_visited(&mut self, id: NodeId) {
        self.visited.insert(id);
        self.failures.remove(&id);
    }

    /// Updates the dormancy counter after a refresh
    ///
    /// # Returns
    ///
    /// The number of consecutive refreshes without change
    pub fn note_refresh(&mut self, id: NodeId, changed: bool) -> u32 {
        if changed {
            self.unchanged_refreshes.remove(&id);
            0
        } else {
            let count = self.unchanged_refreshes.entry(id).or_insert(0);
            *count += 1;
            *count
        }
    }

    /// Counts a fetch that exhausted its retries
    pub fn record_failure(&mut self, id: NodeId) -> u32 {
        let count = self.failures.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops every trace of a deleted node and logs the deletion
    pub fn record_deletion(&mut self, id: NodeId, now: DateTime<Utc>) -> DeletionEvent {
        self.visited.remove(&id);
        self.unchanged_refreshes.remove(&id);
        self.failures.remove(&id);

        let event = DeletionEvent {
            id,
            detected_at: now,
        };
        self.deletions.push(event);
        event
    }
}

#[derive(Serialize)]
struct CheckpointDocumentRef<'a> {
    schema_version: u32,
    snapshot: &'a CheckpointSnapshot,
    state: &'a CheckpointState,
}

#[derive(Deserialize)]
struct CheckpointDocument {
    #[allow(dead_code)]
    schema_version: u32,
    snapshot: CheckpointSnapshot,
    state: CheckpointState,
}

#[derive(Deserialize)]
struct VersionHeader {
    schema_version: u32,
}

#[derive(Deserialize)]
struct SnapshotHeader {
    snapshot: CheckpointSnapshot,
}

/// Locations of the checkpoint artifacts and their load/save logic
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn topology_path(&self) -> PathBuf {
        self.dir.join(TOPOLOGY_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Creates the data directory if needed
    pub fn ensure_dir(&self) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Removes all checkpoint artifacts
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let metadata = self.metadata_path();
        let sidecars = ["-wal", "-shm"].map(|suffix| {
            let mut name = metadata.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        });

        for path in [self.state_path(), self.topology_path(), metadata]
            .into_iter()
            .chain(sidecars)
        {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "Removed checkpoint file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Loads the control state
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - No checkpoint exists yet
    /// * `Ok(Some(state))` - The last saved state
    /// * `Err(CheckpointError::Corrupted)` - The file exists but cannot be decoded
    pub fn load_state(&self) -> Result<Option<CheckpointState>, CheckpointError> {
        let path = self.state_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let header: VersionHeader =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if header.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path,
                found: header.schema_version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        let document: CheckpointDocument =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if document.snapshot.generation != document.state.generation {
            return Err(CheckpointError::Corrupted {
                path,
                reason: format!(
                    "snapshot generation {} does not match state generation {}",
                    document.snapshot.generation, document.state.generation
                ),
            });
        }

        Ok(Some(document.state))
    }

    /// Loads the topology, empty if no checkpoint has been written
    pub fn load_topology(&self) -> Result<TopologyStore, CheckpointError> {
        let path = self.topology_path();
        TopologyStore::load_or_default(&path).map_err(|e| match e {
            StorageError::Io(io) => CheckpointError::Io(io),
            other => CheckpointError::Corrupted {
                path,
                reason: other.to_string(),
            },
        })
    }

    /// Opens the metadata database inside the data directory
    pub fn open_metadata(&self) -> Result<SqliteMetadataStore, CheckpointError> {
        Ok(SqliteMetadataStore::open(&self.metadata_path())?)
    }

    /// Reads the snapshot of the last saved checkpoint without loading the stores
    pub fn read_snapshot(&self) -> Result<Option<CheckpointSnapshot>, CheckpointError> {
        let path = self.state_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let header: SnapshotHeader =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupted {
                path,
                reason: e.to_string(),
            })?;
        Ok(Some(header.snapshot))
    }

    /// Persists all three artifacts
    ///
    /// Metadata is flushed first, then the topology, then the control state.
    /// On success the state's generation and save time are advanced.
    ///
    /// # Returns
    ///
    /// * `Ok(CheckpointSnapshot)` - Summary of what was saved
    /// * `Err(CheckpointError::Write)` - A file could not be written; the
    ///   previous checkpoint file is left in place
    pub fn save(
        &self,
        state: &mut CheckpointState,
        topology: &TopologyStore,
        metadata: &mut dyn MetadataStore,
    ) -> Result<CheckpointSnapshot, CheckpointError> {
        let now = Utc::now();

        metadata.flush().map_err(|e| CheckpointError::Write {
            path: self.metadata_path(),
            reason: e.to_string(),
        })?;

        let topology_path = self.topology_path();
        topology
            .save(&topology_path)
            .map_err(|e| CheckpointError::Write {
                path: topology_path,
                reason: e.to_string(),
            })?;

        let mut next = state.clone();
        next.generation += 1;
        next.last_saved = Some(now);

        let snapshot = CheckpointSnapshot {
            node_count: topology.fetched_count() as u64,
            stub_count: topology.stub_count() as u64,
            edge_count: topology.edge_count() as u64,
            frontier_len: next.frontier.entries.len() as u64,
            lifetime_requests: next.lifetime_requests,
            last_saved: now,
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            generation: next.generation,
        };

        let state_path = self.state_path();
        let json = serde_json::to_vec_pretty(&CheckpointDocumentRef {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            snapshot: &snapshot,
            state: &next,
        })
        .map_err(|e| CheckpointError::Write {
            path: state_path.clone(),
            reason: e.to_string(),
        })?;

        write_atomic(&state_path, &json).map_err(|e| CheckpointError::Write {
            path: state_path,
            reason: e.to_string(),
        })?;

        *state = next;

        tracing::debug!(
            generation = snapshot.generation,
            nodes = snapshot.node_count,
            edges = snapshot.edge_count,
            frontier = snapshot.frontier_len,
            "Checkpoint saved"
        );

        Ok(snapshot)
    }
}
