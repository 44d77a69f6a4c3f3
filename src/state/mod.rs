//! State module for tracking crawl progress across sessions
//!
//! # Components
//!
//! - `CheckpointState`: visited set, frontier snapshot, budgets and logs
//! - `CheckpointStore`: loads and atomically saves the checkpoint artifacts
//! - `milestone`: node-count boundary detection between sessions

mod checkpoint;
pub mod milestone;

pub use checkpoint::{
    CheckpointError, CheckpointSnapshot, CheckpointState, CheckpointStore, DeletionEvent,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use milestone::{check_milestone, crossed_milestone};
