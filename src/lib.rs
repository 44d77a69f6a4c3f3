//! Sample-Graph: an incremental crawler for audio-sample relationship graphs
//!
//! This crate builds a graph of samples linked by similarity, shared users,
//! shared packs and shared tags by querying a rate-limited remote API across
//! many resumable sessions. Progress is checkpointed so a session can stop at
//! any budget and the next one continues where it left off.

pub mod api;
pub mod config;
pub mod crawler;
pub mod model;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for crawl sessions
///
/// Budget and time exhaustion are not errors; they are reported through
/// [`crawler::CrawlOutcome`].
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API client error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Checkpoint is corrupted and needs operator recovery: {0}")]
    CheckpointCorrupted(state::CheckpointError),

    #[error("Checkpoint could not be written, progress since the last save is not persisted: {0}")]
    CheckpointWrite(state::CheckpointError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<state::CheckpointError> for CrawlError {
    fn from(error: state::CheckpointError) -> Self {
        use state::CheckpointError;

        match error {
            CheckpointError::Corrupted { .. } | CheckpointError::UnsupportedVersion { .. } => {
                Self::CheckpointCorrupted(error)
            }
            CheckpointError::Write { .. } => Self::CheckpointWrite(error),
            CheckpointError::Io(e) => Self::Io(e),
            CheckpointError::Storage(e) => Self::Storage(e),
        }
    }
}

impl CrawlError {
    /// Whether the failure needs an operator before the next session
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::CheckpointCorrupted(_) | Self::Config(_))
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for crawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlOutcome, IncrementalCrawler, SessionReport, StopSignal};
pub use model::{EdgeKind, NodeId};
