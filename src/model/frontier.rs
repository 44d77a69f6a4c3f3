//! Frontier entries and their persisted form

use crate::model::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a node is waiting in the frontier
///
/// Variants are declared from highest to lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierReason {
    /// Discovered through an edge, never fetched
    New,
    /// Fetched before, refresh is due
    Stale,
    /// Refreshed repeatedly without yielding anything new
    Dormant,
    /// Last fetch attempt exhausted its retries
    Deferred,
}

impl FrontierReason {
    /// Priority tier; lower tiers are popped first
    pub fn tier(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Stale => 1,
            Self::Dormant => 2,
            Self::Deferred => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Stale => "stale",
            Self::Dormant => "dormant",
            Self::Deferred => "deferred",
        }
    }
}

impl fmt::Display for FrontierReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node waiting to be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub id: NodeId,
    pub reason: FrontierReason,
    /// When the node was first discovered; FIFO key within a tier
    pub discovered_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal discovery times
    pub seq: u64,
}

impl FrontierEntry {
    pub fn priority(&self) -> u8 {
        self.reason.tier()
    }
}

/// Frontier contents as stored in the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    /// Entries in pop order
    pub entries: Vec<FrontierEntry>,
    pub next_seq: u64,
}
