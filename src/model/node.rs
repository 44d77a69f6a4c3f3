//! Node identifiers and attribute records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// External resource identifier of a sample
///
/// Assigned by the remote API and never changed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Attribute record of a sample
///
/// The fields the crawler and the edge synthesizer reason about are typed;
/// everything else the API returns is kept in `extra` so that records survive
/// a round-trip through the store unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Uploader of the sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Name of the pack (collection) the sample belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Upload timestamp as reported by the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_downloads: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rating: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ratings: Option<u64>,

    /// Fields not inspected by the crawler
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SampleAttributes {
    /// Returns the tag set, lowercased and deduplicated
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Pack name normalised for grouping
    ///
    /// The API reports packs either as a bare name or as a URL; both are
    /// reduced to the trailing path segment.
    pub fn pack_key(&self) -> Option<String> {
        self.pack.as_deref().and_then(|p| {
            let key = p.trim_end_matches('/').rsplit('/').next()?.trim();
            (!key.is_empty()).then(|| key.to_string())
        })
    }
}

/// A single record as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: NodeId,

    #[serde(flatten)]
    pub attributes: SampleAttributes,
}

/// Stored attribute record for a node
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub id: NodeId,
    pub attributes: SampleAttributes,
    pub updated_at: DateTime<Utc>,
}
