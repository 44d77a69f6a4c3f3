//! Typed graph edges

use crate::model::NodeId;
use serde::{Deserialize, Serialize};

/// Relationship kind carried by an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Reported by the API's similarity endpoint (directed)
    Similar,
    /// Both samples uploaded by the same user
    SharedUser,
    /// Both samples belong to the same pack
    SharedPack,
    /// Tag sets overlap above the configured threshold
    SharedTag,
}

impl EdgeKind {
    /// Whether `(a, b)` and `(b, a)` denote the same edge
    pub fn is_undirected(&self) -> bool {
        !matches!(self, Self::Similar)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Similar => "similar",
            Self::SharedUser => "shared_user",
            Self::SharedPack => "shared_pack",
            Self::SharedTag => "shared_tag",
        }
    }

    pub const ALL: [EdgeKind; 4] = [
        EdgeKind::Similar,
        EdgeKind::SharedUser,
        EdgeKind::SharedPack,
        EdgeKind::SharedTag,
    ];
}

/// Identity of an edge: ordered pair plus kind
///
/// Undirected kinds are normalised so that `source < target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
}

impl EdgeKey {
    pub fn new(a: NodeId, b: NodeId, kind: EdgeKind) -> Self {
        let (source, target) = if kind.is_undirected() && b < a {
            (b, a)
        } else {
            (a, b)
        };
        Self {
            source,
            target,
            kind,
        }
    }

    pub fn touches(&self, id: NodeId) -> bool {
        self.source == id || self.target == id
    }

    /// The endpoint opposite to `id`
    pub fn other(&self, id: NodeId) -> NodeId {
        if self.source == id {
            self.target
        } else {
            self.source
        }
    }
}

/// An edge with its optional weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(flatten)]
    pub key: EdgeKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}
