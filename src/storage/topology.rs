//! Compact graph store
//!
//! The topology holds node identities and typed edges only. It is kept in
//! memory and persisted as a single JSON document, so loading it on resume
//! does not touch the metadata database.

use crate::model::{Edge, EdgeKey, EdgeKind, NodeId};
use crate::storage::atomic::write_atomic;
use crate::storage::traits::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Version of the topology document format
pub const TOPOLOGY_VERSION: u32 = 1;

/// Graph-side state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    /// When the node was first referenced
    pub discovered_at: DateTime<Utc>,

    /// Last successful fetch, `None` for stubs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,

    /// Whether the node has been fetched at least once
    #[serde(default)]
    pub fetched: bool,
}

#[derive(Serialize, Deserialize)]
struct NodeEntry {
    id: NodeId,
    #[serde(flatten)]
    node: TopologyNode,
}

#[derive(Serialize, Deserialize)]
struct TopologyDocument {
    version: u32,
    nodes: Vec<NodeEntry>,
    edges: Vec<Edge>,
}

/// In-memory node and edge sets with an adjacency index
#[derive(Debug, Clone, Default)]
pub struct TopologyStore {
    nodes: BTreeMap<NodeId, TopologyNode>,
    edges: BTreeMap<EdgeKey, Option<f64>>,
    adjacency: HashMap<NodeId, BTreeSet<EdgeKey>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the store from `path`, or returns an empty store if absent
    pub fn load_or_default(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::load(path)
    }

    /// Loads the store from a topology document
    pub fn load(path: &Path) -> StorageResult<Self> {
        let bytes = std::fs::read(path)?;
        let document: TopologyDocument = serde_json::from_slice(&bytes)?;

        if document.version > TOPOLOGY_VERSION {
            return Err(StorageError::Serialization(format!(
                "topology version {} is newer than supported version {}",
                document.version, TOPOLOGY_VERSION
            )));
        }

        let mut store = Self::new();
        for entry in document.nodes {
            store.nodes.insert(entry.id, entry.node);
        }
        for edge in document.edges {
            if !store.nodes.contains_key(&edge.key.source)
                || !store.nodes.contains_key(&edge.key.target)
            {
                return Err(StorageError::InvalidEdge(format!(
                    "{} -> {} references a missing node",
                    edge.key.source, edge.key.target
                )));
            }
            store.insert_edge(edge.key, edge.weight);
        }

        Ok(store)
    }

    /// Writes the store to `path` atomically
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let document = TopologyDocument {
            version: TOPOLOGY_VERSION,
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| NodeEntry {
                    id: *id,
                    node: *node,
                })
                .collect(),
            edges: self.edges().collect(),
        };

        let json = serde_json::to_vec(&document)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    /// Adds a stub node if `id` is unknown
    ///
    /// # Returns
    ///
    /// `true` if the node was created
    pub fn ensure_node(&mut self, id: NodeId, now: DateTime<Utc>) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(
            id,
            TopologyNode {
                discovered_at: now,
                refreshed_at: None,
                fetched: false,
            },
        );
        true
    }

    /// Records a successful fetch of `id`, creating the node if needed
    pub fn mark_fetched(&mut self, id: NodeId, now: DateTime<Utc>) {
        let node = self.nodes.entry(id).or_insert(TopologyNode {
            discovered_at: now,
            refreshed_at: None,
            fetched: false,
        });
        node.fetched = true;
        node.refreshed_at = Some(now);
    }

    /// Inserts an edge or updates its weight
    ///
    /// Both endpoints must already exist. Repeating the call with the same
    /// endpoints and kind never creates a second edge.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A new edge was stored
    /// * `Ok(false)` - The edge already existed
    /// * `Err(StorageError)` - Self-loop or unknown endpoint
    pub fn upsert_edge(
        &mut self,
        a: NodeId,
        b: NodeId,
        kind: EdgeKind,
        weight: Option<f64>,
    ) -> StorageResult<bool> {
        if a == b {
            return Err(StorageError::InvalidEdge(format!(
                "self-loop on {} ({})",
                a,
                kind.as_str()
            )));
        }
        for id in [a, b] {
            if !self.nodes.contains_key(&id) {
                return Err(StorageError::UnknownNode(id));
            }
        }

        Ok(self.insert_edge(EdgeKey::new(a, b, kind), weight))
    }

    fn insert_edge(&mut self, key: EdgeKey, weight: Option<f64>) -> bool {
        let created = self.edges.insert(key, weight).is_none();
        if created {
            self.adjacency.entry(key.source).or_default().insert(key);
            self.adjacency.entry(key.target).or_default().insert(key);
        }
        created
    }

    /// Removes a node and all edges incident to it
    ///
    /// # Returns
    ///
    /// Number of edges removed, or `None` if the node was unknown
    pub fn remove_node(&mut self, id: NodeId) -> Option<usize> {
        self.nodes.remove(&id)?;

        let incident = self.adjacency.remove(&id).unwrap_or_default();
        for key in &incident {
            self.edges.remove(key);
            let other = key.other(id);
            if let Some(keys) = self.adjacency.get_mut(&other) {
                keys.remove(key);
                if keys.is_empty() {
                    self.adjacency.remove(&other);
                }
            }
        }

        Some(incident.len())
    }

    pub fn node(&self, id: NodeId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn contains_edge(&self, a: NodeId, b: NodeId, kind: EdgeKind) -> bool {
        self.edges.contains_key(&EdgeKey::new(a, b, kind))
    }

    pub fn edge_weight(&self, a: NodeId, b: NodeId, kind: EdgeKind) -> Option<f64> {
        self.edges.get(&EdgeKey::new(a, b, kind)).copied().flatten()
    }

    /// Distinct nodes connected to `id` by any edge, in ascending order
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        let neighbors: BTreeSet<NodeId> = self
            .adjacency
            .get(&id)
            .map(|keys| keys.iter().map(|k| k.other(id)).collect())
            .unwrap_or_default();
        neighbors.into_iter().collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges
            .iter()
            .map(|(key, weight)| Edge { key: *key, weight: *weight })
    }

    pub fn edges_of_kind(&self, kind: EdgeKind) -> impl Iterator<Item = Edge> + '_ {
        self.edges().filter(move |edge| edge.key.kind == kind)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TopologyNode)> + '_ {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Ids of nodes referenced by an edge but never fetched
    pub fn stub_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.fetched)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn fetched_count(&self) -> usize {
        self.nodes.values().filter(|node| node.fetched).count()
    }

    pub fn stub_count(&self) -> usize {
        self.node_count() - self.fetched_count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edge counts per kind, including kinds with no edges
    pub fn edge_counts_by_kind(&self) -> BTreeMap<EdgeKind, usize> {
        let mut counts: BTreeMap<EdgeKind, usize> =
            EdgeKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        for key in self.edges.keys() {
            *counts.entry(key.kind).or_insert(0) += 1;
        }
        counts
    }
}
