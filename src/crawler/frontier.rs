//! Priority frontier of nodes waiting to be fetched
//!
//! This module handles:
//! - Ordering by reason tier (new > stale > dormant > deferred)
//! - FIFO order within a tier by discovery time, then insertion order
//! - At most one live entry per node; re-insertion replaces
//! - Enqueueing stale and dormant refresh candidates

use crate::model::{FrontierEntry, FrontierReason, FrontierSnapshot, NodeId};
use crate::storage::TopologyStore;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// Heap wrapper ordering entries so the next node to fetch is the maximum
#[derive(Debug, Clone)]
struct Queued(FrontierEntry);

// BinaryHeap is a max-heap, so every comparison is reversed
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority()
            .cmp(&self.0.priority())
            .then_with(|| other.0.discovered_at.cmp(&self.0.discovered_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Queued {}

/// Frontier queue with replace-on-push semantics
///
/// Replaced and removed entries stay in the heap until popped; `live` holds
/// the sequence number of the only valid entry per node.
#[derive(Debug, Default)]
pub struct PriorityFrontier {
    heap: BinaryHeap<Queued>,
    live: HashMap<NodeId, FrontierEntry>,
    next_seq: u64,
}

impl PriorityFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the frontier from a checkpoint snapshot
    pub fn restore(snapshot: &FrontierSnapshot) -> Self {
        let mut frontier = Self::new();
        let mut max_seq = None;

        for entry in &snapshot.entries {
            max_seq = max_seq.max(Some(entry.seq));
            if let Some(previous) = frontier.live.insert(entry.id, *entry) {
                tracing::warn!(node = %entry.id, seq = previous.seq, "Duplicate frontier entry in snapshot");
            }
        }
        frontier.heap = frontier.live.values().copied().map(Queued).collect();
        frontier.next_seq = snapshot
            .next_seq
            .max(max_seq.map_or(0, |seq| seq + 1));

        frontier
    }

    /// Captures the live entries in pop order
    pub fn snapshot(&self) -> FrontierSnapshot {
        let mut queued: Vec<Queued> = self.live.values().copied().map(Queued).collect();
        // Descending by heap order is pop order
        queued.sort_by(|a, b| b.cmp(a));

        FrontierSnapshot {
            entries: queued.into_iter().map(|q| q.0).collect(),
            next_seq: self.next_seq,
        }
    }

    /// Queues `id`, replacing any entry it already has
    ///
    /// # Arguments
    ///
    /// * `id` - Node to queue
    /// * `reason` - Determines the priority tier
    /// * `discovered_at` - FIFO key within the tier
    /// * `now` - Enqueue time
    ///
    /// # Returns
    ///
    /// The entry that was replaced, if any
    pub fn push(
        &mut self,
        id: NodeId,
        reason: FrontierReason,
        discovered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<FrontierEntry> {
        let entry = FrontierEntry {
            id,
            reason,
            discovered_at,
            enqueued_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.heap.push(Queued(entry));
        let replaced = self.live.insert(id, entry);
        self.compact_if_needed();
        replaced
    }

    /// Queues `entry` again with its original reason and discovery time
    pub fn requeue(&mut self, entry: &FrontierEntry, now: DateTime<Utc>) {
        self.push(entry.id, entry.reason, entry.discovered_at, now);
    }

    /// Removes and returns the highest-priority entry
    pub fn pop(&mut self) -> Option<FrontierEntry> {
        while let Some(Queued(entry)) = self.heap.pop() {
            let is_live = self
                .live
                .get(&entry.id)
                .is_some_and(|current| current.seq == entry.seq);
            if is_live {
                self.live.remove(&entry.id);
                return Some(entry);
            }
        }
        None
    }

    /// Drops the entry of `id`, if queued
    pub fn remove(&mut self, id: NodeId) -> Option<FrontierEntry> {
        let removed = self.live.remove(&id);
        self.compact_if_needed();
        removed
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&FrontierEntry> {
        self.live.get(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live entries per reason
    pub fn counts_by_reason(&self) -> BTreeMap<FrontierReason, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.live.values() {
            *counts.entry(entry.reason).or_insert(0) += 1;
        }
        counts
    }

    /// Queues fetched nodes whose last refresh is older than `stale_after`
    ///
    /// Nodes whose unchanged-refresh count reached `dormant_after` are queued
    /// as dormant, the rest as stale. Nodes already in the frontier are left
    /// untouched.
    ///
    /// # Returns
    ///
    /// Number of nodes queued
    pub fn schedule_stale(
        &mut self,
        topology: &TopologyStore,
        unchanged_refreshes: &BTreeMap<NodeId, u32>,
        now: DateTime<Utc>,
        stale_after: Duration,
        dormant_after: u32,
    ) -> usize {
        let mut scheduled = 0;

        for (id, node) in topology.nodes() {
            if !node.fetched || self.contains(id) {
                continue;
            }
            let Some(refreshed_at) = node.refreshed_at else {
                continue;
            };
            if now - refreshed_at < stale_after {
                continue;
            }

            let unchanged = unchanged_refreshes.get(&id).copied().unwrap_or(0);
            let reason = if dormant_after > 0 && unchanged >= dormant_after {
                FrontierReason::Dormant
            } else {
                FrontierReason::Stale
            };

            self.push(id, reason, node.discovered_at, now);
            scheduled += 1;
        }

        scheduled
    }

    fn compact_if_needed(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 2 {
            self.heap = self.live.values().copied().map(Queued).collect();
        }
    }
}
