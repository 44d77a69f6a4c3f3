//! Statistics generation from the checkpoint artifacts
//!
//! This module provides functionality for extracting and displaying
//! graph and crawl statistics without running a session.

use crate::crawler::{PriorityFrontier, SessionReport};
use crate::model::{EdgeKind, FrontierReason};
use crate::state::{CheckpointSnapshot, CheckpointStore};
use crate::storage::MetadataStore;
use crate::CrawlError;
use std::collections::BTreeMap;

/// Graph and crawl statistics summary
#[derive(Debug, Clone, Default)]
pub struct GraphStatistics {
    /// Snapshot of the last saved checkpoint, if any
    pub snapshot: Option<CheckpointSnapshot>,

    /// Nodes in the topology, fetched and stubs
    pub total_nodes: u64,
    pub fetched_nodes: u64,
    pub stub_nodes: u64,

    /// Edge counts per kind
    pub edges_by_kind: BTreeMap<EdgeKind, u64>,

    /// Attribute records in the metadata store
    pub metadata_records: u64,

    /// Frontier entries per reason
    pub frontier_by_reason: BTreeMap<FrontierReason, u64>,

    pub sessions: u64,
    pub lifetime_requests: u64,
    pub deletions: u64,
    /// Nodes with at least one fetch that exhausted its retries
    pub failing_nodes: u64,
}

impl GraphStatistics {
    pub fn total_edges(&self) -> u64 {
        self.edges_by_kind.values().sum()
    }
}

/// Loads statistics from the checkpoint in `store`
///
/// # Arguments
///
/// * `store` - Location of the checkpoint artifacts
///
/// # Returns
///
/// * `Ok(GraphStatistics)` - Successfully loaded statistics
/// * `Err(CrawlError)` - A checkpoint file could not be read
pub fn load_statistics(store: &CheckpointStore) -> Result<GraphStatistics, CrawlError> {
    let snapshot = store.read_snapshot()?;
    let topology = store.load_topology()?;
    let metadata = store.open_metadata()?;

    let mut stats = GraphStatistics {
        snapshot,
        total_nodes: topology.node_count() as u64,
        fetched_nodes: topology.fetched_count() as u64,
        stub_nodes: topology.stub_count() as u64,
        edges_by_kind: topology
            .edge_counts_by_kind()
            .into_iter()
            .map(|(kind, count)| (kind, count as u64))
            .collect(),
        metadata_records: metadata.count()?,
        ..Default::default()
    };

    if let Some(state) = store.load_state()? {
        let frontier = PriorityFrontier::restore(&state.frontier);
        stats.frontier_by_reason = frontier
            .counts_by_reason()
            .into_iter()
            .map(|(reason, count)| (reason, count as u64))
            .collect();
        stats.sessions = state.sessions;
        stats.lifetime_requests = state.lifetime_requests;
        stats.deletions = state.deletions.len() as u64;
        stats.failing_nodes = state.failures.len() as u64;
    }

    Ok(stats)
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &GraphStatistics) {
    println!("=== Graph Statistics ===\n");

    match &stats.snapshot {
        Some(snapshot) => {
            println!("Checkpoint:");
            println!("  Generation: {}", snapshot.generation);
            println!("  Last saved: {}", snapshot.last_saved.to_rfc3339());
            println!("  Schema version: {}", snapshot.schema_version);
        }
        None => println!("Checkpoint: none saved yet"),
    }
    println!();

    println!("Nodes:");
    println!("  Total: {}", stats.total_nodes);
    println!("  Fetched: {}", stats.fetched_nodes);
    println!("  Stubs: {}", stats.stub_nodes);
    println!("  Metadata records: {}", stats.metadata_records);
    println!();

    println!("Edges ({}):", stats.total_edges());
    for (kind, count) in &stats.edges_by_kind {
        println!("  {}: {}", kind.as_str(), count);
    }
    println!();

    let queued: u64 = stats.frontier_by_reason.values().sum();
    println!("Frontier ({}):", queued);
    for (reason, count) in &stats.frontier_by_reason {
        println!("  {}: {}", reason, count);
    }
    println!();

    println!("History:");
    println!("  Sessions: {}", stats.sessions);
    println!("  Lifetime requests: {}", stats.lifetime_requests);
    println!("  Deleted nodes: {}", stats.deletions);
    println!("  Nodes with failed fetches: {}", stats.failing_nodes);
}

/// Prints the outcome of a crawl session
pub fn print_session_report(report: &SessionReport) {
    println!("=== Session Report ===\n");
    println!("Outcome: {}", report.outcome);
    println!(
        "Fetched: {} ({} new, {} refreshed, {} deferred)",
        report.fetched, report.new_nodes, report.refreshed, report.deferred
    );
    println!("Requests used: {}", report.requests_used);
    println!("Elapsed: {:.1}s", report.elapsed.as_secs_f64());

    if !report.deletions.is_empty() {
        println!("\nDeleted nodes ({}):", report.deletions.len());
        for event in &report.deletions {
            println!("  - {} at {}", event.id, event.detected_at.to_rfc3339());
        }
    }

    if let Some(synthesis) = &report.synthesis {
        println!(
            "\nSynthesized edges: {} (user {}, pack {}, tag {})",
            synthesis.new_edges(),
            synthesis.shared_user,
            synthesis.shared_pack,
            synthesis.shared_tag
        );
    }

    if let Some(resolve) = &report.resolve {
        println!(
            "Resolved stubs: {} of {} in {} batches",
            resolve.resolved, resolve.stubs, resolve.batches
        );
    }

    println!(
        "\nCheckpoint: {} nodes, {} stubs, {} edges, {} queued",
        report.snapshot.node_count,
        report.snapshot.stub_count,
        report.snapshot.edge_count,
        report.snapshot.frontier_len
    );

    if let Some(boundary) = report.milestone {
        println!("Milestone reached: {} nodes", boundary);
    }
}
