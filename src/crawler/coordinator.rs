//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the incremental crawl loop, which coordinates:
//! - Loading the checkpoint and seeding an empty one
//! - Scheduling stale and dormant refreshes
//! - Fetching records and similarity lists through the retrying client
//! - Updating topology, metadata and the visited set
//! - The deletion path for resources the API reports gone
//! - Periodic and final checkpoints, edge synthesis and milestone checks

use crate::api::{Fetched, RetryError, RetryingClient, SampleApi, SearchQuery, SimilarSample};
use crate::config::Config;
use crate::crawler::frontier::PriorityFrontier;
use crate::crawler::synthesizer::{EdgeSynthesizer, ResolveReport, SynthesisReport};
use crate::crawler::StopSignal;
use crate::model::{EdgeKind, FrontierEntry, FrontierReason, NodeId, SampleRecord};
use crate::state::{
    check_milestone, CheckpointSnapshot, CheckpointState, CheckpointStore, DeletionEvent,
};
use crate::storage::{MetadataStore, SqliteMetadataStore, TopologyStore};
use crate::CrawlError;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Requests needed to fetch one node (record + similarity list)
pub const REQUESTS_PER_NODE: u64 = 2;

/// Why a session stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// The session's request budget cannot cover another node
    BudgetExhausted,
    /// Nothing left to fetch
    FrontierEmpty,
    /// The session's wall-clock budget ran out
    TimeExhausted,
    /// The stop signal was triggered
    Interrupted,
}

impl fmt::Display for CrawlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BudgetExhausted => "budget exhausted",
            Self::FrontierEmpty => "frontier empty",
            Self::TimeExhausted => "time exhausted",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the crawler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Idle,
    Running,
    Paused(CrawlOutcome),
    Failed,
}

/// Result of a crawl session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: CrawlOutcome,
    /// Nodes fetched this session, first fetches and refreshes
    pub fetched: u64,
    pub new_nodes: u64,
    pub refreshed: u64,
    pub deferred: u64,
    pub requests_used: u64,
    pub elapsed: Duration,
    pub deletions: Vec<DeletionEvent>,
    /// Highest node-count boundary crossed since the previous session
    pub milestone: Option<u64>,
    pub snapshot: CheckpointSnapshot,
    pub synthesis: Option<SynthesisReport>,
    pub resolve: Option<ResolveReport>,
}

/// Result of a synthesis-only run
#[derive(Debug, Clone)]
pub struct SynthesisRun {
    pub synthesis: SynthesisReport,
    pub resolve: Option<ResolveReport>,
    pub snapshot: CheckpointSnapshot,
}

/// What happened to one popped frontier entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    Fetched { first_time: bool },
    Skipped,
    Deleted,
    Deferred,
    Cancelled,
    /// The request budget ran out before the node was fully fetched
    OutOfBudget,
}

#[derive(Debug, Default)]
struct SessionCounters {
    fetched: u64,
    new_nodes: u64,
    refreshed: u64,
    deferred: u64,
    since_checkpoint: u32,
    deletions: Vec<DeletionEvent>,
}

/// Main crawler structure
pub struct IncrementalCrawler {
    config: Config,
    api: Arc<dyn SampleApi>,
    client: RetryingClient,
    checkpoints: CheckpointStore,
    state: CheckpointState,
    topology: TopologyStore,
    metadata: SqliteMetadataStore,
    frontier: PriorityFrontier,
    synthesizer: EdgeSynthesizer,
    stop: StopSignal,
    status: CrawlerState,
    /// Client attempts already charged to the checkpoint state
    charged: u64,
    config_hash: Option<String>,
}

impl IncrementalCrawler {
    /// Opens the checkpoint in the configured data directory
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `api` - Remote API implementation
    /// * `stop` - Signal that interrupts the session
    /// * `fresh` - Discard any existing checkpoint first
    ///
    /// # Returns
    ///
    /// * `Ok(IncrementalCrawler)` - Ready to run
    /// * `Err(CrawlError::CheckpointCorrupted)` - The checkpoint cannot be
    ///   decoded; it is left untouched for the operator
    pub fn open(
        config: Config,
        api: Arc<dyn SampleApi>,
        stop: StopSignal,
        fresh: bool,
    ) -> Result<Self, CrawlError> {
        let checkpoints = CheckpointStore::new(&config.storage.data_dir);
        checkpoints.ensure_dir()?;

        if fresh {
            tracing::info!(dir = %checkpoints.dir().display(), "Discarding existing checkpoint");
            checkpoints.clear()?;
        }

        let state = match checkpoints.load_state()? {
            Some(state) => {
                tracing::info!(
                    generation = state.generation,
                    visited = state.visited.len(),
                    frontier = state.frontier.entries.len(),
                    "Resuming from checkpoint"
                );
                state
            }
            None => {
                tracing::info!("No checkpoint found, starting a new crawl");
                CheckpointState::new(Utc::now())
            }
        };

        let topology = checkpoints.load_topology()?;
        let metadata = checkpoints.open_metadata()?;
        let frontier = PriorityFrontier::restore(&state.frontier);
        let client = RetryingClient::from_config(&config.api, stop.clone());
        let synthesizer = EdgeSynthesizer::from_config(&config.synthesis);

        Ok(Self {
            config,
            api,
            client,
            checkpoints,
            state,
            topology,
            metadata,
            frontier,
            synthesizer,
            stop,
            status: CrawlerState::Idle,
            charged: 0,
            config_hash: None,
        })
    }

    /// Records the hash of the configuration file driving this session
    pub fn with_config_hash(mut self, hash: String) -> Self {
        if let Some(previous) = &self.state.config_hash {
            if *previous != hash {
                tracing::warn!(
                    previous = %previous,
                    current = %hash,
                    "Configuration changed since the last checkpoint"
                );
            }
        }
        self.config_hash = Some(hash);
        self
    }

    /// Replaces the retrying client, e.g. to use a different rate policy
    pub fn with_client(mut self, client: RetryingClient) -> Self {
        self.charged = client.ledger().attempts();
        self.client = client;
        self
    }

    pub fn status(&self) -> CrawlerState {
        self.status
    }

    pub fn checkpoint_state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn metadata(&self) -> &SqliteMetadataStore {
        &self.metadata
    }

    pub fn frontier(&self) -> &PriorityFrontier {
        &self.frontier
    }

    /// Runs one crawl session until a budget, the frontier or the stop signal ends it
    ///
    /// Budget and time exhaustion are successful outcomes. Only checkpoint
    /// and storage failures are errors; after one the crawler is `Failed`.
    pub async fn run(&mut self) -> Result<SessionReport, CrawlError> {
        let result = self.run_session().await;
        if result.is_err() {
            self.status = CrawlerState::Failed;
        }
        result
    }

    async fn run_session(&mut self) -> Result<SessionReport, CrawlError> {
        self.status = CrawlerState::Running;

        let started = Instant::now();
        let max_duration = self.config.budget.max_duration();
        self.client.set_deadline(Some(started + max_duration));
        self.state.begin_session();
        if let Some(hash) = &self.config_hash {
            self.state.config_hash = Some(hash.clone());
        }

        tracing::info!(
            session = self.state.sessions,
            max_requests = self.config.budget.max_requests,
            max_duration = ?max_duration,
            "Starting crawl session"
        );

        if self.frontier.is_empty() && self.state.visited.is_empty() {
            self.seed().await;
        }

        let stale = self.frontier.schedule_stale(
            &self.topology,
            &self.state.unchanged_refreshes,
            Utc::now(),
            self.config.crawl.stale_after(),
            self.config.crawl.dormant_after_refreshes,
        );
        if stale > 0 {
            tracing::info!(count = stale, "Scheduled stale nodes for refresh");
        }

        let mut counters = SessionCounters::default();
        let outcome = loop {
            if let Some(outcome) = self.check_budgets(started) {
                break outcome;
            }

            let Some(entry) = self.frontier.pop() else {
                break CrawlOutcome::FrontierEmpty;
            };

            match self.process(entry, &mut counters).await? {
                NodeOutcome::Fetched { first_time } => {
                    counters.fetched += 1;
                    if first_time {
                        counters.new_nodes += 1;
                    } else {
                        counters.refreshed += 1;
                    }
                    counters.since_checkpoint += 1;

                    if counters.fetched % 10 == 0 {
                        tracing::info!(
                            fetched = counters.fetched,
                            frontier = self.frontier.len(),
                            requests = self.state.session_requests,
                            "Progress"
                        );
                    }

                    if counters.since_checkpoint >= self.config.crawl.checkpoint_interval {
                        self.checkpoint(started)?;
                        counters.since_checkpoint = 0;
                    }
                }
                NodeOutcome::Deferred => counters.deferred += 1,
                NodeOutcome::OutOfBudget => break CrawlOutcome::BudgetExhausted,
                NodeOutcome::Skipped | NodeOutcome::Deleted | NodeOutcome::Cancelled => {}
            }
        };

        tracing::info!(%outcome, fetched = counters.fetched, "Crawl loop stopped");

        let resolve = if self.may_spend_after(outcome) {
            self.resolve_stubs().await?
        } else {
            None
        };
        let synthesis = self.synthesize();

        let current = self.topology.fetched_count() as u64;
        let milestone = check_milestone(
            self.state.last_node_count,
            current,
            self.config.milestones.node_interval,
        );
        if let Some(boundary) = milestone {
            tracing::info!(
                boundary,
                previous = self.state.last_node_count,
                current,
                "Node milestone reached"
            );
        }
        self.state.last_node_count = current;

        let snapshot = self.checkpoint(started)?;
        self.status = CrawlerState::Paused(outcome);

        let report = SessionReport {
            outcome,
            fetched: counters.fetched,
            new_nodes: counters.new_nodes,
            refreshed: counters.refreshed,
            deferred: counters.deferred,
            requests_used: self.state.session_requests,
            elapsed: started.elapsed(),
            deletions: counters.deletions,
            milestone,
            snapshot,
            synthesis,
            resolve,
        };

        tracing::info!(
            %outcome,
            fetched = report.fetched,
            requests = report.requests_used,
            nodes = report.snapshot.node_count,
            edges = report.snapshot.edge_count,
            frontier = report.snapshot.frontier_len,
            failed_requests = self.client.ledger().failed(),
            rate_limited = self.client.ledger().rate_limited(),
            elapsed = ?report.elapsed,
            "Crawl session finished"
        );

        Ok(report)
    }

    /// Resolves stubs and synthesizes edges without crawling
    pub async fn synthesize_only(&mut self) -> Result<SynthesisRun, CrawlError> {
        let started = Instant::now();
        self.client
            .set_deadline(Some(started + self.config.budget.max_duration()));
        self.state.begin_session();

        let resolve = match self.resolve_stubs().await {
            Ok(resolve) => resolve,
            Err(e) => {
                self.status = CrawlerState::Failed;
                return Err(e);
            }
        };
        let synthesis = self.synthesize().unwrap_or_default();

        let snapshot = match self.checkpoint(started) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.status = CrawlerState::Failed;
                return Err(e);
            }
        };

        Ok(SynthesisRun {
            synthesis,
            resolve,
            snapshot,
        })
    }

    /// Checks the stop signal and both budgets, in that order
    fn check_budgets(&self, started: Instant) -> Option<CrawlOutcome> {
        if self.stop.is_triggered() {
            return Some(CrawlOutcome::Interrupted);
        }

        let used = self.state.session_requests;
        if used + REQUESTS_PER_NODE > self.config.budget.max_requests {
            tracing::info!(used, max = self.config.budget.max_requests, "Request budget exhausted");
            return Some(CrawlOutcome::BudgetExhausted);
        }

        if started.elapsed() >= self.config.budget.max_duration() {
            tracing::info!(elapsed = ?started.elapsed(), "Time budget exhausted");
            return Some(CrawlOutcome::TimeExhausted);
        }

        None
    }

    fn may_spend_after(&self, outcome: CrawlOutcome) -> bool {
        self.config.synthesis.enabled
            && self.config.synthesis.resolve_stubs
            && matches!(
                outcome,
                CrawlOutcome::BudgetExhausted | CrawlOutcome::FrontierEmpty
            )
            && self.remaining_requests() > 0
    }

    fn remaining_requests(&self) -> u64 {
        self.config
            .budget
            .max_requests
            .saturating_sub(self.state.session_requests)
    }

    /// Charges new client attempts to the checkpoint counters
    fn sync_requests(&mut self) {
        let attempts = self.client.ledger().attempts();
        self.state.charge_requests(attempts - self.charged);
        self.charged = attempts;
    }

    /// Runs one API call through the retrying client and charges it
    ///
    /// Attempts are capped at the requests left in the session budget.
    async fn call<T, F, Fut>(&mut self, label: &str, op: F) -> Result<Fetched<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, crate::api::ApiError>>,
    {
        self.client.set_request_limit(Some(self.remaining_requests()));
        let result = self.client.call(label, op).await;
        self.sync_requests();
        result
    }

    /// Queues configured seeds and the first page of the seed query
    async fn seed(&mut self) {
        let now = Utc::now();
        let deleted: BTreeSet<NodeId> = self.state.deletions.iter().map(|e| e.id).collect();
        let mut seeds: Vec<NodeId> = self.config.crawl.seeds.iter().map(|id| NodeId(*id)).collect();

        if let Some(query_text) = self.config.crawl.seed_query.clone() {
            let mut query = SearchQuery::new(query_text)
                .with_fields(&["id"])
                .with_page_size(self.config.crawl.seed_page_size);
            if let Some(filter) = &self.config.crawl.seed_filter {
                query = query.with_filter(filter.clone());
            }

            let api = Arc::clone(&self.api);
            match self.call("seed_search", || api.search(&query)).await {
                Ok(Fetched::Present(page)) => {
                    tracing::info!(results = page.results.len(), total = page.count, "Seed query returned");
                    seeds.extend(page.results.iter().map(|record| record.id));
                }
                Ok(Fetched::Absent) => tracing::warn!("Seed query endpoint reported not found"),
                Err(e) => tracing::warn!(error = %e, "Seed query failed, using configured seeds only"),
            }
        }

        let mut queued = 0;
        for id in seeds {
            if deleted.contains(&id) || self.frontier.contains(id) {
                continue;
            }
            self.topology.ensure_node(id, now);
            let discovered_at = self
                .topology
                .node(id)
                .map_or(now, |node| node.discovered_at);
            self.frontier.push(id, FrontierReason::New, discovered_at, now);
            queued += 1;
        }

        tracing::info!(count = queued, "Seeded frontier");
    }

    /// Fetches one node and applies the result to the stores
    async fn process(
        &mut self,
        entry: FrontierEntry,
        counters: &mut SessionCounters,
    ) -> Result<NodeOutcome, CrawlError> {
        let id = entry.id;

        if entry.reason == FrontierReason::New && self.state.is_visited(id) {
            tracing::debug!(node = %id, "Already visited, skipping");
            return Ok(NodeOutcome::Skipped);
        }

        tracing::debug!(node = %id, reason = %entry.reason, "Fetching node");

        let api = Arc::clone(&self.api);
        let record = match self.call("get_sample", || api.get_sample(id)).await {
            Ok(Fetched::Present(record)) => record,
            Ok(Fetched::Absent) => return self.delete_node(id, counters),
            Err(e) => return Ok(self.handle_failure(&entry, e)),
        };

        let page_size = self.config.api.similar_page_size;
        let similar = match self.call("get_similar", || api.get_similar(id, page_size)).await {
            Ok(Fetched::Present(similar)) => similar,
            Ok(Fetched::Absent) => return self.delete_node(id, counters),
            Err(e) => return Ok(self.handle_failure(&entry, e)),
        };

        let first_time = !self.topology.node(id).is_some_and(|node| node.fetched);
        self.apply_fetch(id, record, &similar, first_time)?;

        Ok(NodeOutcome::Fetched { first_time })
    }

    /// Stores a fetched record and its similarity edges, queueing new neighbours
    fn apply_fetch(
        &mut self,
        id: NodeId,
        record: SampleRecord,
        similar: &[SimilarSample],
        first_time: bool,
    ) -> Result<(), CrawlError> {
        let now = Utc::now();

        let changed = first_time || self.detect_change(id, &record, similar)?;

        self.metadata.upsert_node(id, &record.attributes)?;
        self.topology.mark_fetched(id, now);

        let mut discovered = 0;
        for neighbor in similar {
            if neighbor.id == id {
                continue;
            }
            self.topology.ensure_node(neighbor.id, now);
            self.topology
                .upsert_edge(id, neighbor.id, EdgeKind::Similar, neighbor.distance)?;

            let Some(node) = self.topology.node(neighbor.id) else {
                continue;
            };
            if !node.fetched
                && !self.state.is_visited(neighbor.id)
                && !self.frontier.contains(neighbor.id)
            {
                self.frontier
                    .push(neighbor.id, FrontierReason::New, node.discovered_at, now);
                discovered += 1;
            }
        }

        self.state.mark_visited(id);
        if !first_time {
            let unchanged = self.state.note_refresh(id, changed);
            if unchanged >= self.config.crawl.dormant_after_refreshes && unchanged > 0 {
                tracing::debug!(node = %id, unchanged, "Node is dormant");
            }
        }

        tracing::debug!(
            node = %id,
            similar = similar.len(),
            discovered,
            first_time,
            "Node stored"
        );

        Ok(())
    }

    /// Whether a refresh brought new attributes or similarity edges
    fn detect_change(
        &self,
        id: NodeId,
        record: &SampleRecord,
        similar: &[SimilarSample],
    ) -> Result<bool, CrawlError> {
        let attributes_changed = match self.metadata.get_node(id)? {
            Some(stored) => stored.attributes != record.attributes,
            None => true,
        };
        let new_edges = similar.iter().any(|neighbor| {
            neighbor.id != id
                && !self
                    .topology
                    .contains_edge(id, neighbor.id, EdgeKind::Similar)
        });
        Ok(attributes_changed || new_edges)
    }

    /// The only deletion path: the API reported the node gone
    fn delete_node(
        &mut self,
        id: NodeId,
        counters: &mut SessionCounters,
    ) -> Result<NodeOutcome, CrawlError> {
        self.metadata.remove_node(id)?;
        let edges = self.topology.remove_node(id).unwrap_or(0);
        self.frontier.remove(id);
        let event = self.state.record_deletion(id, Utc::now());

        tracing::warn!(node = %id, edges, "Node no longer exists, removed from graph");
        counters.deletions.push(event);

        Ok(NodeOutcome::Deleted)
    }

    /// Re-queues a node whose fetch did not complete
    fn handle_failure(&mut self, entry: &FrontierEntry, error: RetryError) -> NodeOutcome {
        let now = Utc::now();

        match error {
            RetryError::Cancelled => {
                tracing::debug!(node = %entry.id, "Fetch cancelled, re-queued");
                self.frontier.requeue(entry, now);
                NodeOutcome::Cancelled
            }
            RetryError::BudgetExhausted => {
                tracing::debug!(node = %entry.id, "Request budget reached mid-fetch, re-queued");
                self.frontier.requeue(entry, now);
                NodeOutcome::OutOfBudget
            }
            error => {
                let failures = self.state.record_failure(entry.id);
                tracing::warn!(
                    node = %entry.id,
                    failures,
                    error = %error,
                    "Fetch failed, deferring node"
                );
                self.frontier
                    .push(entry.id, FrontierReason::Deferred, entry.discovered_at, now);
                NodeOutcome::Deferred
            }
        }
    }

    async fn resolve_stubs(&mut self) -> Result<Option<ResolveReport>, CrawlError> {
        if !self.config.synthesis.resolve_stubs {
            return Ok(None);
        }

        let budget = self.remaining_requests();
        let api = Arc::clone(&self.api);
        let report = self
            .synthesizer
            .resolve_stubs(
                api.as_ref(),
                &mut self.client,
                &mut self.metadata,
                &self.topology,
                budget,
            )
            .await;
        self.sync_requests();

        Ok(Some(report?))
    }

    /// Runs edge synthesis; a failure skips synthesis for this session
    fn synthesize(&mut self) -> Option<SynthesisReport> {
        if !self.config.synthesis.enabled {
            return None;
        }

        match self.synthesizer.synthesize(&self.metadata, &mut self.topology) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Edge synthesis failed, skipped for this session");
                None
            }
        }
    }

    /// Saves the checkpoint; any failure is fatal to the session
    fn checkpoint(&mut self, started: Instant) -> Result<CheckpointSnapshot, CrawlError> {
        self.state.frontier = self.frontier.snapshot();
        self.state
            .set_elapsed(started.elapsed().as_millis().min(u64::MAX as u128) as u64);

        match self
            .checkpoints
            .save(&mut self.state, &self.topology, &mut self.metadata)
        {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::error!(error = %e, "Checkpoint write failed");
                self.status = CrawlerState::Failed;
                Err(e.into())
            }
        }
    }
}
