//! Integration tests for the crawler
//!
//! Most tests drive the crawl loop against an in-memory graph that records
//! every call. One test runs the full cycle over HTTP against a wiremock
//! server standing in for the remote API.

use async_trait::async_trait;
use sample_graph::api::{
    ApiError, RateLimiter, RetryPolicy, RetryingClient, SampleApi, SearchPage, SearchQuery,
    SimilarSample,
};
use sample_graph::config::{
    ApiConfig, BudgetConfig, Config, CrawlConfig, MilestoneConfig, StorageConfig,
    SynthesisConfig,
};
use sample_graph::crawler::{crawl, CrawlOutcome, CrawlerState, IncrementalCrawler, StopSignal};
use sample_graph::model::{EdgeKind, FrontierReason, NodeId, SampleAttributes, SampleRecord};
use sample_graph::state::CheckpointStore;
use sample_graph::storage::MetadataStore;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration rooted at `data_dir`
fn create_test_config(data_dir: &Path, seeds: Vec<u64>, max_requests: u64) -> Config {
    Config {
        api: ApiConfig {
            base_url: "https://freesound.org/apiv2/".to_string(),
            token: Some("test-token".to_string()),
            token_env: "FREESOUND_API_KEY".to_string(),
            requests_per_minute: 10_000,
            max_attempts: 2,
            initial_backoff_ms: 1,
            transient_backoff_ms: 1,
            max_backoff_secs: 1,
            timeout_secs: 5,
            similar_page_size: 15,
        },
        budget: BudgetConfig {
            max_requests,
            max_duration_secs: 3600,
        },
        crawl: CrawlConfig {
            seeds,
            ..CrawlConfig::default()
        },
        synthesis: SynthesisConfig::default(),
        storage: StorageConfig {
            data_dir: data_dir.to_string_lossy().into_owned(),
        },
        milestones: MilestoneConfig::default(),
    }
}

/// In-memory sample graph that records every record request
#[derive(Default)]
struct GraphApi {
    neighbors: HashMap<u64, Vec<u64>>,
    users: HashMap<u64, String>,
    missing: HashSet<u64>,
    /// Nodes whose record requests always fail with a server error
    failing: HashSet<u64>,
    /// Server errors returned by every call before it first succeeds
    flaky_failures: u32,
    flaky_counts: Mutex<HashMap<(u64, &'static str), u32>>,
    /// Time each record request takes
    sample_delay: Option<Duration>,
    /// The similarity listing of this node never answers
    hang_similar: Option<u64>,
    /// Triggered after the similarity listing of this node is served
    stop_after: Option<(u64, StopSignal)>,
    sample_calls: Mutex<Vec<NodeId>>,
}

impl GraphApi {
    fn with_edges(edges: Vec<(u64, Vec<u64>)>) -> Self {
        Self {
            neighbors: edges.into_iter().collect(),
            ..Default::default()
        }
    }

    fn fetched(&self) -> Vec<NodeId> {
        self.sample_calls.lock().unwrap().clone()
    }

    fn still_flaky(&self, id: NodeId, call: &'static str) -> bool {
        let mut counts = self.flaky_counts.lock().unwrap();
        let failures = counts.entry((id.0, call)).or_insert(0);
        if *failures < self.flaky_failures {
            *failures += 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SampleApi for GraphApi {
    async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, ApiError> {
        Ok(SearchPage::default())
    }

    async fn get_sample(&self, id: NodeId) -> Result<SampleRecord, ApiError> {
        self.sample_calls.lock().unwrap().push(id);
        if let Some(delay) = self.sample_delay {
            tokio::time::sleep(delay).await;
        }
        if self.missing.contains(&id.0) {
            return Err(ApiError::NotFound);
        }
        if self.failing.contains(&id.0) || self.still_flaky(id, "sample") {
            return Err(ApiError::Server { status: 500 });
        }
        Ok(SampleRecord {
            id,
            attributes: SampleAttributes {
                name: Some(format!("sample-{}.wav", id)),
                username: self.users.get(&id.0).cloned(),
                ..Default::default()
            },
        })
    }

    async fn get_similar(
        &self,
        id: NodeId,
        _page_size: u32,
    ) -> Result<Vec<SimilarSample>, ApiError> {
        if self.hang_similar == Some(id.0) {
            std::future::pending::<()>().await;
        }
        if self.still_flaky(id, "similar") {
            return Err(ApiError::Server { status: 500 });
        }

        let similar = self
            .neighbors
            .get(&id.0)
            .map(|targets| {
                targets
                    .iter()
                    .map(|target| SimilarSample {
                        id: NodeId(*target),
                        distance: Some(0.5),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some((node, stop)) = &self.stop_after {
            if *node == id.0 {
                stop.trigger();
            }
        }

        Ok(similar)
    }
}

fn open_crawler(config: Config, api: &Arc<GraphApi>, stop: StopSignal) -> IncrementalCrawler {
    let api: Arc<dyn SampleApi> = api.clone();
    IncrementalCrawler::open(config, api, stop, false).expect("Failed to open crawler")
}

#[tokio::test]
async fn test_request_budget_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let neighbours: Vec<u64> = (2..=11).collect();
    let api = Arc::new(GraphApi::with_edges(vec![(1, neighbours)]));

    let mut crawler = open_crawler(create_test_config(dir.path(), vec![1], 5), &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::BudgetExhausted);
    assert!(report.requests_used <= 5);
    assert_eq!(report.fetched, 2);

    let state = crawler.checkpoint_state();
    assert!(state.visited.len() <= 5);
    assert!(state.is_visited(NodeId(1)));
    assert_eq!(report.snapshot.node_count, state.visited.len() as u64);
    assert_eq!(report.snapshot.frontier_len, 9);
    assert_eq!(
        crawler.status(),
        CrawlerState::Paused(CrawlOutcome::BudgetExhausted)
    );
}

#[tokio::test]
async fn test_resume_never_refetches_visited_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(GraphApi::with_edges(vec![
        (1, vec![2, 3]),
        (2, vec![1, 4]),
        (3, vec![1, 5]),
        (4, vec![2]),
        (5, vec![3]),
    ]));

    let mut first = open_crawler(create_test_config(dir.path(), vec![1], 5), &api, StopSignal::new());
    let report = first.run().await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::BudgetExhausted);
    drop(first);

    let mut second = open_crawler(create_test_config(dir.path(), vec![1], 5), &api, StopSignal::new());
    assert_eq!(second.checkpoint_state().visited.len(), 2);
    let report = second.run().await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::BudgetExhausted);
    drop(second);

    let fetched = api.fetched();
    let unique: HashSet<NodeId> = fetched.iter().copied().collect();
    assert_eq!(fetched.len(), unique.len(), "a node was fetched twice: {:?}", fetched);
    assert_eq!(fetched.len(), 4);

    let state = CheckpointStore::new(dir.path()).load_state().unwrap().unwrap();
    assert_eq!(state.sessions, 2);
    assert_eq!(state.lifetime_requests, 8);
    assert_eq!(state.visited.len(), 4);
}

#[tokio::test]
async fn test_frontier_empty_with_deleted_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2, 3]), (3, vec![1])]);
    graph.missing.insert(2);
    let api = Arc::new(graph);

    let mut crawler = open_crawler(create_test_config(dir.path(), vec![1], 100), &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::FrontierEmpty);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.deletions.len(), 1);
    assert_eq!(report.deletions[0].id, NodeId(2));
    assert!(!crawler.topology().contains(NodeId(2)));
    assert!(crawler.topology().contains_edge(NodeId(1), NodeId(3), EdgeKind::Similar));
    assert!(!crawler.topology().contains_edge(NodeId(1), NodeId(2), EdgeKind::Similar));

    // The deletion survives in the saved checkpoint
    let state = CheckpointStore::new(dir.path()).load_state().unwrap().unwrap();
    assert_eq!(state.deletions.len(), 1);
    assert!(!state.is_visited(NodeId(2)));
}

#[tokio::test]
async fn test_interrupt_saves_progress_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let stop = StopSignal::new();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2]), (2, vec![3]), (3, vec![4])]);
    graph.stop_after = Some((2, stop.clone()));
    let api = Arc::new(graph);

    let mut crawler = open_crawler(create_test_config(dir.path(), vec![1], 100), &api, stop);
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::Interrupted);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.snapshot.node_count, 2);
    assert_eq!(report.snapshot.frontier_len, 1);
    drop(crawler);

    let mut resumed = open_crawler(create_test_config(dir.path(), vec![1], 100), &api, StopSignal::new());
    let report = resumed.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::FrontierEmpty);
    assert_eq!(report.fetched, 2);
    assert_eq!(resumed.checkpoint_state().visited.len(), 4);
    assert_eq!(api.fetched().len(), 4);
}

#[tokio::test]
async fn test_checkpoint_written_every_interval() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(GraphApi::with_edges(vec![(1, vec![2]), (2, vec![3]), (3, vec![4])]));

    let mut config = create_test_config(dir.path(), vec![1], 100);
    config.crawl.checkpoint_interval = 2;

    let client = RetryingClient::new(
        RateLimiter::unlimited(),
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            transient_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        StopSignal::new(),
    );
    let api_dyn: Arc<dyn SampleApi> = api.clone();
    let mut crawler = IncrementalCrawler::open(config, api_dyn, StopSignal::new(), false)
        .unwrap()
        .with_client(client);
    let report = crawler.run().await.unwrap();

    // Two periodic saves (after nodes 2 and 4) plus the final one
    assert_eq!(report.fetched, 4);
    assert_eq!(report.snapshot.generation, 3);

    let snapshot = CheckpointStore::new(dir.path())
        .read_snapshot()
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.generation, 3);
    assert_eq!(snapshot.node_count, 4);
    assert_eq!(snapshot.lifetime_requests, 8);
}

#[tokio::test]
async fn test_synthesis_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2]), (2, vec![3])]);
    for id in 1..=3 {
        graph.users.insert(id, "alice".to_string());
    }
    let api = Arc::new(graph);

    let mut crawler = open_crawler(create_test_config(dir.path(), vec![1], 100), &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    let synthesis = report.synthesis.expect("synthesis enabled by default");
    assert_eq!(synthesis.shared_user, 3);
    let edges_after_crawl = crawler.topology().edge_count();

    let run = crawler.synthesize_only().await.unwrap();

    assert_eq!(run.synthesis.new_edges(), 0);
    assert_eq!(crawler.topology().edge_count(), edges_after_crawl);
    assert_eq!(run.snapshot.edge_count, edges_after_crawl as u64);
}

#[tokio::test]
async fn test_full_crawl_over_http() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/sounds/1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 1, "name": "rain.wav", "username": "alice", "tags": ["rain", "field"]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sounds/1/similar/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{"id": 2, "distance_to_target": 0.25}]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sounds/2/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 2, "name": "storm.wav", "username": "alice", "tags": ["rain", "field"]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sounds/2/similar/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{"id": 1}]
        })))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(dir.path(), vec![1], 100);
    config.api.base_url = mock_server.uri();

    let report = crawl(config, "hash-1".to_string(), StopSignal::new(), false)
        .await
        .unwrap();

    assert_eq!(report.outcome, CrawlOutcome::FrontierEmpty);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.requests_used, 4);
    assert_eq!(report.snapshot.node_count, 2);
    // Similar 1->2 and 2->1, plus shared user and shared tags
    assert_eq!(report.snapshot.edge_count, 4);

    let store = CheckpointStore::new(dir.path());
    let state = store.load_state().unwrap().unwrap();
    assert_eq!(state.config_hash.as_deref(), Some("hash-1"));

    let metadata = store.open_metadata().unwrap();
    let record = metadata.get_node(NodeId(2)).unwrap().unwrap();
    assert_eq!(record.attributes.name.as_deref(), Some("storm.wav"));

    let topology = store.load_topology().unwrap();
    assert_eq!(topology.edge_weight(NodeId(1), NodeId(2), EdgeKind::Similar), Some(0.25));
    assert_eq!(topology.edges_of_kind(EdgeKind::SharedUser).count(), 1);
    let tag_edge = topology.edges_of_kind(EdgeKind::SharedTag).next().unwrap();
    assert_eq!(tag_edge.weight, Some(1.0));
}

#[tokio::test]
async fn test_retries_never_exceed_request_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2])]);
    graph.flaky_failures = 3;
    let api = Arc::new(graph);

    let mut config = create_test_config(dir.path(), vec![1], 5);
    config.api.max_attempts = 5;
    let mut crawler = open_crawler(config, &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::BudgetExhausted);
    assert!(
        report.requests_used <= 5,
        "request budget 5 overrun: {} requests",
        report.requests_used
    );
    assert!(report.snapshot.lifetime_requests <= 5);
    assert_eq!(report.fetched, 0);

    // The unfinished node keeps its place for the next session
    let entry = crawler.frontier().get(NodeId(1)).unwrap();
    assert_eq!(entry.reason, FrontierReason::New);
}

#[tokio::test]
async fn test_exhausted_retries_defer_node_and_continue() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2, 3])]);
    graph.failing.insert(2);
    let api = Arc::new(graph);

    let mut crawler = open_crawler(create_test_config(dir.path(), vec![1], 12), &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::BudgetExhausted);
    assert!(report.requests_used <= 12);
    assert_eq!(report.fetched, 2);
    assert!(report.deferred >= 1);

    let state = crawler.checkpoint_state();
    assert!(state.is_visited(NodeId(3)));
    assert!(!state.is_visited(NodeId(2)));
    assert_eq!(state.failures[&NodeId(2)] as u64, report.deferred);

    let entry = crawler.frontier().get(NodeId(2)).unwrap();
    assert_eq!(entry.reason, FrontierReason::Deferred);
}

#[tokio::test(start_paused = true)]
async fn test_time_budget_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = GraphApi::with_edges(vec![(1, vec![2]), (2, vec![3])]);
    graph.sample_delay = Some(Duration::from_millis(600));
    let api = Arc::new(graph);

    let mut config = create_test_config(dir.path(), vec![1], 100);
    config.budget.max_duration_secs = 1;
    let mut crawler = open_crawler(config, &api, StopSignal::new());
    let report = crawler.run().await.unwrap();

    assert_eq!(report.outcome, CrawlOutcome::TimeExhausted);
    assert_eq!(report.fetched, 1);
    assert!(report.elapsed >= Duration::from_secs(1));
    assert!(crawler.frontier().contains(NodeId(2)));
    assert_eq!(
        crawler.status(),
        CrawlerState::Paused(CrawlOutcome::TimeExhausted)
    );
}

#[tokio::test]
async fn test_unchanged_refreshes_make_node_dormant() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(GraphApi::default());

    let config = || {
        let mut config = create_test_config(dir.path(), vec![1], 100);
        config.crawl.stale_after_hours = 0;
        config.crawl.dormant_after_refreshes = 1;
        config
    };

    let mut first = open_crawler(config(), &api, StopSignal::new());
    let report = first.run().await.unwrap();
    assert_eq!(report.new_nodes, 1);
    drop(first);

    // Second session: stale refresh with nothing new
    let mut second = open_crawler(config(), &api, StopSignal::new());
    let report = second.run().await.unwrap();
    assert_eq!(report.refreshed, 1);
    assert_eq!(second.checkpoint_state().unchanged_refreshes[&NodeId(1)], 1);
    drop(second);

    // Third session only schedules, then stops
    let stop = StopSignal::new();
    stop.trigger();
    let mut third = open_crawler(config(), &api, stop);
    let report = third.run().await.unwrap();
    assert_eq!(report.outcome, CrawlOutcome::Interrupted);
    let entry = third.frontier().get(NodeId(1)).unwrap();
    assert_eq!(entry.reason, FrontierReason::Dormant);
    drop(third);

    let mut fourth = open_crawler(config(), &api, StopSignal::new());
    let report = fourth.run().await.unwrap();
    assert_eq!(report.refreshed, 1);
    assert_eq!(fourth.checkpoint_state().unchanged_refreshes[&NodeId(1)], 2);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_matches_checkpoint_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(GraphApi::with_edges(vec![(1, vec![2])]));

    let config = || {
        let mut config = create_test_config(dir.path(), vec![1], 100);
        config.crawl.stale_after_hours = 0;
        config
    };

    let mut first = open_crawler(config(), &api, StopSignal::new());
    first.run().await.unwrap();
    drop(first);

    // Node 1 is gone on refresh, then the session dies before saving
    let mut graph = GraphApi::with_edges(vec![(1, vec![2])]);
    graph.missing.insert(1);
    graph.hang_similar = Some(2);
    let failing_api = Arc::new(graph);

    let mut second = open_crawler(config(), &failing_api, StopSignal::new());
    let crashed = tokio::time::timeout(Duration::from_secs(60), second.run()).await;
    assert!(crashed.is_err());
    drop(second);

    let store = CheckpointStore::new(dir.path());
    let state = store.load_state().unwrap().unwrap();
    let topology = store.load_topology().unwrap();
    let metadata = store.open_metadata().unwrap();

    assert!(state.is_visited(NodeId(1)));
    assert!(state.deletions.is_empty());
    assert!(topology.contains(NodeId(1)));
    assert!(metadata.get_node(NodeId(1)).unwrap().is_some());
    assert_eq!(metadata.count().unwrap(), 2);
}
