use serde::Deserialize;
use std::time::Duration;

/// Largest accepted `stale-after-hours` (one hundred years)
pub const MAX_STALE_AFTER_HOURS: u64 = 100 * 365 * 24;

/// Main configuration structure for the sample-graph crawler
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub milestones: MilestoneConfig,
}

/// Remote API access configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the API, e.g. `https://freesound.org/apiv2/`
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// API token (takes precedence over `token-env`)
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding the API token
    #[serde(rename = "token-env", default = "default_token_env")]
    pub token_env: String,

    /// Ceiling on requests issued per minute
    #[serde(rename = "requests-per-minute", default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Maximum attempts per logical call, including the first one
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First wait after a rate-limit response (milliseconds)
    #[serde(rename = "initial-backoff-ms", default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// First wait after a transport or server error (milliseconds)
    #[serde(
        rename = "transient-backoff-ms",
        default = "default_transient_backoff_ms"
    )]
    pub transient_backoff_ms: u64,

    /// Upper bound on any single backoff wait (seconds)
    #[serde(rename = "max-backoff-secs", default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Per-request timeout (seconds)
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of similar samples requested per node
    #[serde(rename = "similar-page-size", default = "default_similar_page_size")]
    pub similar_page_size: u32,
}

/// Session budgets
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Maximum requests issued in one session
    #[serde(rename = "max-requests", default = "default_max_requests")]
    pub max_requests: u64,

    /// Maximum wall-clock time of one session (seconds)
    #[serde(rename = "max-duration-secs", default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

/// Crawl loop behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    /// Sample ids used to seed an empty checkpoint
    #[serde(default)]
    pub seeds: Vec<u64>,

    /// Optional text query whose first result page seeds an empty checkpoint
    #[serde(rename = "seed-query", default)]
    pub seed_query: Option<String>,

    /// Optional filter expression applied to the seed query
    #[serde(rename = "seed-filter", default)]
    pub seed_filter: Option<String>,

    /// Number of results taken from the seed query
    #[serde(rename = "seed-page-size", default = "default_seed_page_size")]
    pub seed_page_size: u32,

    /// Persist a checkpoint every N fetched nodes
    #[serde(
        rename = "checkpoint-interval",
        default = "default_checkpoint_interval"
    )]
    pub checkpoint_interval: u32,

    /// Fetched nodes older than this become refresh candidates (hours)
    #[serde(rename = "stale-after-hours", default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    /// Refreshes without new information before a node is dormant
    #[serde(
        rename = "dormant-after-refreshes",
        default = "default_dormant_after_refreshes"
    )]
    pub dormant_after_refreshes: u32,
}

/// Edge synthesis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    /// Run synthesis at the end of each session
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum Jaccard similarity for a shared-tag edge
    #[serde(rename = "tag-threshold", default = "default_tag_threshold")]
    pub tag_threshold: f64,

    /// Groups (user, pack, tag) larger than this are not expanded into pairs
    #[serde(rename = "max-group-size", default = "default_max_group_size")]
    pub max_group_size: usize,

    /// Resolve attributes of stub nodes before synthesizing
    #[serde(rename = "resolve-stubs", default)]
    pub resolve_stubs: bool,

    /// Number of stub ids resolved per search request
    #[serde(rename = "resolve-batch-size", default = "default_resolve_batch_size")]
    pub resolve_batch_size: usize,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding topology, metadata and crawl state
    #[serde(rename = "data-dir")]
    pub data_dir: String,
}

/// Milestone reporting
#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneConfig {
    /// Fetched-node interval whose crossing is reported (0 disables)
    #[serde(rename = "node-interval", default = "default_milestone_interval")]
    pub node_interval: u64,
}

impl ApiConfig {
    /// Resolves the token from the file or the configured environment variable
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.is_empty())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BudgetConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

impl CrawlConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_after_hours.min(MAX_STALE_AFTER_HOURS) as i64)
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            seed_query: None,
            seed_filter: None,
            seed_page_size: default_seed_page_size(),
            checkpoint_interval: default_checkpoint_interval(),
            stale_after_hours: default_stale_after_hours(),
            dormant_after_refreshes: default_dormant_after_refreshes(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tag_threshold: default_tag_threshold(),
            max_group_size: default_max_group_size(),
            resolve_stubs: false,
            resolve_batch_size: default_resolve_batch_size(),
        }
    }
}

impl Default for MilestoneConfig {
    fn default() -> Self {
        Self {
            node_interval: default_milestone_interval(),
        }
    }
}

fn default_token_env() -> String {
    "FREESOUND_API_KEY".to_string()
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    10_000
}

fn default_transient_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_similar_page_size() -> u32 {
    15
}

fn default_max_requests() -> u64 {
    1_900
}

fn default_max_duration_secs() -> u64 {
    3 * 60 * 60
}

fn default_seed_page_size() -> u32 {
    15
}

fn default_checkpoint_interval() -> u32 {
    50
}

fn default_stale_after_hours() -> u64 {
    30 * 24
}

fn default_dormant_after_refreshes() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_tag_threshold() -> f64 {
    0.5
}

fn default_max_group_size() -> usize {
    200
}

fn default_resolve_batch_size() -> usize {
    50
}

fn default_milestone_interval() -> u64 {
    1_000
}
