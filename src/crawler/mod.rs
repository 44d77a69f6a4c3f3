//! Crawler module for incremental graph collection
//!
//! This module contains the core crawling logic, including:
//! - The priority frontier of nodes to fetch
//! - Shared-attribute edge synthesis
//! - The stop signal shared with waits and the loop
//! - Overall crawl coordination across sessions

mod coordinator;
mod frontier;
mod stop;
mod synthesizer;

pub use coordinator::{
    CrawlOutcome, CrawlerState, IncrementalCrawler, SessionReport, SynthesisRun,
    REQUESTS_PER_NODE,
};
pub use frontier::PriorityFrontier;
pub use stop::StopSignal;
pub use synthesizer::{jaccard, EdgeSynthesizer, ResolveReport, SynthesisReport, STUB_FIELDS};

use crate::config::Config;
use crate::CrawlError;
use std::sync::Arc;

/// Runs one crawl session against the configured API
///
/// This is the main entry point for a session. It will:
/// 1. Open or create the checkpoint in the data directory
/// 2. Seed an empty frontier
/// 3. Fetch nodes until a budget, the frontier or `stop` ends the loop
/// 4. Synthesize shared-attribute edges
/// 5. Save the final checkpoint
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `config_hash` - Hash of the configuration file
/// * `stop` - Signal that interrupts the session
/// * `fresh` - Discard any existing checkpoint first
///
/// # Returns
///
/// * `Ok(SessionReport)` - Session ended gracefully
/// * `Err(CrawlError)` - Session failed
pub async fn crawl(
    config: Config,
    config_hash: String,
    stop: StopSignal,
    fresh: bool,
) -> Result<SessionReport, CrawlError> {
    let api = crate::api::FreesoundClient::from_config(&config.api)?;
    let mut crawler = IncrementalCrawler::open(config, Arc::new(api), stop, fresh)?
        .with_config_hash(config_hash);
    crawler.run().await
}
