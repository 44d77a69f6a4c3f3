//! Sample-Graph main entry point
//!
//! This is the command-line interface for the incremental sample-graph crawler.

use anyhow::Context;
use clap::Parser;
use sample_graph::config::{load_config_with_hash, Config};
use sample_graph::crawler::{crawl, IncrementalCrawler, StopSignal};
use sample_graph::output::{load_statistics, print_session_report, print_statistics};
use sample_graph::state::CheckpointStore;
use sample_graph::CrawlError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Sample-Graph: an incremental crawler for audio-sample graphs
///
/// Each invocation runs one budget-limited session and saves a checkpoint,
/// so repeated invocations grow the graph without refetching visited nodes.
#[derive(Parser, Debug)]
#[command(name = "sample-graph")]
#[command(version)]
#[command(about = "Incremental, resumable crawler for audio-sample graphs", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Discard the existing checkpoint and start over
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    fresh: bool,

    /// Validate config and show the session plan without crawling
    #[arg(long, conflicts_with_all = ["stats", "synthesize"])]
    dry_run: bool,

    /// Show statistics from the checkpoint and exit
    #[arg(long, conflicts_with_all = ["dry_run", "synthesize"])]
    stats: bool,

    /// Resolve stubs and synthesize shared-attribute edges without crawling
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    synthesize: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            // Operator-facing failures get their own exit code
            match e.downcast_ref::<CrawlError>() {
                Some(crawl_error) if crawl_error.needs_operator() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .map_err(CrawlError::from)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config)
    } else if cli.stats {
        handle_stats(&config)
    } else if cli.synthesize {
        handle_synthesize(config, config_hash).await
    } else {
        handle_crawl(config, config_hash, cli.fresh).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sample_graph=info,warn"),
            1 => EnvFilter::new("sample_graph=debug,info"),
            2 => EnvFilter::new("sample_graph=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Triggers `stop` on Ctrl-C so the session can checkpoint before exiting
fn install_interrupt_handler(stop: StopSignal) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Interrupt received, stopping after the current node");
                stop.trigger();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

/// Handles the --dry-run mode: validates config and shows the session plan
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Sample-Graph Dry Run ===\n");

    println!("API:");
    println!("  Base URL: {}", config.api.base_url);
    println!(
        "  Token: {}",
        if config.api.resolve_token().is_some() {
            "configured"
        } else {
            "missing"
        }
    );
    println!("  Requests per minute: {}", config.api.requests_per_minute);
    println!("  Max attempts: {}", config.api.max_attempts);
    println!("  Max backoff: {}s", config.api.max_backoff_secs);

    println!("\nBudget:");
    println!("  Max requests: {}", config.budget.max_requests);
    println!("  Max duration: {}s", config.budget.max_duration_secs);

    println!("\nCrawl:");
    println!("  Seeds: {:?}", config.crawl.seeds);
    if let Some(query) = &config.crawl.seed_query {
        println!("  Seed query: {:?} (filter {:?})", query, config.crawl.seed_filter);
    }
    println!("  Checkpoint interval: {} nodes", config.crawl.checkpoint_interval);
    println!("  Stale after: {}h", config.crawl.stale_after_hours);
    println!(
        "  Dormant after: {} unchanged refreshes",
        config.crawl.dormant_after_refreshes
    );

    println!("\nSynthesis:");
    println!("  Enabled: {}", config.synthesis.enabled);
    println!("  Tag threshold: {}", config.synthesis.tag_threshold);
    println!("  Resolve stubs: {}", config.synthesis.resolve_stubs);

    println!("\nStorage:");
    println!("  Data directory: {}", config.storage.data_dir);

    let store = CheckpointStore::new(&config.storage.data_dir);
    match store.read_snapshot().map_err(CrawlError::from)? {
        Some(snapshot) => println!(
            "\n✓ Would resume checkpoint generation {} ({} nodes, {} queued)",
            snapshot.generation, snapshot.node_count, snapshot.frontier_len
        ),
        None => println!(
            "\n✓ Would start a new crawl from {} configured seeds",
            config.crawl.seeds.len()
        ),
    }
    println!("✓ Configuration is valid");

    Ok(())
}

/// Handles the --stats mode: shows statistics from the checkpoint
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Data directory: {}\n", config.storage.data_dir);

    let store = CheckpointStore::new(&config.storage.data_dir);
    let stats = load_statistics(&store)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --synthesize mode
async fn handle_synthesize(config: Config, config_hash: String) -> anyhow::Result<()> {
    let api = sample_graph::api::FreesoundClient::from_config(&config.api)
        .map_err(CrawlError::from)?;
    let stop = StopSignal::new();
    install_interrupt_handler(stop.clone());

    let mut crawler = IncrementalCrawler::open(config, Arc::new(api), stop, false)?
        .with_config_hash(config_hash);
    let run = crawler.synthesize_only().await?;

    if let Some(resolve) = &run.resolve {
        println!(
            "Resolved stubs: {} of {} in {} batches",
            resolve.resolved, resolve.stubs, resolve.batches
        );
    }
    println!(
        "Synthesized edges: {} (user {}, pack {}, tag {})",
        run.synthesis.new_edges(),
        run.synthesis.shared_user,
        run.synthesis.shared_pack,
        run.synthesis.shared_tag
    );
    println!(
        "Checkpoint generation {}: {} nodes, {} edges",
        run.snapshot.generation, run.snapshot.node_count, run.snapshot.edge_count
    );

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh crawl (discarding previous checkpoint)");
    } else {
        tracing::info!("Starting crawl session (resuming checkpoint if present)");
    }

    let stop = StopSignal::new();
    install_interrupt_handler(stop.clone());

    let report = crawl(config, config_hash, stop, fresh).await?;
    print_session_report(&report);

    Ok(())
}
