//! Configuration module for the sample-graph crawler
//!
//! This module handles loading, parsing, validating and hashing TOML
//! configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sample_graph::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl.toml")).unwrap();
//! println!("Checkpoint every {} nodes", config.crawl.checkpoint_interval);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    ApiConfig, BudgetConfig, Config, CrawlConfig, MilestoneConfig, StorageConfig,
    SynthesisConfig, MAX_STALE_AFTER_HOURS,
};

pub use parser::{
    compute_config_hash, hash_config_content, load_config, load_config_with_hash, parse_config,
};
