//! Output module for reporting crawl results
//!
//! This module handles:
//! - Loading graph statistics from the checkpoint artifacts
//! - Printing statistics and session reports

pub mod stats;

pub use stats::{load_statistics, print_session_report, print_statistics, GraphStatistics};
