//! Remote API access
//!
//! This module contains everything between the crawl loop and the network:
//! - The [`SampleApi`] trait describing the three operations the crawler uses
//! - A `reqwest` implementation of that trait
//! - Request throttling ([`RateLimiter`])
//! - Bounded exponential-backoff retries ([`RetryingClient`])

pub mod http;
pub mod rate_limiter;
pub mod retry;

pub use http::{build_http_client, FreesoundClient};
pub use rate_limiter::RateLimiter;
pub use retry::{Fetched, RequestLedger, RetryError, RetryPolicy, RetryingClient};

use crate::model::{NodeId, SampleRecord};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single API request, classified for the retry layer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("resource not found")]
    NotFound,

    /// The token was refused (HTTP 401 or 403)
    #[error("unauthorized: HTTP {status}")]
    Unauthorized { status: u16 },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Parameters of a paginated, filterable search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    /// Free-text query
    pub query: String,
    /// Structured filter expression, e.g. `username:alice`
    pub filter: Option<String>,
    /// Fields to include in each result
    pub fields: Vec<String>,
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    pub sort: Option<String>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            page: 1,
            page_size: 15,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    /// Filter matching any of the given ids
    pub fn id_filter(ids: &[NodeId]) -> String {
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" OR ");
        format!("id:({})", joined)
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchPage {
    /// Total number of matching records
    #[serde(default)]
    pub count: u64,
    /// URL of the next page, if any
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<SampleRecord>,
}

impl SearchPage {
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Entry of a similarity listing
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimilarSample {
    pub id: NodeId,
    /// Distance reported by the similarity endpoint, when present
    #[serde(default)]
    pub distance: Option<f64>,
}

/// Operations the crawler needs from the remote API
///
/// Implementations must report a missing resource as [`ApiError::NotFound`],
/// a refused token as [`ApiError::Unauthorized`] and throttling as
/// [`ApiError::RateLimited`] so the retry layer can treat them differently
/// from transport failures.
#[async_trait]
pub trait SampleApi: Send + Sync {
    /// Runs a text search with an optional filter
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ApiError>;

    /// Fetches a single record by id
    async fn get_sample(&self, id: NodeId) -> Result<SampleRecord, ApiError>;

    /// Lists samples similar to `id`
    async fn get_similar(&self, id: NodeId, page_size: u32)
        -> Result<Vec<SimilarSample>, ApiError>;
}
