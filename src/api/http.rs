//! `reqwest` implementation of [`SampleApi`] for the Freesound v2 API
//!
//! This module handles:
//! - Building the HTTP client with a proper user agent and timeouts
//! - Token authentication
//! - Mapping HTTP statuses to [`ApiError`] classes

use crate::api::{ApiError, SampleApi, SearchPage, SearchQuery, SimilarSample};
use crate::config::ApiConfig;
use crate::model::{NodeId, SampleRecord};
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `timeout` - Total per-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Client for the Freesound API
#[derive(Debug, Clone)]
pub struct FreesoundClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

/// Shape of the similarity listing response
#[derive(Debug, Deserialize)]
struct SimilarResponse {
    #[serde(default)]
    results: Vec<SimilarEntry>,
}

#[derive(Debug, Deserialize)]
struct SimilarEntry {
    id: NodeId,
    #[serde(default, alias = "distance_to_target")]
    distance: Option<f64>,
}

impl FreesoundClient {
    /// Creates a client for `base_url`
    ///
    /// A trailing slash is added to the base URL when missing so that
    /// relative endpoint paths resolve beneath it.
    pub fn new(client: Client, base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ApiError::Transport(format!("invalid base url {}: {}", base_url, e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Builds a client from the API configuration
    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = build_http_client(config.timeout())
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let token = config.resolve_token();
        if token.is_none() {
            tracing::warn!(
                "No API token configured (set `token` or ${}); requests will be unauthenticated",
                config.token_env
            );
        }
        Self::new(client, &config.base_url, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Transport(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let mut request = self.client.get(url.clone()).query(query);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Token {}", token));
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let response = check_status(response)?;

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl SampleApi for FreesoundClient {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, ApiError> {
        let url = self.endpoint("search/text/")?;

        let mut params = vec![
            ("query", query.query.clone()),
            ("page", query.page.max(1).to_string()),
            ("page_size", query.page_size.to_string()),
        ];
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.clone()));
        }
        if !query.fields.is_empty() {
            params.push(("fields", query.fields.join(",")));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }

        self.get_json(url, &params).await
    }

    async fn get_sample(&self, id: NodeId) -> Result<SampleRecord, ApiError> {
        let url = self.endpoint(&format!("sounds/{}/", id))?;
        self.get_json(url, &[]).await
    }

    async fn get_similar(
        &self,
        id: NodeId,
        page_size: u32,
    ) -> Result<Vec<SimilarSample>, ApiError> {
        let url = self.endpoint(&format!("sounds/{}/similar/", id))?;
        let response: SimilarResponse = self
            .get_json(url, &[("page_size", page_size.to_string())])
            .await?;

        Ok(response
            .results
            .into_iter()
            .filter(|entry| entry.id != id)
            .map(|entry| SimilarSample {
                id: entry.id,
                distance: entry.distance,
            })
            .collect())
    }
}

/// Maps a response status to an [`ApiError`] class
///
/// | Status | Class |
/// |--------|-------|
/// | 2xx | passed through |
/// | 401, 403 | `Unauthorized` |
/// | 404, 410 | `NotFound` |
/// | 429 | `RateLimited` with `Retry-After` seconds if present |
/// | anything else | `Server` |
fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(ApiError::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized {
            status: status.as_u16(),
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited {
            retry_after: parse_retry_after(&response),
        }),
        _ => Err(ApiError::Server {
            status: status.as_u16(),
        }),
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Transport("request timeout".to_string())
    } else if error.is_connect() {
        ApiError::Transport(format!("connection failed: {}", error))
    } else {
        ApiError::Transport(error.to_string())
    }
}
