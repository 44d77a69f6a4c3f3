//! Bounded exponential-backoff retries around single API calls
//!
//! # Retry Logic
//!
//! | Condition | Action |
//! |-----------|--------|
//! | Success | Return `Fetched::Present` |
//! | Not found | Immediate → `Fetched::Absent`, no retry |
//! | Unauthorized / forbidden | Immediate → `Rejected`, no retry |
//! | Rate limited | Backoff from `initial_backoff` (or `Retry-After` if longer), doubling |
//! | Transport / server / decode | Backoff from `transient_backoff`, doubling |
//! | Attempts exhausted | `RateLimitExceeded` or `TransientFailure` |
//!
//! Every wait is capped at `max_backoff`. Each attempt passes the rate limiter
//! first and is charged to the [`RequestLedger`], failed attempts included.
//! When a request limit is set, an attempt that would exceed it is refused
//! with `BudgetExhausted` before anything is sent.

use crate::api::rate_limiter::{deadline_reached, RateLimiter};
use crate::api::ApiError;
use crate::config::ApiConfig;
use crate::crawler::StopSignal;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Outcome of a call that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Present(T),
    /// The API reported that the resource does not exist
    Absent,
}

impl<T> Fetched<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            Self::Absent => None,
        }
    }
}

/// Errors surfaced once retrying is given up
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    #[error("still rate limited after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    #[error("request failed after {attempts} attempts: {last_error}")]
    TransientFailure { attempts: u32, last_error: ApiError },

    #[error("request rejected: {last_error}")]
    Rejected { last_error: ApiError },

    #[error("request budget exhausted")]
    BudgetExhausted,

    #[error("request cancelled by stop signal or deadline")]
    Cancelled,
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// First wait after a rate-limit response
    pub initial_backoff: Duration,
    /// First wait after any other failure
    pub transient_backoff: Duration,
    /// Cap on any single wait
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            transient_backoff: config.transient_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Wait before retry number `retry` (1-based) starting from `base`
    pub fn backoff(&self, base: Duration, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        base.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            transient_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Running count of requests issued through a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestLedger {
    attempts: u64,
    failed: u64,
    rate_limited: u64,
}

impl RequestLedger {
    /// Requests issued, including failed attempts
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited
    }
}

/// Executes API operations under the rate limiter with retries
pub struct RetryingClient {
    limiter: RateLimiter,
    policy: RetryPolicy,
    ledger: RequestLedger,
    stop: StopSignal,
    deadline: Option<Instant>,
    /// Ledger attempt count at which further attempts are refused
    attempt_cap: Option<u64>,
}

impl RetryingClient {
    pub fn new(limiter: RateLimiter, policy: RetryPolicy, stop: StopSignal) -> Self {
        Self {
            limiter,
            policy,
            ledger: RequestLedger::default(),
            stop,
            deadline: None,
            attempt_cap: None,
        }
    }

    /// Builds a client from the API configuration
    pub fn from_config(config: &ApiConfig, stop: StopSignal) -> Self {
        Self::new(
            RateLimiter::per_minute(config.requests_per_minute),
            RetryPolicy::from_config(config),
            stop,
        )
    }

    /// Waits are abandoned once `deadline` passes
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Allows at most `remaining` further attempts; `None` lifts the limit
    pub fn set_request_limit(&mut self, remaining: Option<u64>) {
        self.attempt_cap = remaining.map(|n| self.ledger.attempts.saturating_add(n));
    }

    pub fn ledger(&self) -> RequestLedger {
        self.ledger
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one logical API call
    ///
    /// `op` is invoked once per attempt; `label` only appears in logs.
    pub async fn call<T, F, Fut>(&mut self, label: &str, mut op: F) -> Result<Fetched<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut transient_retries: u32 = 0;

        loop {
            if self.attempt_cap.is_some_and(|cap| self.ledger.attempts >= cap) {
                tracing::debug!(call = label, attempts = attempt, "request limit reached");
                return Err(RetryError::BudgetExhausted);
            }

            if !self.limiter.acquire_until(&self.stop, self.deadline).await {
                return Err(RetryError::Cancelled);
            }

            attempt += 1;
            self.ledger.attempts += 1;

            let error = match op().await {
                Ok(value) => return Ok(Fetched::Present(value)),
                Err(ApiError::NotFound) => {
                    tracing::debug!(call = label, "resource not found");
                    return Ok(Fetched::Absent);
                }
                Err(error @ ApiError::Unauthorized { .. }) => {
                    self.ledger.failed += 1;
                    tracing::error!(call = label, error = %error, "request rejected, not retrying");
                    return Err(RetryError::Rejected { last_error: error });
                }
                Err(error) => error,
            };

            self.ledger.failed += 1;

            let wait = match &error {
                ApiError::RateLimited { retry_after } => {
                    self.ledger.rate_limited += 1;
                    if attempt >= self.policy.max_attempts {
                        tracing::error!(call = label, attempts = attempt, "rate limit retries exhausted");
                        return Err(RetryError::RateLimitExceeded { attempts: attempt });
                    }
                    rate_limit_retries += 1;
                    let backoff = self
                        .policy
                        .backoff(self.policy.initial_backoff, rate_limit_retries);
                    retry_after
                        .map_or(backoff, |suggested| suggested.max(backoff))
                        .min(self.policy.max_backoff)
                }
                _ => {
                    if attempt >= self.policy.max_attempts {
                        tracing::error!(call = label, attempts = attempt, error = %error, "retries exhausted");
                        return Err(RetryError::TransientFailure {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    transient_retries += 1;
                    self.policy
                        .backoff(self.policy.transient_backoff, transient_retries)
                }
            };

            tracing::warn!(
                call = label,
                attempt,
                error = %error,
                ?wait,
                "request failed, backing off"
            );

            self.sleep(wait).await?;
        }
    }

    async fn sleep(&self, wait: Duration) -> Result<(), RetryError> {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = self.stop.triggered() => Err(RetryError::Cancelled),
            _ = deadline_reached(self.deadline) => Err(RetryError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(10),
            transient_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }

    fn test_client() -> RetryingClient {
        RetryingClient::new(RateLimiter::unlimited(), test_policy(), StopSignal::new())
    }

    /// Replays `script` one response per attempt and records attempt times
    fn scripted(
        script: Vec<Result<u32, ApiError>>,
    ) -> (
        impl FnMut() -> std::future::Ready<Result<u32, ApiError>>,
        Arc<Mutex<Vec<Instant>>>,
    ) {
        let times = Arc::new(Mutex::new(Vec::new()));
        let recorded = times.clone();
        let mut script = script.into_iter();
        let op = move || {
            recorded.lock().unwrap().push(Instant::now());
            std::future::ready(script.next().unwrap_or(Err(ApiError::Server { status: 500 })))
        };
        (op, times)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = test_policy();
        let base = Duration::from_secs(10);
        assert_eq!(policy.backoff(base, 1), Duration::from_secs(10));
        assert_eq!(policy.backoff(base, 2), Duration::from_secs(20));
        assert_eq!(policy.backoff(base, 3), Duration::from_secs(40));
        assert_eq!(policy.backoff(base, 6), Duration::from_secs(300));
        assert_eq!(policy.backoff(base, 40), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_rate_limits() {
        let mut client = test_client();
        let (op, times) = scripted(vec![
            Err(ApiError::RateLimited { retry_after: None }),
            Err(ApiError::RateLimited { retry_after: None }),
            Ok(7),
        ]);

        let result = client.call("test", op).await;
        assert_eq!(result, Ok(Fetched::Present(7)));

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        let first_wait = times[1] - times[0];
        let second_wait = times[2] - times[1];
        assert_eq!(first_wait, Duration::from_secs(10));
        assert_eq!(second_wait, Duration::from_secs(20));
        assert!(second_wait >= first_wait);

        assert_eq!(client.ledger().attempts(), 3);
        assert_eq!(client.ledger().rate_limited(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let mut client = test_client();
        let (op, times) = scripted(vec![Err(ApiError::NotFound), Ok(1)]);

        let result = client.call("test", op).await;
        assert_eq!(result, Ok(Fetched::Absent));
        assert_eq!(times.lock().unwrap().len(), 1);
        assert_eq!(client.ledger().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion() {
        let mut client = test_client();
        let (op, times) = scripted(vec![
            Err(ApiError::RateLimited { retry_after: None });
            10
        ]);

        let result = client.call("test", op).await;
        assert_eq!(result, Err(RetryError::RateLimitExceeded { attempts: 4 }));
        assert_eq!(times.lock().unwrap().len(), 4);
        assert_eq!(client.ledger().attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_reports_last_error() {
        let mut client = test_client();
        let (op, _) = scripted(vec![
            Err(ApiError::Transport("reset".into())),
            Err(ApiError::Server { status: 502 }),
            Err(ApiError::Server { status: 503 }),
            Err(ApiError::Server { status: 504 }),
        ]);

        let result = client.call("test", op).await;
        assert_eq!(
            result,
            Err(RetryError::TransientFailure {
                attempts: 4,
                last_error: ApiError::Server { status: 504 },
            })
        );
        assert_eq!(client.ledger().failed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_extends_wait_but_is_capped() {
        let mut client = test_client();
        let (op, times) = scripted(vec![
            Err(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(45)),
            }),
            Err(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            }),
            Ok(1),
        ]);

        client.call("test", op).await.unwrap();

        let times = times.lock().unwrap();
        assert_eq!(times[1] - times[0], Duration::from_secs(45));
        assert_eq!(times[2] - times[1], Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_backoff_is_separate_from_rate_limit() {
        let mut client = test_client();
        let (op, times) = scripted(vec![
            Err(ApiError::Server { status: 500 }),
            Err(ApiError::RateLimited { retry_after: None }),
            Err(ApiError::Server { status: 500 }),
            Ok(1),
        ]);

        client.call("test", op).await.unwrap();

        let times = times.lock().unwrap();
        assert_eq!(times[1] - times[0], Duration::from_secs(1));
        assert_eq!(times[2] - times[1], Duration::from_secs(10));
        assert_eq!(times[3] - times[2], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_backoff() {
        let stop = StopSignal::new();
        let mut client =
            RetryingClient::new(RateLimiter::unlimited(), test_policy(), stop.clone());
        let (op, times) = scripted(vec![Err(ApiError::RateLimited { retry_after: None }); 4]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stop.trigger();
        });

        let result = client.call("test", op).await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(times.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_backoff() {
        let mut client = test_client();
        client.set_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let (op, _) = scripted(vec![Err(ApiError::RateLimited { retry_after: None }); 4]);

        let start = Instant::now();
        let result = client.call("test", op).await;
        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let mut client = test_client();
        let (op, times) = scripted(vec![Err(ApiError::Unauthorized { status: 401 }), Ok(1)]);

        let result = client.call("test", op).await;
        assert_eq!(
            result,
            Err(RetryError::Rejected {
                last_error: ApiError::Unauthorized { status: 401 },
            })
        );
        assert_eq!(times.lock().unwrap().len(), 1);
        assert_eq!(client.ledger().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_limit_stops_retries() {
        let mut client = test_client();
        client.set_request_limit(Some(2));
        let (op, times) = scripted(vec![Err(ApiError::Server { status: 500 }); 4]);

        let result = client.call("test", op).await;
        assert_eq!(result, Err(RetryError::BudgetExhausted));
        assert_eq!(times.lock().unwrap().len(), 2);
        assert_eq!(client.ledger().attempts(), 2);

        // The limit counts from when it was set
        client.set_request_limit(Some(1));
        let (op, _) = scripted(vec![Ok(5)]);
        assert_eq!(client.call("test", op).await, Ok(Fetched::Present(5)));

        let (op, times) = scripted(vec![Ok(6)]);
        assert_eq!(client.call("test", op).await, Err(RetryError::BudgetExhausted));
        assert!(times.lock().unwrap().is_empty());

        client.set_request_limit(None);
        let (op, _) = scripted(vec![Ok(7)]);
        assert_eq!(client.call("test", op).await, Ok(Fetched::Present(7)));
    }
}
