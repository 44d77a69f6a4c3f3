//! Sliding-window request throttling
//!
//! The limiter remembers when each request in the trailing window was issued.
//! A new request is admitted once fewer than `max_requests` fall inside the
//! window; otherwise the caller waits until the oldest one ages out.

use crate::crawler::StopSignal;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Throttles outgoing requests to a per-window ceiling
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum requests admitted within `window` (`None` disables throttling)
    max_requests: Option<usize>,

    window: Duration,

    /// Issue instants of requests still inside the window, oldest first
    issued: VecDeque<Instant>,
}

impl RateLimiter {
    /// Creates a limiter admitting `requests_per_minute` requests per minute
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute as usize, Duration::from_secs(60))
    }

    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: Some(max_requests.max(1)),
            window,
            issued: VecDeque::new(),
        }
    }

    /// A limiter that never delays
    pub fn unlimited() -> Self {
        Self {
            max_requests: None,
            window: Duration::ZERO,
            issued: VecDeque::new(),
        }
    }

    /// Number of requests currently counted against the window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.issued.len()
    }

    /// Time until a request may be issued, or `None` if it may go now
    pub fn time_until_available(&mut self, now: Instant) -> Option<Duration> {
        let max = self.max_requests?;
        self.prune(now);

        if self.issued.len() < max {
            return None;
        }

        self.issued
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    /// Waits until a request may be issued and records it
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            match self.time_until_available(now) {
                None => {
                    self.record(now);
                    return;
                }
                Some(wait) => {
                    tracing::debug!(?wait, "rate limiter full, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up when `stop` fires or
    /// `deadline` passes
    ///
    /// Returns `false` without recording a request when the wait was cut
    /// short.
    pub async fn acquire_until(&mut self, stop: &StopSignal, deadline: Option<Instant>) -> bool {
        loop {
            if stop.is_triggered() {
                return false;
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return false;
            }

            let wait = match self.time_until_available(now) {
                None => {
                    self.record(now);
                    return true;
                }
                Some(wait) => wait,
            };

            tracing::debug!(?wait, "rate limiter full, waiting");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.triggered() => return false,
                _ = deadline_reached(deadline) => return false,
            }
        }
    }

    fn record(&mut self, now: Instant) {
        if self.max_requests.is_some() {
            self.issued.push_back(now);
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.issued.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Resolves at `deadline`, or never when there is none
pub(crate) async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_ceiling_without_waiting() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window(Instant::now()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_oldest_to_leave_window() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Third request waits until the first (t=0) ages out at t=60
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_available() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.time_until_available(now).is_none());
        limiter.acquire().await;

        let later = now + Duration::from_secs(15);
        assert_eq!(
            limiter.time_until_available(later),
            Some(Duration::from_secs(45))
        );
        assert!(limiter
            .time_until_available(now + Duration::from_secs(60))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let mut limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_respects_stop() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let stop = StopSignal::new();

        assert!(limiter.acquire_until(&stop, None).await);

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(!limiter.acquire_until(&stop, None).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_respects_deadline() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        let stop = StopSignal::new();
        limiter.acquire().await;

        let deadline = Instant::now() + Duration::from_secs(20);
        assert!(!limiter.acquire_until(&stop, Some(deadline)).await);
        assert_eq!(limiter.in_window(Instant::now()), 1);
    }
}
