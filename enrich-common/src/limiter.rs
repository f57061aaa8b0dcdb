use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Extra seconds added when waiting for the oldest request to exit the
/// window, so a provider measuring on a slightly skewed clock still sees us
/// under the limit.
const SAFETY_MARGIN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum number of requests dispatched inside one sliding window.
    pub requests_per_window: usize,
    /// Width of the sliding window.
    pub window: Duration,
    /// Minimum spacing between any two consecutive requests, regardless of
    /// window occupancy.
    pub min_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 5,
            window: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
        }
    }
}

/// A sliding-window gate for outbound provider calls.
///
/// State is in-memory only and lives for a single run; overlapping scheduled
/// invocations each budget independently. Callers must hold the limiter
/// across every network call they make, including calls that end up
/// classified Invalid.
pub struct RateLimiter {
    config: RateLimiterConfig,
    dispatched: VecDeque<Instant>,
    last_dispatch: Option<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            dispatched: VecDeque::with_capacity(config.requests_per_window),
            last_dispatch: None,
        }
    }

    /// Block until a request may be dispatched, then record its timestamp.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_dispatch {
            let since_last = last.elapsed();
            if since_last < self.config.min_interval {
                sleep(self.config.min_interval - since_last).await;
            }
        }

        let mut now = Instant::now();
        while let Some(&oldest) = self.dispatched.front() {
            if now.duration_since(oldest) >= self.config.window {
                self.dispatched.pop_front();
            } else {
                break;
            }
        }

        if self.dispatched.len() >= self.config.requests_per_window {
            if let Some(&oldest) = self.dispatched.front() {
                let wait = (self.config.window + SAFETY_MARGIN)
                    .saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    debug!("request window full, waiting {:?}", wait);
                    sleep(wait).await;
                }
                self.dispatched.pop_front();
                now = Instant::now();
            }
        }

        self.dispatched.push_back(now);
        self.last_dispatch = Some(now);
    }

    /// Drop all window state. Called at the start of a batch run.
    pub fn reset(&mut self) {
        self.dispatched.clear();
        self.last_dispatch = None;
    }
}
