//! Per-source request pacing with exponential backoff
//!
//! Tracks a rolling one-minute window, a minimum inter-call spacing and
//! a backoff horizon per source. Callers `acquire` before each request
//! and `record` the outcome afterwards; rate-limited outcomes push the
//! source's next permitted call out by `min(2^failures, 300)` seconds.
//! Backoff is per-source, never global.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 300;

/// Result of an upstream call, as seen by the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    RateLimited,
    OtherError,
}

#[derive(Debug)]
struct SourceState {
    rpm_cap: u32,
    min_interval: Duration,
    last_call_at: Option<Instant>,
    /// Call instants inside the rolling window
    window: VecDeque<Instant>,
    consecutive_failures: u32,
    next_allowed_at: Option<Instant>,
}

impl SourceState {
    fn new(rpm_cap: u32, min_interval: Duration) -> Self {
        Self {
            rpm_cap: rpm_cap.max(1),
            min_interval,
            last_call_at: None,
            window: VecDeque::new(),
            consecutive_failures: 0,
            next_allowed_at: None,
        }
    }

    /// Time to wait before the next call is permitted, or None if clear
    fn wait_needed(&mut self, now: Instant) -> Option<Duration> {
        let mut earliest = now;

        if let Some(backoff) = self.next_allowed_at {
            if backoff > earliest {
                earliest = backoff;
            }
        }
        if let Some(last) = self.last_call_at {
            let spaced = last + self.min_interval;
            if spaced > earliest {
                earliest = spaced;
            }
        }

        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() >= self.rpm_cap as usize {
            // Window full: wait for the oldest entry to age out
            let oldest = *self.window.front().expect("non-empty window");
            let reset = oldest + WINDOW;
            if reset > earliest {
                earliest = reset;
            }
        }

        if earliest > now {
            Some(earliest - now)
        } else {
            None
        }
    }
}

/// Thread-safe per-source rate limiter
pub struct RateLimiter {
    sources: Mutex<HashMap<String, SourceState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or re-register) pacing limits for a source
    pub async fn configure(&self, source: &str, rpm_cap: u32, min_interval_ms: u64) {
        let mut sources = self.sources.lock().await;
        sources.insert(
            source.to_string(),
            SourceState::new(rpm_cap, Duration::from_millis(min_interval_ms)),
        );
        debug!(source, rpm_cap, min_interval_ms, "rate limiter configured");
    }

    /// Block until the source is clear to call, then stamp the call.
    ///
    /// Cancellation-safe: dropping the future before it resolves leaves
    /// the window unstamped.
    pub async fn acquire(&self, source: &str) {
        loop {
            let wait = {
                let mut sources = self.sources.lock().await;
                let state = sources
                    .entry(source.to_string())
                    .or_insert_with(|| SourceState::new(60, Duration::ZERO));
                let now = Instant::now();
                match state.wait_needed(now) {
                    None => {
                        state.last_call_at = Some(now);
                        state.window.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            debug!(source, wait_ms = wait.as_millis() as u64, "rate limit wait");
            sleep(wait).await;
        }
    }

    /// Record the outcome of a call made after `acquire`
    pub async fn record(&self, source: &str, outcome: Outcome) {
        let mut sources = self.sources.lock().await;
        let state = match sources.get_mut(source) {
            Some(s) => s,
            None => return,
        };
        match outcome {
            Outcome::Ok => {
                state.consecutive_failures = 0;
            }
            Outcome::RateLimited => {
                state.consecutive_failures += 1;
                let backoff = backoff_secs(state.consecutive_failures);
                state.next_allowed_at = Some(Instant::now() + Duration::from_secs(backoff));
                warn!(
                    source,
                    consecutive_failures = state.consecutive_failures,
                    backoff_secs = backoff,
                    "rate limited, backing off"
                );
            }
            Outcome::OtherError => {
                // Transient upstream failures do not change pacing
            }
        }
    }

    /// Consecutive rate-limited count for a source (0 if unknown)
    pub async fn failure_count(&self, source: &str) -> u32 {
        let sources = self.sources.lock().await;
        sources
            .get(source)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff: `min(2^failures, 300)` seconds
pub fn backoff_secs(failures: u32) -> u64 {
    if failures >= 9 {
        MAX_BACKOFF_SECS
    } else {
        (1u64 << failures).min(MAX_BACKOFF_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(8), 256);
        assert_eq!(backoff_secs(9), 300);
        assert_eq!(backoff_secs(40), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_spacing() {
        let limiter = RateLimiter::new();
        limiter.configure("av", 5, 12_000).await;

        let start = Instant::now();
        limiter.acquire("av").await;
        limiter.acquire("av").await;
        assert!(start.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_cap() {
        let limiter = RateLimiter::new();
        limiter.configure("burst", 3, 0).await;

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("burst").await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        // Fourth call must wait for the window to roll over
        limiter.acquire("burst").await;
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_rate_limits_push_fourth_call_out() {
        let limiter = RateLimiter::new();
        limiter.configure("av", 5, 12_000).await;

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("av").await;
            limiter.record("av", Outcome::RateLimited).await;
        }
        // After three consecutive 429s the horizon is 24s + min(2^3, 300)
        limiter.acquire("av").await;
        assert!(start.elapsed() >= Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let limiter = RateLimiter::new();
        limiter.configure("src", 60, 0).await;

        limiter.acquire("src").await;
        limiter.record("src", Outcome::RateLimited).await;
        limiter.record("src", Outcome::RateLimited).await;
        assert_eq!(limiter.failure_count("src").await, 2);

        limiter.acquire("src").await;
        limiter.record("src", Outcome::Ok).await;
        assert_eq!(limiter.failure_count("src").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_leaves_backoff_untouched() {
        let limiter = RateLimiter::new();
        limiter.configure("src", 60, 0).await;

        limiter.acquire("src").await;
        limiter.record("src", Outcome::OtherError).await;

        let start = Instant::now();
        limiter.acquire("src").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_per_source() {
        let limiter = RateLimiter::new();
        limiter.configure("a", 60, 0).await;
        limiter.configure("b", 60, 0).await;

        limiter.acquire("a").await;
        limiter.record("a", Outcome::RateLimited).await;

        // Source b is unaffected by a's backoff
        let start = Instant::now();
        limiter.acquire("b").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
