//! Fixed-window rate limit counter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// A rate limit window that counts requests for one `(tier, key)` bucket.
///
/// Windows live inside the limiter's sharded map, so mutation goes through
/// `&mut self` under the shard lock rather than through atomics.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    /// When the current window started
    window_start: Instant,
    /// Requests counted in the current window
    count: u64,
    /// The limit for this window
    limit: u64,
    /// Length of a window
    window: Duration,
}

impl RateLimitWindow {
    /// Create a new window starting at `now`.
    pub fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit,
            window,
        }
    }

    /// Increment the counter and check if the limit has been exceeded.
    ///
    /// Returns `true` if the request is within the limit, `false` if over limit.
    pub fn increment(&mut self, hits: u64, now: Instant) -> bool {
        self.maybe_reset_window(now);

        self.count = self.count.saturating_add(hits);
        self.count <= self.limit
    }

    /// Get the current count.
    pub fn current_count(&self) -> u64 {
        self.count
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// Get the limit for this window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.window.saturating_sub(elapsed)
    }

    /// Whether the window has aged out as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    /// Reset the window if it has expired.
    fn maybe_reset_window(&mut self, now: Instant) {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }
}
