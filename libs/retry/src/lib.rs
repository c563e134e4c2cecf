//! Retry primitives shared by the pool components.
//!
//! - [`Backoff`]: bounded exponential delay between attempts.
//! - [`Deadline`]: an optional wall-clock bound for polling loops.
//! - [`RetryTracker`]: per-key failure budget within a time window.
//!
//! # Invariants
//!
//! - Delays never exceed the configured maximum
//! - An unbounded deadline never expires
//! - A key's budget resets once its window has passed

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Bounded exponential backoff.
///
/// Attempt `n` (1-based) waits `base * 2^(n-1)`, capped at `max`, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]` and capped again.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,

    /// Jitter factor; values outside `[0.0, 1.0]` are clamped when used.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Create a backoff without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Backoff that never waits.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter <= 0.0 || raw.is_zero() {
            return raw;
        }

        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        raw.mul_f64(factor).min(self.max)
    }
}

/// Optional deadline for a wait loop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    /// Start a deadline; `None` never expires.
    pub fn after(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Time since the deadline was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.elapsed()))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Clamp a sleep so it does not overshoot the deadline.
    pub fn clamp(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(left) => wait.min(left),
            None => wait,
        }
    }
}

/// Retry tracker for failing operations, keyed by resource.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if first.elapsed() > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Default delay after the first failed attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default cap on a single backoff delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
