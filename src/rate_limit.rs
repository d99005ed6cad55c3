//! Rate limiting primitives for auth flows.
//!
//! The limiter keeps a true sliding window per key: on each check,
//! timestamps older than the window are pruned, and the attempt is
//! admitted and recorded only while the remaining count is under the
//! limit. Rejected attempts are not recorded. The map is guarded by a
//! mutex so the prune-count-record sequence is atomic for concurrent
//! callers sharing a key.
//!
//! State is per-process. Instances running side by side each hold an
//! independent view; callers needing a cluster-wide limit must put a
//! shared counter store behind the [`RateLimiter`] trait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Flows the limiter distinguishes, each with its own budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    Login,
    Register,
}

impl RateLimitAction {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
        }
    }

    /// Budget for this action: (max attempts, window seconds).
    #[must_use]
    pub fn limits(self) -> (usize, i64) {
        match self {
            Self::Login => (5, 300),
            Self::Register => (3, 3600),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision;
}

/// Limiter that admits everything. Useful in tests and trusted setups.
#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _key: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// In-process sliding-window limiter keyed by caller-supplied strings
/// (typically the client network address).
pub struct SlidingWindowLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit and record the attempt if fewer than `max_requests`
    /// attempts for `key` fall inside the trailing window.
    pub fn is_allowed(&self, key: &str, max_requests: usize, window_seconds: i64) -> bool {
        let now = self.clock.now_unix();
        let window_start = now - window_seconds;

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panic mid-update; failing closed
            // here would lock every caller out, so take the map as-is.
            Err(poisoned) => poisoned.into_inner(),
        };

        let attempts = windows.entry(key.to_string()).or_default();
        while attempts.front().is_some_and(|&t| t <= window_start) {
            attempts.pop_front();
        }

        if attempts.len() < max_requests {
            attempts.push_back(now);
            true
        } else {
            false
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision {
        let (max_requests, window_seconds) = action.limits();
        let scoped = format!("{}:{key}", action.as_str());
        if self.is_allowed(&scoped, max_requests, window_seconds) {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter").finish_non_exhaustive()
    }
}
