use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

/// Sliding-window request counter keyed by client address.
#[derive(Debug, Clone)]
pub struct IpRateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl IpRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_requests: max_requests.max(1),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut guard = self.inner.lock();
        let queue = guard.entry(key.to_string()).or_default();

        while queue
            .front()
            .is_some_and(|front| now.duration_since(*front) >= self.window)
        {
            queue.pop_front();
        }

        if queue.len() >= self.max_requests {
            let oldest = queue.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited { retry_after };
        }

        queue.push_back(now);
        RateDecision::Allowed
    }

    /// Drops keys with no requests inside the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.inner.lock().retain(|_, queue| {
            queue
                .back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
    }
}
