//! Client-side sliding-window rate limiter for upstream requests.
//!
//! Proactively throttles requests to stay within a requests-per-minute budget
//! instead of relying on 429 backpressure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A sliding-window limiter over request timestamps.
#[derive(Debug)]
pub struct RequestRateLimiter {
    /// Requests per minute limit (0 = unlimited).
    rpm: usize,
    requests_window: VecDeque<Instant>,
    window: Duration,
}

impl RequestRateLimiter {
    pub fn new(rpm: usize) -> Self {
        Self {
            rpm,
            requests_window: VecDeque::new(),
            window: Duration::from_secs(60),
        }
    }

    /// Check if a request can proceed now.
    ///
    /// Returns `None` if the request can proceed immediately, or `Some(delay)`
    /// indicating how long to wait before retrying.
    pub fn check(&mut self) -> Option<Duration> {
        if self.rpm == 0 {
            return None;
        }
        let now = Instant::now();
        self.prune(now);

        if self.requests_window.len() >= self.rpm
            && let Some(&oldest) = self.requests_window.front()
        {
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            if !wait.is_zero() {
                return Some(wait);
            }
        }
        None
    }

    /// Record a request that was just issued.
    pub fn record(&mut self) {
        self.requests_window.push_back(Instant::now());
    }

    pub fn has_limits(&self) -> bool {
        self.rpm > 0
    }

    /// Requests counted in the current window.
    pub fn current_usage(&mut self) -> usize {
        self.prune(Instant::now());
        self.requests_window.len()
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.requests_window.front().is_some_and(|t| *t < cutoff) {
            self.requests_window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut limiter = RequestRateLimiter::new(0);
        for _ in 0..100 {
            limiter.record();
        }
        assert!(!limiter.has_limits());
        assert!(limiter.check().is_none());
    }

    #[test]
    fn test_rpm_limit_blocks() {
        let mut limiter = RequestRateLimiter::new(2);
        assert!(limiter.check().is_none());
        limiter.record();
        assert!(limiter.check().is_none());
        limiter.record();
        let wait = limiter.check().expect("third request should wait");
        assert!(wait <= Duration::from_secs(60));
        assert_eq!(limiter.current_usage(), 2);
    }
}
