//! Windowed circuit breaker shared by the model and search clients.
//!
//! The breaker looks at the outcomes of the most recent `window` attempts and
//! opens once `failure_threshold` of them failed. While open, callers are told
//! how long to wait; after the cooldown one trial call is let through (half-open)
//! and its outcome closes or reopens the circuit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are paused until the cooldown elapses.
    Open { since: Instant },
    /// One trial call is allowed.
    HalfOpen,
}

/// A circuit breaker over a sliding window of attempt outcomes.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    window: usize,
    failure_threshold: usize,
    cooldown: Duration,
}

/// Handle shared between every client that talks to an upstream service.
pub type SharedBreaker = Arc<Mutex<CircuitBreaker>>;

impl CircuitBreaker {
    pub fn new(window: usize, failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::with_capacity(window),
            window: window.max(1),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn shared(window: usize, failure_threshold: usize, cooldown: Duration) -> SharedBreaker {
        Arc::new(Mutex::new(Self::new(window, failure_threshold, cooldown)))
    }

    /// `None` when a call may proceed, otherwise the remaining cooldown.
    pub fn wait_time(&mut self) -> Option<Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => None,
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cooldown {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    None
                } else {
                    Some(self.cooldown - elapsed)
                }
            }
        }
    }

    /// Whether a call is currently permitted.
    pub fn is_call_permitted(&mut self) -> bool {
        self.wait_time().is_none()
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            debug!("Circuit breaker closing after successful trial call");
            self.outcomes.clear();
        }
        self.state = CircuitState::Closed;
        self.push(true);
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        if self.state == CircuitState::HalfOpen {
            warn!("Circuit breaker trial call failed, reopening");
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
            return;
        }
        self.push(false);
        let failures = self.failures();
        if failures >= self.failure_threshold {
            warn!(
                failures,
                window = self.window,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures among the attempts currently in the window.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|ok| !**ok).count()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }
}
