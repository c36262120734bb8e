//! Circuit breaker for external calls.
//!
//! Closed -> Open after `threshold` consecutive failures; Open -> HalfOpen
//! after `half_open_after`; one probe decides whether it closes again.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    half_open_after: Duration,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, half_open_after: Duration) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            half_open_after,
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// once the reset window has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.half_open_after {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            self.state = CircuitState::Closed;
            self.opened_at = None;
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        let tripped = match self.state {
            // A half-open probe failing reopens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.threshold,
            CircuitState::Open => false,
        };
        if tripped {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            warn!(
                circuit = self.name,
                failures = self.consecutive_failures,
                "circuit opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            name: self.name.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}
