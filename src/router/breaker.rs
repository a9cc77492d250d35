use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
}

/// Consecutive-failure circuit breaker guarding the remote runner. Opens
/// after `failure_threshold` failures in a row, rejects attempts for
/// `cooldown`, then resumes. Any success closes it immediately.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Returns true if a remote attempt may proceed. An expired open circuit
    /// transitions back to closed here.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    *state = CircuitState::Closed {
                        consecutive_failures: 0,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Records a remote failure. Returns true if this failure opened the
    /// circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    *state = CircuitState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                    true
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    false
                }
            }
            // Already open; the cooldown window is not extended.
            CircuitState::Open { .. } => false,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(
            *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            CircuitState::Closed { .. }
        )
    }
}
