// Fleet-wide circuit breaker guarding every dispatch decision

//! # Circuit Breaker
//!
//! One shared health gate for the whole fleet. Every dispatch decision asks
//! the breaker for a permit; every run outcome feeds a success or failure
//! signal back. When failures inside the sliding window cross the configured
//! threshold the breaker opens and *all* workflow dispatch is suppressed -
//! the business intent is "stop everything when things are clearly broken",
//! which is why this is a single process-wide breaker and not per-workflow.
//!
//! State machine:
//! - `Closed` -> `Open` when windowed failures reach the threshold
//! - `Open` -> `HalfOpen` after the cooldown elapses
//! - `HalfOpen` -> `Closed` on one successful probe (window resets)
//! - `HalfOpen` -> `Open` on any probe failure (cooldown restarts)
//!
//! While half-open, exactly one probe dispatch is allowed; all other permits
//! are refused until the probe resolves.
//!
//! The state lives behind a `std::sync::Mutex`: the critical sections are a
//! few comparisons and a VecDeque push, and nothing awaits while holding the
//! lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip the breaker
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted
    pub window: Duration,
    /// How long the breaker stays open before probing
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(120),
        }
    }
}

/// Read-only view of the breaker for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
    pub last_transition_at: DateTime<Utc>,
}

struct BreakerInner {
    state: BreakerState,
    /// Timestamps of recent failures, oldest first
    failures: VecDeque<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
    /// Set while the single half-open probe is in flight
    probe_in_flight: bool,
}

/// Process-wide circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                last_transition_at: Utc::now(),
                probe_in_flight: false,
            }),
        }
    }

    /// Rebuild the failure window from persisted run history on startup.
    pub fn seed(&self, failure_times: impl IntoIterator<Item = DateTime<Utc>>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Utc::now();
        for at in failure_times {
            inner.failures.push_back(at);
        }
        inner
            .failures
            .make_contiguous()
            .sort();
        Self::evict_expired(&self.config, &mut inner, now);
        if inner.failures.len() >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            inner.last_transition_at = now;
            warn!(
                failures = inner.failures.len(),
                "circuit breaker opened from persisted failure history"
            );
        }
    }

    /// Ask for a dispatch permit.
    ///
    /// Returns `Ok(true)` when this dispatch is the half-open probe,
    /// `Ok(false)` for a normal closed-state dispatch, and `Err(())` when
    /// dispatch is refused. The caller converts refusal into
    /// `OrchestratorError::CircuitOpen` without creating a run.
    pub fn try_acquire(&self) -> std::result::Result<bool, ()> {
        self.try_acquire_at(Utc::now())
    }

    fn try_acquire_at(&self, now: DateTime<Utc>) -> std::result::Result<bool, ()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::evict_expired(&self.config, &mut inner, now);

        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let cooldown =
                    chrono::Duration::from_std(self.config.cooldown).unwrap_or_else(|_| {
                        chrono::Duration::seconds(i64::MAX / 1_000)
                    });
                if now - inner.last_transition_at >= cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition_at = now;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open; allowing one probe dispatch");
                    Ok(true)
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Feed a successful run outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.last_transition_at = Utc::now();
            inner.probe_in_flight = false;
            inner.failures.clear();
            info!("circuit breaker closed after successful probe");
        }
    }

    /// Feed a failed run outcome.
    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_transition_at = now;
                inner.probe_in_flight = false;
                warn!("circuit breaker probe failed; reopening");
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                Self::evict_expired(&self.config, &mut inner, now);
                if inner.failures.len() >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_transition_at = now;
                    warn!(
                        failures = inner.failures.len(),
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened; suppressing all dispatch"
                    );
                }
            }
            // Failures reported while open (stragglers from in-flight runs)
            // still land in the window.
            BreakerState::Open => {
                inner.failures.push_back(now);
            }
        }
    }

    /// Current state for the status surface.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        Self::evict_expired(&self.config, &mut inner, Utc::now());
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failures.len(),
            last_transition_at: inner.last_transition_at,
        }
    }

    fn evict_expired(config: &CircuitBreakerConfig, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let cutoff = now - window;
        while inner
            .failures
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            inner.failures.pop_front();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: usize, window_secs: u64, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(window_secs),
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    #[test]
    fn test_trips_at_threshold() {
        let breaker = breaker(3, 300, 60);
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        // Fleet-wide refusal
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = breaker(1, 300, 60);
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        // Cooldown elapsed: exactly one probe permitted.
        let after_cooldown = Utc::now() + chrono::Duration::seconds(61);
        let probe = breaker.try_acquire_at(after_cooldown);
        assert_eq!(probe, Ok(true));
        assert!(breaker.try_acquire_at(after_cooldown).is_err());

        breaker.record_success();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = breaker(1, 300, 60);
        breaker.record_failure();

        let after_cooldown = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(breaker.try_acquire_at(after_cooldown), Ok(true));

        breaker.record_failure_at(after_cooldown);
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        // Cooldown restarted from the probe failure; still refused shortly
        // after.
        assert!(breaker
            .try_acquire_at(after_cooldown + chrono::Duration::seconds(1))
            .is_err());
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let breaker = breaker(3, 60, 60);
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        breaker.record_failure_at(long_ago);
        breaker.record_failure_at(long_ago);
        breaker.record_failure();
        // Only one failure inside the window; still closed.
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 1);
    }

    #[test]
    fn test_seed_from_history_can_open() {
        let breaker = breaker(2, 300, 60);
        let now = Utc::now();
        breaker.seed(vec![now - chrono::Duration::seconds(10), now]);
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[test]
    fn test_success_in_closed_state_is_noop() {
        let breaker = breaker(2, 300, 60);
        breaker.record_failure();
        breaker.record_success();
        // Closed-state successes do not clear the window.
        assert_eq!(breaker.snapshot().failure_count, 1);
    }
}
