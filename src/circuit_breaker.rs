//! Per-endpoint circuit breaker state machine (§4.3).
//!
//! Grounded in the teacher's `BackoffConfig::cooldown_for` in
//! `provider_health.rs`, which escalates cooldown duration by trip count up
//! to a capped multiplier. This module generalizes that shape into a full
//! closed/open/half-open machine with the spec's three trip conditions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub min_requests_threshold: u32,
    pub error_threshold_percentage: f64,
    pub monitoring_window: Duration,
    pub reset_timeout: Duration,
    pub timeout_multiplier: u32,
    pub base_timeout: Duration,
    pub max_backoff_multiplier: u32,
    /// Window after which `trip_count` decays back towards zero even without
    /// a successful half-open probe (§4.3: "decays only via a configurable
    /// window").
    pub trip_count_decay_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_threshold: 10,
            error_threshold_percentage: 50.0,
            monitoring_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            timeout_multiplier: 5,
            base_timeout: Duration::from_secs(300),
            max_backoff_multiplier: 4,
            trip_count_decay_window: Duration::from_secs(3600),
        }
    }
}

/// Outcome of one attempt, as classified by the adapter (§4.2, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

impl Outcome {
    fn is_immediate_failure(&self) -> bool {
        matches!(self, Outcome::Failure(ErrorKind::ImmediateFailure))
    }

    fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub reason: &'static str,
    pub at: Instant,
}

/// A single endpoint's breaker. Counter mutations happen under the owning
/// manager's per-endpoint mutex (§4.3 "Counter mutations occur under a
/// per-endpoint mutex") — this type itself is not internally synchronized;
/// `EndpointHealthManager` wraps it in a `tokio::sync::Mutex`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: State,
    consecutive_failures: u32,
    window: VecDeque<(Instant, bool)>,
    next_attempt_at: Option<Instant>,
    trip_count: u32,
    last_trip_was_immediate: bool,
    last_trip_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: State::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            next_attempt_at: None,
            trip_count: 0,
            last_trip_was_immediate: false,
            last_trip_at: None,
            half_open_probe_in_flight: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// `isAvailable`: `state != open` OR `now >= nextAttemptAt` (§4.4). On
    /// the boundary crossing this transitions `open -> half-open` and admits
    /// exactly one probe at a time.
    pub fn is_available(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::HalfOpen => !self.half_open_probe_in_flight,
            State::Open => {
                if self.next_attempt_at.is_some_and(|at| now >= at) {
                    self.transition(State::HalfOpen, "reset-timeout-elapsed", now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Call before starting an operation; marks the half-open slot consumed.
    pub fn begin_attempt(&mut self) {
        if self.state == State::HalfOpen {
            self.half_open_probe_in_flight = true;
        }
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) -> Option<Transition> {
        self.decay_trip_count_if_due(now);
        self.window.push_back((now, outcome.is_failure()));
        self.evict_stale(now);

        if self.state == State::HalfOpen {
            self.half_open_probe_in_flight = false;
            return if outcome == Outcome::Success {
                self.consecutive_failures = 0;
                if !self.last_trip_was_immediate {
                    self.trip_count = 0;
                }
                Some(self.transition(State::Closed, "half-open-probe-succeeded", now))
            } else {
                Some(self.trip(outcome, now))
            };
        }

        match outcome {
            Outcome::Success => {
                self.consecutive_failures = 0;
                None
            }
            Outcome::Failure(_) => {
                self.consecutive_failures += 1;
                if outcome.is_immediate_failure() {
                    return Some(self.trip(outcome, now));
                }
                if self.consecutive_failures >= self.config.failure_threshold {
                    return Some(self.trip(outcome, now));
                }
                let windowed_total = self.window.len() as u32;
                let windowed_failures = self.window.iter().filter(|(_, f)| *f).count() as u32;
                if windowed_total >= self.config.min_requests_threshold {
                    let rate = (windowed_failures as f64 / windowed_total as f64) * 100.0;
                    if rate >= self.config.error_threshold_percentage {
                        return Some(self.trip(outcome, now));
                    }
                }
                None
            }
        }
    }

    fn trip(&mut self, outcome: Outcome, now: Instant) -> Transition {
        let immediate = outcome.is_immediate_failure();
        self.trip_count += 1;
        self.last_trip_was_immediate = immediate;
        self.last_trip_at = Some(now);

        let delay = if immediate {
            let base = (self.config.reset_timeout * self.config.timeout_multiplier)
                .max(self.config.base_timeout);
            let pre_increment_trip_count = self.trip_count - 1;
            let exp = 2u32.saturating_pow(pre_increment_trip_count.min(self.config.max_backoff_multiplier));
            base * exp
        } else {
            self.config.reset_timeout
        };
        self.next_attempt_at = Some(now + delay);

        let reason = if immediate {
            "immediate-failure-trip"
        } else if self.consecutive_failures >= self.config.failure_threshold {
            "consecutive-failure-trip"
        } else {
            "windowed-rate-trip"
        };

        warn!(
            trip_count = self.trip_count,
            consecutive_failures = self.consecutive_failures,
            reason,
            delay_ms = delay.as_millis() as u64,
            "circuit breaker tripped"
        );

        self.transition(State::Open, reason, now)
    }

    fn transition(&mut self, to: State, reason: &'static str, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to, reason, at: now }
    }

    fn evict_stale(&mut self, now: Instant) {
        let window = self.config.monitoring_window;
        while let Some((ts, _)) = self.window.front() {
            if now.saturating_duration_since(*ts) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn decay_trip_count_if_due(&mut self, now: Instant) {
        if let Some(last_trip) = self.last_trip_at {
            if now.saturating_duration_since(last_trip) >= self.config.trip_count_decay_window {
                self.trip_count = 0;
                self.last_trip_was_immediate = false;
                self.last_trip_at = None;
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.window.clear();
        self.next_attempt_at = None;
        self.trip_count = 0;
        self.last_trip_was_immediate = false;
        self.last_trip_at = None;
        self.half_open_probe_in_flight = false;
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub fn trip_count(&self) -> u32 {
        self.trip_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            min_requests_threshold: 4,
            error_threshold_percentage: 50.0,
            monitoring_window: Duration::from_secs(60),
            reset_timeout: Duration::from_millis(100),
            timeout_multiplier: 5,
            base_timeout: Duration::from_millis(200),
            max_backoff_multiplier: 4,
            trip_count_decay_window: Duration::from_secs(3600),
        }
    }

    #[test]
    fn consecutive_failures_trip_the_breaker() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        for _ in 0..2 {
            assert!(cb.record(Outcome::Failure(ErrorKind::Transient), now).is_none());
        }
        let t = cb.record(Outcome::Failure(ErrorKind::Transient), now).unwrap();
        assert_eq!(t.to, State::Open);
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn immediate_failure_trips_regardless_of_threshold() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        let t = cb
            .record(Outcome::Failure(ErrorKind::ImmediateFailure), now)
            .unwrap();
        assert_eq!(t.reason, "immediate-failure-trip");
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn windowed_rate_trip_fires_on_ratio() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        assert!(cb.record(Outcome::Success, now).is_none());
        assert!(cb.record(Outcome::Failure(ErrorKind::Transient), now).is_none());
        assert!(cb.record(Outcome::Success, now).is_none());
        let t = cb.record(Outcome::Failure(ErrorKind::Transient), now).unwrap();
        assert_eq!(t.reason, "windowed-rate-trip");
    }

    #[test]
    fn half_open_admits_single_probe_then_closes_on_success() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        cb.record(Outcome::Failure(ErrorKind::ImmediateFailure), now);
        assert_eq!(cb.state(), State::Open);

        let later = now + Duration::from_secs(3600);
        assert!(cb.is_available(later));
        assert_eq!(cb.state(), State::HalfOpen);
        cb.begin_attempt();
        assert!(!cb.is_available(later));

        let t = cb.record(Outcome::Success, later).unwrap();
        assert_eq!(t.to, State::Closed);
    }

    #[test]
    fn half_open_failure_escalates_backoff() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        cb.record(Outcome::Failure(ErrorKind::ImmediateFailure), now);
        let first_delay = cb.next_attempt_at().unwrap() - now;

        let later = now + first_delay + Duration::from_millis(1);
        cb.is_available(later);
        cb.begin_attempt();
        cb.record(Outcome::Failure(ErrorKind::ImmediateFailure), later);

        let second_delay = cb.next_attempt_at().unwrap() - later;
        // §4.3: exponent is `2^min(tripCount, maxBackoffMultiplier)` using the
        // *pre*-increment trip count, so each successive trip exactly doubles
        // the prior delay (S6: 300_000 / 600_000 / 1_200_000ms).
        assert_eq!(second_delay, first_delay * 2);
        assert_eq!(cb.trip_count(), 2);
    }

    #[test]
    fn stale_window_entries_are_evicted() {
        let mut cb = CircuitBreaker::new(cfg());
        let now = Instant::now();
        cb.record(Outcome::Failure(ErrorKind::Transient), now);
        let later = now + Duration::from_secs(120);
        cb.record(Outcome::Success, later);
        assert_eq!(cb.window.len(), 1);
    }
}
