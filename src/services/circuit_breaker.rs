//! Adaptive circuit breaker for upstream protection.
//!
//! Each breaker guards either a whole server or a single (server, model)
//! pair. Unlike a fixed-threshold breaker, the failure threshold slides
//! with the observed error mix: a run of transient network errors trips
//! the breaker later than a burst of non-retryable or server errors. An
//! error-rate window provides a second trip condition once enough
//! outcomes accumulate.
//!
//! State transitions follow the classic closed, open, half-open cycle.
//! Recovery admits exactly one probe at a time; every failed probe
//! multiplies the open timeout, every run of successful probes closes the
//! breaker and resets its thresholds.

use crate::models::error::ErrorClass;
use crate::models::settings::BreakerConfig;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Identity of a circuit breaker.
///
/// Server-level breakers gate every request to a backend; model-level
/// breakers isolate a single (server, model) pair. The router consults the
/// model-level breaker first, then the server-level one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakerKey {
    Server(String),
    ServerModel(String, String),
}

impl BreakerKey {
    pub fn server(&self) -> &str {
        match self {
            BreakerKey::Server(s) => s,
            BreakerKey::ServerModel(s, _) => s,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            BreakerKey::Server(_) => None,
            BreakerKey::ServerModel(_, m) => Some(m),
        }
    }

    /// Parses a persisted key. Server ids must not contain a colon; the
    /// first colon separates the server from the (possibly tagged) model.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((server, model)) => {
                BreakerKey::ServerModel(server.to_string(), model.to_string())
            }
            None => BreakerKey::Server(raw.to_string()),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerKey::Server(s) => write!(f, "{}", s),
            BreakerKey::ServerModel(s, m) => write!(f, "{}:{}", s, m),
        }
    }
}

/// State of a circuit breaker.
///
/// * `Closed` - Normal operation, requests pass through
/// * `Open` - Circuit tripped, requests fail fast without executing
/// * `HalfOpen` - Testing recovery, a single probe allowed through
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of an execution gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecDecision {
    /// Breaker is closed, proceed normally.
    Allow,
    /// Breaker is half-open and this caller holds the single probe slot.
    /// The next `record_success` or `record_failure` releases it.
    Probe,
    /// Execution denied. `retry_after` is zero when another probe is
    /// already in flight.
    Denied { retry_after: Duration },
}

impl ExecDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, ExecDecision::Denied { .. })
    }
}

/// One recorded state transition, bounded per breaker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Unix milliseconds.
    pub at_ms: u64,
    pub reason: String,
}

/// Transition event published through the breaker registry.
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    pub key: BreakerKey,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
}

/// Point-in-time view of a breaker, for stats endpoints and tests.
#[derive(Serialize, Debug, Clone)]
pub struct BreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_successes: u32,
    pub transient_errors: u32,
    pub non_retryable_errors: u32,
    pub adaptive_threshold: f64,
    pub open_timeout_ms: u64,
    pub probe_in_flight: bool,
    pub transitions: Vec<TransitionRecord>,
}

/// Persisted breaker state.
///
/// Instants do not survive a restart, so open breakers store the time
/// remaining until their next probe instead of an absolute deadline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_successes: u32,
    pub transient_errors: u32,
    pub non_retryable_errors: u32,
    pub adaptive_threshold: f64,
    pub open_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_open_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_ms: Option<u64>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    consecutive_successes: u32,
    transient_errors: u32,
    non_retryable_errors: u32,
    adaptive_threshold: f64,
    open_timeout: Duration,
    custom_open_timeout: Option<Duration>,
    next_attempt_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_failure_ms: Option<u64>,
    last_success_ms: Option<u64>,
    probe_in_flight: bool,
    outcomes: VecDeque<(Instant, bool)>,
    transitions: VecDeque<TransitionRecord>,
}

/// Circuit breaker with adaptive thresholds.
///
/// All `record_*` operations on one breaker are serialized behind an
/// internal mutex, so observed transitions form a total order.
///
/// # Examples
///
/// ```rust
/// use corral::models::error::ErrorClass;
/// use corral::models::settings::BreakerConfig;
/// use corral::services::circuit_breaker::{BreakerKey, CircuitBreaker, CircuitState};
///
/// let breaker = CircuitBreaker::new(
///     BreakerKey::Server("gpu-01".to_string()),
///     BreakerConfig::default(),
///     None,
/// );
///
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// breaker.record_failure(ErrorClass::Retryable);
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<broadcast::Sender<BreakerTransition>>,
}

impl CircuitBreaker {
    pub fn new(
        key: BreakerKey,
        config: BreakerConfig,
        events: Option<broadcast::Sender<BreakerTransition>>,
    ) -> Self {
        let inner = BreakerInner {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_successes: 0,
            transient_errors: 0,
            non_retryable_errors: 0,
            adaptive_threshold: config.failure_threshold as f64,
            open_timeout: config.open_timeout(),
            custom_open_timeout: None,
            next_attempt_at: None,
            last_failure_at: None,
            last_failure_ms: None,
            last_success_ms: None,
            probe_in_flight: false,
            outcomes: VecDeque::new(),
            transitions: VecDeque::new(),
        };

        Self {
            key,
            config,
            inner: Mutex::new(inner),
            events,
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// Gates an execution attempt.
    ///
    /// A closed breaker always allows. An open breaker allows exactly one
    /// probe once its timeout has elapsed, transitioning to half-open; the
    /// probe slot is released by the next recorded outcome.
    pub fn can_execute(&self) -> ExecDecision {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => ExecDecision::Allow,
            CircuitState::Open => match inner.next_attempt_at {
                Some(at) if now >= at => {
                    self.transition(&mut inner, CircuitState::HalfOpen, "open timeout elapsed");
                    inner.probe_in_flight = true;
                    ExecDecision::Probe
                }
                Some(at) => ExecDecision::Denied {
                    retry_after: at.duration_since(now),
                },
                // Open without a deadline only happens on a forced open.
                None => ExecDecision::Denied {
                    retry_after: inner.open_timeout,
                },
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    ExecDecision::Denied {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    inner.probe_in_flight = true;
                    ExecDecision::Probe
                }
            }
        }
    }

    /// Non-mutating peek at whether [`CircuitBreaker::can_execute`] would
    /// currently allow an attempt. Candidate filtering uses this so an
    /// open breaker whose timeout elapsed stays rankable for its probe.
    pub fn would_permit(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .next_attempt_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Releases a probe slot granted by [`CircuitBreaker::can_execute`]
    /// without recording an outcome. Used when the probe could not be
    /// scheduled at all.
    pub fn abandon_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    /// Records a successful execution.
    pub fn record_success(&self, duration: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();

        inner.probe_in_flight = false;
        inner.success_count = inner.success_count.saturating_add(1);
        inner.last_success_ms = Some(unix_ms());
        Self::push_outcome(&mut inner, &self.config, now, true);

        debug!("Breaker {} success in {}ms", self.key, duration.as_millis());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.transient_errors = 0;
                inner.non_retryable_errors = 0;
                inner.adaptive_threshold = self.recompute_threshold(&inner);
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.recovery_success_threshold {
                    inner.failure_count = 0;
                    inner.transient_errors = 0;
                    inner.non_retryable_errors = 0;
                    inner.adaptive_threshold = self.config.failure_threshold as f64;
                    inner.open_timeout = self.base_open_timeout(&inner);
                    inner.next_attempt_at = None;
                    self.transition(&mut inner, CircuitState::Closed, "recovered");
                }
            }
            CircuitState::Open => {
                // Reachable through breaker bypass; recorded without a
                // state change.
                debug!("Breaker {} observed a success while open", self.key);
            }
        }
    }

    /// Records a failed execution with its classification.
    pub fn record_failure(&self, class: ErrorClass) {
        let mut inner = self.lock();
        let now = Instant::now();

        inner.probe_in_flight = false;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.consecutive_successes = 0;
        inner.last_failure_at = Some(now);
        inner.last_failure_ms = Some(unix_ms());
        Self::push_outcome(&mut inner, &self.config, now, false);

        match class {
            ErrorClass::Transient => inner.transient_errors += 1,
            ErrorClass::NonRetryable => inner.non_retryable_errors += 1,
            ErrorClass::Retryable | ErrorClass::Unknown => {}
        }

        inner.adaptive_threshold = self.recompute_threshold(&inner);

        match inner.state {
            CircuitState::Closed => {
                let threshold_hit = inner.failure_count as f64 >= inner.adaptive_threshold;
                let rate_hit = self.error_rate_tripped(&mut inner, now);
                if threshold_hit || rate_hit {
                    let reason = if threshold_hit {
                        format!(
                            "{} failures reached adaptive threshold {:.2}",
                            inner.failure_count, inner.adaptive_threshold
                        )
                    } else {
                        "error rate threshold exceeded".to_string()
                    };
                    self.open(&mut inner, now, &reason);
                }
            }
            CircuitState::HalfOpen => {
                let backed_off = inner.open_timeout.mul_f64(self.config.backoff_multiplier);
                inner.open_timeout = backed_off.min(self.config.max_open_timeout());
                let reason = format!(
                    "probe failed ({}), open timeout now {}ms",
                    class.as_str(),
                    inner.open_timeout.as_millis()
                );
                self.open(&mut inner, now, &reason);
            }
            CircuitState::Open => {
                debug!("Breaker {} observed a failure while open", self.key);
            }
        }
    }

    /// Administrative: opens the breaker regardless of counters.
    pub fn force_open(&self, reason: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        if inner.state != CircuitState::Open {
            self.open(&mut inner, now, reason);
        }
    }

    /// Administrative: closes the breaker regardless of state. Health
    /// probes use this for server-level breakers after a successful probe.
    pub fn force_close(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            inner.failure_count = 0;
            inner.transient_errors = 0;
            inner.non_retryable_errors = 0;
            inner.consecutive_successes = 0;
            inner.probe_in_flight = false;
            inner.adaptive_threshold = self.config.failure_threshold as f64;
            inner.open_timeout = self.base_open_timeout(&inner);
            inner.next_attempt_at = None;
            self.transition(&mut inner, CircuitState::Closed, reason);
        }
    }

    /// Administrative: resets all counters and returns to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.consecutive_successes = 0;
        inner.transient_errors = 0;
        inner.non_retryable_errors = 0;
        inner.probe_in_flight = false;
        inner.adaptive_threshold = self.config.failure_threshold as f64;
        inner.open_timeout = self.base_open_timeout(&inner);
        inner.next_attempt_at = None;
        inner.outcomes.clear();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "reset");
        }
    }

    /// Overrides the base open timeout for this breaker.
    pub fn set_open_timeout(&self, timeout: Duration) {
        let mut inner = self.lock();
        inner.custom_open_timeout = Some(timeout);
        if inner.state == CircuitState::Closed {
            inner.open_timeout = timeout;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            key: self.key.to_string(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_successes: inner.consecutive_successes,
            transient_errors: inner.transient_errors,
            non_retryable_errors: inner.non_retryable_errors,
            adaptive_threshold: inner.adaptive_threshold,
            open_timeout_ms: inner.open_timeout.as_millis() as u64,
            probe_in_flight: inner.probe_in_flight,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Serializable state for persistence.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let open_remaining_ms = inner.next_attempt_at.and_then(|at| {
            if inner.state == CircuitState::Open {
                Some(at.saturating_duration_since(now).as_millis() as u64)
            } else {
                None
            }
        });

        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_successes: inner.consecutive_successes,
            transient_errors: inner.transient_errors,
            non_retryable_errors: inner.non_retryable_errors,
            adaptive_threshold: inner.adaptive_threshold,
            open_timeout_ms: inner.open_timeout.as_millis() as u64,
            open_remaining_ms,
            custom_open_timeout_ms: inner
                .custom_open_timeout
                .map(|t| t.as_millis() as u64),
            last_failure_ms: inner.last_failure_ms,
            last_success_ms: inner.last_success_ms,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Restores state from a persisted snapshot.
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = self.lock();
        inner.state = snapshot.state;
        inner.failure_count = snapshot.failure_count;
        inner.success_count = snapshot.success_count;
        inner.consecutive_successes = snapshot.consecutive_successes;
        inner.transient_errors = snapshot.transient_errors;
        inner.non_retryable_errors = snapshot.non_retryable_errors;
        inner.adaptive_threshold = snapshot.adaptive_threshold;
        inner.open_timeout = Duration::from_millis(snapshot.open_timeout_ms);
        inner.custom_open_timeout = snapshot.custom_open_timeout_ms.map(Duration::from_millis);
        inner.last_failure_ms = snapshot.last_failure_ms;
        inner.last_success_ms = snapshot.last_success_ms;
        inner.probe_in_flight = false;
        inner.next_attempt_at = match (snapshot.state, snapshot.open_remaining_ms) {
            (CircuitState::Open, Some(remaining)) => {
                Some(Instant::now() + Duration::from_millis(remaining))
            }
            (CircuitState::Open, None) => Some(Instant::now() + inner.open_timeout),
            _ => None,
        };
        inner.transitions = snapshot.transitions.iter().cloned().collect();
        Self::trim_transitions(&mut inner, &self.config);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned lock means a panic while holding it; the state is
        // still structurally valid, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn base_open_timeout(&self, inner: &BreakerInner) -> Duration {
        inner.custom_open_timeout.unwrap_or_else(|| self.config.open_timeout())
    }

    fn recompute_threshold(&self, inner: &BreakerInner) -> f64 {
        let raw = self.config.failure_threshold as f64
            + self.config.transient_weight * inner.transient_errors as f64
            - self.config.non_retryable_weight * inner.non_retryable_errors as f64;

        raw.clamp(
            self.config.min_failure_threshold as f64,
            self.config.max_failure_threshold as f64,
        )
    }

    fn error_rate_tripped(&self, inner: &mut BreakerInner, now: Instant) -> bool {
        let window = self.config.error_rate_window();
        while let Some((at, _)) = inner.outcomes.front() {
            if now.duration_since(*at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }

        if inner.outcomes.len() < self.config.error_rate_min_samples {
            return false;
        }

        let errors = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
        errors as f64 / inner.outcomes.len() as f64 >= self.config.error_rate_threshold
    }

    fn push_outcome(inner: &mut BreakerInner, config: &BreakerConfig, now: Instant, ok: bool) {
        inner.outcomes.push_back((now, ok));
        // Window pruning happens on the trip check; this bound just keeps
        // an idle breaker from accumulating samples forever.
        let cap = config.error_rate_min_samples.max(100) * 4;
        while inner.outcomes.len() > cap {
            inner.outcomes.pop_front();
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant, reason: &str) {
        inner.next_attempt_at = Some(now + inner.open_timeout);
        inner.consecutive_successes = 0;
        inner.probe_in_flight = false;
        self.transition(inner, CircuitState::Open, reason);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        inner.transitions.push_back(TransitionRecord {
            from,
            to,
            at_ms: unix_ms(),
            reason: reason.to_string(),
        });
        Self::trim_transitions(inner, &self.config);

        match to {
            CircuitState::Open => {
                warn!("Breaker {} opened: {}", self.key, reason);
            }
            CircuitState::HalfOpen => {
                info!("Breaker {} half-open: {}", self.key, reason);
            }
            CircuitState::Closed => {
                info!("Breaker {} closed: {}", self.key, reason);
            }
        }

        if let Some(events) = &self.events {
            let _ = events.send(BreakerTransition {
                key: self.key.clone(),
                from,
                to,
                reason: reason.to_string(),
            });
        }
    }

    fn trim_transitions(inner: &mut BreakerInner, config: &BreakerConfig) {
        while inner.transitions.len() > config.transition_log_size {
            inner.transitions.pop_front();
        }
    }
}

fn unix_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            open_timeout_ms: 20,
            max_open_timeout_ms: 200,
            ..BreakerConfig::default()
        }
    }

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(BreakerKey::Server("s1".to_string()), config, None)
    }

    #[test]
    fn opens_after_consecutive_retryable_failures() {
        let cb = breaker(fast_config());
        for _ in 0..4 {
            cb.record_failure(ErrorClass::Retryable);
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure(ErrorClass::Retryable);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn transient_failures_inflate_the_threshold() {
        let cb = breaker(fast_config());
        for _ in 0..5 {
            cb.record_failure(ErrorClass::Transient);
        }
        // Five transient failures stay under the inflated threshold.
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(ErrorClass::Transient);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let cb = breaker(fast_config());
        for _ in 0..4 {
            cb.record_failure(ErrorClass::Retryable);
        }
        cb.record_success(Duration::from_millis(10));
        assert_eq!(cb.stats().failure_count, 0);
        cb.record_failure(ErrorClass::Retryable);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_denies_until_timeout_then_grants_single_probe() {
        let cb = breaker(fast_config());
        cb.force_open("test");

        assert!(!cb.can_execute().is_allowed());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.can_execute(), ExecDecision::Probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller is denied while the probe is outstanding.
        assert!(!cb.can_execute().is_allowed());
    }

    #[test]
    fn recovery_needs_configured_consecutive_successes() {
        let mut config = fast_config();
        config.recovery_success_threshold = 2;
        let cb = breaker(config);
        cb.force_open("test");
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cb.can_execute(), ExecDecision::Probe);
        cb.record_success(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(cb.can_execute(), ExecDecision::Probe);
        cb.record_success(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_backs_off_the_open_timeout() {
        let cb = breaker(fast_config());
        cb.force_open("test");
        let before = cb.stats().open_timeout_ms;

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.can_execute(), ExecDecision::Probe);
        cb.record_failure(ErrorClass::Transient);

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().open_timeout_ms, before * 2);
    }

    #[test]
    fn backoff_is_capped() {
        let mut config = fast_config();
        config.max_open_timeout_ms = 50;
        let cb = breaker(config);
        cb.force_open("test");

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(60));
            assert_eq!(cb.can_execute(), ExecDecision::Probe);
            cb.record_failure(ErrorClass::Transient);
        }

        assert_eq!(cb.stats().open_timeout_ms, 50);
    }

    #[test]
    fn error_rate_opens_with_enough_samples() {
        let mut config = fast_config();
        config.max_failure_threshold = 100;
        config.failure_threshold = 50;
        config.error_rate_min_samples = 10;
        let cb = breaker(config);

        // Mixed outcomes below the minimum sample count do not trip.
        for _ in 0..4 {
            cb.record_success(Duration::from_millis(5));
            cb.record_failure(ErrorClass::Retryable);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(ErrorClass::Retryable);
        cb.record_failure(ErrorClass::Retryable);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn snapshot_restore_round_trips_logical_state() {
        let cb = breaker(fast_config());
        cb.record_failure(ErrorClass::Transient);
        cb.record_failure(ErrorClass::Retryable);
        cb.force_open("maintenance");

        let snapshot = cb.snapshot();
        let restored = breaker(fast_config());
        restored.restore(&snapshot);

        let a = cb.stats();
        let b = restored.stats();
        assert_eq!(a.state, b.state);
        assert_eq!(a.failure_count, b.failure_count);
        assert_eq!(a.transient_errors, b.transient_errors);
        assert_eq!(a.adaptive_threshold, b.adaptive_threshold);
        assert_eq!(a.open_timeout_ms, b.open_timeout_ms);
    }

    #[test]
    fn parse_key_splits_on_first_colon() {
        assert_eq!(
            BreakerKey::parse("gpu-01:llama3:8b"),
            BreakerKey::ServerModel("gpu-01".to_string(), "llama3:8b".to_string())
        );
        assert_eq!(BreakerKey::parse("gpu-01"), BreakerKey::Server("gpu-01".to_string()));
    }
}
