//! Half-open probe coordination.
//!
//! A breaker permits one probe at a time, but the fleet can hold many
//! breakers; without a coordinator a mass outage would end in a thundering
//! herd of simultaneous recovery probes. The coordinator adds a global
//! concurrency cap, a per-breaker cooldown after a failed probe, and a
//! small outcome history that yields a recovery-probability estimate for
//! monitoring. Its optional background loop watches breaker transitions
//! and drives a user-supplied probe function whenever a breaker reaches
//! half-open on its own.

use crate::models::error::UpstreamError;
use crate::models::settings::RecoveryConfig;
use crate::services::breaker_registry::BreakerRegistry;
use crate::services::circuit_breaker::{BreakerKey, CircuitState, ExecDecision};
use crate::services::classifier;
use ahash::AHashMap;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Signature of a user-supplied recovery probe. Returns the observed
/// duration on success.
pub type ProbeFn =
    Arc<dyn Fn(BreakerKey) -> BoxFuture<'static, Result<Duration, UpstreamError>> + Send + Sync>;

/// Monitoring view of one breaker's recovery history.
#[derive(Serialize, Debug, Clone)]
pub struct RecoveryEstimate {
    pub key: String,
    pub probes: usize,
    pub success_probability: f64,
    pub in_cooldown: bool,
}

struct RecoveryInner {
    in_flight: AHashMap<String, OwnedSemaphorePermit>,
    cooldown_until: AHashMap<String, Instant>,
    history: AHashMap<String, VecDeque<bool>>,
}

/// Throttles half-open probes across the process.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    semaphore: Arc<Semaphore>,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_probes));
        Self {
            config,
            semaphore,
            inner: Mutex::new(RecoveryInner {
                in_flight: AHashMap::new(),
                cooldown_until: AHashMap::new(),
                history: AHashMap::new(),
            }),
        }
    }

    /// Claims the probe slot for `key`.
    ///
    /// Returns `false` when a probe for this breaker is already running,
    /// the breaker is in post-probe cooldown, or the global concurrency
    /// cap is reached. The caller must pair a `true` return with either
    /// [`RecoveryCoordinator::complete_probe`] or
    /// [`RecoveryCoordinator::cancel_probe`].
    pub fn try_begin_probe(&self, key: &BreakerKey) -> bool {
        let storage_key = key.to_string();
        let mut inner = self.lock();

        if inner.in_flight.contains_key(&storage_key) {
            return false;
        }

        if let Some(until) = inner.cooldown_until.get(&storage_key) {
            if Instant::now() < *until {
                return false;
            }
        }

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                debug!("Probe slot claimed for {}", key);
                inner.in_flight.insert(storage_key, permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Records the probe outcome and releases the slot. A failed probe
    /// puts the breaker into probe cooldown.
    pub fn complete_probe(&self, key: &BreakerKey, success: bool) {
        let storage_key = key.to_string();
        let mut inner = self.lock();
        inner.in_flight.remove(&storage_key);

        let history = inner.history.entry(storage_key.clone()).or_default();
        history.push_back(success);
        while history.len() > self.config.history_size {
            history.pop_front();
        }

        if success {
            inner.cooldown_until.remove(&storage_key);
        } else {
            inner
                .cooldown_until
                .insert(storage_key, Instant::now() + self.config.probe_cooldown());
        }
    }

    /// Releases the slot without recording an outcome.
    pub fn cancel_probe(&self, key: &BreakerKey) {
        self.lock().in_flight.remove(&key.to_string());
    }

    /// Estimated probability that the next probe of `key` succeeds, from
    /// recorded history. Unknown breakers estimate 0.5.
    pub fn recovery_probability(&self, key: &BreakerKey) -> f64 {
        let inner = self.lock();
        match inner.history.get(&key.to_string()) {
            Some(history) if !history.is_empty() => {
                history.iter().filter(|ok| **ok).count() as f64 / history.len() as f64
            }
            _ => 0.5,
        }
    }

    /// Monitoring snapshot for every breaker with probe history.
    pub fn estimates(&self) -> Vec<RecoveryEstimate> {
        let inner = self.lock();
        let now = Instant::now();
        let mut estimates: Vec<RecoveryEstimate> = inner
            .history
            .iter()
            .map(|(key, history)| RecoveryEstimate {
                key: key.clone(),
                probes: history.len(),
                success_probability: if history.is_empty() {
                    0.5
                } else {
                    history.iter().filter(|ok| **ok).count() as f64 / history.len() as f64
                },
                in_cooldown: inner
                    .cooldown_until
                    .get(key)
                    .is_some_and(|until| now < *until),
            })
            .collect();
        estimates.sort_by(|a, b| a.key.cmp(&b.key));
        estimates
    }

    /// Spawns the probe loop. Two triggers feed it: breaker transitions
    /// to half-open, and a periodic scan that catches breakers whose open
    /// timeout elapsed while no traffic arrived to probe them. Each probe
    /// runs `probe_fn` (subject to throttling) and feeds the outcome back
    /// into the breaker.
    pub fn start(
        self: &Arc<Self>,
        registry: Arc<BreakerRegistry>,
        probe_fn: ProbeFn,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let scan_interval = self.config.scan_interval();
        tokio::spawn(async move {
            let mut events = registry.subscribe();
            let mut scan = tokio::time::interval(scan_interval);
            scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            scan.tick().await;

            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) if event.to == CircuitState::HalfOpen => {
                                coordinator.maybe_probe(&registry, &event.key, &probe_fn);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Probe loop lagged, skipped {} transitions", skipped);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = scan.tick() => {
                        for breaker in registry.all() {
                            if breaker.state() != CircuitState::Closed && breaker.would_permit() {
                                let key = breaker.key().clone();
                                coordinator.maybe_probe(&registry, &key, &probe_fn);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Launches one probe for `key` when the throttle and the breaker
    /// both allow it.
    fn maybe_probe(self: &Arc<Self>, registry: &Arc<BreakerRegistry>, key: &BreakerKey, probe_fn: &ProbeFn) {
        let Some(breaker) = registry.get(key) else {
            return;
        };

        if !self.try_begin_probe(key) {
            return;
        }

        // The slot inside the breaker may already be held by the request
        // that triggered the transition; that live request is the probe.
        if breaker.can_execute() != ExecDecision::Probe {
            self.cancel_probe(key);
            return;
        }

        let coordinator = Arc::clone(self);
        let probe_fn = Arc::clone(probe_fn);
        let key = key.clone();
        tokio::spawn(async move {
            info!("Running recovery probe for {}", key);
            match probe_fn(key.clone()).await {
                Ok(duration) => {
                    breaker.record_success(duration);
                    coordinator.complete_probe(&key, true);
                }
                Err(error) => {
                    breaker.record_failure(classifier::classify(&error));
                    coordinator.complete_probe(&key, false);
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecoveryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> BreakerKey {
        BreakerKey::Server(name.to_string())
    }

    #[test]
    fn one_probe_per_breaker() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig::default());

        assert!(coordinator.try_begin_probe(&key("s1")));
        assert!(!coordinator.try_begin_probe(&key("s1")));

        coordinator.complete_probe(&key("s1"), true);
        assert!(coordinator.try_begin_probe(&key("s1")));
    }

    #[test]
    fn global_cap_limits_concurrent_probes() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig {
            max_concurrent_probes: 2,
            ..RecoveryConfig::default()
        });

        assert!(coordinator.try_begin_probe(&key("s1")));
        assert!(coordinator.try_begin_probe(&key("s2")));
        assert!(!coordinator.try_begin_probe(&key("s3")));

        coordinator.complete_probe(&key("s1"), true);
        assert!(coordinator.try_begin_probe(&key("s3")));
    }

    #[test]
    fn failed_probe_starts_a_cooldown() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig {
            probe_cooldown_ms: 10_000,
            ..RecoveryConfig::default()
        });

        assert!(coordinator.try_begin_probe(&key("s1")));
        coordinator.complete_probe(&key("s1"), false);

        assert!(!coordinator.try_begin_probe(&key("s1")));
        // Other breakers are unaffected.
        assert!(coordinator.try_begin_probe(&key("s2")));
    }

    #[test]
    fn probability_follows_history() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig {
            probe_cooldown_ms: 0,
            ..RecoveryConfig::default()
        });

        assert_eq!(coordinator.recovery_probability(&key("s1")), 0.5);

        for success in [true, true, false, true] {
            assert!(coordinator.try_begin_probe(&key("s1")));
            coordinator.complete_probe(&key("s1"), success);
        }

        assert_eq!(coordinator.recovery_probability(&key("s1")), 0.75);
    }

    #[test]
    fn cancel_releases_without_recording() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig::default());

        assert!(coordinator.try_begin_probe(&key("s1")));
        coordinator.cancel_probe(&key("s1"));

        assert!(coordinator.try_begin_probe(&key("s1")));
        assert_eq!(coordinator.recovery_probability(&key("s1")), 0.5);
    }
}
