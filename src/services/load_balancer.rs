//! Metrics-driven backend scoring.
//!
//! Given a model, the balancer filters the fleet down to viable
//! candidates and ranks them by a weighted score over normalized
//! components: p95 latency (lower is better), rolling success rate,
//! available capacity, and a bonus for raw capacity. Latency and
//! success-rate thresholds act as soft penalties rather than hard
//! filters, so a uniformly degraded fleet still produces a ranking
//! instead of an empty candidate list.

use crate::models::backend::{Backend, Capability};
use crate::models::settings::BalancerConfig;
use crate::services::breaker_registry::BreakerRegistry;
use crate::services::circuit_breaker::BreakerKey;
use crate::services::fleet::FleetRegistry;
use crate::services::metrics::MetricsAggregator;
use crate::services::routing::RoutingTable;
use crate::utils::model_tag::resolve_tag;
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// One ranked candidate.
#[derive(Serialize, Debug, Clone)]
pub struct ScoredCandidate {
    pub backend: Backend,
    pub score: f64,
    pub in_flight: u32,
}

/// Ranks backends for a model from live fleet, breaker, and metrics state.
pub struct LoadBalancer {
    fleet: Arc<FleetRegistry>,
    metrics: Arc<MetricsAggregator>,
    breakers: Arc<BreakerRegistry>,
    table: Arc<RoutingTable>,
    config: BalancerConfig,
}

impl LoadBalancer {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        metrics: Arc<MetricsAggregator>,
        breakers: Arc<BreakerRegistry>,
        table: Arc<RoutingTable>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            fleet,
            metrics,
            breakers,
            table,
            config,
        }
    }

    /// Candidates for `model`, best first.
    ///
    /// A backend qualifies when it advertises the model (after tag
    /// resolution), is available, matches the required capability, is not
    /// cooling down or banned for this model, has neither breaker open,
    /// and has spare concurrency. Ties break toward fewer in-flight
    /// requests, then lexicographic id.
    pub fn rank(&self, model: &str, capability: Capability) -> Vec<ScoredCandidate> {
        let resolved = resolve_tag(model);
        let mut viable: Vec<(Backend, u32)> = Vec::new();

        for backend in self.fleet.list() {
            if !backend.advertises(&resolved)
                || !backend.is_available()
                || !backend.capabilities.supports(capability)
            {
                continue;
            }

            if self.table.is_banned(&backend.id, &resolved)
                || self.table.cooldown_remaining(&backend.id, &resolved).is_some()
            {
                continue;
            }

            if self.breakers.is_blocking(&BreakerKey::Server(backend.id.clone()))
                || self.breakers.is_blocking(&BreakerKey::ServerModel(
                    backend.id.clone(),
                    resolved.clone(),
                ))
            {
                continue;
            }

            let in_flight = self.table.in_flight(&backend.id, &resolved);
            if in_flight >= backend.max_concurrency {
                continue;
            }

            viable.push((backend, in_flight));
        }

        let max_capacity = viable
            .iter()
            .map(|(b, _)| b.max_concurrency)
            .max()
            .unwrap_or(1) as f64;

        let mut candidates: Vec<ScoredCandidate> = viable
            .into_iter()
            .map(|(backend, in_flight)| {
                let score = self.score(&backend, &resolved, in_flight, max_capacity);
                ScoredCandidate {
                    backend,
                    score,
                    in_flight,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.in_flight.cmp(&b.in_flight))
                .then_with(|| a.backend.id.cmp(&b.backend.id))
        });

        debug!(
            "Ranked {} candidates for {}: {:?}",
            candidates.len(),
            resolved,
            candidates
                .iter()
                .map(|c| (c.backend.id.as_str(), c.score))
                .collect::<Vec<_>>()
        );

        candidates
    }

    /// Best candidate for `model`, if any.
    pub fn best(&self, model: &str, capability: Capability) -> Option<Backend> {
        self.rank(model, capability)
            .into_iter()
            .next()
            .map(|c| c.backend)
    }

    fn score(&self, backend: &Backend, model: &str, in_flight: u32, max_capacity: f64) -> f64 {
        // Unobserved pairs score as fast and fully successful, which gives
        // fresh backends a chance to accumulate real data.
        let (p95_ms, success_rate) = self
            .metrics
            .get(&backend.id, model)
            .map(|view| (view.p95_ms, view.success_rate))
            .unwrap_or((0.0, 1.0));

        let latency_score =
            self.config.p95_threshold_ms / (self.config.p95_threshold_ms + p95_ms);
        let capacity_score = 1.0 - in_flight as f64 / backend.max_concurrency as f64;
        let capacity_bonus = backend.max_concurrency as f64 / max_capacity;

        let mut score = self.config.latency_weight * latency_score
            + self.config.success_weight * success_rate
            + self.config.capacity_weight * capacity_score
            + self.config.capacity_bonus_weight * capacity_bonus;

        if p95_ms > self.config.p95_threshold_ms {
            score *= self.config.soft_penalty;
        }
        if success_rate < self.config.min_success_rate {
            score *= self.config.soft_penalty;
        }

        score
    }
}
