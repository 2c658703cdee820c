//! Request routing with failover.
//!
//! The routing engine turns a ranked candidate list into at most one
//! successful upstream call. For each candidate it re-checks breaker,
//! cooldown, ban, and capacity state (the ranking may be stale by the
//! time the attempt starts), claims an in-flight slot, and invokes the
//! caller-supplied upstream function. Outcomes feed the breakers, the
//! metrics aggregator, and the per-pair cooldown table. Failover stops on
//! non-retryable errors and, for streaming requests, as soon as any byte
//! reached the client.

use crate::models::backend::{Backend, Capability, Endpoint};
use crate::models::error::{ErrorClass, OrchestratorError, UpstreamError};
use crate::models::settings::RoutingConfig;
use crate::services::breaker_registry::BreakerRegistry;
use crate::services::circuit_breaker::{BreakerKey, CircuitBreaker, ExecDecision};
use crate::services::classifier;
use crate::services::fleet::FleetRegistry;
use crate::services::load_balancer::LoadBalancer;
use crate::services::metrics::{MetricsAggregator, RequestSample};
use crate::services::recovery::RecoveryCoordinator;
use crate::services::streaming::StreamingMetrics;
use crate::utils::model_tag::resolve_tag;
use ahash::{AHashMap, AHashSet};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Cancellation handle carried by a request.
///
/// Cancelling closes the upstream attempt, releases the in-flight slot,
/// and records the abort without touching breaker counters.
///
/// # Examples
///
/// ```rust
/// use corral::services::routing::CancelToken;
///
/// let token = CancelToken::new();
/// assert!(!token.is_cancelled());
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

/// Outcome returned by a caller-supplied upstream function.
///
/// Non-streaming calls carry the response payload; streaming calls have
/// already written to the client and return only the metrics descriptor.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOutcome {
    pub body: Option<serde_json::Value>,
    pub tokens_prompt: u64,
    pub tokens_generated: u64,
    pub streaming: Option<StreamingMetrics>,
}

/// Future type produced by upstream functions.
pub type UpstreamFuture = BoxFuture<'static, Result<UpstreamOutcome, UpstreamError>>;

/// Per-request routing options.
#[derive(Clone)]
pub struct RequestOptions {
    pub endpoint: Endpoint,
    pub capability: Capability,
    pub streaming: bool,
    pub bypass_breaker: bool,
    pub cancel: Option<CancelToken>,
}

impl RequestOptions {
    pub fn new(endpoint: Endpoint, capability: Capability) -> Self {
        Self {
            endpoint,
            capability,
            streaming: false,
            bypass_breaker: false,
            cancel: None,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn bypass_breaker(mut self, bypass: bool) -> Self {
        self.bypass_breaker = bypass;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Debug trail of one routing decision, exposed to the host.
#[derive(Serialize, Debug, Clone, Default)]
pub struct RoutingContext {
    /// Candidate server ids in the order tried.
    pub tried: Vec<String>,
    pub selected_server_id: Option<String>,
    pub available_server_count: usize,
    pub retry_count: u32,
    pub any_breaker_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

#[derive(Debug, Clone, Copy)]
struct CooldownState {
    until: Instant,
    consecutive_failures: u32,
}

/// Aggregate counters from the routing table.
#[derive(Serialize, Debug, Clone)]
pub struct RoutingStats {
    pub in_flight_total: u64,
    pub active_pairs: usize,
    pub pairs_in_cooldown: usize,
    pub banned_pairs: Vec<String>,
    pub bypass_requests: u64,
    pub aborted_requests: u64,
}

/// Shared per-(server, model) usage state: in-flight slots, failure
/// cooldowns, and administrative bans.
pub struct RoutingTable {
    in_flight: RwLock<AHashMap<(String, String), u32>>,
    cooldowns: Mutex<AHashMap<(String, String), CooldownState>>,
    bans: RwLock<AHashSet<(String, String)>>,
    bypass_requests: AtomicU64,
    aborted_requests: AtomicU64,
    config: RoutingConfig,
}

impl RoutingTable {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            in_flight: RwLock::new(AHashMap::new()),
            cooldowns: Mutex::new(AHashMap::new()),
            bans: RwLock::new(AHashSet::new()),
            bypass_requests: AtomicU64::new(0),
            aborted_requests: AtomicU64::new(0),
            config,
        }
    }

    pub fn in_flight(&self, server: &str, model: &str) -> u32 {
        let key = pair(server, model);
        self.in_flight
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Claims an in-flight slot when the pair is under `max`.
    pub fn try_acquire(&self, server: &str, model: &str, max: u32) -> bool {
        let key = pair(server, model);
        let mut in_flight = self.in_flight.write().unwrap_or_else(|e| e.into_inner());
        let count = in_flight.entry(key).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Releases a previously claimed slot.
    pub fn release(&self, server: &str, model: &str) {
        let key = pair(server, model);
        let mut in_flight = self.in_flight.write().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = in_flight.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(&key);
            }
        }
    }

    /// Time left of an active cooldown, if any. Expired entries are kept
    /// until the next failure or success resets them; the streak counter
    /// survives expiry so repeat offenders cool down longer.
    pub fn cooldown_remaining(&self, server: &str, model: &str) -> Option<Duration> {
        let key = pair(server, model);
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let state = cooldowns.get(&key)?;
        let now = Instant::now();
        if state.until > now {
            Some(state.until - now)
        } else {
            None
        }
    }

    /// Starts or extends the exponential cooldown after a failure.
    pub fn note_failure(&self, server: &str, model: &str) -> Duration {
        let key = pair(server, model);
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let state = cooldowns.entry(key).or_insert(CooldownState {
            until: Instant::now(),
            consecutive_failures: 0,
        });
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let cooldown = self.config.cooldown_for(state.consecutive_failures);
        state.until = Instant::now() + cooldown;
        cooldown
    }

    /// Clears cooldown state after a success.
    pub fn note_success(&self, server: &str, model: &str) {
        let key = pair(server, model);
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn ban(&self, server: &str, model: &str) {
        let key = pair(server, model);
        warn!("Banning {}:{}", key.0, key.1);
        self.bans.write().unwrap_or_else(|e| e.into_inner()).insert(key);
    }

    pub fn unban(&self, server: &str, model: &str) {
        let key = pair(server, model);
        self.bans.write().unwrap_or_else(|e| e.into_inner()).remove(&key);
    }

    pub fn is_banned(&self, server: &str, model: &str) -> bool {
        let key = pair(server, model);
        self.bans.read().unwrap_or_else(|e| e.into_inner()).contains(&key)
    }

    pub fn note_bypass(&self) {
        self.bypass_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_abort(&self) {
        self.aborted_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops every entry belonging to a removed server.
    pub fn remove_server(&self, server_id: &str) {
        self.in_flight
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(server, _), _| server != server_id);
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(server, _), _| server != server_id);
        self.bans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(server, _)| server != server_id);
    }

    pub fn stats(&self) -> RoutingStats {
        let in_flight = self.in_flight.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let bans = self.bans.read().unwrap_or_else(|e| e.into_inner());

        let mut banned: Vec<String> = bans
            .iter()
            .map(|(server, model)| format!("{}:{}", server, model))
            .collect();
        banned.sort();

        RoutingStats {
            in_flight_total: in_flight.values().map(|c| *c as u64).sum(),
            active_pairs: in_flight.len(),
            pairs_in_cooldown: cooldowns.values().filter(|s| s.until > now).count(),
            banned_pairs: banned,
            bypass_requests: self.bypass_requests.load(Ordering::Relaxed),
            aborted_requests: self.aborted_requests.load(Ordering::Relaxed),
        }
    }
}

fn pair(server: &str, model: &str) -> (String, String) {
    (server.to_string(), resolve_tag(model))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    Cooldown,
    Banned,
    BreakerOpen,
    AtCapacity,
}

enum AttemptResult {
    Success(UpstreamOutcome),
    Failed {
        error: UpstreamError,
        class: ErrorClass,
        fatal: bool,
    },
    Skipped(SkipReason),
    Cancelled,
}

/// The failover executor.
pub struct RoutingEngine {
    fleet: Arc<FleetRegistry>,
    balancer: Arc<LoadBalancer>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    table: Arc<RoutingTable>,
    recovery: Option<Arc<RecoveryCoordinator>>,
}

impl RoutingEngine {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        balancer: Arc<LoadBalancer>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
        table: Arc<RoutingTable>,
        recovery: Option<Arc<RecoveryCoordinator>>,
    ) -> Self {
        Self {
            fleet,
            balancer,
            breakers,
            metrics,
            table,
            recovery,
        }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Routes a request across ranked candidates until one succeeds.
    ///
    /// Each failed candidate is recorded locally (breakers, metrics,
    /// cooldown) before the loop continues; only the final error
    /// surfaces. Non-retryable failures and mid-stream failures stop the
    /// failover immediately.
    pub async fn try_request_with_failover<F>(
        &self,
        model: &str,
        upstream: F,
        options: &RequestOptions,
        ctx: &mut RoutingContext,
    ) -> Result<UpstreamOutcome, OrchestratorError>
    where
        F: Fn(Backend) -> UpstreamFuture,
    {
        let resolved = resolve_tag(model);
        ctx.endpoint = Some(options.endpoint);
        ctx.capability = Some(options.capability);

        if !self.fleet.list().iter().any(|b| b.advertises(&resolved)) {
            return Err(OrchestratorError::ModelNotAvailable { model: resolved });
        }

        let ranked = self.balancer.rank(&resolved, options.capability);
        ctx.available_server_count = ranked.len();
        if ranked.is_empty() {
            debug!("No candidates for {}", resolved);
            return Err(OrchestratorError::NoHealthyServers { model: resolved });
        }

        let mut last_error: Option<UpstreamError> = None;
        let mut classifications: Vec<ErrorClass> = Vec::new();
        let mut skips: Vec<(String, SkipReason)> = Vec::new();

        for candidate in ranked {
            // Refetch: flags or membership may have changed while earlier
            // candidates were being tried.
            let Some(fresh) = self.fleet.get(&candidate.backend.id) else {
                continue;
            };
            if !fresh.is_available() {
                continue;
            }

            match self
                .attempt(&fresh, &resolved, &upstream, options, ctx)
                .await
            {
                AttemptResult::Success(outcome) => return Ok(outcome),
                AttemptResult::Cancelled => return Err(OrchestratorError::Cancelled),
                AttemptResult::Skipped(reason) => {
                    if reason == SkipReason::BreakerOpen {
                        ctx.any_breaker_open = true;
                    }
                    skips.push((fresh.id.clone(), reason));
                }
                AttemptResult::Failed {
                    error,
                    class,
                    fatal,
                } => {
                    classifications.push(class);
                    if fatal {
                        return Err(OrchestratorError::Upstream {
                            class,
                            source: error,
                        });
                    }
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(source) => {
                warn!(
                    "All candidates exhausted for {} after {} attempts",
                    resolved,
                    classifications.len()
                );
                Err(OrchestratorError::AllCandidatesExhausted {
                    model: resolved,
                    attempts: classifications.len(),
                    classifications,
                    source,
                })
            }
            // Every candidate was skipped at the freshness re-check.
            None => Err(self.skip_error(&resolved, &skips)),
        }
    }

    /// Routes a request to one named server, bypassing load balancing.
    pub async fn request_to_server<F>(
        &self,
        server_id: &str,
        model: &str,
        upstream: F,
        options: &RequestOptions,
        ctx: &mut RoutingContext,
    ) -> Result<UpstreamOutcome, OrchestratorError>
    where
        F: Fn(Backend) -> UpstreamFuture,
    {
        let resolved = resolve_tag(model);
        ctx.endpoint = Some(options.endpoint);
        ctx.capability = Some(options.capability);
        ctx.available_server_count = 1;

        let backend = self
            .fleet
            .get(server_id)
            .ok_or_else(|| OrchestratorError::ServerNotFound {
                id: server_id.to_string(),
            })?;

        if !backend.is_available() {
            return Err(OrchestratorError::ServerUnhealthy {
                id: server_id.to_string(),
            });
        }

        if !backend.advertises(&resolved) {
            return Err(OrchestratorError::ModelNotAvailable { model: resolved });
        }

        match self.attempt(&backend, &resolved, &upstream, options, ctx).await {
            AttemptResult::Success(outcome) => Ok(outcome),
            AttemptResult::Cancelled => Err(OrchestratorError::Cancelled),
            AttemptResult::Failed { error, class, .. } => Err(OrchestratorError::Upstream {
                class,
                source: error,
            }),
            AttemptResult::Skipped(reason) => Err(match reason {
                SkipReason::Banned => OrchestratorError::Banned {
                    server: server_id.to_string(),
                    model: resolved,
                },
                SkipReason::Cooldown => OrchestratorError::InCooldown {
                    server: server_id.to_string(),
                    model: resolved.clone(),
                    remaining_ms: self
                        .table
                        .cooldown_remaining(server_id, &resolved)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                },
                SkipReason::BreakerOpen => OrchestratorError::BreakerOpen {
                    key: format!("{}:{}", server_id, resolved),
                },
                SkipReason::AtCapacity => OrchestratorError::ServerUnhealthy {
                    id: server_id.to_string(),
                },
            }),
        }
    }

    async fn attempt<F>(
        &self,
        backend: &Backend,
        model: &str,
        upstream: &F,
        options: &RequestOptions,
        ctx: &mut RoutingContext,
    ) -> AttemptResult
    where
        F: Fn(Backend) -> UpstreamFuture,
    {
        if self.table.is_banned(&backend.id, model) {
            return AttemptResult::Skipped(SkipReason::Banned);
        }

        if self.table.cooldown_remaining(&backend.id, model).is_some() {
            return AttemptResult::Skipped(SkipReason::Cooldown);
        }

        let model_breaker = self
            .breakers
            .get_or_create(&BreakerKey::ServerModel(backend.id.clone(), model.to_string()));
        let server_breaker = self
            .breakers
            .get_or_create(&BreakerKey::Server(backend.id.clone()));

        // Probes granted along the way have to be released on every exit
        // path that never records an outcome.
        let mut probes: Vec<Arc<CircuitBreaker>> = Vec::new();

        if options.bypass_breaker {
            self.table.note_bypass();
        } else {
            for breaker in [&model_breaker, &server_breaker] {
                match breaker.can_execute() {
                    ExecDecision::Allow => {}
                    ExecDecision::Probe => {
                        let claimed = self
                            .recovery
                            .as_ref()
                            .map(|r| r.try_begin_probe(breaker.key()))
                            .unwrap_or(true);
                        if !claimed {
                            breaker.abandon_probe();
                            self.abandon_probes(&probes);
                            return AttemptResult::Skipped(SkipReason::BreakerOpen);
                        }
                        probes.push(Arc::clone(breaker));
                    }
                    ExecDecision::Denied { .. } => {
                        self.abandon_probes(&probes);
                        return AttemptResult::Skipped(SkipReason::BreakerOpen);
                    }
                }
            }
        }

        if !self
            .table
            .try_acquire(&backend.id, model, backend.max_concurrency)
        {
            self.abandon_probes(&probes);
            return AttemptResult::Skipped(SkipReason::AtCapacity);
        }

        ctx.tried.push(backend.id.clone());
        ctx.selected_server_id = Some(backend.id.clone());

        let started = Instant::now();
        let call = upstream(backend.clone());

        let result = match &options.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        // Aborts are not counted outcomes: release the
                        // slot and the probes, leave breakers untouched.
                        self.table.release(&backend.id, model);
                        self.abandon_probes(&probes);
                        self.table.note_abort();
                        debug!("Request to {} cancelled", backend.id);
                        return AttemptResult::Cancelled;
                    }
                    result = call => result,
                }
            }
            None => call.await,
        };

        let duration = started.elapsed();
        self.table.release(&backend.id, model);

        match result {
            Ok(outcome) => {
                model_breaker.record_success(duration);
                server_breaker.record_success(duration);
                self.complete_probes(&probes, true);
                self.table.note_success(&backend.id, model);
                self.metrics.record(RequestSample {
                    server: backend.id.clone(),
                    model: model.to_string(),
                    duration,
                    success: true,
                    tokens_prompt: outcome.tokens_prompt,
                    tokens_generated: outcome.tokens_generated,
                    streaming: outcome.streaming,
                });
                info!(
                    "Request to {} for {} succeeded in {}ms",
                    backend.id,
                    model,
                    duration.as_millis()
                );
                AttemptResult::Success(outcome)
            }
            Err(error) => {
                let class = classifier::classify(&error);
                model_breaker.record_failure(class);
                server_breaker.record_failure(class);
                self.complete_probes(&probes, false);
                let cooldown = self.table.note_failure(&backend.id, model);
                self.metrics.record(RequestSample {
                    server: backend.id.clone(),
                    model: model.to_string(),
                    duration,
                    success: false,
                    tokens_prompt: 0,
                    tokens_generated: 0,
                    streaming: error.partial,
                });

                let mid_stream = options.streaming && error.first_byte_written;
                let fatal = !class.is_retryable() || mid_stream;
                warn!(
                    "Request to {} for {} failed ({}, cooldown {}ms{}): {}",
                    backend.id,
                    model,
                    class.as_str(),
                    cooldown.as_millis(),
                    if mid_stream { ", mid-stream" } else { "" },
                    error
                );

                AttemptResult::Failed {
                    error,
                    class,
                    fatal,
                }
            }
        }
    }

    fn abandon_probes(&self, probes: &[Arc<CircuitBreaker>]) {
        for breaker in probes {
            breaker.abandon_probe();
            if let Some(recovery) = &self.recovery {
                recovery.cancel_probe(breaker.key());
            }
        }
    }

    fn complete_probes(&self, probes: &[Arc<CircuitBreaker>], success: bool) {
        if let Some(recovery) = &self.recovery {
            for breaker in probes {
                recovery.complete_probe(breaker.key(), success);
            }
        }
    }

    fn skip_error(&self, model: &str, skips: &[(String, SkipReason)]) -> OrchestratorError {
        let first = skips.first();
        let uniform = first
            .map(|(_, reason)| skips.iter().all(|(_, r)| r == reason))
            .unwrap_or(false);

        match (uniform, first) {
            (true, Some((server, SkipReason::Banned))) => OrchestratorError::Banned {
                server: server.clone(),
                model: model.to_string(),
            },
            (true, Some((server, SkipReason::Cooldown))) => OrchestratorError::InCooldown {
                server: server.clone(),
                model: model.to_string(),
                remaining_ms: self
                    .table
                    .cooldown_remaining(server, model)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
            },
            (true, Some((server, SkipReason::BreakerOpen))) => OrchestratorError::BreakerOpen {
                key: format!("{}:{}", server, model),
            },
            _ => OrchestratorError::NoHealthyServers {
                model: model.to_string(),
            },
        }
    }
}
