use crate::models::backend::Backend;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scoring weights and thresholds for the load balancer.
///
/// The four weights must sum to 1.0 (validated with a small tolerance).
/// The p95 and success-rate thresholds are soft: a candidate crossing them
/// is penalized but stays rankable, so a degraded fleet still routes.
///
/// # Examples
///
/// ```rust
/// use corral::models::settings::BalancerConfig;
///
/// let config = BalancerConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BalancerConfig {
    /// Weight of the latency component (lower p95 scores higher).
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Weight of the rolling success rate.
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,

    /// Weight of available capacity (1 - inflight / max_concurrency).
    #[serde(default = "default_capacity_weight")]
    pub capacity_weight: f64,

    /// Weight of the raw capacity bonus (normalized max_concurrency).
    #[serde(default = "default_capacity_bonus_weight")]
    pub capacity_bonus_weight: f64,

    /// p95 latency above this is penalized, in milliseconds.
    #[serde(default = "default_p95_threshold_ms")]
    pub p95_threshold_ms: f64,

    /// Success rate below this is penalized.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,

    /// Multiplier applied to a candidate's score per crossed threshold.
    #[serde(default = "default_soft_penalty")]
    pub soft_penalty: f64,
}

fn default_latency_weight() -> f64 {
    0.4
}

fn default_success_weight() -> f64 {
    0.3
}

fn default_capacity_weight() -> f64 {
    0.2
}

fn default_capacity_bonus_weight() -> f64 {
    0.1
}

fn default_p95_threshold_ms() -> f64 {
    5000.0
}

fn default_min_success_rate() -> f64 {
    0.8
}

fn default_soft_penalty() -> f64 {
    0.75
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            latency_weight: default_latency_weight(),
            success_weight: default_success_weight(),
            capacity_weight: default_capacity_weight(),
            capacity_bonus_weight: default_capacity_bonus_weight(),
            p95_threshold_ms: default_p95_threshold_ms(),
            min_success_rate: default_min_success_rate(),
            soft_penalty: default_soft_penalty(),
        }
    }
}

impl BalancerConfig {
    /// Validates weight and threshold ranges.
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            self.latency_weight,
            self.success_weight,
            self.capacity_weight,
            self.capacity_bonus_weight,
        ];

        if weights.iter().any(|w| *w < 0.0) {
            return Err("Balancer weights must not be negative".to_string());
        }

        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 0.001 {
            return Err(format!("Balancer weights must sum to 1.0, got {:.3}", sum));
        }

        if self.p95_threshold_ms <= 0.0 {
            return Err("p95_threshold_ms must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err("min_success_rate must be between 0.0 and 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.soft_penalty) {
            return Err("soft_penalty must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}

/// Thresholds and timeouts for the adaptive circuit breakers.
///
/// The effective failure threshold slides between `min_failure_threshold`
/// and `max_failure_threshold` depending on the observed error mix:
/// transient errors inflate it (weight `transient_weight`) while
/// non-retryable errors pull it down (weight `non_retryable_weight`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakerConfig {
    /// Base consecutive-failure threshold before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Lower bound for the adaptive threshold.
    #[serde(default = "default_min_failure_threshold")]
    pub min_failure_threshold: u32,

    /// Upper bound for the adaptive threshold.
    #[serde(default = "default_max_failure_threshold")]
    pub max_failure_threshold: u32,

    /// Threshold inflation per observed transient error.
    #[serde(default = "default_transient_weight")]
    pub transient_weight: f64,

    /// Threshold reduction per observed non-retryable error.
    #[serde(default = "default_non_retryable_weight")]
    pub non_retryable_weight: f64,

    /// Consecutive half-open successes required to close the breaker.
    #[serde(default = "default_recovery_success_threshold")]
    pub recovery_success_threshold: u32,

    /// Time an open breaker waits before admitting a probe, in milliseconds.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Cap for the backed-off open timeout, in milliseconds.
    #[serde(default = "default_max_open_timeout_ms")]
    pub max_open_timeout_ms: u64,

    /// Open-timeout multiplier applied after a failed half-open probe.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Error ratio in the sliding window that opens the breaker.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Minimum outcomes in the window before the ratio is consulted.
    #[serde(default = "default_error_rate_min_samples")]
    pub error_rate_min_samples: usize,

    /// Length of the sliding error-rate window, in milliseconds.
    #[serde(default = "default_error_rate_window_ms")]
    pub error_rate_window_ms: u64,

    /// Number of recorded state transitions kept per breaker.
    #[serde(default = "default_transition_log_size")]
    pub transition_log_size: usize,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_min_failure_threshold() -> u32 {
    3
}

fn default_max_failure_threshold() -> u32 {
    10
}

fn default_transient_weight() -> f64 {
    0.125
}

fn default_non_retryable_weight() -> f64 {
    0.5
}

fn default_recovery_success_threshold() -> u32 {
    3
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_max_open_timeout_ms() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_error_rate_min_samples() -> usize {
    10
}

fn default_error_rate_window_ms() -> u64 {
    60_000
}

fn default_transition_log_size() -> usize {
    32
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            min_failure_threshold: default_min_failure_threshold(),
            max_failure_threshold: default_max_failure_threshold(),
            transient_weight: default_transient_weight(),
            non_retryable_weight: default_non_retryable_weight(),
            recovery_success_threshold: default_recovery_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            max_open_timeout_ms: default_max_open_timeout_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            error_rate_threshold: default_error_rate_threshold(),
            error_rate_min_samples: default_error_rate_min_samples(),
            error_rate_window_ms: default_error_rate_window_ms(),
            transition_log_size: default_transition_log_size(),
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn max_open_timeout(&self) -> Duration {
        Duration::from_millis(self.max_open_timeout_ms)
    }

    pub fn error_rate_window(&self) -> Duration {
        Duration::from_millis(self.error_rate_window_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.min_failure_threshold > self.max_failure_threshold {
            return Err(
                "min_failure_threshold cannot be greater than max_failure_threshold".to_string(),
            );
        }

        if self.recovery_success_threshold == 0 {
            return Err("recovery_success_threshold must be greater than 0".to_string());
        }

        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }

        if self.open_timeout_ms > self.max_open_timeout_ms {
            return Err("open_timeout_ms cannot be greater than max_open_timeout_ms".to_string());
        }

        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err("error_rate_threshold must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}

/// Capacity and starvation control for the priority queue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueueConfig {
    /// Maximum resident envelopes before enqueues are rejected.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// How often resident envelopes receive a priority boost, in milliseconds.
    #[serde(default = "default_priority_boost_interval_ms")]
    pub priority_boost_interval_ms: u64,

    /// Priority added per boost pass.
    #[serde(default = "default_priority_boost_amount")]
    pub priority_boost_amount: i32,
}

fn default_queue_max_size() -> usize {
    100
}

fn default_priority_boost_interval_ms() -> u64 {
    10_000
}

fn default_priority_boost_amount() -> i32 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            priority_boost_interval_ms: default_priority_boost_interval_ms(),
            priority_boost_amount: default_priority_boost_amount(),
        }
    }
}

impl QueueConfig {
    pub fn priority_boost_interval(&self) -> Duration {
        Duration::from_millis(self.priority_boost_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("Queue max_size must be greater than 0".to_string());
        }

        if self.priority_boost_amount < 0 {
            return Err("priority_boost_amount must not be negative".to_string());
        }

        Ok(())
    }
}

/// Health sweep cadence and probe limits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthConfig {
    /// Delay between sweeps, in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe timeout, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Backends probed concurrently within a sweep.
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// Pause between probe batches, in milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_concurrency() -> usize {
    4
}

fn default_batch_delay_ms() -> u64 {
    100
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_concurrency: default_probe_concurrency(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.probe_concurrency == 0 {
            return Err("probe_concurrency must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Sample bounds and staleness decay for the metrics aggregator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum recent request durations retained per (server, model) pair.
    #[serde(default = "default_recent_samples")]
    pub recent_samples: usize,

    /// Age after which decay applies to derived values, in milliseconds.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Half-life of the exponential decay, in milliseconds.
    #[serde(default = "default_half_life_ms")]
    pub half_life_ms: u64,

    /// Floor for the decay factor.
    #[serde(default = "default_min_decay_factor")]
    pub min_decay_factor: f64,

    /// Stale percentile estimates are blended toward this multiple of
    /// themselves, erring on the pessimistic side for old data.
    #[serde(default = "default_stale_inflation")]
    pub stale_inflation: f64,

    /// Debounce between persistence flushes, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_recent_samples() -> usize {
    1000
}

fn default_stale_threshold_ms() -> u64 {
    60_000
}

fn default_half_life_ms() -> u64 {
    300_000
}

fn default_min_decay_factor() -> f64 {
    0.1
}

fn default_stale_inflation() -> f64 {
    1.5
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            recent_samples: default_recent_samples(),
            stale_threshold_ms: default_stale_threshold_ms(),
            half_life_ms: default_half_life_ms(),
            min_decay_factor: default_min_decay_factor(),
            stale_inflation: default_stale_inflation(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.recent_samples == 0 {
            return Err("recent_samples must be greater than 0".to_string());
        }

        if self.half_life_ms == 0 {
            return Err("half_life_ms must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.min_decay_factor) {
            return Err("min_decay_factor must be between 0.0 and 1.0".to_string());
        }

        if self.stale_inflation < 1.0 {
            return Err("stale_inflation must be >= 1.0".to_string());
        }

        Ok(())
    }
}

/// Half-open probe throttling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecoveryConfig {
    /// Process-wide cap on concurrent half-open probes.
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// Pause before the same breaker may probe again after a failed probe,
    /// in milliseconds.
    #[serde(default = "default_probe_cooldown_ms")]
    pub probe_cooldown_ms: u64,

    /// Probe outcomes retained per breaker for the recovery estimate.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// How often the probe loop scans for breakers that reached their
    /// open timeout without any traffic to probe them, in milliseconds.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_max_concurrent_probes() -> usize {
    2
}

fn default_probe_cooldown_ms() -> u64 {
    15_000
}

fn default_history_size() -> usize {
    20
}

fn default_scan_interval_ms() -> u64 {
    5_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: default_max_concurrent_probes(),
            probe_cooldown_ms: default_probe_cooldown_ms(),
            history_size: default_history_size(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

impl RecoveryConfig {
    pub fn probe_cooldown(&self) -> Duration {
        Duration::from_millis(self.probe_cooldown_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_probes == 0 {
            return Err("max_concurrent_probes must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Failover cooldown curve.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoutingConfig {
    /// Cooldown after the first failure for a (server, model) pair, in
    /// milliseconds. Doubles per consecutive failure.
    #[serde(default = "default_base_cooldown_ms")]
    pub base_cooldown_ms: u64,

    /// Cap for the exponential cooldown, in milliseconds.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_base_cooldown_ms() -> u64 {
    500
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_cooldown_ms: default_base_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl RoutingConfig {
    /// Cooldown applied after `consecutive_failures` failures, capped.
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        let cooldown = self
            .base_cooldown_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_cooldown_ms);
        Duration::from_millis(cooldown)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_cooldown_ms == 0 {
            return Err("base_cooldown_ms must be greater than 0".to_string());
        }

        if self.base_cooldown_ms > self.max_cooldown_ms {
            return Err("base_cooldown_ms cannot be greater than max_cooldown_ms".to_string());
        }

        Ok(())
    }
}

/// Retry discipline for model warmup calls.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WarmupConfig {
    /// Attempts per backend before giving up (default: 3).
    #[serde(default = "default_warmup_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failed attempt, in milliseconds.
    #[serde(default = "default_warmup_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap for the exponential backoff, in milliseconds.
    #[serde(default = "default_warmup_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier between attempts.
    #[serde(default = "default_warmup_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_warmup_max_attempts() -> u32 {
    3
}

fn default_warmup_initial_backoff_ms() -> u64 {
    500
}

fn default_warmup_max_backoff_ms() -> u64 {
    10_000
}

fn default_warmup_backoff_multiplier() -> f64 {
    2.0
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_warmup_max_attempts(),
            initial_backoff_ms: default_warmup_initial_backoff_ms(),
            max_backoff_ms: default_warmup_max_backoff_ms(),
            backoff_multiplier: default_warmup_backoff_multiplier(),
        }
    }
}

impl WarmupConfig {
    /// Backoff applied after `attempt` failed attempts, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff = (self.initial_backoff_ms as f64)
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(backoff.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Warmup max_attempts must be greater than 0".to_string());
        }

        if self.backoff_multiplier < 1.0 {
            return Err("Warmup backoff_multiplier must be >= 1.0".to_string());
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(
                "Warmup initial_backoff_ms cannot be greater than max_backoff_ms".to_string(),
            );
        }

        Ok(())
    }
}

/// Snapshot file locations and rotation depth.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistenceConfig {
    /// Whether snapshots are written at all.
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,

    /// Directory holding the snapshot files.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Metrics snapshot file name within `state_dir`.
    #[serde(default = "default_metrics_file")]
    pub metrics_file: String,

    /// Breaker snapshot file name within `state_dir`.
    #[serde(default = "default_breakers_file")]
    pub breakers_file: String,

    /// Rotated backup copies kept per file.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_state_dir() -> String {
    "./state".to_string()
}

fn default_metrics_file() -> String {
    "metrics.json".to_string()
}

fn default_breakers_file() -> String {
    "breakers.json".to_string()
}

fn default_max_backups() -> usize {
    3
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            state_dir: default_state_dir(),
            metrics_file: default_metrics_file(),
            breakers_file: default_breakers_file(),
            max_backups: default_max_backups(),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.state_dir.trim().is_empty() {
            return Err("state_dir must not be empty when persistence is enabled".to_string());
        }

        Ok(())
    }
}

/// Top-level orchestrator settings.
///
/// Loaded from JSON via [`crate::config::settings::load_settings`] or
/// built in code for embedded use. Every section carries serde defaults,
/// so `{}` is a valid configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Settings {
    /// Initial fleet, added before any background task starts.
    #[serde(default)]
    pub backends: Vec<Backend>,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub warmup: WarmupConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Settings {
    /// Validates every section and the initial fleet.
    pub fn validate(&self) -> Result<(), String> {
        for (i, backend) in self.backends.iter().enumerate() {
            backend
                .validate()
                .map_err(|e| format!("Backend {} validation failed: {}", i, e))?;
        }

        self.balancer.validate()?;
        self.breaker.validate()?;
        self.queue.validate()?;
        self.health.validate()?;
        self.metrics.validate()?;
        self.recovery.validate()?;
        self.routing.validate()?;
        self.warmup.validate()?;
        self.persistence.validate()?;

        Ok(())
    }
}
