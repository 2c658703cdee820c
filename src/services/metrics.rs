//! Rolling performance metrics per (server, model) pair.
//!
//! Each pair keeps a set of tumbling time windows, a bounded ring of
//! recent request durations for percentile estimation, and optional
//! streaming sub-metrics (time to first token, stream duration). Reads go
//! through a staleness decay: the older a record, the more its success
//! rate drifts toward neutral, its throughput toward zero, and its
//! percentile estimates toward a configured pessimistic inflation of
//! themselves. The raw accessor bypasses decay for dashboards and tests.

use crate::models::settings::MetricsConfig;
use crate::services::persistence::SnapshotStore;
use crate::services::streaming::StreamingMetrics;
use crate::utils::model_tag::resolve_tag;
use ahash::AHashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Schema tag embedded in persisted metrics files.
pub const METRICS_SCHEMA: u32 = 1;

/// Named aggregation windows tracked per pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl WindowKind {
    pub const ALL: [WindowKind; 5] = [
        WindowKind::OneMinute,
        WindowKind::FiveMinutes,
        WindowKind::FifteenMinutes,
        WindowKind::OneHour,
        WindowKind::OneDay,
    ];

    /// Window length.
    pub fn length(&self) -> ChronoDuration {
        match self {
            WindowKind::OneMinute => ChronoDuration::minutes(1),
            WindowKind::FiveMinutes => ChronoDuration::minutes(5),
            WindowKind::FifteenMinutes => ChronoDuration::minutes(15),
            WindowKind::OneHour => ChronoDuration::hours(1),
            WindowKind::OneDay => ChronoDuration::hours(24),
        }
    }
}

/// Aggregated statistics for one tumbling window period.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub count: u64,
    pub error_count: u64,
    pub latency_sum_ms: f64,
    pub latency_sq_sum_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub tokens_generated: u64,
    pub tokens_prompt: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowStats {
    fn new(kind: WindowKind, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            error_count: 0,
            latency_sum_ms: 0.0,
            latency_sq_sum_ms: 0.0,
            min_latency_ms: 0.0,
            max_latency_ms: 0.0,
            tokens_generated: 0,
            tokens_prompt: 0,
            start: now,
            end: now + kind.length(),
        }
    }

    /// Advances the window to cover `now`. One expired period slides to
    /// the next; anything older resets the window entirely.
    fn roll(&mut self, kind: WindowKind, now: DateTime<Utc>) {
        if now <= self.end {
            return;
        }

        let length = kind.length();
        let expired_for = now - self.end;
        if expired_for > length {
            *self = Self::new(kind, now);
        } else {
            let start = self.end;
            *self = Self::new(kind, start);
        }
    }

    fn record(&mut self, duration_ms: f64, success: bool, tokens_prompt: u64, tokens_generated: u64) {
        self.count += 1;
        if !success {
            self.error_count += 1;
        }
        self.latency_sum_ms += duration_ms;
        self.latency_sq_sum_ms += duration_ms * duration_ms;
        if self.count == 1 {
            self.min_latency_ms = duration_ms;
            self.max_latency_ms = duration_ms;
        } else {
            self.min_latency_ms = self.min_latency_ms.min(duration_ms);
            self.max_latency_ms = self.max_latency_ms.max(duration_ms);
        }
        self.tokens_prompt += tokens_prompt;
        self.tokens_generated += tokens_generated;
    }

    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            1.0
        } else {
            1.0 - self.error_count as f64 / self.count as f64
        }
    }
}

/// The five windows of one pair, persisted with stable field order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WindowSet {
    pub one_minute: WindowStats,
    pub five_minutes: WindowStats,
    pub fifteen_minutes: WindowStats,
    pub one_hour: WindowStats,
    pub one_day: WindowStats,
}

impl WindowSet {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            one_minute: WindowStats::new(WindowKind::OneMinute, now),
            five_minutes: WindowStats::new(WindowKind::FiveMinutes, now),
            fifteen_minutes: WindowStats::new(WindowKind::FifteenMinutes, now),
            one_hour: WindowStats::new(WindowKind::OneHour, now),
            one_day: WindowStats::new(WindowKind::OneDay, now),
        }
    }

    pub fn get(&self, kind: WindowKind) -> &WindowStats {
        match kind {
            WindowKind::OneMinute => &self.one_minute,
            WindowKind::FiveMinutes => &self.five_minutes,
            WindowKind::FifteenMinutes => &self.fifteen_minutes,
            WindowKind::OneHour => &self.one_hour,
            WindowKind::OneDay => &self.one_day,
        }
    }

    fn get_mut(&mut self, kind: WindowKind) -> &mut WindowStats {
        match kind {
            WindowKind::OneMinute => &mut self.one_minute,
            WindowKind::FiveMinutes => &mut self.five_minutes,
            WindowKind::FifteenMinutes => &mut self.fifteen_minutes,
            WindowKind::OneHour => &mut self.one_hour,
            WindowKind::OneDay => &mut self.one_day,
        }
    }
}

/// Streaming sub-metrics: bounded rings of TTFT and stream durations.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StreamingStats {
    pub count: u64,
    pub ttft_ms: VecDeque<f64>,
    pub duration_ms: VecDeque<f64>,
}

/// Full metrics record for one (server, model) pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PairMetrics {
    pub windows: WindowSet,
    pub recent_ms: VecDeque<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingStats>,
    pub success_rate: f64,
    pub throughput_rpm: f64,
    pub avg_tokens_per_request: f64,
    /// Unix milliseconds of the last recorded request.
    pub last_updated_ms: u64,
}

impl PairMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            windows: WindowSet::new(now),
            recent_ms: VecDeque::new(),
            streaming: None,
            success_rate: 1.0,
            throughput_rpm: 0.0,
            avg_tokens_per_request: 0.0,
            last_updated_ms: now.timestamp_millis().max(0) as u64,
        }
    }

    pub fn p50_ms(&self) -> f64 {
        percentile_of(&self.recent_ms, 50.0)
    }

    pub fn p95_ms(&self) -> f64 {
        percentile_of(&self.recent_ms, 95.0)
    }

    pub fn p99_ms(&self) -> f64 {
        percentile_of(&self.recent_ms, 99.0)
    }
}

/// One finished request, as reported by the routing engine.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub server: String,
    pub model: String,
    pub duration: Duration,
    pub success: bool,
    pub tokens_prompt: u64,
    pub tokens_generated: u64,
    pub streaming: Option<StreamingMetrics>,
}

/// Derived view of one pair, after decay.
#[derive(Serialize, Debug, Clone)]
pub struct MetricsView {
    pub server: String,
    pub model: String,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub success_rate: f64,
    pub throughput_rpm: f64,
    pub avg_tokens_per_request: f64,
    pub sample_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_duration_p95_ms: Option<f64>,
    /// 1.0 for fresh data, approaching the configured floor as the record
    /// ages.
    pub decay_factor: f64,
    pub last_updated_ms: u64,
}

/// Persisted layout of the aggregator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsFile {
    pub schema: u32,
    pub timestamp: DateTime<Utc>,
    pub servers: BTreeMap<String, PairMetrics>,
}

/// Nearest-rank percentile over an unsorted sample.
///
/// # Examples
///
/// ```rust
/// use corral::services::metrics::percentile;
///
/// assert_eq!(percentile(&[], 95.0), 0.0);
/// assert_eq!(percentile(&[250.0], 95.0), 250.0);
/// assert_eq!(percentile(&[10.0, 20.0, 30.0, 40.0], 100.0), 40.0);
/// ```
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

fn percentile_of(ring: &VecDeque<f64>, p: f64) -> f64 {
    let (a, b) = ring.as_slices();
    if b.is_empty() {
        percentile(a, p)
    } else {
        let mut joined = Vec::with_capacity(ring.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        percentile(&joined, p)
    }
}

/// Rolling metrics aggregator for the whole fleet.
///
/// Updates for the same (server, model) pair are serialized behind the
/// aggregator lock; reads return cloned views so callers never hold it.
pub struct MetricsAggregator {
    records: RwLock<AHashMap<String, PairMetrics>>,
    config: MetricsConfig,
    dirty: AtomicBool,
    store: Option<SnapshotStore>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            records: RwLock::new(AHashMap::new()),
            config,
            dirty: AtomicBool::new(false),
            store: None,
        }
    }

    /// Aggregator with snapshot persistence attached.
    pub fn with_store(config: MetricsConfig, store: SnapshotStore) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    /// Records one finished request.
    pub fn record(&self, sample: RequestSample) {
        let key = pair_key(&sample.server, &sample.model);
        let now = Utc::now();
        let duration_ms = sample.duration.as_secs_f64() * 1000.0;

        let mut records = self.write();
        let pair = records
            .entry(key)
            .or_insert_with(|| PairMetrics::new(now));

        for kind in WindowKind::ALL {
            let window = pair.windows.get_mut(kind);
            window.roll(kind, now);
            window.record(
                duration_ms,
                sample.success,
                sample.tokens_prompt,
                sample.tokens_generated,
            );
        }

        pair.recent_ms.push_back(duration_ms);
        while pair.recent_ms.len() > self.config.recent_samples {
            pair.recent_ms.pop_front();
        }

        if let Some(streaming) = sample.streaming {
            let stats = pair.streaming.get_or_insert_with(StreamingStats::default);
            stats.count += 1;
            stats.ttft_ms.push_back(streaming.time_to_first_chunk_ms);
            stats.duration_ms.push_back(streaming.duration_ms);
            while stats.ttft_ms.len() > self.config.recent_samples {
                stats.ttft_ms.pop_front();
            }
            while stats.duration_ms.len() > self.config.recent_samples {
                stats.duration_ms.pop_front();
            }
        }

        let five = pair.windows.get(WindowKind::FiveMinutes);
        pair.success_rate = five.success_rate();
        pair.throughput_rpm = pair.windows.get(WindowKind::OneMinute).count as f64;
        pair.avg_tokens_per_request = if five.count == 0 {
            0.0
        } else {
            (five.tokens_generated + five.tokens_prompt) as f64 / five.count as f64
        };
        pair.last_updated_ms = now.timestamp_millis().max(0) as u64;

        drop(records);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Decayed view for routing decisions. `None` when the pair was never
    /// observed.
    pub fn get(&self, server: &str, model: &str) -> Option<MetricsView> {
        let key = pair_key(server, model);
        let records = self.read();
        let pair = records.get(&key)?;
        Some(self.view_of(server, model, pair, true))
    }

    /// Undecayed view, for dashboards and tests.
    pub fn get_raw(&self, server: &str, model: &str) -> Option<MetricsView> {
        let key = pair_key(server, model);
        let records = self.read();
        let pair = records.get(&key)?;
        Some(self.view_of(server, model, pair, false))
    }

    /// Full record clone for the per-pair detail endpoint.
    pub fn detail(&self, server: &str, model: &str) -> Option<PairMetrics> {
        self.read().get(&pair_key(server, model)).cloned()
    }

    /// Decayed views for every known pair.
    pub fn all(&self) -> Vec<MetricsView> {
        let records = self.read();
        let mut views: Vec<MetricsView> = records
            .iter()
            .map(|(key, pair)| {
                let (server, model) = split_key(key);
                self.view_of(server, model, pair, true)
            })
            .collect();
        views.sort_by(|a, b| (a.server.as_str(), a.model.as_str()).cmp(&(b.server.as_str(), b.model.as_str())));
        views
    }

    /// Drops every record belonging to a removed server.
    pub fn remove_server(&self, server_id: &str) {
        let prefix = format!("{}:", server_id);
        let mut records = self.write();
        let before = records.len();
        records.retain(|key, _| !key.starts_with(&prefix));
        if records.len() != before {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Serializes every record with a stable key order.
    pub fn snapshot(&self) -> MetricsFile {
        let servers = self
            .read()
            .iter()
            .map(|(key, pair)| (key.clone(), pair.clone()))
            .collect();

        MetricsFile {
            schema: METRICS_SCHEMA,
            timestamp: Utc::now(),
            servers,
        }
    }

    /// Restores records from a persisted file.
    pub fn restore(&self, file: &MetricsFile) {
        if file.schema != METRICS_SCHEMA {
            warn!(
                "Skipping metrics snapshot with schema {} (expected {})",
                file.schema, METRICS_SCHEMA
            );
            return;
        }

        let mut records = self.write();
        for (key, pair) in &file.servers {
            records.insert(key.clone(), pair.clone());
        }
        debug!("Restored metrics for {} pairs", file.servers.len());
    }

    /// Loads the snapshot from the attached store, if any.
    pub async fn load(&self) -> Result<(), crate::models::error::OrchestratorError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if let Some(file) = store.read::<MetricsFile>().await? {
            self.restore(&file);
        }
        Ok(())
    }

    /// Writes the snapshot when anything changed since the last flush.
    /// Called by the debounced flusher task and synchronously on shutdown.
    pub async fn flush(&self) -> Result<(), crate::models::error::OrchestratorError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let snapshot = self.snapshot();
        if let Err(e) = store.write(&snapshot).await {
            // Leave the dirty bit set so the next tick retries.
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        self.config.flush_interval()
    }

    fn view_of(&self, server: &str, model: &str, pair: &PairMetrics, decay: bool) -> MetricsView {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let age_ms = now_ms.saturating_sub(pair.last_updated_ms);

        let factor = if decay && age_ms > self.config.stale_threshold_ms {
            let halves = age_ms as f64 / self.config.half_life_ms as f64;
            (0.5f64.powf(halves)).max(self.config.min_decay_factor)
        } else {
            1.0
        };

        let inflate = |p: f64| -> f64 {
            // Blend toward a pessimistic multiple of the estimate itself.
            p * (factor + self.config.stale_inflation * (1.0 - factor))
        };

        let ttft_p95 = pair
            .streaming
            .as_ref()
            .filter(|s| !s.ttft_ms.is_empty())
            .map(|s| inflate(percentile_of(&s.ttft_ms, 95.0)));
        let stream_p95 = pair
            .streaming
            .as_ref()
            .filter(|s| !s.duration_ms.is_empty())
            .map(|s| inflate(percentile_of(&s.duration_ms, 95.0)));

        MetricsView {
            server: server.to_string(),
            model: model.to_string(),
            p50_ms: inflate(pair.p50_ms()),
            p95_ms: inflate(pair.p95_ms()),
            p99_ms: inflate(pair.p99_ms()),
            success_rate: pair.success_rate * factor + (1.0 - factor),
            throughput_rpm: pair.throughput_rpm * factor,
            avg_tokens_per_request: pair.avg_tokens_per_request,
            sample_count: pair.recent_ms.len(),
            ttft_p95_ms: ttft_p95,
            stream_duration_p95_ms: stream_p95,
            decay_factor: factor,
            last_updated_ms: pair.last_updated_ms,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AHashMap<String, PairMetrics>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AHashMap<String, PairMetrics>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn pair_key(server: &str, model: &str) -> String {
    format!("{}:{}", server, resolve_tag(model))
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once(':').unwrap_or((key, ""))
}
