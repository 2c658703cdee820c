//! Integration tests for metrics aggregation, decay, and persistence.

use corral::models::settings::MetricsConfig;
use corral::services::metrics::{percentile, MetricsAggregator, RequestSample};
use corral::services::persistence::SnapshotStore;
use corral::services::streaming::StreamingMetrics;
use std::time::Duration;

fn sample(server: &str, model: &str, ms: u64, success: bool) -> RequestSample {
    RequestSample {
        server: server.to_string(),
        model: model.to_string(),
        duration: Duration::from_millis(ms),
        success,
        tokens_prompt: 12,
        tokens_generated: 48,
        streaming: None,
    }
}

#[test]
fn percentile_boundary_behaviours() {
    // Empty sample.
    assert_eq!(percentile(&[], 95.0), 0.0);

    // Single element.
    assert_eq!(percentile(&[420.0], 50.0), 420.0);
    assert_eq!(percentile(&[420.0], 99.0), 420.0);

    // p100 equals the maximum.
    let samples = [12.0, 7.0, 99.0, 45.0, 3.0];
    assert_eq!(percentile(&samples, 100.0), 99.0);
}

#[test]
fn derived_fields_recompute_on_each_update() {
    let metrics = MetricsAggregator::new(MetricsConfig::default());
    metrics.record(sample("s1", "llama3:8b", 100, true));
    metrics.record(sample("s1", "llama3:8b", 200, true));
    metrics.record(sample("s1", "llama3:8b", 300, false));

    let view = metrics.get_raw("s1", "llama3:8b").expect("view");
    assert!((view.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(view.sample_count, 3);
    assert_eq!(view.avg_tokens_per_request, 60.0);
}

#[test]
fn streaming_submetrics_track_ttft_and_duration() {
    let metrics = MetricsAggregator::new(MetricsConfig::default());
    for i in 0..5u64 {
        metrics.record(RequestSample {
            streaming: Some(StreamingMetrics {
                time_to_first_chunk_ms: 100.0 + i as f64,
                duration_ms: 900.0,
                chunks: 20,
            }),
            ..sample("s1", "llama3:8b", 950, true)
        });
    }

    let view = metrics.get_raw("s1", "llama3:8b").expect("view");
    assert_eq!(view.ttft_p95_ms, Some(104.0));
    assert_eq!(view.stream_duration_p95_ms, Some(900.0));

    let detail = metrics.detail("s1", "llama3:8b").expect("detail");
    assert_eq!(detail.streaming.expect("streaming").count, 5);
}

#[test]
fn decay_is_monotone_in_age() {
    let config = MetricsConfig {
        stale_threshold_ms: 0,
        half_life_ms: 5,
        ..MetricsConfig::default()
    };
    let metrics = MetricsAggregator::new(config);
    metrics.record(RequestSample {
        success: false,
        ..sample("s1", "m", 500, true)
    });

    let mut last_p95 = 0.0;
    let mut last_success = 0.0;
    let mut last_throughput = f64::MAX;
    for _ in 0..4 {
        std::thread::sleep(Duration::from_millis(10));
        let view = metrics.get("s1", "m").expect("view");

        assert!(view.p95_ms >= last_p95, "stale p95 must not shrink");
        assert!(view.success_rate >= last_success, "stale success drifts to 1");
        assert!(view.throughput_rpm <= last_throughput, "stale throughput drifts to 0");

        last_p95 = view.p95_ms;
        last_success = view.success_rate;
        last_throughput = view.throughput_rpm;
    }

    // Inflation is bounded by the configured multiple.
    let raw = metrics.get_raw("s1", "m").expect("raw");
    assert!(last_p95 <= raw.p95_ms * 1.5 + 1e-9);
}

#[tokio::test]
async fn snapshot_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metrics.json");

    let metrics =
        MetricsAggregator::with_store(MetricsConfig::default(), SnapshotStore::new(&path, 2));
    metrics.record(sample("s1", "llama3:8b", 150, true));
    metrics.record(sample("s1", "llama3:8b", 250, false));
    metrics.flush().await.expect("flush");

    let restarted =
        MetricsAggregator::with_store(MetricsConfig::default(), SnapshotStore::new(&path, 2));
    restarted.load().await.expect("load");

    assert_eq!(
        metrics.detail("s1", "llama3:8b"),
        restarted.detail("s1", "llama3:8b")
    );
}

#[tokio::test]
async fn flush_is_a_noop_when_nothing_changed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metrics.json");

    let metrics =
        MetricsAggregator::with_store(MetricsConfig::default(), SnapshotStore::new(&path, 2));
    metrics.record(sample("s1", "m", 100, true));
    metrics.flush().await.expect("flush");

    let first_write = std::fs::read(&path).expect("written");

    // No new samples: the debounced flusher skips the write entirely and
    // the backup rotation does not advance.
    metrics.flush().await.expect("flush");
    assert!(!path.with_extension("json.1").exists());
    assert_eq!(std::fs::read(&path).expect("still there"), first_write);
}
