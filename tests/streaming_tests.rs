//! Streaming hand-off through the routing engine.
//!
//! These tests compose the pieces the way a host does: the upstream
//! function copies a chunk stream to the client with activity timeouts
//! and reports streaming metrics (or a mid-stream failure) back to the
//! engine.

use corral::models::backend::{Backend, Capabilities, Capability, Endpoint};
use corral::models::error::{OrchestratorError, UpstreamError};
use corral::models::settings::{
    BalancerConfig, BreakerConfig, MetricsConfig, RoutingConfig,
};
use corral::services::breaker_registry::BreakerRegistry;
use corral::services::fleet::FleetRegistry;
use corral::services::load_balancer::LoadBalancer;
use corral::services::metrics::MetricsAggregator;
use corral::services::routing::{
    RequestOptions, RoutingContext, RoutingEngine, RoutingTable, UpstreamOutcome,
};
use corral::services::streaming::{copy_stream, StreamCopyError};
use futures::FutureExt;
use futures_util::stream;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    metrics: Arc<MetricsAggregator>,
    engine: RoutingEngine,
}

fn harness() -> Harness {
    let fleet = Arc::new(FleetRegistry::new());
    fleet
        .add(Backend {
            id: "s1".to_string(),
            url: "http://s1:11434".to_string(),
            capabilities: Capabilities {
                native: true,
                openai: true,
            },
            models: vec!["llama3:8b".to_string()],
            ..Backend::default()
        })
        .expect("added");

    let metrics = Arc::new(MetricsAggregator::new(MetricsConfig::default()));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let table = Arc::new(RoutingTable::new(RoutingConfig::default()));
    let balancer = Arc::new(LoadBalancer::new(
        Arc::clone(&fleet),
        Arc::clone(&metrics),
        Arc::clone(&breakers),
        Arc::clone(&table),
        BalancerConfig::default(),
    ));
    let engine = RoutingEngine::new(
        fleet,
        balancer,
        breakers,
        Arc::clone(&metrics),
        table,
        None,
    );

    Harness { metrics, engine }
}

#[tokio::test]
async fn streamed_tokens_reach_the_client_and_the_metrics() {
    let h = harness();
    let client_buffer = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&client_buffer);

    let options = RequestOptions::new(Endpoint::Generate, Capability::Native).streaming(true);
    let mut ctx = RoutingContext::default();
    let result = h
        .engine
        .try_request_with_failover(
            "llama3:8b",
            move |_backend| {
                let sink = Arc::clone(&sink);
                async move {
                    let chunks: Vec<Result<&str, Infallible>> =
                        vec![Ok("The"), Ok(" answer"), Ok(" is"), Ok(" 42")];
                    let streaming = copy_stream(
                        stream::iter(chunks),
                        |chunk| {
                            sink.lock().unwrap().push_str(chunk);
                            async { Ok(()) }
                        },
                        Duration::from_secs(1),
                        Duration::from_secs(1),
                    )
                    .await
                    .map_err(|e| UpstreamError::new(e.to_string()))?;

                    Ok(UpstreamOutcome {
                        tokens_generated: streaming.chunks,
                        streaming: Some(streaming),
                        ..UpstreamOutcome::default()
                    })
                }
                .boxed()
            },
            &options,
            &mut ctx,
        )
        .await;

    let outcome = result.expect("stream completes");
    assert_eq!(outcome.streaming.expect("metrics").chunks, 4);
    assert_eq!(*client_buffer.lock().unwrap(), "The answer is 42");

    let detail = h.metrics.detail("s1", "llama3:8b").expect("recorded");
    let streaming = detail.streaming.expect("streaming sub-record");
    assert_eq!(streaming.count, 1);
    assert_eq!(streaming.ttft_ms.len(), 1);
}

#[tokio::test]
async fn stalled_stream_after_first_chunk_terminates_without_retry() {
    let h = harness();

    let options = RequestOptions::new(Endpoint::Generate, Capability::Native).streaming(true);
    let mut ctx = RoutingContext::default();
    let result = h
        .engine
        .try_request_with_failover(
            "llama3:8b",
            move |_backend| {
                async move {
                    let chunks = stream::iter(vec![Ok::<&str, Infallible>("partial")])
                        .chain(stream::pending());
                    let error = copy_stream(
                        chunks,
                        |_chunk| async { Ok(()) },
                        Duration::from_millis(100),
                        Duration::from_millis(20),
                    )
                    .await
                    .expect_err("must stall");

                    assert!(matches!(
                        error,
                        StreamCopyError::TimedOut {
                            first_chunk_written: true
                        }
                    ));
                    Err(UpstreamError::mid_stream(error.to_string()))
                }
                .boxed()
            },
            &options,
            &mut ctx,
        )
        .await;

    // Terminal for the stream: surfaced, not retried.
    assert!(matches!(result, Err(OrchestratorError::Upstream { .. })));
    assert_eq!(ctx.retry_count, 0);
    assert_eq!(ctx.tried.len(), 1);

    // The failure still landed in the metrics.
    let view = h.metrics.get_raw("s1", "llama3:8b").expect("recorded");
    assert_eq!(view.sample_count, 1);
    assert!(view.success_rate < 1.0);
}
