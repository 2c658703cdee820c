//! Orchestrator lifecycle and administrative surface.

use async_trait::async_trait;
use corral::models::backend::{Backend, Capabilities, Capability, Endpoint};
use corral::models::settings::{PersistenceConfig, Settings};
use corral::orchestrator::Orchestrator;
use corral::services::circuit_breaker::{BreakerKey, CircuitState};
use corral::services::health::{ProbeOutcome, Prober};
use corral::services::routing::{RequestOptions, RoutingContext, UpstreamOutcome};
use futures::FutureExt;
use std::sync::Arc;

struct AlwaysHealthy;

#[async_trait]
impl Prober for AlwaysHealthy {
    async fn probe(&self, backend: &Backend) -> ProbeOutcome {
        ProbeOutcome {
            healthy: true,
            models: backend.models.clone(),
            supports_native: true,
            supports_openai: true,
            ..ProbeOutcome::default()
        }
    }
}

fn settings(state_dir: &str) -> Settings {
    Settings {
        backends: vec![Backend {
            id: "gpu-01".to_string(),
            url: "http://10.0.0.5:11434".to_string(),
            capabilities: Capabilities {
                native: true,
                openai: true,
            },
            models: vec!["llama3:8b".to_string()],
            ..Backend::default()
        }],
        persistence: PersistenceConfig {
            enabled: true,
            state_dir: state_dir.to_string(),
            ..PersistenceConfig::default()
        },
        ..Settings::default()
    }
}

fn orchestrator(state_dir: &str) -> Orchestrator {
    Orchestrator::with_prober(settings(state_dir), Arc::new(AlwaysHealthy))
        .expect("orchestrator builds")
}

#[tokio::test]
async fn requests_route_through_the_wired_engine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(dir.path().to_str().expect("utf8 path"));
    orchestrator.start().await.expect("start");

    let options = RequestOptions::new(Endpoint::Generate, Capability::Native);
    let mut ctx = RoutingContext::default();
    let result = orchestrator
        .engine()
        .try_request_with_failover(
            "llama3:8b",
            |_backend| async { Ok(UpstreamOutcome::default()) }.boxed(),
            &options,
            &mut ctx,
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(ctx.selected_server_id.as_deref(), Some("gpu-01"));

    let views = orchestrator.metrics_snapshot();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].server, "gpu-01");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn breaker_state_survives_restart_through_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().to_str().expect("utf8 path").to_string();

    {
        let orchestrator = orchestrator(&state_dir);
        orchestrator.start().await.expect("start");
        orchestrator.force_open_breaker(
            &BreakerKey::Server("gpu-01".to_string()),
            "planned maintenance",
        );
        orchestrator.shutdown().await;
    }

    let restarted = orchestrator(&state_dir);
    restarted.start().await.expect("start");

    let stats = restarted.breaker_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].state, CircuitState::Open);

    restarted.shutdown().await;
}

#[tokio::test]
async fn removing_a_backend_prunes_all_derived_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(dir.path().to_str().expect("utf8 path"));
    orchestrator.start().await.expect("start");

    // Build up state tied to the backend.
    let options = RequestOptions::new(Endpoint::Chat, Capability::Native);
    let mut ctx = RoutingContext::default();
    orchestrator
        .engine()
        .try_request_with_failover(
            "llama3:8b",
            |_backend| async { Ok(UpstreamOutcome::default()) }.boxed(),
            &options,
            &mut ctx,
        )
        .await
        .expect("routes");
    orchestrator.ban("gpu-01", "llama3:8b");

    orchestrator.remove_backend("gpu-01").expect("removed");

    assert!(orchestrator.list_backends().is_empty());
    assert!(orchestrator.breaker_stats().is_empty());
    assert!(orchestrator.metrics_snapshot().is_empty());
    assert!(orchestrator.routing_stats().banned_pairs.is_empty());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn sweep_updates_backend_state_via_the_prober() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(dir.path().to_str().expect("utf8 path"));

    orchestrator
        .fleet()
        .set_healthy("gpu-01", false)
        .expect("flag");
    orchestrator.run_sweep_now().await;

    let entry = orchestrator.fleet().get("gpu-01").expect("present");
    assert!(entry.healthy);
    assert!(entry.last_probe_ms.is_some());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn draining_excludes_a_backend_from_routing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(dir.path().to_str().expect("utf8 path"));
    orchestrator.set_draining("gpu-01", true).expect("flag");

    let options = RequestOptions::new(Endpoint::Chat, Capability::Native);
    let mut ctx = RoutingContext::default();
    let result = orchestrator
        .engine()
        .try_request_with_failover(
            "llama3:8b",
            |_backend| async { Ok(UpstreamOutcome::default()) }.boxed(),
            &options,
            &mut ctx,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(ctx.available_server_count, 0);

    orchestrator.shutdown().await;
}
