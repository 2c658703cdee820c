//! The background probe loop: idle breakers recover without traffic.

use corral::models::error::UpstreamError;
use corral::models::settings::{BreakerConfig, RecoveryConfig};
use corral::services::breaker_registry::BreakerRegistry;
use corral::services::circuit_breaker::{BreakerKey, CircuitState};
use corral::services::recovery::{ProbeFn, RecoveryCoordinator};
use futures::FutureExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn registry(open_timeout_ms: u64) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(BreakerConfig {
        open_timeout_ms,
        max_open_timeout_ms: open_timeout_ms * 8,
        recovery_success_threshold: 1,
        ..BreakerConfig::default()
    }))
}

fn coordinator(scan_interval_ms: u64, probe_cooldown_ms: u64) -> Arc<RecoveryCoordinator> {
    Arc::new(RecoveryCoordinator::new(RecoveryConfig {
        scan_interval_ms,
        probe_cooldown_ms,
        ..RecoveryConfig::default()
    }))
}

async fn wait_for_state(
    registry: &BreakerRegistry,
    key: &BreakerKey,
    state: CircuitState,
) -> bool {
    for _ in 0..100 {
        if registry.get(key).map(|b| b.state()) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn idle_open_breaker_recovers_through_the_scan() {
    let registry = registry(30);
    let coordinator = coordinator(20, 10);
    let key = BreakerKey::Server("s1".to_string());
    registry.get_or_create(&key).force_open("outage");

    let probes = Arc::new(AtomicU32::new(0));
    let probes_in = Arc::clone(&probes);
    let probe_fn: ProbeFn = Arc::new(move |_key| {
        probes_in.fetch_add(1, Ordering::SeqCst);
        async { Ok(Duration::from_millis(5)) }.boxed()
    });

    let task = coordinator.start(Arc::clone(&registry), probe_fn);

    assert!(
        wait_for_state(&registry, &key, CircuitState::Closed).await,
        "breaker should close without any request traffic"
    );
    assert!(probes.load(Ordering::SeqCst) >= 1);
    assert_eq!(coordinator.recovery_probability(&key), 1.0);

    task.abort();
}

#[tokio::test]
async fn failing_probes_back_off_and_record_history() {
    let registry = registry(20);
    let coordinator = coordinator(15, 30);
    let key = BreakerKey::Server("s1".to_string());
    let breaker = registry.get_or_create(&key);
    breaker.force_open("outage");
    let base_timeout = breaker.stats().open_timeout_ms;

    let probe_fn: ProbeFn = Arc::new(move |_key| {
        async { Err(UpstreamError::with_status("service unavailable", 503)) }.boxed()
    });

    let task = coordinator.start(Arc::clone(&registry), probe_fn);
    tokio::time::sleep(Duration::from_millis(150)).await;
    task.abort();

    let stats = breaker.stats();
    assert_eq!(stats.state, CircuitState::Open);
    assert!(
        stats.open_timeout_ms >= base_timeout * 2,
        "failed probes must back the open timeout off"
    );
    assert!(coordinator.recovery_probability(&key) < 0.5);
}
