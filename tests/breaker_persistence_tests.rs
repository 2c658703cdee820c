//! Breaker registry persistence round trips.

use corral::models::error::ErrorClass;
use corral::models::settings::BreakerConfig;
use corral::services::breaker_registry::{BreakerRegistry, BreakersFile};
use corral::services::circuit_breaker::{BreakerKey, CircuitState};
use corral::services::persistence::SnapshotStore;
use std::collections::HashSet;

fn key(server: &str, model: Option<&str>) -> BreakerKey {
    match model {
        Some(model) => BreakerKey::ServerModel(server.to_string(), model.to_string()),
        None => BreakerKey::Server(server.to_string()),
    }
}

#[tokio::test]
async fn registry_state_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path().join("breakers.json"), 2);

    let registry = BreakerRegistry::new(BreakerConfig::default());

    // A mix of states: open with failures, closed with history.
    let open = registry.get_or_create(&key("s1", Some("llama3:8b")));
    open.record_failure(ErrorClass::Transient);
    open.record_failure(ErrorClass::Retryable);
    open.force_open("persisted outage");

    let closed = registry.get_or_create(&key("s2", None));
    closed.record_success(std::time::Duration::from_millis(42));

    store.write(&registry.snapshot()).await.expect("write");

    let restored = BreakerRegistry::new(BreakerConfig::default());
    let file: BreakersFile = store.read().await.expect("read").expect("present");
    let known: HashSet<String> = ["s1".to_string(), "s2".to_string()].into_iter().collect();
    restored.restore(&file, &known);

    let open_restored = restored
        .get(&key("s1", Some("llama3:8b")))
        .expect("restored");
    let a = open.stats();
    let b = open_restored.stats();
    assert_eq!(b.state, CircuitState::Open);
    assert_eq!(a.failure_count, b.failure_count);
    assert_eq!(a.transient_errors, b.transient_errors);
    assert_eq!(a.adaptive_threshold, b.adaptive_threshold);
    assert_eq!(a.open_timeout_ms, b.open_timeout_ms);
    assert_eq!(a.transitions.len(), b.transitions.len());

    let closed_restored = restored.get(&key("s2", None)).expect("restored");
    assert_eq!(closed_restored.state(), CircuitState::Closed);
    assert_eq!(closed_restored.stats().success_count, 1);
}

#[tokio::test]
async fn restored_open_breaker_still_respects_its_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::new(dir.path().join("breakers.json"), 2);

    let registry = BreakerRegistry::new(BreakerConfig {
        open_timeout_ms: 60_000,
        ..BreakerConfig::default()
    });
    registry
        .get_or_create(&key("s1", None))
        .force_open("outage");

    store.write(&registry.snapshot()).await.expect("write");

    let restored = BreakerRegistry::new(BreakerConfig {
        open_timeout_ms: 60_000,
        ..BreakerConfig::default()
    });
    let file: BreakersFile = store.read().await.expect("read").expect("present");
    let known: HashSet<String> = ["s1".to_string()].into_iter().collect();
    restored.restore(&file, &known);

    let breaker = restored.get(&key("s1", None)).expect("restored");
    assert_eq!(breaker.state(), CircuitState::Open);
    // The remaining open time was persisted, so no probe is admitted yet.
    assert!(!breaker.can_execute().is_allowed());
}
