//! Ownership and lookup of circuit breakers.
//!
//! The registry lazily creates breakers on first reference, one per
//! server and one per (server, model) pair, and fans their state
//! transitions out on a broadcast channel. Absence of a breaker means
//! implicitly closed: lookups that miss simply permit execution.

use crate::models::settings::BreakerConfig;
use crate::services::circuit_breaker::{
    BreakerKey, BreakerSnapshot, BreakerStats, BreakerTransition, CircuitBreaker, CircuitState,
};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Schema tag embedded in persisted breaker files.
pub const BREAKER_SCHEMA: u32 = 1;

/// Persisted layout of the whole registry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakersFile {
    pub schema: u32,
    pub timestamp: DateTime<Utc>,
    pub breakers: AHashMap<String, BreakerSnapshot>,
}

/// Registry of server-level and model-level breakers.
///
/// # Examples
///
/// ```rust
/// use corral::models::settings::BreakerConfig;
/// use corral::services::breaker_registry::BreakerRegistry;
/// use corral::services::circuit_breaker::BreakerKey;
///
/// let registry = BreakerRegistry::new(BreakerConfig::default());
/// let key = BreakerKey::ServerModel("gpu-01".to_string(), "llama3:8b".to_string());
///
/// // Absent breakers permit execution.
/// assert!(!registry.is_open(&key));
///
/// let breaker = registry.get_or_create(&key);
/// assert!(breaker.can_execute().is_allowed());
/// ```
pub struct BreakerRegistry {
    breakers: RwLock<AHashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    events: broadcast::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            breakers: RwLock::new(AHashMap::new()),
            config,
            events,
        }
    }

    /// Subscribes to breaker state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Returns the breaker for `key` if one was ever created.
    pub fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.read().get(&key.to_string()).cloned()
    }

    /// Returns the breaker for `key`, creating it with the registry
    /// default config on first reference.
    pub fn get_or_create(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        let storage_key = key.to_string();

        if let Some(existing) = self.read().get(&storage_key) {
            return Arc::clone(existing);
        }

        let mut breakers = self.write();
        Arc::clone(breakers.entry(storage_key).or_insert_with(|| {
            debug!("Creating breaker {}", key);
            Arc::new(CircuitBreaker::new(
                key.clone(),
                self.config.clone(),
                Some(self.events.clone()),
            ))
        }))
    }

    /// Whether the breaker for `key` is currently open. Absent breakers
    /// count as closed.
    pub fn is_open(&self, key: &BreakerKey) -> bool {
        self.get(key)
            .map(|b| b.state() == CircuitState::Open)
            .unwrap_or(false)
    }

    /// Whether the breaker for `key` would reject an attempt right now.
    /// Open breakers past their timeout do not block: the next attempt
    /// becomes the half-open probe.
    pub fn is_blocking(&self, key: &BreakerKey) -> bool {
        self.get(key).map(|b| !b.would_permit()).unwrap_or(false)
    }

    /// Current state of every known breaker.
    pub fn stats(&self) -> Vec<BreakerStats> {
        self.read().values().map(|b| b.stats()).collect()
    }

    /// All known breakers, for iteration.
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.read().values().cloned().collect()
    }

    /// Drops the server-level breaker and every model-level breaker of a
    /// removed server. Stale backoff state must not survive a re-add.
    pub fn remove_server(&self, server_id: &str) {
        let mut breakers = self.write();
        breakers.retain(|_, breaker| breaker.key().server() != server_id);
    }

    /// Serializes every breaker for persistence.
    pub fn snapshot(&self) -> BreakersFile {
        let breakers = self
            .read()
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.snapshot()))
            .collect();

        BreakersFile {
            schema: BREAKER_SCHEMA,
            timestamp: Utc::now(),
            breakers,
        }
    }

    /// Restores breakers from a persisted file, discarding entries whose
    /// server is no longer part of the fleet.
    pub fn restore(&self, file: &BreakersFile, known_servers: &HashSet<String>) {
        if file.schema != BREAKER_SCHEMA {
            warn!(
                "Skipping breaker snapshot with schema {} (expected {})",
                file.schema, BREAKER_SCHEMA
            );
            return;
        }

        let mut restored = 0usize;
        let mut discarded = 0usize;

        for (raw_key, snapshot) in &file.breakers {
            let key = BreakerKey::parse(raw_key);
            if !known_servers.contains(key.server()) {
                discarded += 1;
                continue;
            }

            self.get_or_create(&key).restore(snapshot);
            restored += 1;
        }

        debug!(
            "Restored {} breakers ({} discarded for unknown servers)",
            restored, discarded
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AHashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AHashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakers_are_created_lazily_and_shared() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let key = BreakerKey::Server("s1".to_string());

        assert!(registry.get(&key).is_none());
        let a = registry.get_or_create(&key);
        let b = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_server_drops_both_levels() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        registry.get_or_create(&BreakerKey::Server("s1".to_string()));
        registry.get_or_create(&BreakerKey::ServerModel(
            "s1".to_string(),
            "llama3:8b".to_string(),
        ));
        registry.get_or_create(&BreakerKey::Server("s2".to_string()));

        registry.remove_server("s1");

        assert_eq!(registry.all().len(), 1);
        assert!(registry.get(&BreakerKey::Server("s2".to_string())).is_some());
    }

    #[test]
    fn restore_discards_unknown_servers() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        registry
            .get_or_create(&BreakerKey::Server("kept".to_string()))
            .force_open("test");
        registry
            .get_or_create(&BreakerKey::Server("gone".to_string()))
            .force_open("test");

        let file = registry.snapshot();

        let fresh = BreakerRegistry::new(BreakerConfig::default());
        let known: HashSet<String> = ["kept".to_string()].into_iter().collect();
        fresh.restore(&file, &known);

        assert!(fresh.is_open(&BreakerKey::Server("kept".to_string())));
        assert!(fresh.get(&BreakerKey::Server("gone".to_string())).is_none());
    }

    #[test]
    fn restore_skips_schema_mismatch() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        registry
            .get_or_create(&BreakerKey::Server("s1".to_string()))
            .force_open("test");

        let mut file = registry.snapshot();
        file.schema = 99;

        let fresh = BreakerRegistry::new(BreakerConfig::default());
        let known: HashSet<String> = ["s1".to_string()].into_iter().collect();
        fresh.restore(&file, &known);

        assert!(fresh.all().is_empty());
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let mut events = registry.subscribe();

        registry
            .get_or_create(&BreakerKey::Server("s1".to_string()))
            .force_open("test");

        let event = events.recv().await.expect("transition event");
        assert_eq!(event.to, CircuitState::Open);
        assert_eq!(event.key, BreakerKey::Server("s1".to_string()));
    }
}
