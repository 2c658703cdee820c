//! Canonical registry of inference backends.
//!
//! The registry is the single source of truth for which backends exist
//! and what state they are in. Admin operations and health probes mutate
//! entries synchronously; the routing layer reads cloned snapshots, so a
//! flag flip is visible to the very next routing decision without a
//! half-updated entry ever being observed.

use crate::models::backend::Backend;
use crate::models::error::OrchestratorError;
use ahash::AHashMap;
use chrono::Utc;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Fleet membership change, consumed by the metrics aggregator (pruning)
/// and the breaker registry (drop policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Added { id: String },
    Removed { id: String },
    Updated { id: String },
}

/// In-memory map of backend id to entry, with uniqueness on id and URL.
///
/// # Examples
///
/// ```rust
/// use corral::models::backend::Backend;
/// use corral::services::fleet::FleetRegistry;
///
/// let fleet = FleetRegistry::new();
/// fleet
///     .add(Backend {
///         id: "gpu-01".to_string(),
///         url: "http://10.0.0.5:11434".to_string(),
///         models: vec!["llama3:8b".to_string()],
///         ..Backend::default()
///     })
///     .expect("added");
///
/// assert_eq!(fleet.list().len(), 1);
/// assert!(fleet.get("gpu-01").is_some());
/// ```
pub struct FleetRegistry {
    backends: RwLock<AHashMap<String, Backend>>,
    events: broadcast::Sender<FleetEvent>,
}

impl Default for FleetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backends: RwLock::new(AHashMap::new()),
            events,
        }
    }

    /// Subscribes to membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Adds a backend after validation.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] when the entry is invalid or
    /// its id or URL collides with an existing backend.
    pub fn add(&self, backend: Backend) -> Result<(), OrchestratorError> {
        backend.validate().map_err(OrchestratorError::Config)?;

        let mut backends = self.write();
        if backends.contains_key(&backend.id) {
            return Err(OrchestratorError::Config(format!(
                "Backend id {} already exists",
                backend.id
            )));
        }
        if backends.values().any(|b| b.url == backend.url) {
            return Err(OrchestratorError::Config(format!(
                "Backend url {} already registered",
                backend.url
            )));
        }

        info!("Adding backend {} at {}", backend.id, backend.url);
        let id = backend.id.clone();
        backends.insert(id.clone(), backend);
        drop(backends);

        let _ = self.events.send(FleetEvent::Added { id });
        Ok(())
    }

    /// Removes a backend, returning its last state.
    pub fn remove(&self, id: &str) -> Result<Backend, OrchestratorError> {
        let mut backends = self.write();
        let removed = backends
            .remove(id)
            .ok_or_else(|| OrchestratorError::ServerNotFound { id: id.to_string() })?;
        drop(backends);

        info!("Removed backend {}", id);
        let _ = self.events.send(FleetEvent::Removed { id: id.to_string() });
        Ok(removed)
    }

    /// Cloned entry for `id`.
    pub fn get(&self, id: &str) -> Option<Backend> {
        self.read().get(id).cloned()
    }

    /// Cloned snapshot of the whole fleet, sorted by id.
    pub fn list(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.read().values().cloned().collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }

    /// Ids of every registered backend.
    pub fn ids(&self) -> HashSet<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Flips the draining flag. Draining backends finish in-flight work
    /// but receive no new requests.
    pub fn set_draining(&self, id: &str, draining: bool) -> Result<(), OrchestratorError> {
        self.update(id, |b| b.draining = draining)
    }

    /// Flips the maintenance flag. Maintenance excludes the backend from
    /// routing and probing.
    pub fn set_maintenance(&self, id: &str, maintenance: bool) -> Result<(), OrchestratorError> {
        self.update(id, |b| b.maintenance = maintenance)
    }

    /// Marks a backend healthy or unhealthy. Normally driven by probes.
    pub fn set_healthy(&self, id: &str, healthy: bool) -> Result<(), OrchestratorError> {
        self.update(id, |b| b.healthy = healthy)
    }

    /// Adds `model` to a backend's advertised list, used after a
    /// successful warmup. No-op when already advertised.
    pub fn add_model(&self, id: &str, model: &str) -> Result<(), OrchestratorError> {
        self.update(id, |b| {
            if !b.advertises(model) {
                b.models.push(model.to_string());
            }
        })
    }

    /// Applies a probe outcome to the entry.
    pub fn apply_probe(
        &self,
        id: &str,
        healthy: bool,
        models: Option<Vec<String>>,
        loaded_models: Option<Vec<String>>,
        supports_native: Option<bool>,
        supports_openai: Option<bool>,
    ) -> Result<(), OrchestratorError> {
        self.update(id, |backend| {
            let was_healthy = backend.healthy;
            backend.healthy = healthy;
            if let Some(models) = models {
                backend.models = models;
            }
            if let Some(loaded) = loaded_models {
                backend.hardware.get_or_insert_with(Default::default).loaded_models = loaded;
            }
            if let Some(native) = supports_native {
                backend.capabilities.native = native;
            }
            if let Some(openai) = supports_openai {
                backend.capabilities.openai = openai;
            }
            backend.last_probe_ms = Some(Utc::now().timestamp_millis().max(0) as u64);

            if was_healthy && !healthy {
                warn!("Backend {} became unhealthy", backend.id);
            } else if !was_healthy && healthy {
                info!("Backend {} recovered", backend.id);
            }
        })
    }

    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Backend),
    ) -> Result<(), OrchestratorError> {
        let mut backends = self.write();
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ServerNotFound { id: id.to_string() })?;
        mutate(backend);
        drop(backends);

        let _ = self.events.send(FleetEvent::Updated { id: id.to_string() });
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AHashMap<String, Backend>> {
        self.backends.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AHashMap<String, Backend>> {
        self.backends.write().unwrap_or_else(|e| e.into_inner())
    }
}
