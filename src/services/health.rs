//! Periodic health sweeps over the fleet.
//!
//! Each sweep probes every backend (maintenance excluded) with bounded
//! concurrency and a small pause between batches, so a large fleet never
//! sees a probe storm. A probe discovers capabilities and advertised
//! models: the native tag listing is tried first, then the
//! OpenAI-compatible model listing, plus a best-effort query for which
//! models are loaded. Probe outcomes refresh the fleet entry; a healthy
//! probe against a server whose server-level breaker is open force-closes
//! that breaker, while model-level breakers are left to the half-open
//! recovery path.

use crate::models::backend::Backend;
use crate::models::settings::HealthConfig;
use crate::services::breaker_registry::BreakerRegistry;
use crate::services::circuit_breaker::{BreakerKey, CircuitState};
use crate::services::fleet::FleetRegistry;
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Result of probing one backend.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub response_time: Duration,
    pub models: Vec<String>,
    pub loaded_models: Vec<String>,
    pub supports_native: bool,
    pub supports_openai: bool,
    pub error: Option<String>,
}

/// Performs the actual probe calls. The default implementation speaks
/// HTTP; tests substitute a scripted prober.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, backend: &Backend) -> ProbeOutcome;
}

/// HTTP prober: native tag listing, OpenAI model listing, loaded models.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Creates a prober with its own pooled client.
    ///
    /// # Errors
    ///
    /// Returns the underlying client build error, which only occurs on
    /// system-level TLS or resolver problems.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client })
    }

    async fn list_native_models(&self, base: &str) -> Result<Vec<String>, String> {
        let body: serde_json::Value = self
            .client
            .get(format!("{}/api/tags", base))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        Ok(extract_names(&body, "models", "name"))
    }

    async fn list_openai_models(&self, base: &str) -> Result<Vec<String>, String> {
        let body: serde_json::Value = self
            .client
            .get(format!("{}/v1/models", base))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        Ok(extract_names(&body, "data", "id"))
    }

    async fn list_loaded_models(&self, base: &str) -> Vec<String> {
        match self
            .client
            .get(format!("{}/api/ps", base))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json::<serde_json::Value>().await {
                Ok(body) => extract_names(&body, "models", "name"),
                Err(_) => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }
}

fn extract_names(body: &serde_json::Value, list_field: &str, name_field: &str) -> Vec<String> {
    body.get(list_field)
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get(name_field).and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, backend: &Backend) -> ProbeOutcome {
        let started = Instant::now();
        let base = backend.url.trim_end_matches('/');

        let native = self.list_native_models(base).await;
        let openai = self.list_openai_models(base).await;

        let supports_native = native.is_ok();
        let supports_openai = openai.is_ok();
        let healthy = supports_native || supports_openai;

        let models = match (&native, &openai) {
            (Ok(models), _) => models.clone(),
            (Err(_), Ok(models)) => models.clone(),
            (Err(e), Err(_)) => {
                debug!("Probe of {} failed: {}", backend.id, e);
                Vec::new()
            }
        };

        let loaded_models = if supports_native {
            self.list_loaded_models(base).await
        } else {
            Vec::new()
        };

        ProbeOutcome {
            healthy,
            response_time: started.elapsed(),
            models,
            loaded_models,
            supports_native,
            supports_openai,
            error: match (native, openai) {
                (Err(n), Err(o)) => Some(format!("native: {}; openai: {}", n, o)),
                _ => None,
            },
        }
    }
}

/// Per-backend and per-sweep health events.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    ProbeCompleted {
        id: String,
        healthy: bool,
        response_time_ms: u64,
    },
    SweepCompleted {
        probed: usize,
        healthy: usize,
        duration_ms: u64,
    },
}

/// Schedules sweeps and feeds their outcomes into the fleet and the
/// breaker registry.
pub struct HealthScheduler {
    fleet: Arc<FleetRegistry>,
    breakers: Arc<BreakerRegistry>,
    prober: Arc<dyn Prober>,
    config: HealthConfig,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthScheduler {
    pub fn new(
        fleet: Arc<FleetRegistry>,
        breakers: Arc<BreakerRegistry>,
        prober: Arc<dyn Prober>,
        config: HealthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fleet,
            breakers,
            prober,
            config,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Probes the whole fleet once.
    pub async fn run_sweep(&self) {
        let started = Instant::now();
        let backends: Vec<Backend> = self
            .fleet
            .list()
            .into_iter()
            .filter(|b| !b.maintenance)
            .collect();

        if backends.is_empty() {
            return;
        }

        let total = backends.len();
        let mut healthy = 0usize;
        let batches: Vec<&[Backend]> = backends.chunks(self.config.probe_concurrency).collect();
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            let probes = batch.iter().map(|backend| {
                let prober = Arc::clone(&self.prober);
                async move { (backend, prober.probe(backend).await) }
            });

            for (backend, outcome) in futures::future::join_all(probes).await {
                if outcome.healthy {
                    healthy += 1;
                }
                self.apply_outcome(backend, &outcome);
            }

            if i + 1 < batch_count {
                tokio::time::sleep(self.config.batch_delay()).await;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Health sweep finished: {}/{} healthy in {}ms",
            healthy, total, duration_ms
        );
        let _ = self.events.send(HealthEvent::SweepCompleted {
            probed: total,
            healthy,
            duration_ms,
        });
    }

    fn apply_outcome(&self, backend: &Backend, outcome: &ProbeOutcome) {
        if let Some(error) = &outcome.error {
            warn!("Backend {} probe failed: {}", backend.id, error);
        }

        let result = self.fleet.apply_probe(
            &backend.id,
            outcome.healthy,
            if outcome.models.is_empty() && !outcome.healthy {
                None
            } else {
                Some(outcome.models.clone())
            },
            Some(outcome.loaded_models.clone()),
            Some(outcome.supports_native),
            Some(outcome.supports_openai),
        );
        if result.is_err() {
            // Backend was removed while the probe was in flight.
            return;
        }

        if outcome.healthy {
            let key = BreakerKey::Server(backend.id.clone());
            if let Some(breaker) = self.breakers.get(&key) {
                if breaker.state() == CircuitState::Open {
                    info!(
                        "Force-closing breaker {} after healthy probe",
                        backend.id
                    );
                    breaker.force_close("healthy probe");
                }
            }
        }

        let _ = self.events.send(HealthEvent::ProbeCompleted {
            id: backend.id.clone(),
            healthy: outcome.healthy,
            response_time_ms: outcome.response_time.as_millis() as u64,
        });
    }

    /// Spawns the sweep loop. The handle is aborted on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                scheduler.run_sweep().await;

                let interval = scheduler.config.interval();
                // Jitter keeps a restarted fleet of orchestrators from
                // sweeping in lockstep.
                let jitter_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..=interval.as_millis().max(10) as u64 / 10)
                };
                tokio::time::sleep(interval + Duration::from_millis(jitter_ms)).await;
            }
        })
    }
}
