//! Model warmup with classification-aware retries.
//!
//! Warming pulls a model into a backend's memory ahead of traffic, so the
//! first real request doesn't pay the load cost. The actual load call is
//! host-supplied (it differs per protocol); this module contributes the
//! retry discipline around it: transient and retryable failures back off
//! and try again, while non-retryable and unknown failures stop
//! immediately. Unknown errors retry for routing purposes but not here,
//! where an unclassified failure usually means the model name itself is
//! wrong.

use crate::models::backend::Backend;
use crate::models::error::{ErrorClass, OrchestratorError, UpstreamError};
use crate::models::settings::WarmupConfig;
use crate::services::classifier;
use crate::services::fleet::FleetRegistry;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::Arc;

/// Host-supplied model load call.
pub type WarmupFn =
    Arc<dyn Fn(Backend, String) -> BoxFuture<'static, Result<(), UpstreamError>> + Send + Sync>;

/// Outcome of warming one backend.
#[derive(Debug)]
pub struct WarmupOutcome {
    pub server: String,
    pub attempts: u32,
    pub result: Result<(), OrchestratorError>,
}

/// Drives warmup calls across the fleet.
pub struct WarmupRunner {
    fleet: Arc<FleetRegistry>,
    config: WarmupConfig,
}

impl WarmupRunner {
    pub fn new(fleet: Arc<FleetRegistry>, config: WarmupConfig) -> Self {
        Self { fleet, config }
    }

    /// Warms `model` on one backend, retrying recoverable failures with
    /// exponential backoff. On success the model is added to the
    /// backend's advertised list so routing can use it right away.
    pub async fn warm_model(
        &self,
        server_id: &str,
        model: &str,
        warm: &WarmupFn,
    ) -> WarmupOutcome {
        let backend = match self.fleet.get(server_id) {
            Some(backend) => backend,
            None => {
                return WarmupOutcome {
                    server: server_id.to_string(),
                    attempts: 0,
                    result: Err(OrchestratorError::ServerNotFound {
                        id: server_id.to_string(),
                    }),
                }
            }
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!(
                "Warming {} on {} (attempt {}/{})",
                model, server_id, attempts, self.config.max_attempts
            );

            match warm(backend.clone(), model.to_string()).await {
                Ok(()) => {
                    info!("Warmed {} on {} after {} attempts", model, server_id, attempts);
                    if let Err(e) = self.fleet.add_model(server_id, model) {
                        warn!("Backend {} vanished during warmup: {}", server_id, e);
                    }
                    return WarmupOutcome {
                        server: server_id.to_string(),
                        attempts,
                        result: Ok(()),
                    };
                }
                Err(error) => {
                    let class = classifier::classify(&error);
                    let recoverable =
                        matches!(class, ErrorClass::Transient | ErrorClass::Retryable);

                    if !recoverable || attempts >= self.config.max_attempts {
                        warn!(
                            "Warmup of {} on {} failed after {} attempts ({}): {}",
                            model,
                            server_id,
                            attempts,
                            class.as_str(),
                            error
                        );
                        return WarmupOutcome {
                            server: server_id.to_string(),
                            attempts,
                            result: Err(OrchestratorError::Upstream {
                                class,
                                source: error,
                            }),
                        };
                    }

                    let backoff = self.config.backoff_for(attempts);
                    debug!(
                        "Warmup of {} on {} hit a {} error, retrying in {}ms",
                        model,
                        server_id,
                        class.as_str(),
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Warms `model` on every available backend, sequentially. Returns
    /// one outcome per backend tried.
    pub async fn warm_fleet(&self, model: &str, warm: &WarmupFn) -> Vec<WarmupOutcome> {
        let mut outcomes = Vec::new();
        for backend in self.fleet.list() {
            if !backend.is_available() {
                continue;
            }
            outcomes.push(self.warm_model(&backend.id, model, warm).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fleet_with_backend() -> Arc<FleetRegistry> {
        let fleet = Arc::new(FleetRegistry::new());
        fleet
            .add(Backend {
                id: "s1".to_string(),
                url: "http://s1:11434".to_string(),
                models: vec!["llama3:8b".to_string()],
                ..Backend::default()
            })
            .expect("added");
        fleet
    }

    fn fast_config() -> WarmupConfig {
        WarmupConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..WarmupConfig::default()
        }
    }

    fn scripted(failures_before_success: u32, error: UpstreamError) -> (WarmupFn, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let warm: WarmupFn = Arc::new(move |_backend, _model| {
            let call = calls_in.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            async move {
                if call < failures_before_success {
                    Err(error)
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        (warm, calls)
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let fleet = fleet_with_backend();
        let runner = WarmupRunner::new(Arc::clone(&fleet), fast_config());
        let (warm, calls) = scripted(2, UpstreamError::with_status("service unavailable", 503));

        let outcome = runner.warm_model("s1", "mistral:7b", &warm).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The warmed model is now advertised.
        assert!(fleet.get("s1").expect("present").advertises("mistral:7b"));
    }

    #[tokio::test]
    async fn non_retryable_failures_stop_immediately() {
        let runner = WarmupRunner::new(fleet_with_backend(), fast_config());
        let (warm, calls) = scripted(10, UpstreamError::with_status("model not found", 404));

        let outcome = runner.warm_model("s1", "ghost:1b", &warm).await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_failures_do_not_retry() {
        let runner = WarmupRunner::new(fleet_with_backend(), fast_config());
        let (warm, calls) = scripted(10, UpstreamError::new("something odd happened"));

        let outcome = runner.warm_model("s1", "mistral:7b", &warm).await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let runner = WarmupRunner::new(fleet_with_backend(), fast_config());
        let (warm, calls) = scripted(10, UpstreamError::with_status("bad gateway", 502));

        let outcome = runner.warm_model("s1", "mistral:7b", &warm).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = WarmupConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
    }
}
