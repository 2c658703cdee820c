//! Queue dispatcher: drains pending envelopes through the routing engine.
//!
//! The priority queue holds envelopes that could not be served
//! immediately; the dispatcher's worker loops pull them out in priority
//! order and run each one through failover. The outcome, success or
//! terminal error, resolves the envelope's continuation so the waiting
//! client always hears back. Workers idle on a short poll when the queue
//! is empty rather than holding a lock across awaits.

use crate::models::backend::Backend;
use crate::services::queue::{QueuedRequest, RequestQueue};
use crate::services::routing::{RequestOptions, RoutingContext, RoutingEngine, UpstreamFuture};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Host-supplied executor for queued requests. Receives the envelope (for
/// its payload and endpoint) and the selected backend.
pub type DispatchFn = Arc<dyn Fn(&QueuedRequest, Backend) -> UpstreamFuture + Send + Sync>;

/// Pulls envelopes off the queue and executes them with failover.
pub struct QueueDispatcher {
    queue: Arc<RequestQueue>,
    engine: Arc<RoutingEngine>,
    workers: usize,
    poll_interval: Duration,
}

impl QueueDispatcher {
    pub fn new(queue: Arc<RequestQueue>, engine: Arc<RoutingEngine>, workers: usize) -> Self {
        Self {
            queue,
            engine,
            workers: workers.max(1),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Spawns the worker loops. Handles are aborted on shutdown.
    pub fn start(&self, dispatch: DispatchFn) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let queue = Arc::clone(&self.queue);
                let engine = Arc::clone(&self.engine);
                let dispatch = Arc::clone(&dispatch);
                let poll_interval = self.poll_interval;

                tokio::spawn(async move {
                    loop {
                        let Some(request) = queue.dequeue() else {
                            tokio::time::sleep(poll_interval).await;
                            continue;
                        };

                        debug!(
                            "Worker {} dispatching request {} for {}",
                            worker, request.id, request.model
                        );
                        Self::execute(&engine, &dispatch, request).await;
                    }
                })
            })
            .collect()
    }

    /// Runs one envelope to completion and resolves its continuation.
    pub async fn execute(engine: &RoutingEngine, dispatch: &DispatchFn, request: QueuedRequest) {
        let options = RequestOptions::new(request.endpoint, request.capability);
        let mut ctx = RoutingContext::default();

        let result = engine
            .try_request_with_failover(
                &request.model,
                |backend| dispatch(&request, backend),
                &options,
                &mut ctx,
            )
            .await
            .map(|outcome| outcome.body.unwrap_or(serde_json::Value::Null));

        if let Err(error) = &result {
            warn!(
                "Queued request {} for {} failed: {}",
                request.id, request.model, error
            );
        }

        // A dropped receiver just means the client went away.
        let _ = request.responder.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::{Backend, Capabilities, Capability, Endpoint};
    use crate::models::error::OrchestratorError;
    use crate::models::settings::{
        BalancerConfig, BreakerConfig, MetricsConfig, QueueConfig, RoutingConfig,
    };
    use crate::services::breaker_registry::BreakerRegistry;
    use crate::services::fleet::FleetRegistry;
    use crate::services::load_balancer::LoadBalancer;
    use crate::services::metrics::MetricsAggregator;
    use crate::services::queue::QueuedRequest;
    use crate::services::routing::{RoutingTable, UpstreamOutcome};
    use futures::FutureExt;
    use serde_json::json;

    fn engine_with_backend(capabilities: Capabilities) -> Arc<RoutingEngine> {
        let fleet = Arc::new(FleetRegistry::new());
        fleet
            .add(Backend {
                id: "s1".to_string(),
                url: "http://s1:11434".to_string(),
                capabilities,
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
        Arc::new(RoutingEngine::new(
            fleet, balancer, breakers, metrics, table, None,
        ))
    }

    fn echo_dispatch() -> DispatchFn {
        Arc::new(|request: &QueuedRequest, _backend: Backend| {
            let payload = request.payload.clone();
            async move {
                Ok(UpstreamOutcome {
                    body: Some(json!({ "echo": payload })),
                    ..UpstreamOutcome::default()
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_resolve_envelopes() {
        let queue = Arc::new(RequestQueue::new(QueueConfig::default()));
        let engine = engine_with_backend(Capabilities {
            native: true,
            openai: true,
        });
        let dispatcher = QueueDispatcher::new(Arc::clone(&queue), engine, 2);

        let (request, rx) =
            QueuedRequest::new("llama3:8b", 3, Endpoint::Chat, json!({"prompt": "hi"}));
        assert!(queue.enqueue(request));

        let handles = dispatcher.start(echo_dispatch());

        let resolved = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("resolved in time")
            .expect("sender kept")
            .expect("dispatch succeeded");
        assert_eq!(resolved["echo"]["prompt"], "hi");
        assert!(queue.is_empty());

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn unroutable_envelopes_resolve_with_the_terminal_error() {
        let engine = engine_with_backend(Capabilities {
            native: true,
            openai: true,
        });
        let (request, rx) =
            QueuedRequest::new("unknown:model", 3, Endpoint::Chat, json!({}));

        QueueDispatcher::execute(&engine, &echo_dispatch(), request).await;

        let resolved = rx.await.expect("sender kept");
        assert!(matches!(
            resolved,
            Err(OrchestratorError::ModelNotAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn envelope_capability_drives_candidate_filtering() {
        // The only backend is native-only, so an openai-shaped envelope
        // finds no candidate.
        let engine = engine_with_backend(Capabilities {
            native: true,
            openai: false,
        });

        let (request, rx) = QueuedRequest::new("llama3:8b", 3, Endpoint::Chat, json!({}));
        let request = request.with_capability(Capability::Openai);

        QueueDispatcher::execute(&engine, &echo_dispatch(), request).await;

        let resolved = rx.await.expect("sender kept");
        assert!(matches!(
            resolved,
            Err(OrchestratorError::NoHealthyServers { .. })
        ));
    }
}
