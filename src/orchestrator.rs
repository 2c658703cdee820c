//! Process-wide orchestrator facade.
//!
//! Owns the singletons (fleet registry, breaker registry, metrics
//! aggregator, request queue), wires the routing engine and schedulers
//! over them, and exposes the administrative surface as plain methods so
//! the host can mount whatever API it wants on top. Lifecycle is
//! `new -> start -> shutdown`: `start` restores persisted state and
//! spawns the background tasks, `shutdown` stops them and flushes
//! snapshots synchronously.

use crate::models::backend::Backend;
use crate::models::error::OrchestratorError;
use crate::models::settings::Settings;
use crate::services::breaker_registry::{BreakerRegistry, BreakersFile};
use crate::services::circuit_breaker::{BreakerKey, BreakerStats};
use crate::services::dispatcher::{DispatchFn, QueueDispatcher};
use crate::services::fleet::FleetRegistry;
use crate::services::health::{HealthScheduler, HttpProber, Prober};
use crate::services::load_balancer::LoadBalancer;
use crate::services::metrics::{MetricsAggregator, MetricsView, PairMetrics};
use crate::services::persistence::SnapshotStore;
use crate::services::queue::{QueueStats, RequestQueue};
use crate::services::recovery::{ProbeFn, RecoveryCoordinator, RecoveryEstimate};
use crate::services::routing::{RoutingEngine, RoutingStats, RoutingTable};
use crate::services::warmup::{WarmupFn, WarmupOutcome, WarmupRunner};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// The orchestrator core, fully wired.
///
/// # Examples
///
/// ```rust,no_run
/// use corral::models::settings::Settings;
/// use corral::orchestrator::Orchestrator;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = Orchestrator::new(Settings::default())?;
/// orchestrator.start().await?;
/// // ... serve requests through orchestrator.engine() ...
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    fleet: Arc<FleetRegistry>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    queue: Arc<RequestQueue>,
    table: Arc<RoutingTable>,
    engine: Arc<RoutingEngine>,
    recovery: Arc<RecoveryCoordinator>,
    health: Arc<HealthScheduler>,
    warmup: WarmupRunner,
    breaker_store: Option<SnapshotStore>,
    breakers_dirty: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the orchestrator with the default HTTP prober.
    pub fn new(settings: Settings) -> Result<Self, OrchestratorError> {
        let prober = HttpProber::new(settings.health.probe_timeout())
            .map_err(|e| OrchestratorError::Config(format!("cannot build prober: {}", e)))?;
        Self::with_prober(settings, Arc::new(prober))
    }

    /// Builds the orchestrator with a custom prober, mainly for tests.
    pub fn with_prober(
        settings: Settings,
        prober: Arc<dyn Prober>,
    ) -> Result<Self, OrchestratorError> {
        settings.validate().map_err(OrchestratorError::Config)?;

        let fleet = Arc::new(FleetRegistry::new());
        for backend in &settings.backends {
            fleet.add(backend.clone())?;
        }

        let table = Arc::new(RoutingTable::new(settings.routing.clone()));
        let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone()));

        let (metrics, breaker_store) = if settings.persistence.enabled {
            let dir = PathBuf::from(&settings.persistence.state_dir);
            let metrics_store = SnapshotStore::new(
                dir.join(&settings.persistence.metrics_file),
                settings.persistence.max_backups,
            );
            let breaker_store = SnapshotStore::new(
                dir.join(&settings.persistence.breakers_file),
                settings.persistence.max_backups,
            );
            (
                Arc::new(MetricsAggregator::with_store(
                    settings.metrics.clone(),
                    metrics_store,
                )),
                Some(breaker_store),
            )
        } else {
            (Arc::new(MetricsAggregator::new(settings.metrics.clone())), None)
        };

        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&fleet),
            Arc::clone(&metrics),
            Arc::clone(&breakers),
            Arc::clone(&table),
            settings.balancer.clone(),
        ));

        let recovery = Arc::new(RecoveryCoordinator::new(settings.recovery.clone()));

        let engine = Arc::new(RoutingEngine::new(
            Arc::clone(&fleet),
            balancer,
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            Arc::clone(&table),
            Some(Arc::clone(&recovery)),
        ));

        let health = Arc::new(HealthScheduler::new(
            Arc::clone(&fleet),
            Arc::clone(&breakers),
            prober,
            settings.health.clone(),
        ));

        let queue = Arc::new(RequestQueue::new(settings.queue.clone()));
        let warmup = WarmupRunner::new(Arc::clone(&fleet), settings.warmup.clone());

        Ok(Self {
            fleet,
            breakers,
            metrics,
            queue,
            table,
            engine,
            recovery,
            health,
            warmup,
            breaker_store,
            breakers_dirty: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restores persisted state and spawns the background tasks: health
    /// sweeps, the queue boost pass, and the debounced snapshot flushers.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if let Err(e) = self.metrics.load().await {
            warn!("Could not restore metrics snapshot: {}", e);
        }

        if let Some(store) = &self.breaker_store {
            match store.read::<BreakersFile>().await {
                Ok(Some(file)) => self.breakers.restore(&file, &self.fleet.ids()),
                Ok(None) => {}
                Err(e) => warn!("Could not restore breaker snapshot: {}", e),
            }
        }

        let mut tasks = self.lock_tasks();
        tasks.push(self.health.start());
        tasks.push(self.queue.start_boost_task());
        tasks.push(self.spawn_metrics_flusher());
        if self.breaker_store.is_some() {
            tasks.push(self.spawn_breaker_watcher());
            tasks.push(self.spawn_breaker_flusher());
        }
        drop(tasks);

        info!("Orchestrator started with {} backends", self.fleet.len());
        Ok(())
    }

    /// Starts the recovery probe loop with a host-supplied probe function.
    pub fn start_recovery_probes(&self, probe_fn: ProbeFn) {
        let handle = self.recovery.start(Arc::clone(&self.breakers), probe_fn);
        self.lock_tasks().push(handle);
    }

    /// Starts `workers` dispatcher loops draining the queue through the
    /// routing engine with a host-supplied executor.
    pub fn start_dispatcher(&self, dispatch: DispatchFn, workers: usize) {
        let dispatcher =
            QueueDispatcher::new(Arc::clone(&self.queue), Arc::clone(&self.engine), workers);
        self.lock_tasks().extend(dispatcher.start(dispatch));
    }

    /// Warms `model` on every available backend with a host-supplied
    /// load call.
    pub async fn warm_model_everywhere(&self, model: &str, warm: &WarmupFn) -> Vec<WarmupOutcome> {
        self.warmup.warm_fleet(model, warm).await
    }

    /// Warms `model` on one backend.
    pub async fn warm_model(&self, server: &str, model: &str, warm: &WarmupFn) -> WarmupOutcome {
        self.warmup.warm_model(server, model, warm).await
    }

    /// Stops the background tasks and flushes both snapshots.
    pub async fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        if let Err(e) = self.metrics.flush().await {
            warn!("Final metrics flush failed: {}", e);
        }
        if let Some(store) = &self.breaker_store {
            if let Err(e) = store.write(&self.breakers.snapshot()).await {
                warn!("Final breaker flush failed: {}", e);
            }
        }

        info!("Orchestrator stopped");
    }

    // Component accessors for the host.

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn fleet(&self) -> &Arc<FleetRegistry> {
        &self.fleet
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn health(&self) -> &Arc<HealthScheduler> {
        &self.health
    }

    // Administrative surface.

    pub fn add_backend(&self, backend: Backend) -> Result<(), OrchestratorError> {
        self.fleet.add(backend)
    }

    /// Removes a backend and prunes every piece of state keyed to it.
    pub fn remove_backend(&self, id: &str) -> Result<Backend, OrchestratorError> {
        let removed = self.fleet.remove(id)?;
        self.breakers.remove_server(id);
        self.metrics.remove_server(id);
        self.table.remove_server(id);
        Ok(removed)
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.fleet.list()
    }

    pub fn set_draining(&self, id: &str, draining: bool) -> Result<(), OrchestratorError> {
        self.fleet.set_draining(id, draining)
    }

    pub fn set_maintenance(&self, id: &str, maintenance: bool) -> Result<(), OrchestratorError> {
        self.fleet.set_maintenance(id, maintenance)
    }

    pub fn ban(&self, server: &str, model: &str) {
        self.table.ban(server, model);
    }

    pub fn unban(&self, server: &str, model: &str) {
        self.table.unban(server, model);
    }

    pub fn reset_server_breaker(&self, server: &str) -> bool {
        self.reset_breaker(&BreakerKey::Server(server.to_string()))
    }

    pub fn reset_model_breaker(&self, server: &str, model: &str) -> bool {
        self.reset_breaker(&BreakerKey::ServerModel(
            server.to_string(),
            model.to_string(),
        ))
    }

    fn reset_breaker(&self, key: &BreakerKey) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn force_open_breaker(&self, key: &BreakerKey, reason: &str) {
        self.breakers.get_or_create(key).force_open(reason);
    }

    pub fn force_close_breaker(&self, key: &BreakerKey, reason: &str) {
        self.breakers.get_or_create(key).force_close(reason);
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.table.stats()
    }

    pub fn metrics_snapshot(&self) -> Vec<MetricsView> {
        self.metrics.all()
    }

    pub fn metrics_detail(&self, server: &str, model: &str) -> Option<PairMetrics> {
        self.metrics.detail(server, model)
    }

    pub fn recovery_estimates(&self) -> Vec<RecoveryEstimate> {
        self.recovery.estimates()
    }

    /// Runs one health sweep immediately, outside the schedule.
    pub async fn run_sweep_now(&self) {
        self.health.run_sweep().await;
    }

    fn spawn_metrics_flusher(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = metrics.flush().await {
                    warn!("Metrics flush failed: {}", e);
                }
            }
        })
    }

    /// Marks the breaker snapshot dirty on every transition, so the
    /// flusher only writes when something actually changed.
    fn spawn_breaker_watcher(&self) -> JoinHandle<()> {
        let mut events = self.breakers.subscribe();
        let dirty = Arc::clone(&self.breakers_dirty);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) => dirty.store(true, Ordering::Relaxed),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        dirty.store(true, Ordering::Relaxed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_breaker_flusher(&self) -> JoinHandle<()> {
        let breakers = Arc::clone(&self.breakers);
        let dirty = Arc::clone(&self.breakers_dirty);
        let interval = self.metrics.flush_interval();
        let Some(store) = self.breaker_store.clone() else {
            return tokio::spawn(async {});
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if dirty.swap(false, Ordering::Relaxed) {
                    if let Err(e) = store.write(&breakers.snapshot()).await {
                        warn!("Breaker flush failed: {}", e);
                        dirty.store(true, Ordering::Relaxed);
                    }
                }
            }
        })
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
