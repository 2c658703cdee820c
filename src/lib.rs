//! # Corral
//!
//! A multi-backend orchestrator core for model-inference fleets. Corral
//! sits between a serving layer and a fleet of inference servers, picks a
//! healthy backend for every generation, chat, or embedding request, and
//! keeps the fleet protected while doing so: per-(server, model) circuit
//! breakers, failure cooldowns, priority queueing, and metrics-driven
//! load balancing with failover.
//!
//! The crate is protocol-agnostic by design. The host supplies an
//! upstream function that performs the actual wire call (native protocol
//! or OpenAI-compatible shape) and streams to the client where
//! applicable; corral decides *where* the call goes and records what
//! happened.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corral::models::backend::{Backend, Capabilities, Capability, Endpoint};
//! use corral::models::settings::Settings;
//! use corral::orchestrator::Orchestrator;
//! use corral::services::routing::{RequestOptions, RoutingContext, UpstreamOutcome};
//! use futures::FutureExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(Settings::default())?;
//!     orchestrator.add_backend(Backend {
//!         id: "gpu-01".to_string(),
//!         url: "http://10.0.0.5:11434".to_string(),
//!         capabilities: Capabilities { native: true, openai: true },
//!         models: vec!["llama3:8b".to_string()],
//!         ..Backend::default()
//!     })?;
//!     orchestrator.start().await?;
//!
//!     let options = RequestOptions::new(Endpoint::Chat, Capability::Native);
//!     let mut ctx = RoutingContext::default();
//!     let result = orchestrator
//!         .engine()
//!         .try_request_with_failover(
//!             "llama3:8b",
//!             |backend| {
//!                 async move {
//!                     // Perform the real upstream call against backend.url here.
//!                     let _ = backend;
//!                     Ok(UpstreamOutcome::default())
//!                 }
//!                 .boxed()
//!             },
//!             &options,
//!             &mut ctx,
//!         )
//!         .await;
//!
//!     println!("routed via {:?}: {:?}", ctx.selected_server_id, result.is_ok());
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Subsystems
//!
//! ### Routing
//! - **Load Balancer**: weighted scoring over p95 latency, success rate,
//!   and capacity, with soft threshold penalties
//! - **Failover**: ranked candidates tried in order, with per-candidate
//!   freshness re-checks and exponential per-pair cooldowns
//! - **Streaming**: activity-based timeouts; no failover once a byte
//!   reached the client
//!
//! ### Protection
//! - **Circuit Breakers**: adaptive thresholds per server and per
//!   (server, model), half-open single-probe recovery with backoff
//! - **Recovery Coordinator**: process-wide probe throttling
//! - **Priority Queue**: bounded, age-boosted, deadline-aware
//!
//! ### Observability & State
//! - **Metrics**: rolling windows, bounded percentile samples, staleness
//!   decay, debounced JSON snapshots
//! - **Health Scheduler**: periodic capability and model discovery probes
//! - **Persistence**: atomic snapshot files with rotated backups
//!
//! ## Module Organization
//!
//! - **[`config`]** - Configuration file loading
//! - **[`models`]** - Data models, errors, and configuration sections
//! - **[`services`]** - The subsystems listed above
//! - **[`orchestrator`]** - Process-wide facade and admin surface
//! - **[`logs`]** - Logger setup
//! - **[`utils`]** - Small shared helpers

pub mod config;
pub mod logs;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
