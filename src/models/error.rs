use crate::services::streaming::StreamingMetrics;
use serde::{Deserialize, Serialize};

/// Outcome classification for upstream failures.
///
/// The classifier maps raw errors onto these four buckets; the router and
/// the circuit breakers consume the classification rather than the raw
/// error, so the rest of the system never inspects status codes or
/// message text itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network resets, timeouts, refused connections, upstream 5xx.
    /// Contributes to breaker thresholds with reduced weight.
    Transient,
    /// Known recoverable (429, generic server error). Failover continues.
    Retryable,
    /// 4xx other than 429, unknown model, auth failures. Stops failover.
    NonRetryable,
    /// Catchall. Treated as retryable for breaker purposes.
    Unknown,
}

impl ErrorClass {
    /// Whether failover may continue to the next candidate after a
    /// failure of this class.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::NonRetryable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Retryable => "retryable",
            ErrorClass::NonRetryable => "non_retryable",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Failure reported by a caller-supplied upstream function.
///
/// The orchestrator never performs the generation call itself, so this is
/// the structured shape the host hands back when an attempt fails. The
/// `first_byte_written` flag is what prevents failover from double-writing
/// a streaming response: once any byte reached the client, the error
/// terminates the request instead of moving to the next candidate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    /// Human-readable failure description.
    pub message: String,

    /// HTTP status returned by the backend, when one was received.
    pub status: Option<u16>,

    /// True once any response byte was forwarded to the client.
    pub first_byte_written: bool,

    /// Streaming metrics captured before the failure, so a broken stream
    /// still contributes its partial TTFT and duration.
    pub partial: Option<StreamingMetrics>,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            first_byte_written: false,
            partial: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            first_byte_written: false,
            partial: None,
        }
    }

    pub fn mid_stream(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            first_byte_written: true,
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: StreamingMetrics) -> Self {
        self.partial = Some(partial);
        self
    }
}

/// Errors the orchestrator core returns to its host.
///
/// Every variant corresponds to a terminal outcome of a routing, queue, or
/// administrative operation. Per-candidate failures during failover are
/// recorded locally and folded into `AllCandidatesExhausted`; only the
/// final error surfaces.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("No healthy servers available for model {model}")]
    NoHealthyServers { model: String },

    #[error("Model {model} is not available on any backend")]
    ModelNotAvailable { model: String },

    #[error("Server {id} not found")]
    ServerNotFound { id: String },

    #[error("Server {id} is unhealthy")]
    ServerUnhealthy { id: String },

    #[error("Server {server} is cooling down for model {model} ({remaining_ms}ms remaining)")]
    InCooldown {
        server: String,
        model: String,
        remaining_ms: u64,
    },

    #[error("Server {server} is banned for model {model}")]
    Banned { server: String, model: String },

    #[error("Circuit breaker {key} is open")]
    BreakerOpen { key: String },

    #[error("Request queue is full")]
    QueueFull,

    #[error("Request queue is paused")]
    QueuePaused,

    #[error("Request queue was cleared")]
    QueueCleared,

    #[error("Request deadline exceeded while queued")]
    DeadlineExceeded,

    #[error("Upstream failure ({}): {source}", .class.as_str())]
    Upstream {
        class: ErrorClass,
        #[source]
        source: UpstreamError,
    },

    #[error("All {attempts} candidates exhausted for model {model}: {source}")]
    AllCandidatesExhausted {
        model: String,
        attempts: usize,
        /// Classification of each failed attempt, in the order tried.
        classifications: Vec<ErrorClass>,
        #[source]
        source: UpstreamError,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl OrchestratorError {
    /// Short machine-readable kind, suitable for log fields and debug
    /// headers assembled by the host.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NoHealthyServers { .. } => "no_healthy_servers",
            OrchestratorError::ModelNotAvailable { .. } => "model_not_available",
            OrchestratorError::ServerNotFound { .. } => "server_not_found",
            OrchestratorError::ServerUnhealthy { .. } => "server_unhealthy",
            OrchestratorError::InCooldown { .. } => "in_cooldown",
            OrchestratorError::Banned { .. } => "banned",
            OrchestratorError::BreakerOpen { .. } => "breaker_open",
            OrchestratorError::QueueFull => "queue_full",
            OrchestratorError::QueuePaused => "queue_paused",
            OrchestratorError::QueueCleared => "queue_cleared",
            OrchestratorError::DeadlineExceeded => "deadline_exceeded",
            OrchestratorError::Upstream { .. } => "upstream_failure",
            OrchestratorError::AllCandidatesExhausted { .. } => "all_candidates_exhausted",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Persistence(_) => "persistence",
        }
    }
}
