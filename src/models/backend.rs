use crate::utils::model_tag::models_match;
use serde::{Deserialize, Serialize};

/// Upstream API shape a request requires.
///
/// Backends may speak the native inference protocol, the OpenAI-compatible
/// shape, or both. Requests declare which shape their payload uses and the
/// router only considers backends that advertise it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Native inference protocol (`/api/generate`, `/api/chat`, ...).
    Native,
    /// OpenAI-compatible shape (`/v1/chat/completions`, ...).
    Openai,
}

/// Kind of upstream operation a request performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Generate,
    Chat,
    Embeddings,
}

impl Endpoint {
    /// Stable lowercase name, used in logs and queue stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Generate => "generate",
            Endpoint::Chat => "chat",
            Endpoint::Embeddings => "embeddings",
        }
    }
}

/// Protocol capabilities a backend advertises.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Serves the native inference protocol.
    #[serde(default)]
    pub native: bool,

    /// Serves the OpenAI-compatible shape.
    #[serde(default)]
    pub openai: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Native => self.native,
            Capability::Openai => self.openai,
        }
    }
}

/// Last observed hardware state of a backend, reported by health probes.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HardwareSnapshot {
    /// Models currently loaded into memory.
    #[serde(default)]
    pub loaded_models: Vec<String>,

    /// VRAM currently in use, in bytes.
    #[serde(default)]
    pub vram_used_bytes: u64,

    /// Total VRAM, in bytes. Zero when unknown.
    #[serde(default)]
    pub vram_total_bytes: u64,
}

/// A single inference server in the fleet.
///
/// Backends are added through the administrative surface and afterwards
/// mutated only by health probes and admin operations. The routing layer
/// works on cloned snapshots, so a `Backend` value observed during a
/// routing decision stays internally consistent even while the registry
/// entry is being refreshed.
///
/// # Examples
///
/// ```rust
/// use corral::models::backend::{Backend, Capabilities};
///
/// let backend = Backend {
///     id: "gpu-01".to_string(),
///     url: "http://10.0.0.5:11434".to_string(),
///     capabilities: Capabilities { native: true, openai: true },
///     max_concurrency: 4,
///     models: vec!["llama3:8b".to_string()],
///     ..Backend::default()
/// };
///
/// assert!(backend.validate().is_ok());
/// assert!(backend.advertises("llama3:8b"));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Backend {
    /// Opaque unique identifier.
    pub id: String,

    /// Base URL including protocol, without a trailing slash.
    pub url: String,

    /// Protocol shapes this backend serves.
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Maximum concurrent in-flight requests this backend accepts (default: 4).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Models currently advertised by the backend.
    #[serde(default)]
    pub models: Vec<String>,

    /// Whether the last health probe succeeded (default: true, so a freshly
    /// added backend is routable before the first sweep).
    #[serde(default = "default_healthy")]
    pub healthy: bool,

    /// Draining backends finish in-flight work but receive no new requests.
    #[serde(default)]
    pub draining: bool,

    /// Maintenance backends are excluded from routing and probing.
    #[serde(default)]
    pub maintenance: bool,

    /// Optional reference to an API key held by the host (never the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,

    /// Hardware state from the most recent probe, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareSnapshot>,

    /// Unix milliseconds of the most recent probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_ms: Option<u64>,
}

fn default_max_concurrency() -> u32 {
    4
}

fn default_healthy() -> bool {
    true
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            capabilities: Capabilities::default(),
            max_concurrency: default_max_concurrency(),
            models: Vec::new(),
            healthy: default_healthy(),
            draining: false,
            maintenance: false,
            api_key_ref: None,
            hardware: None,
            last_probe_ms: None,
        }
    }
}

impl Backend {
    /// Validates the backend entry.
    ///
    /// # Errors
    ///
    /// Returns a descriptive message when the id is empty, the URL is
    /// missing its protocol, or `max_concurrency` is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Backend id must not be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!(
                "Backend url must start with http:// or https://: {}",
                self.url
            ));
        }

        if self.max_concurrency == 0 {
            return Err("Backend max_concurrency must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Whether this backend advertises `model`, treating a bare name and
    /// its `:latest` tag as the same model.
    pub fn advertises(&self, model: &str) -> bool {
        self.models.iter().any(|m| models_match(m, model))
    }

    /// Whether the backend is routable at all: healthy, not draining, and
    /// not under maintenance.
    pub fn is_available(&self) -> bool {
        self.healthy && !self.draining && !self.maintenance
    }
}
