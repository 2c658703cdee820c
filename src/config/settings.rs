use crate::models::settings::Settings;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Hard cap on configuration file size. Anything larger is almost
/// certainly not a config file.
const MAX_CONFIG_BYTES: u64 = 10 * 1024 * 1024;

/// Loads and validates orchestrator configuration from the file system.
///
/// The path comes from `CORRAL_CONFIG_PATH` when set, falling back to
/// `./config.json`. The file must live inside the working directory
/// (symlinks are resolved before the check) and stay under a 10 MB size
/// cap; both restrictions exist so a misconfigured deployment cannot be
/// pointed at arbitrary host files.
///
/// # File Format
///
/// Every section is optional and falls back to its defaults:
/// ```json
/// {
///   "backends": [
///     {
///       "id": "gpu-01",
///       "url": "http://10.0.0.5:11434",
///       "capabilities": { "native": true, "openai": true },
///       "max_concurrency": 4,
///       "models": ["llama3:8b"]
///     }
///   ],
///   "balancer": { "latency_weight": 0.4, "success_weight": 0.3 },
///   "breaker": { "failure_threshold": 5 },
///   "queue": { "max_size": 100 }
/// }
/// ```
///
/// # Errors
///
/// Fails when the file is missing, escapes the working directory,
/// exceeds the size cap, is not valid JSON, or parses into settings that
/// do not validate. A missing file is a hard error rather than silent
/// defaults; running with an ignored config is worse than not starting.
pub fn load_settings() -> Result<Settings, Box<dyn std::error::Error>> {
    let raw_path =
        std::env::var("CORRAL_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    debug!("Loading configuration from {}", raw_path);

    let path = confined_config_path(&raw_path)?;
    let content = read_config_bounded(&path)?;

    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| format!("config {} is not valid JSON: {}", raw_path, e))?;

    settings
        .validate()
        .map_err(|e| format!("config {} failed validation: {}", raw_path, e))?;

    debug!(
        "Configuration loaded: {} backends, queue capacity {}",
        settings.backends.len(),
        settings.queue.max_size
    );
    Ok(settings)
}

/// Resolves `raw` to an absolute path and refuses anything that lands
/// outside the working directory once symlinks are followed.
fn confined_config_path(raw: &str) -> Result<PathBuf, String> {
    let resolved = Path::new(raw)
        .canonicalize()
        .map_err(|e| format!("config {} is not accessible: {}", raw, e))?;

    let workdir = std::env::current_dir()
        .map_err(|e| format!("working directory is unavailable: {}", e))?;

    if !resolved.starts_with(&workdir) {
        return Err(format!(
            "config {} resolves outside the working directory",
            raw
        ));
    }

    Ok(resolved)
}

/// Reads the config file after checking it against the size cap.
fn read_config_bounded(path: &Path) -> Result<String, String> {
    let size = fs::metadata(path)
        .map_err(|e| format!("cannot stat config {}: {}", path.display(), e))?
        .len();

    if size > MAX_CONFIG_BYTES {
        return Err(format!(
            "config {} is {} bytes, refusing anything over {}",
            path.display(),
            size,
            MAX_CONFIG_BYTES
        ));
    }

    fs::read_to_string(path).map_err(|e| format!("cannot read config {}: {}", path.display(), e))
}
