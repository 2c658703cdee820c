//! Advanced configuration validation with detailed reporting.
//!
//! `Settings::validate()` answers "can this configuration run at all";
//! this module answers "should it". It collects hard errors alongside
//! warnings and tuning recommendations, for surfacing at startup or from
//! an admin endpoint.

use crate::models::settings::Settings;
use log::{info, warn};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_recommendation(&mut self, recommendation: String) {
        self.recommendations.push(recommendation);
    }
}

/// Configuration validator with fleet and tuning checks.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Performs comprehensive validation of orchestrator settings.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_basic_structure(settings, &mut result);
        Self::validate_fleet(settings, &mut result);
        Self::validate_tuning(settings, &mut result);

        Self::log_results(&result);
        result
    }

    fn validate_basic_structure(settings: &Settings, result: &mut ValidationResult) {
        if let Err(e) = settings.validate() {
            result.add_error(e);
        }
    }

    fn validate_fleet(settings: &Settings, result: &mut ValidationResult) {
        if settings.backends.is_empty() {
            result.add_warning(
                "No backends configured; every request will fail until one is added".to_string(),
            );
            return;
        }

        if settings.backends.len() == 1 {
            result.add_warning(
                "Only one backend configured; failover has nowhere to go".to_string(),
            );
        }

        let mut ids = HashSet::new();
        let mut urls = HashSet::new();
        for backend in &settings.backends {
            if !ids.insert(backend.id.as_str()) {
                result.add_error(format!("Duplicate backend id: {}", backend.id));
            }
            if !urls.insert(backend.url.as_str()) {
                result.add_error(format!("Duplicate backend url: {}", backend.url));
            }

            if backend.models.is_empty() {
                result.add_warning(format!(
                    "Backend {} advertises no models; it will receive no traffic until a probe discovers some",
                    backend.id
                ));
            }

            if backend.max_concurrency > 32 {
                result.add_recommendation(format!(
                    "Backend {} allows {} concurrent requests; inference servers rarely benefit beyond 32",
                    backend.id, backend.max_concurrency
                ));
            }
        }
    }

    fn validate_tuning(settings: &Settings, result: &mut ValidationResult) {
        if settings.health.probe_timeout_ms >= settings.health.interval_ms {
            result.add_warning(format!(
                "Probe timeout ({}ms) is not shorter than the sweep interval ({}ms); sweeps may overlap",
                settings.health.probe_timeout_ms, settings.health.interval_ms
            ));
        }

        if settings.breaker.min_failure_threshold == settings.breaker.max_failure_threshold {
            result.add_warning(
                "Breaker min and max thresholds are equal; adaptive thresholds are effectively disabled"
                    .to_string(),
            );
        }

        if settings.queue.max_size > 1_000 {
            result.add_recommendation(format!(
                "Queue max_size of {} holds a lot of memory-resident payloads; consider rejecting earlier",
                settings.queue.max_size
            ));
        }

        if settings.metrics.flush_interval_ms < 1_000 {
            result.add_recommendation(format!(
                "Metrics flush every {}ms churns the snapshot files; 10s is usually enough",
                settings.metrics.flush_interval_ms
            ));
        }

        if settings.metrics.stale_inflation > 3.0 {
            result.add_recommendation(format!(
                "stale_inflation of {} makes idle backends look extremely slow; they may never win traffic back",
                settings.metrics.stale_inflation
            ));
        }

        if settings.balancer.capacity_bonus_weight == 0.0
            && settings.backends.iter().any(|b| b.max_concurrency > 8)
        {
            result.add_recommendation(
                "High-capacity backends present but capacity_bonus_weight is 0; larger servers get no preference"
                    .to_string(),
            );
        }

        if settings.routing.max_cooldown_ms > settings.breaker.max_open_timeout_ms {
            result.add_warning(format!(
                "Failover cooldown can reach {}ms, longer than the maximum breaker open timeout ({}ms); cooldowns will mask breaker recovery",
                settings.routing.max_cooldown_ms, settings.breaker.max_open_timeout_ms
            ));
        }
    }

    fn log_results(result: &ValidationResult) {
        for error in &result.errors {
            warn!("Config error: {}", error);
        }
        for warning in &result.warnings {
            warn!("Config warning: {}", warning);
        }
        for recommendation in &result.recommendations {
            info!("Config recommendation: {}", recommendation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::Backend;

    fn backend(id: &str, url: &str) -> Backend {
        Backend {
            id: id.to_string(),
            url: url.to_string(),
            models: vec!["llama3:8b".to_string()],
            ..Backend::default()
        }
    }

    #[test]
    fn empty_fleet_is_valid_but_warned() {
        let result = ConfigValidator::validate_comprehensive(&Settings::default());
        assert!(result.is_valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("No backends configured")));
    }

    #[test]
    fn duplicate_urls_are_errors() {
        let settings = Settings {
            backends: vec![
                backend("a", "http://host:11434"),
                backend("b", "http://host:11434"),
            ],
            ..Settings::default()
        };

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("Duplicate backend url")));
    }

    #[test]
    fn single_backend_warns_about_failover() {
        let settings = Settings {
            backends: vec![backend("a", "http://host:11434")],
            ..Settings::default()
        };

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("failover")));
    }

    #[test]
    fn aggressive_flush_interval_is_flagged() {
        let mut settings = Settings::default();
        settings.metrics.flush_interval_ms = 100;

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("flush")));
    }

    #[test]
    fn cooldown_longer_than_open_timeout_is_flagged() {
        let mut settings = Settings::default();
        settings.routing.max_cooldown_ms = 400_000;

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("mask breaker recovery")));
    }
}
