//! Configuration loading and validation tests.

use corral::config::settings::load_settings;
use corral::models::settings::Settings;

#[test]
fn settings_sections_all_default() {
    let settings: Settings = serde_json::from_str("{}").expect("empty config is valid");
    assert!(settings.validate().is_ok());
    assert_eq!(settings.queue.max_size, 100);
    assert_eq!(settings.breaker.failure_threshold, 5);
    assert_eq!(settings.metrics.recent_samples, 1000);
    assert!(settings.persistence.enabled);
}

#[test]
fn invalid_sections_fail_validation() {
    let mut settings = Settings::default();
    settings.balancer.latency_weight = 0.9; // weights no longer sum to 1
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.breaker.backoff_multiplier = 0.5;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.queue.max_size = 0;
    assert!(settings.validate().is_err());
}

#[test]
fn backend_sections_are_validated() {
    let json = r#"{
        "backends": [
            { "id": "gpu-01", "url": "10.0.0.5:11434" }
        ]
    }"#;
    let settings: Settings = serde_json::from_str(json).expect("parses");
    let err = settings.validate().expect_err("missing protocol");
    assert!(err.contains("http"));
}

// File-based loading runs in one test to keep the env var and the
// working-directory fixture race-free under the parallel test runner.
#[test]
fn load_settings_from_disk() {
    let path = "./corral-test-config.json";
    let content = r#"{
        "backends": [
            {
                "id": "gpu-01",
                "url": "http://10.0.0.5:11434",
                "capabilities": { "native": true, "openai": false },
                "max_concurrency": 8,
                "models": ["llama3:8b", "mistral:7b"]
            }
        ],
        "queue": { "max_size": 25 },
        "breaker": { "failure_threshold": 4 }
    }"#;
    std::fs::write(path, content).expect("fixture written");
    std::env::set_var("CORRAL_CONFIG_PATH", path);

    let result = load_settings();
    std::fs::remove_file(path).ok();

    let settings = result.expect("loads");
    assert_eq!(settings.backends.len(), 1);
    assert_eq!(settings.backends[0].max_concurrency, 8);
    assert_eq!(settings.queue.max_size, 25);
    assert_eq!(settings.breaker.failure_threshold, 4);

    // Missing file is a hard error, not silent defaults.
    std::env::set_var("CORRAL_CONFIG_PATH", "./corral-missing-config.json");
    assert!(load_settings().is_err());
    std::env::remove_var("CORRAL_CONFIG_PATH");
}
