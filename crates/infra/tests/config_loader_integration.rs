//! Integration tests for configuration loader
//!
//! Tests the end-to-end behavior of loading configuration from files.

use std::io::Write;
use std::path::PathBuf;

use cadence_infra::config;
use tempfile::NamedTempFile;

/// Write `contents` to a temp file and copy it to a path with `extension`
fn config_file(contents: &str, extension: &str) -> (NamedTempFile, PathBuf) {
    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file.write_all(contents.as_bytes()).expect("Failed to write to temp file");

    let path = temp_file.path().with_extension(extension);
    std::fs::copy(temp_file.path(), &path).expect("Failed to copy file");
    (temp_file, path)
}

#[test]
fn test_load_config_from_json_file() {
    let json_content = r#"{
        "scheduler": {
            "node_id": "worker-a",
            "queues": ["reports", "billing"],
            "poll_interval_ms": 500,
            "default_timezone": "Europe/Berlin"
        },
        "store": {
            "max_history": 25,
            "key_prefix": "staging"
        },
        "strategy": {
            "circuits": {
                "payments": { "failure_threshold": 2, "reset_timeout_ms": 10000 }
            },
            "rate_limits": {
                "mailer": { "capacity": 10, "refill_rate": 1, "refill_interval_ms": 1000 }
            }
        },
        "logging": { "level": "debug", "json": true }
    }"#;
    let (_temp, path) = config_file(json_content, "json");

    let result = config::load_from_file(Some(path.clone()));
    assert!(result.is_ok(), "Failed to load config from JSON file");
    let config = result.unwrap();
    config.validate().expect("loaded config should validate");

    // Scheduler settings
    assert_eq!(config.scheduler.node_id, "worker-a");
    assert_eq!(config.scheduler.queues, vec!["reports", "billing"]);
    assert_eq!(config.scheduler.poll_interval_ms, 500);
    assert_eq!(config.scheduler.default_timezone, "Europe/Berlin");

    // Store settings
    assert_eq!(config.store.max_history, 25);
    assert_eq!(config.store.key_prefix, "staging");

    // Strategy overrides keep defaults for unset fields
    let payments = config.strategy.circuits["payments"];
    assert_eq!(payments.failure_threshold, 2);
    assert_eq!(payments.reset_timeout_ms, 10_000);
    assert_eq!(payments.half_open_max_calls, 1);
    assert_eq!(config.strategy.rate_limits["mailer"].capacity, 10);

    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_config_from_toml_file() {
    let toml_content = r#"
[scheduler]
node_id = "worker-b"
enabled = false
lock_ttl_ms = 120000

[workflow]
max_concurrency = 8
default_step_timeout_ms = 60000

[strategy.classifier]
max_retries = 5
terminal_patterns = ["permission denied"]
"#;
    let (_temp, path) = config_file(toml_content, "toml");

    let config = config::load_from_file(Some(path.clone())).expect("Failed to load TOML config");

    assert_eq!(config.scheduler.node_id, "worker-b");
    assert!(!config.scheduler.enabled);
    assert_eq!(config.scheduler.lock_ttl_ms, 120_000);
    assert_eq!(config.workflow.max_concurrency, 8);
    assert_eq!(config.workflow.default_step_timeout_ms, 60_000);
    assert_eq!(config.strategy.classifier.max_retries, 5);
    assert_eq!(config.strategy.classifier.terminal_patterns, vec!["permission denied"]);

    // Untouched sections keep their defaults
    assert_eq!(config.store.key_prefix, "cadence");
    assert_eq!(config.scheduler.queues, vec!["default"]);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_config_with_invalid_rule_fails_validation() {
    let json_content = r#"{
        "strategy": {
            "rate_limits": {
                "broken": { "capacity": 0, "refill_rate": 1, "refill_interval_ms": 1000 }
            }
        }
    }"#;
    let (_temp, path) = config_file(json_content, "json");

    let config = config::load_from_file(Some(path.clone())).expect("file itself is well formed");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("strategy.rate_limits.broken"));

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_config_with_invalid_format() {
    let (_temp, path) = config_file("[scheduler\nnode_id = ", "toml");

    let result = config::load_from_file(Some(path.clone()));
    assert!(result.is_err(), "Should fail with invalid TOML");

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_config_missing_file() {
    let result = config::load_from_file(Some(PathBuf::from("/nonexistent/path/cadence.json")));
    assert!(result.is_err(), "Should fail when file doesn't exist");
}
