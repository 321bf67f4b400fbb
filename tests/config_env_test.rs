//! Config environment variable tests
//!
//! These tests verify that Config::from_env() correctly reads and applies
//! environment variable overrides. Config::from_env() also loads a .env file
//! via dotenvy, so every test clears the variables it depends on first.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use chrono::Duration;
use mcp_traffic_cache::config::{Config, LogFormat};
use serial_test::serial;
use std::env;

const VARS: &[&str] = &[
    "AZURE_MAPS_SUBSCRIPTION_KEY",
    "AZURE_MAPS_BASE_URL",
    "AZURE_MAPS_LANGUAGE",
    "USE_SYNTHETIC_DATA",
    "FRESHNESS_WINDOW_MINUTES",
    "SYNTHETIC_SEED",
    "SYNTHETIC_FLOW_BATCH",
    "SYNTHETIC_INCIDENT_BATCH",
    "DATABASE_PATH",
    "DATABASE_MAX_CONNECTIONS",
    "LOG_LEVEL",
    "LOG_FORMAT",
    "REQUEST_TIMEOUT_MS",
    "MAX_RETRIES",
    "RETRY_DELAY_MS",
];

/// Set every listed variable to the empty string, which the loader treats
/// as unset and which dotenvy will not overwrite.
fn clear_env() {
    for var in VARS {
        env::set_var(var, "");
    }
}

#[test]
#[serial]
fn test_config_defaults() {
    clear_env();

    let config = Config::from_env().unwrap();
    assert!(config.provider.subscription_key.is_none());
    assert_eq!(config.provider.base_url, "https://atlas.microsoft.com");
    assert_eq!(config.provider.language, "it-IT");
    assert!(config.cache.use_synthetic_data);
    assert_eq!(config.cache.freshness_window, Duration::minutes(30));
    assert!(config.cache.synthetic_seed.is_none());
    assert_eq!(config.cache.synthetic_flow_batch, 15);
    assert_eq!(config.cache.synthetic_incident_batch, 8);
    assert_eq!(config.request.max_retries, 0);
    assert!(!config.provider_enabled());
}

#[test]
#[serial]
fn test_config_live_provider() {
    clear_env();
    env::set_var("AZURE_MAPS_SUBSCRIPTION_KEY", "secret");
    env::set_var("USE_SYNTHETIC_DATA", "false");
    env::set_var("AZURE_MAPS_BASE_URL", "http://localhost:9999");

    let config = Config::from_env().unwrap();
    assert_eq!(config.provider.subscription_key.as_deref(), Some("secret"));
    assert_eq!(config.provider.base_url, "http://localhost:9999");
    assert!(config.provider_enabled());

    clear_env();
}

#[test]
#[serial]
fn test_config_cache_overrides() {
    clear_env();
    env::set_var("FRESHNESS_WINDOW_MINUTES", "5");
    env::set_var("SYNTHETIC_SEED", "1234");
    env::set_var("SYNTHETIC_FLOW_BATCH", "0");
    env::set_var("REQUEST_TIMEOUT_MS", "2500");

    let config = Config::from_env().unwrap();
    assert_eq!(config.cache.freshness_window, Duration::minutes(5));
    assert_eq!(config.cache.synthetic_seed, Some(1234));
    assert_eq!(config.cache.synthetic_flow_batch, 0);
    assert_eq!(config.request.timeout_ms, 2500);
    assert_eq!(config.cache.refresh_timeout_ms, 2500);

    clear_env();
}

#[test]
#[serial]
fn test_config_refresh_timeout_spans_retries() {
    clear_env();
    env::set_var("REQUEST_TIMEOUT_MS", "1000");
    env::set_var("MAX_RETRIES", "2");
    env::set_var("RETRY_DELAY_MS", "100");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.max_retries, 2);
    assert_eq!(config.cache.refresh_timeout_ms, 3300);

    clear_env();
}

#[test]
#[serial]
fn test_config_custom_database() {
    clear_env();
    env::set_var("DATABASE_PATH", "/custom/traffic.db");
    env::set_var("DATABASE_MAX_CONNECTIONS", "10");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path.to_str().unwrap(), "/custom/traffic.db");
    assert_eq!(config.database.max_connections, 10);

    clear_env();
}

#[test]
#[serial]
fn test_config_json_log_format() {
    clear_env();
    env::set_var("LOG_FORMAT", "JSON");
    env::set_var("LOG_LEVEL", "debug");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "debug");

    clear_env();
}

#[test]
#[serial]
fn test_config_rejects_malformed_values() {
    clear_env();

    env::set_var("USE_SYNTHETIC_DATA", "maybe");
    assert!(Config::from_env().is_err());
    env::set_var("USE_SYNTHETIC_DATA", "");

    env::set_var("MAX_RETRIES", "three");
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("MAX_RETRIES"));
    env::set_var("MAX_RETRIES", "");

    env::set_var("FRESHNESS_WINDOW_MINUTES", "0");
    assert!(Config::from_env().is_err());

    clear_env();
}
