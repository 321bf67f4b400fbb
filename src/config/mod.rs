use std::env;
use std::path::PathBuf;

use chrono::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub cache: CacheConfig,
}

/// Azure Maps traffic provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Subscription key; `None` leaves the provider unconfigured.
    pub subscription_key: Option<String>,
    pub base_url: String,
    pub language: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Freshness and refresh policy for area queries.
///
/// Built once at startup and handed to [`crate::cache::TrafficCache`];
/// nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age of the newest record before a query triggers a refresh.
    pub freshness_window: Duration,
    /// Skip the provider and always refresh with synthetic data.
    pub use_synthetic_data: bool,
    /// Seed for the synthetic generator; `None` seeds from OS entropy.
    pub synthetic_seed: Option<u64>,
    pub synthetic_flow_batch: usize,
    pub synthetic_incident_batch: usize,
    pub flow_query_limit: u32,
    pub incident_query_limit: u32,
    pub recent_events_limit: u32,
    /// Upper bound for one provider fetch during refresh, retries included.
    pub refresh_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let provider = ProviderConfig {
            subscription_key: env::var("AZURE_MAPS_SUBSCRIPTION_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            base_url: string_var("AZURE_MAPS_BASE_URL", "https://atlas.microsoft.com"),
            language: string_var("AZURE_MAPS_LANGUAGE", "it-IT"),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(string_var("DATABASE_PATH", "./data/traffic.db")),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: string_var("LOG_LEVEL", "info"),
            format: match string_var("LOG_FORMAT", "pretty").to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS")?.unwrap_or(30000),
            max_retries: parse_var("MAX_RETRIES")?.unwrap_or(0),
            retry_delay_ms: parse_var("RETRY_DELAY_MS")?.unwrap_or(1000),
        };

        let defaults = CacheConfig::default();
        let freshness_minutes: i64 =
            parse_var("FRESHNESS_WINDOW_MINUTES")?.unwrap_or(defaults.freshness_window.num_minutes());
        if freshness_minutes <= 0 {
            return Err(AppError::Config {
                message: "FRESHNESS_WINDOW_MINUTES must be positive".to_string(),
            });
        }

        let cache = CacheConfig {
            freshness_window: Duration::minutes(freshness_minutes),
            use_synthetic_data: parse_bool("USE_SYNTHETIC_DATA")?
                .unwrap_or(defaults.use_synthetic_data),
            synthetic_seed: parse_var("SYNTHETIC_SEED")?,
            synthetic_flow_batch: parse_var("SYNTHETIC_FLOW_BATCH")?
                .unwrap_or(defaults.synthetic_flow_batch),
            synthetic_incident_batch: parse_var("SYNTHETIC_INCIDENT_BATCH")?
                .unwrap_or(defaults.synthetic_incident_batch),
            refresh_timeout_ms: request.total_budget_ms(),
            ..defaults
        };

        Ok(Config {
            provider,
            database,
            logging,
            request,
            cache,
        })
    }

    /// Whether refreshes should go to the real provider first.
    pub fn provider_enabled(&self) -> bool {
        !self.cache.use_synthetic_data && self.provider.subscription_key.is_some()
    }
}

/// Read a string variable; unset or blank falls back to `default`.
fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parse an optional environment variable, rejecting malformed values.
fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|_| AppError::Config {
                    message: format!("{} has an invalid value: {}", name, raw),
                })
        }
        _ => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, AppError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AppError::Config {
                message: format!("{} must be a boolean, got: {}", name, raw),
            }),
        },
        Err(_) => Ok(None),
    }
}

impl RequestConfig {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff_delay_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let factor = 2_u64.checked_pow(retry - 1).unwrap_or(u64::MAX);
        self.retry_delay_ms.saturating_mul(factor)
    }

    /// Worst-case duration of one call: every attempt times out and every
    /// backoff is slept in full.
    pub fn total_budget_ms(&self) -> u64 {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff_factor = 2_u64
            .checked_pow(self.max_retries)
            .map_or(u64::MAX, |p| p - 1);
        self.timeout_ms
            .saturating_mul(attempts)
            .saturating_add(self.retry_delay_ms.saturating_mul(backoff_factor))
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(30),
            use_synthetic_data: true,
            synthetic_seed: None,
            synthetic_flow_batch: 15,
            synthetic_incident_batch: 8,
            flow_query_limit: 1000,
            incident_query_limit: 500,
            recent_events_limit: 100,
            refresh_timeout_ms: 30000,
        }
    }
}
