//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and argument validation
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::TrafficCache;
use crate::config::Config;
use crate::error::ProviderResult;
use crate::provider::{AzureMapsClient, DisabledProvider, TrafficProvider};
use crate::storage::Storage;

/// Application state shared across handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Read-through traffic cache.
    pub cache: TrafficCache,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, cache: TrafficCache) -> Self {
        Self { config, cache }
    }

    /// Wire the cache over `storage` with the provider `config` asks for.
    pub fn from_config(config: Config, storage: Arc<dyn Storage>) -> ProviderResult<Self> {
        let provider = select_provider(&config)?;

        info!(
            provider = provider.name(),
            synthetic = config.cache.use_synthetic_data,
            freshness_minutes = config.cache.freshness_window.num_minutes(),
            "AppState initializing"
        );

        let cache = TrafficCache::new(storage, provider, config.cache.clone());
        Ok(Self::new(config, cache))
    }
}

/// The Azure Maps client when live mode is on and a key is configured,
/// otherwise the disabled provider.
pub fn select_provider(config: &Config) -> ProviderResult<Arc<dyn TrafficProvider>> {
    if config.provider_enabled() {
        let client = AzureMapsClient::new(&config.provider, config.request.clone())?;
        return Ok(Arc::new(client));
    }

    if !config.cache.use_synthetic_data {
        warn!("Live mode requested without AZURE_MAPS_SUBSCRIPTION_KEY; refreshes will be synthetic");
    }
    Ok(Arc::new(DisabledProvider))
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CacheConfig, DatabaseConfig, LogFormat, LoggingConfig, ProviderConfig, RequestConfig,
    };
    use crate::storage::SqliteStorage;
    use std::path::PathBuf;

    fn create_test_config(key: Option<&str>, synthetic: bool) -> Config {
        Config {
            provider: ProviderConfig {
                subscription_key: key.map(str::to_string),
                base_url: "https://atlas.microsoft.com".to_string(),
                language: "it-IT".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            request: RequestConfig::default(),
            cache: CacheConfig {
                use_synthetic_data: synthetic,
                ..CacheConfig::default()
            },
        }
    }

    #[test]
    fn test_select_provider() {
        let provider = select_provider(&create_test_config(None, true)).unwrap();
        assert_eq!(provider.name(), "disabled");

        let provider = select_provider(&create_test_config(Some("key"), true)).unwrap();
        assert_eq!(provider.name(), "disabled");

        let provider = select_provider(&create_test_config(None, false)).unwrap();
        assert_eq!(provider.name(), "disabled");

        let provider = select_provider(&create_test_config(Some("key"), false)).unwrap();
        assert_eq!(provider.name(), "azure-maps");
    }

    #[tokio::test]
    async fn test_app_state_from_config() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let state = AppState::from_config(create_test_config(None, true), storage).unwrap();

        assert_eq!(state.cache.provider_name(), "disabled");
        assert!(state.cache.config().use_synthetic_data);
        assert_eq!(state.config.database.max_connections, 5);
    }

    #[tokio::test]
    async fn test_shared_state_type() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let state = AppState::from_config(create_test_config(None, true), storage).unwrap();
        let shared: SharedState = Arc::new(state);

        let shared2 = Arc::clone(&shared);
        assert_eq!(Arc::strong_count(&shared), 2);
        drop(shared2);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
