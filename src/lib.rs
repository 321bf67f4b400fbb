//! # MCP Traffic Cache
//!
//! A Model Context Protocol (MCP) server answering "what is the traffic and
//! incident picture inside this rectangle?" from a local SQLite store, and
//! transparently refreshing the store when the answer would be missing or
//! stale.
//!
//! ## Features
//!
//! - **Freshness-gated reads**: stored records are served while the newest
//!   one is inside the freshness window; otherwise one refresh runs first
//! - **Provider fallback**: Azure Maps traffic data when configured, seeded
//!   synthetic data whenever the provider is disabled or failing
//! - **Derived metrics**: congestion percent and level, area and per-road
//!   averages
//! - **Event filtering**: by type, severity and start-time range, with
//!   per-type counts
//! - **Cancellation**: every in-flight tool call can be cancelled by the client
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → McpServer → TrafficCache → Storage (SQLite)
//!                               ↓
//!                TrafficProvider (Azure Maps) / SyntheticGenerator
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcp_traffic_cache::{AppState, Config, McpServer};
//! use mcp_traffic_cache::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let state = Arc::new(AppState::from_config(config, storage)?);
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Derived metrics, event filters and response shapes.
pub mod analytics;
/// Freshness-gated refresh orchestration.
pub mod cache;
/// Command-line interface.
pub mod cli;
/// Configuration management for the MCP server.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Bounding boxes and the incident vocabulary.
pub mod geo;
/// Upstream traffic providers.
pub mod provider;
/// MCP server implementation and request handling.
pub mod server;
/// SQLite storage layer for traffic records.
pub mod storage;
/// Seedable synthetic traffic data.
pub mod synthetic;

pub use cache::{CacheOutcome, CallerContext, RefreshSource, TrafficCache};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use geo::BoundingBox;
pub use server::{AppState, McpServer, SharedState};
