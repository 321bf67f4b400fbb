//! Upstream traffic data providers.
//!
//! The refresh path talks to whichever [`TrafficProvider`] was wired in at
//! startup. [`AzureMapsClient`] is the real adapter; [`DisabledProvider`]
//! always fails, which the cache treats like any other provider failure and
//! answers with synthetic data.

mod client;
mod types;

pub use client::AzureMapsClient;
pub use types::*;

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderResult};
use crate::geo::BoundingBox;
use crate::storage::{FlowRecord, IncidentEvent};

/// Source of live flow and incident records for an area.
#[async_trait]
pub trait TrafficProvider: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Fetch current flow samples for `bbox`.
    async fn fetch_flows(&self, bbox: BoundingBox) -> ProviderResult<Vec<FlowRecord>>;

    /// Fetch active incidents for `bbox`.
    async fn fetch_incidents(&self, bbox: BoundingBox) -> ProviderResult<Vec<IncidentEvent>>;
}

/// Provider used when no upstream is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProvider;

#[async_trait]
impl TrafficProvider for DisabledProvider {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn fetch_flows(&self, _bbox: BoundingBox) -> ProviderResult<Vec<FlowRecord>> {
        Err(ProviderError::NotConfigured)
    }

    async fn fetch_incidents(&self, _bbox: BoundingBox) -> ProviderResult<Vec<IncidentEvent>> {
        Err(ProviderError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provider_always_fails() {
        let provider = DisabledProvider;
        let bbox = BoundingBox::new(45.0, 9.0, 45.1, 9.1).unwrap();

        assert_eq!(provider.name(), "disabled");
        assert!(matches!(
            provider.fetch_flows(bbox).await,
            Err(ProviderError::NotConfigured)
        ));
        assert!(matches!(
            provider.fetch_incidents(bbox).await,
            Err(ProviderError::NotConfigured)
        ));
    }
}
