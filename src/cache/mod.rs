//! Freshness-gated read-through cache over the record store.
//!
//! Every area query reads the store first. Only when the newest matching
//! record is older than the freshness window (or nothing matches) is a single
//! refresh run, after which the store is read again. A refresh asks the
//! provider first and falls back to synthetic data on any provider failure,
//! so a query never fails because the upstream is down.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{AppError, AppResult, ProviderError, ProviderResult};
use crate::geo::BoundingBox;
use crate::provider::TrafficProvider;
use crate::storage::{FlowRecord, IncidentEvent, Storage};
use crate::synthetic::SyntheticGenerator;

/// Shortest window `recent_incidents` accepts, in hours.
pub const MIN_RECENT_HOURS: i64 = 1;
/// Longest window `recent_incidents` accepts, in hours (one week).
pub const MAX_RECENT_HOURS: i64 = 168;

/// Whether a query was answered from stored data or after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Fresh,
    Refreshed,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Fresh => "fresh",
            CacheOutcome::Refreshed => "refreshed",
        }
    }
}

/// Where the records written by a refresh came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshSource {
    Provider,
    Synthetic,
}

impl RefreshSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshSource::Provider => "provider",
            RefreshSource::Synthetic => "synthetic",
        }
    }
}

/// Identifies who issued a query. Only ever used in log fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_id: Option<String>,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    fn label(&self) -> &str {
        self.caller_id.as_deref().unwrap_or("anonymous")
    }
}

/// True iff `recorded_at` is non-empty and its newest entry lies within
/// `window` of `now`.
pub fn is_fresh<I>(recorded_at: I, now: DateTime<Utc>, window: chrono::Duration) -> bool
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    recorded_at
        .into_iter()
        .max()
        .is_some_and(|newest| newest >= now - window)
}

/// Read-through cache coordinating the store, the provider and the
/// synthetic generator.
pub struct TrafficCache {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn TrafficProvider>,
    config: CacheConfig,
    generator: SyntheticGenerator,
    rng: Mutex<ChaCha8Rng>,
}

impl TrafficCache {
    /// Build a cache. A configured seed makes synthetic refreshes
    /// reproducible; otherwise the generator is seeded randomly.
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn TrafficProvider>,
        config: CacheConfig,
    ) -> Self {
        let seed = config.synthetic_seed.unwrap_or_else(rand::random);
        let generator =
            SyntheticGenerator::new(config.synthetic_flow_batch, config.synthetic_incident_batch);

        Self {
            storage,
            provider,
            config,
            generator,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Flow records in `bbox`, refreshing first if the stored ones are stale.
    pub async fn query_flows(
        &self,
        bbox: &BoundingBox,
        caller: &CallerContext,
        token: &CancellationToken,
    ) -> AppResult<(Vec<FlowRecord>, CacheOutcome)> {
        let limit = self.config.flow_query_limit;
        let records = guard(token, self.storage.flows_in_box(bbox, limit)).await?;

        if is_fresh(
            records.iter().map(|r| r.recorded_at),
            Utc::now(),
            self.config.freshness_window,
        ) {
            debug!(bbox = %bbox, caller = caller.label(), count = records.len(), "Flow cache hit");
            return Ok((records, CacheOutcome::Fresh));
        }

        let source = self.refresh(bbox, caller, token).await?;
        let records = guard(token, self.storage.flows_in_box(bbox, limit)).await?;

        info!(
            bbox = %bbox,
            caller = caller.label(),
            source = source.as_str(),
            count = records.len(),
            "Flow query served after refresh"
        );
        Ok((records, CacheOutcome::Refreshed))
    }

    /// Incidents in `bbox`, refreshing first if the stored ones are stale.
    pub async fn query_incidents(
        &self,
        bbox: &BoundingBox,
        caller: &CallerContext,
        token: &CancellationToken,
    ) -> AppResult<(Vec<IncidentEvent>, CacheOutcome)> {
        let limit = self.config.incident_query_limit;
        let records = guard(token, self.storage.incidents_in_box(bbox, limit)).await?;

        if is_fresh(
            records.iter().map(|r| r.recorded_at),
            Utc::now(),
            self.config.freshness_window,
        ) {
            debug!(bbox = %bbox, caller = caller.label(), count = records.len(), "Incident cache hit");
            return Ok((records, CacheOutcome::Fresh));
        }

        let source = self.refresh(bbox, caller, token).await?;
        let records = guard(token, self.storage.incidents_in_box(bbox, limit)).await?;

        info!(
            bbox = %bbox,
            caller = caller.label(),
            source = source.as_str(),
            count = records.len(),
            "Incident query served after refresh"
        );
        Ok((records, CacheOutcome::Refreshed))
    }

    /// Refresh unconditionally, then return the area's flow records.
    pub async fn force_refresh(
        &self,
        bbox: &BoundingBox,
        caller: &CallerContext,
        token: &CancellationToken,
    ) -> AppResult<(Vec<FlowRecord>, RefreshSource)> {
        let source = self.refresh(bbox, caller, token).await?;
        let records = guard(
            token,
            self.storage.flows_in_box(bbox, self.config.flow_query_limit),
        )
        .await?;
        Ok((records, source))
    }

    /// Incidents recorded in the last `hours` hours anywhere.
    ///
    /// `hours` is clamped into `[MIN_RECENT_HOURS, MAX_RECENT_HOURS]`. This
    /// path reads the store directly and never refreshes.
    pub async fn recent_incidents(
        &self,
        hours: i64,
        caller: &CallerContext,
        token: &CancellationToken,
    ) -> AppResult<Vec<IncidentEvent>> {
        let hours = hours.clamp(MIN_RECENT_HOURS, MAX_RECENT_HOURS);
        let since = Utc::now() - chrono::Duration::hours(hours);

        let records = guard(
            token,
            self.storage
                .incidents_recorded_since(since, self.config.recent_events_limit),
        )
        .await?;

        debug!(hours, caller = caller.label(), count = records.len(), "Recent incidents read");
        Ok(records)
    }

    /// Pull fresh data for `bbox` and append it to the store.
    ///
    /// Provider failures of any kind fall back to synthetic data for both
    /// record kinds. Storage failures and cancellation propagate. Nothing is
    /// written if the token is cancelled before persistence starts.
    pub async fn refresh(
        &self,
        bbox: &BoundingBox,
        caller: &CallerContext,
        token: &CancellationToken,
    ) -> AppResult<RefreshSource> {
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let start = Instant::now();

        if !self.config.use_synthetic_data {
            match self.fetch_from_provider(bbox, token).await {
                Ok((flows, incidents)) => {
                    if token.is_cancelled() {
                        return Err(AppError::Cancelled);
                    }
                    self.persist(&flows, &incidents).await?;
                    info!(
                        bbox = %bbox,
                        caller = caller.label(),
                        provider = self.provider.name(),
                        flows = flows.len(),
                        incidents = incidents.len(),
                        latency_ms = start.elapsed().as_millis(),
                        "Refreshed from provider"
                    );
                    return Ok(RefreshSource::Provider);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(
                        bbox = %bbox,
                        caller = caller.label(),
                        provider = self.provider.name(),
                        error = %e,
                        "Provider refresh failed, falling back to synthetic data"
                    );
                }
            }
        }

        let (flows, incidents) = self.synthesize(bbox, Utc::now());
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.persist(&flows, &incidents).await?;

        info!(
            bbox = %bbox,
            caller = caller.label(),
            flows = flows.len(),
            incidents = incidents.len(),
            latency_ms = start.elapsed().as_millis(),
            "Refreshed with synthetic data"
        );
        Ok(RefreshSource::Synthetic)
    }

    async fn fetch_from_provider(
        &self,
        bbox: &BoundingBox,
        token: &CancellationToken,
    ) -> AppResult<(Vec<FlowRecord>, Vec<IncidentEvent>)> {
        let flows = guard(token, self.with_timeout(self.provider.fetch_flows(*bbox))).await?;
        let incidents =
            guard(token, self.with_timeout(self.provider.fetch_incidents(*bbox))).await?;
        Ok((flows, incidents))
    }

    async fn with_timeout<T, F>(&self, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        let timeout_ms = self.config.refresh_timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .unwrap_or(Err(ProviderError::Timeout { timeout_ms }))
    }

    fn synthesize(
        &self,
        bbox: &BoundingBox,
        now: DateTime<Utc>,
    ) -> (Vec<FlowRecord>, Vec<IncidentEvent>) {
        // A panic elsewhere cannot leave the RNG in a broken state.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let flows = self.generator.generate_flows(bbox, &mut *rng, now);
        let incidents = self.generator.generate_incidents(bbox, &mut *rng, now);
        (flows, incidents)
    }

    async fn persist(&self, flows: &[FlowRecord], incidents: &[IncidentEvent]) -> AppResult<()> {
        if !flows.is_empty() {
            self.storage.insert_flows(flows).await?;
        }
        if !incidents.is_empty() {
            self.storage.insert_incidents(incidents).await?;
        }
        Ok(())
    }
}

/// Race `fut` against cancellation of `token`.
async fn guard<T, E, F>(token: &CancellationToken, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<AppError>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DisabledProvider;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use mockall::mock;

    mock! {
        pub Provider {}

        #[async_trait]
        impl TrafficProvider for Provider {
            fn name(&self) -> &'static str;
            async fn fetch_flows(&self, bbox: BoundingBox) -> ProviderResult<Vec<FlowRecord>>;
            async fn fetch_incidents(&self, bbox: BoundingBox) -> ProviderResult<Vec<IncidentEvent>>;
        }
    }

    fn bbox() -> BoundingBox {
        BoundingBox::new(45.0, 9.0, 45.1, 9.1).unwrap()
    }

    fn live_config() -> CacheConfig {
        CacheConfig {
            use_synthetic_data: false,
            synthetic_seed: Some(42),
            ..CacheConfig::default()
        }
    }

    async fn storage() -> Arc<SqliteStorage> {
        Arc::new(SqliteStorage::new_in_memory().await.unwrap())
    }

    #[test]
    fn test_is_fresh() {
        let now = Utc::now();
        let window = ChronoDuration::minutes(30);

        assert!(!is_fresh(Vec::new(), now, window));
        assert!(is_fresh(vec![now - ChronoDuration::minutes(10)], now, window));
        assert!(is_fresh(vec![now - window], now, window));
        assert!(!is_fresh(vec![now - ChronoDuration::minutes(31)], now, window));
        assert!(is_fresh(
            vec![now - ChronoDuration::hours(5), now - ChronoDuration::minutes(1)],
            now,
            window
        ));
    }

    #[test]
    fn test_caller_label() {
        assert_eq!(CallerContext::anonymous().label(), "anonymous");
        assert_eq!(CallerContext::new("dashboard").label(), "dashboard");
    }

    #[tokio::test]
    async fn test_fresh_data_skips_provider() {
        let storage = storage().await;
        let recent = FlowRecord::new(45.05, 9.05, "Via Roma", 30.0, 60.0, Utc::now());
        storage.insert_flows(&[recent.clone()]).await.unwrap();

        let mut provider = MockProvider::new();
        provider.expect_name().returning(|| "mock");
        provider.expect_fetch_flows().times(0);
        provider.expect_fetch_incidents().times(0);

        let cache = TrafficCache::new(storage.clone(), Arc::new(provider), live_config());
        let (records, outcome) = cache
            .query_flows(&bbox(), &CallerContext::anonymous(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CacheOutcome::Fresh);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, recent.id);
        assert_eq!(storage.count_flows().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_data_refreshes_from_provider() {
        let storage = storage().await;
        let stale = FlowRecord::new(
            45.05,
            9.05,
            "Via Roma",
            30.0,
            60.0,
            Utc::now() - ChronoDuration::hours(2),
        );
        storage.insert_flows(&[stale]).await.unwrap();

        let mut provider = MockProvider::new();
        provider.expect_name().returning(|| "mock");
        provider.expect_fetch_flows().times(1).returning(|_| {
            Ok(vec![FlowRecord::new(
                45.02,
                9.02,
                "FRC1",
                50.0,
                70.0,
                Utc::now(),
            )])
        });
        provider
            .expect_fetch_incidents()
            .times(1)
            .returning(|_| Ok(Vec::new()));

        let cache = TrafficCache::new(storage.clone(), Arc::new(provider), live_config());
        let (records, outcome) = cache
            .query_flows(&bbox(), &CallerContext::new("test"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CacheOutcome::Refreshed);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].road_name, "FRC1");
        assert_eq!(storage.count_incidents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_synthetic() {
        let storage = storage().await;

        let mut provider = MockProvider::new();
        provider.expect_name().returning(|| "mock");
        provider.expect_fetch_flows().returning(|_| {
            Err(ProviderError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        });
        provider.expect_fetch_incidents().times(0);

        let cache = TrafficCache::new(storage.clone(), Arc::new(provider), live_config());
        let source = cache
            .refresh(&bbox(), &CallerContext::anonymous(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source, RefreshSource::Synthetic);
        assert_eq!(storage.count_flows().await.unwrap(), 15);
        assert_eq!(storage.count_incidents().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_synthetic_mode_never_calls_provider() {
        let storage = storage().await;

        let mut provider = MockProvider::new();
        provider.expect_name().returning(|| "mock");
        provider.expect_fetch_flows().times(0);
        provider.expect_fetch_incidents().times(0);

        let config = CacheConfig {
            use_synthetic_data: true,
            ..live_config()
        };
        let cache = TrafficCache::new(storage.clone(), Arc::new(provider), config);
        let (events, outcome) = cache
            .query_incidents(&bbox(), &CallerContext::anonymous(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CacheOutcome::Refreshed);
        assert_eq!(events.len(), 8);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].start_time >= pair[1].start_time));
    }

    #[tokio::test]
    async fn test_cancelled_token_writes_nothing() {
        let storage = storage().await;
        let cache = TrafficCache::new(
            storage.clone(),
            Arc::new(DisabledProvider),
            CacheConfig::default(),
        );

        let token = CancellationToken::new();
        token.cancel();

        let result = cache
            .query_flows(&bbox(), &CallerContext::anonymous(), &token)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(storage.count_flows().await.unwrap(), 0);
        assert_eq!(storage.count_incidents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recent_incidents_clamps_hours() {
        let storage = storage().await;
        let now = Utc::now();
        let old = IncidentEvent::new(
            crate::geo::IncidentType::Accident,
            crate::geo::Severity::Major,
            "Tamponamento",
            45.0,
            9.0,
            "SS35",
            now - ChronoDuration::days(10),
            now - ChronoDuration::days(10),
        );
        let fresh = IncidentEvent::new(
            crate::geo::IncidentType::Weather,
            crate::geo::Severity::Low,
            "Nebbia",
            45.0,
            9.0,
            "A4",
            now - ChronoDuration::minutes(30),
            now - ChronoDuration::minutes(30),
        );
        storage.insert_incidents(&[old, fresh.clone()]).await.unwrap();

        let cache = TrafficCache::new(
            storage.clone(),
            Arc::new(DisabledProvider),
            CacheConfig::default(),
        );
        let token = CancellationToken::new();
        let caller = CallerContext::anonymous();

        // 0 is raised to one hour, 10_000 is capped at one week.
        let within_hour = cache.recent_incidents(0, &caller, &token).await.unwrap();
        assert_eq!(within_hour.len(), 1);
        assert_eq!(within_hour[0].id, fresh.id);

        let within_week = cache.recent_incidents(10_000, &caller, &token).await.unwrap();
        assert_eq!(within_week.len(), 1);

        // Reading never refreshes.
        assert_eq!(storage.count_incidents().await.unwrap(), 2);
        assert_eq!(storage.count_flows().await.unwrap(), 0);
    }
}
