//! Storage layer for geo-tagged traffic records.
//!
//! Two independent, append-only record streams are kept: flow samples and
//! incident events. Records are never updated or deleted here; newer samples
//! simply supersede older ones by `recorded_at`.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::geo::{BoundingBox, IncidentType, Severity};

/// A traffic flow sample at a point on a road segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Unique record identifier.
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub road_name: String,
    /// Observed speed (km/h), never negative.
    pub current_speed: f64,
    /// Uncongested reference speed (km/h), never negative.
    pub free_flow_speed: f64,
    /// Observed travel time over the segment (seconds).
    pub current_travel_time: f64,
    /// Uncongested travel time over the segment (seconds).
    pub free_flow_travel_time: f64,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the sample was collected.
    pub recorded_at: DateTime<Utc>,
}

impl FlowRecord {
    /// Create a new flow record with a generated id.
    ///
    /// Speeds are clamped at zero and confidence into `[0, 1]`.
    pub fn new(
        latitude: f64,
        longitude: f64,
        road_name: impl Into<String>,
        current_speed: f64,
        free_flow_speed: f64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            latitude,
            longitude,
            road_name: road_name.into(),
            current_speed: current_speed.max(0.0),
            free_flow_speed: free_flow_speed.max(0.0),
            current_travel_time: 0.0,
            free_flow_travel_time: 0.0,
            confidence: 1.0,
            recorded_at,
        }
    }

    /// Set the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set observed and uncongested travel times (seconds).
    pub fn with_travel_times(mut self, current: f64, free_flow: f64) -> Self {
        self.current_travel_time = current.max(0.0);
        self.free_flow_travel_time = free_flow.max(0.0);
        self
    }

    /// Set the confidence, clamped into `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// A traffic incident (accident, roadworks, closure, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    /// Unique record identifier.
    pub id: String,
    /// Provider-assigned (or generated) incident identifier.
    pub external_event_id: String,
    pub event_type: IncidentType,
    pub description: String,
    pub severity: Severity,
    pub latitude: f64,
    pub longitude: f64,
    pub road_name: String,
    pub start_time: DateTime<Utc>,
    /// Expected end; when present it is never before `start_time`.
    pub end_time: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl IncidentEvent {
    /// Create a new open-ended incident with generated ids.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_type: IncidentType,
        severity: Severity,
        description: impl Into<String>,
        latitude: f64,
        longitude: f64,
        road_name: impl Into<String>,
        start_time: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            external_event_id: Uuid::new_v4().to_string(),
            event_type,
            description: description.into(),
            severity,
            latitude,
            longitude,
            road_name: road_name.into(),
            start_time,
            end_time: None,
            recorded_at,
        }
    }

    /// Set the provider-side identifier.
    pub fn with_external_id(mut self, external_event_id: impl Into<String>) -> Self {
        self.external_event_id = external_event_id.into();
        self
    }

    /// Set the record id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the end time. An end before the start is clamped to the start.
    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time.max(self.start_time));
        self
    }
}

/// Append-only store of flow and incident records.
///
/// Implementations must allow concurrent readers and concurrent appenders.
#[async_trait]
pub trait Storage: Send + Sync {
    // Writes

    /// Append flow records in one batch. An empty slice is a no-op.
    async fn insert_flows(&self, flows: &[FlowRecord]) -> StorageResult<()>;
    /// Append incident events in one batch. An empty slice is a no-op.
    async fn insert_incidents(&self, incidents: &[IncidentEvent]) -> StorageResult<()>;

    // Reads

    /// Flow records inside `bbox` (inclusive), newest `recorded_at` first.
    async fn flows_in_box(&self, bbox: &BoundingBox, limit: u32) -> StorageResult<Vec<FlowRecord>>;
    /// Incidents inside `bbox` (inclusive), latest `start_time` first.
    async fn incidents_in_box(
        &self,
        bbox: &BoundingBox,
        limit: u32,
    ) -> StorageResult<Vec<IncidentEvent>>;
    /// Incidents recorded at or after `since` anywhere, latest `start_time` first.
    async fn incidents_recorded_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> StorageResult<Vec<IncidentEvent>>;

    // Counters

    /// Total number of stored flow records.
    async fn count_flows(&self) -> StorageResult<u64>;
    /// Total number of stored incident events.
    async fn count_incidents(&self) -> StorageResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_flow_record_clamps_invalid_values() {
        let now = Utc::now();
        let flow = FlowRecord::new(45.0, 9.0, "Via Roma", -5.0, 50.0, now)
            .with_confidence(1.7)
            .with_travel_times(-1.0, 30.0);

        assert_eq!(flow.current_speed, 0.0);
        assert_eq!(flow.free_flow_speed, 50.0);
        assert_eq!(flow.confidence, 1.0);
        assert_eq!(flow.current_travel_time, 0.0);
        assert_eq!(flow.free_flow_travel_time, 30.0);
        assert!(Uuid::parse_str(&flow.id).is_ok());
    }

    #[test]
    fn test_incident_end_time_never_before_start() {
        let now = Utc::now();
        let incident = IncidentEvent::new(
            IncidentType::Accident,
            Severity::Major,
            "Tamponamento",
            45.0,
            9.0,
            "SS35",
            now,
            now,
        )
        .with_end_time(now - Duration::hours(2));

        assert_eq!(incident.end_time, Some(now));
    }

    #[test]
    fn test_incident_new_generates_distinct_ids() {
        let now = Utc::now();
        let a = IncidentEvent::new(
            IncidentType::Weather,
            Severity::Low,
            "Nebbia",
            45.0,
            9.0,
            "A4",
            now,
            now,
        );
        let b = a.clone().with_id("fixed").with_external_id("ext-1");

        assert_ne!(a.id, a.external_event_id);
        assert_eq!(b.id, "fixed");
        assert_eq!(b.external_event_id, "ext-1");
        assert!(a.end_time.is_none());
    }
}
