//! Derived traffic metrics, event filtering and response shaping.
//!
//! Everything here is a pure function of its inputs; nothing touches the
//! store or the clock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheOutcome;
use crate::geo::{event_type_label, severity_label, BoundingBox, IncidentType, Severity};
use crate::storage::{FlowRecord, IncidentEvent};

/// Qualitative congestion level derived from the speed ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    FreeFlowing,
    Moderate,
    Heavy,
    Blocked,
    Unknown,
}

impl CongestionLevel {
    /// Classify `current / free_flow`. A zero free-flow speed is `Unknown`.
    pub fn from_speeds(current: f64, free_flow: f64) -> Self {
        if free_flow <= 0.0 {
            return CongestionLevel::Unknown;
        }

        let ratio = current / free_flow;
        if ratio >= 0.8 {
            CongestionLevel::FreeFlowing
        } else if ratio >= 0.5 {
            CongestionLevel::Moderate
        } else if ratio >= 0.25 {
            CongestionLevel::Heavy
        } else {
            CongestionLevel::Blocked
        }
    }

    /// Severity order, `None` for `Unknown`.
    pub fn rank(&self) -> Option<u8> {
        match self {
            CongestionLevel::FreeFlowing => Some(0),
            CongestionLevel::Moderate => Some(1),
            CongestionLevel::Heavy => Some(2),
            CongestionLevel::Blocked => Some(3),
            CongestionLevel::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::FreeFlowing => "free_flowing",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Heavy => "heavy",
            CongestionLevel::Blocked => "blocked",
            CongestionLevel::Unknown => "unknown",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            CongestionLevel::FreeFlowing => "Scorrevole",
            CongestionLevel::Moderate => "Moderato",
            CongestionLevel::Heavy => "Intenso",
            CongestionLevel::Blocked => "Bloccato",
            CongestionLevel::Unknown => "Sconosciuto",
        }
    }
}

/// Percentage of speed lost to congestion, never negative.
pub fn congestion_percent(current: f64, free_flow: f64) -> f64 {
    if free_flow > 0.0 {
        ((1.0 - current / free_flow) * 100.0).max(0.0)
    } else {
        0.0
    }
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let count = values.len();
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

/// One flow sample with its derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficInfo {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub road_name: String,
    pub current_speed: f64,
    pub free_flow_speed: f64,
    pub congestion_percent: f64,
    pub congestion_level: CongestionLevel,
    pub congestion_label: String,
    pub recorded_at: DateTime<Utc>,
}

impl From<&FlowRecord> for TrafficInfo {
    fn from(record: &FlowRecord) -> Self {
        let level = CongestionLevel::from_speeds(record.current_speed, record.free_flow_speed);
        Self {
            id: record.id.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            road_name: record.road_name.clone(),
            current_speed: round1(record.current_speed),
            free_flow_speed: round1(record.free_flow_speed),
            congestion_percent: round1(congestion_percent(
                record.current_speed,
                record.free_flow_speed,
            )),
            congestion_level: level,
            congestion_label: level.display_name().to_string(),
            recorded_at: record.recorded_at,
        }
    }
}

/// Traffic picture for an area.
#[derive(Debug, Clone, Serialize)]
pub struct AreaTrafficResponse {
    pub area: BoundingBox,
    pub query_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheOutcome>,
    pub total_flow_records: usize,
    pub average_speed: f64,
    pub average_congestion: f64,
    pub average_speed_by_road: BTreeMap<String, f64>,
    pub traffic_data: Vec<TrafficInfo>,
}

impl AreaTrafficResponse {
    pub fn with_cache_status(mut self, outcome: CacheOutcome) -> Self {
        self.cache_status = Some(outcome);
        self
    }
}

/// Build the area traffic response. Averages are taken over the rounded
/// per-record values and are 0 for an empty set.
pub fn summarize_flows(
    bbox: &BoundingBox,
    records: &[FlowRecord],
    now: DateTime<Utc>,
) -> AreaTrafficResponse {
    let traffic_data: Vec<TrafficInfo> = records.iter().map(TrafficInfo::from).collect();

    AreaTrafficResponse {
        area: *bbox,
        query_time: now,
        cache_status: None,
        total_flow_records: traffic_data.len(),
        average_speed: round1(mean(traffic_data.iter().map(|t| t.current_speed))),
        average_congestion: round1(mean(traffic_data.iter().map(|t| t.congestion_percent))),
        average_speed_by_road: average_speed_by_road(records),
        traffic_data,
    }
}

/// Mean current speed per road name, rounded to one decimal.
pub fn average_speed_by_road(records: &[FlowRecord]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for record in records {
        let entry = sums.entry(record.road_name.as_str()).or_insert((0.0, 0));
        entry.0 += record.current_speed;
        entry.1 += 1;
    }

    sums.into_iter()
        .map(|(road, (sum, count))| (road.to_string(), round1(sum / count as f64)))
        .collect()
}

/// Optional constraints on an incident listing.
///
/// Date bounds compare against `start_time` and are inclusive. An inverted
/// range is allowed and simply matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<IncidentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_date: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn is_empty(&self) -> bool {
        self.event_type.is_none()
            && self.severity.is_none()
            && self.from_date.is_none()
            && self.to_date.is_none()
    }

    /// Keep the events matching every present constraint, preserving order.
    pub fn apply(&self, events: Vec<IncidentEvent>) -> Vec<IncidentEvent> {
        events
            .into_iter()
            .filter(|e| self.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| self.severity.map_or(true, |s| e.severity == s))
            .filter(|e| self.from_date.map_or(true, |from| e.start_time >= from))
            .filter(|e| self.to_date.map_or(true, |to| e.start_time <= to))
            .collect()
    }
}

/// Count events per type. Types with no events are absent.
pub fn group_by_type(events: &[IncidentEvent]) -> BTreeMap<IncidentType, usize> {
    let mut groups = BTreeMap::new();
    for event in events {
        *groups.entry(event.event_type).or_insert(0) += 1;
    }
    groups
}

/// An incident with display labels attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventInfo {
    pub id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: IncidentType,
    pub type_display_name: String,
    pub description: String,
    pub severity: Severity,
    pub severity_display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub road_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

pub fn to_event_info(event: &IncidentEvent) -> EventInfo {
    EventInfo {
        id: event.id.clone(),
        event_id: event.external_event_id.clone(),
        event_type: event.event_type,
        type_display_name: event_type_label(event.event_type.as_str()),
        description: event.description.clone(),
        severity: event.severity,
        severity_display_name: severity_label(event.severity.as_str()),
        latitude: event.latitude,
        longitude: event.longitude,
        road_name: event.road_name.clone(),
        start_time: event.start_time,
        end_time: event.end_time,
        recorded_at: event.recorded_at,
    }
}

/// Incident picture for an area.
#[derive(Debug, Clone, Serialize)]
pub struct AreaEventsResponse {
    pub area: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_filters: Option<EventFilter>,
    pub query_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheOutcome>,
    pub total_events: usize,
    pub events_by_type: BTreeMap<IncidentType, usize>,
    pub events: Vec<EventInfo>,
}

impl AreaEventsResponse {
    pub fn with_cache_status(mut self, outcome: CacheOutcome) -> Self {
        self.cache_status = Some(outcome);
        self
    }
}

/// Filter, group and label the events of an area.
pub fn summarize_events(
    bbox: &BoundingBox,
    filter: &EventFilter,
    events: Vec<IncidentEvent>,
    now: DateTime<Utc>,
) -> AreaEventsResponse {
    let matching = filter.apply(events);

    AreaEventsResponse {
        area: *bbox,
        applied_filters: (!filter.is_empty()).then(|| filter.clone()),
        query_time: now,
        cache_status: None,
        total_events: matching.len(),
        events_by_type: group_by_type(&matching),
        events: matching.iter().map(to_event_info).collect(),
    }
}

/// Incidents recorded in the last few hours, across all areas.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEventsResponse {
    pub hours: i64,
    pub query_time: DateTime<Utc>,
    pub total_events: usize,
    pub events: Vec<EventInfo>,
}

pub fn summarize_recent(
    hours: i64,
    events: &[IncidentEvent],
    now: DateTime<Utc>,
) -> RecentEventsResponse {
    RecentEventsResponse {
        hours,
        query_time: now,
        total_events: events.len(),
        events: events.iter().map(to_event_info).collect(),
    }
}

/// A code with its display label, for vocabulary listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelEntry {
    pub code: &'static str,
    pub label: &'static str,
}

pub fn event_type_labels() -> Vec<LabelEntry> {
    IncidentType::ALL
        .iter()
        .map(|t| LabelEntry {
            code: t.as_str(),
            label: t.display_name(),
        })
        .collect()
}

pub fn severity_labels() -> Vec<LabelEntry> {
    Severity::ALL
        .iter()
        .map(|s| LabelEntry {
            code: s.as_str(),
            label: s.display_name(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticGenerator;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn bbox() -> BoundingBox {
        BoundingBox::new(45.0, 9.0, 45.1, 9.1).unwrap()
    }

    fn flow(road: &str, current: f64, free_flow: f64) -> FlowRecord {
        FlowRecord::new(45.05, 9.05, road, current, free_flow, Utc::now())
    }

    fn incident(
        event_type: IncidentType,
        severity: Severity,
        start_time: DateTime<Utc>,
    ) -> IncidentEvent {
        IncidentEvent::new(
            event_type,
            severity,
            "test",
            45.05,
            9.05,
            "Via Roma",
            start_time,
            Utc::now(),
        )
    }

    #[test]
    fn test_congestion_percent() {
        assert_eq!(congestion_percent(30.0, 60.0), 50.0);
        assert_eq!(congestion_percent(60.0, 60.0), 0.0);
        assert_eq!(congestion_percent(80.0, 60.0), 0.0);
        assert_eq!(congestion_percent(0.0, 60.0), 100.0);
        assert_eq!(congestion_percent(30.0, 0.0), 0.0);
    }

    #[test]
    fn test_congestion_level_thresholds() {
        assert_eq!(CongestionLevel::from_speeds(48.0, 60.0), CongestionLevel::FreeFlowing);
        assert_eq!(CongestionLevel::from_speeds(30.0, 60.0), CongestionLevel::Moderate);
        assert_eq!(CongestionLevel::from_speeds(15.0, 60.0), CongestionLevel::Heavy);
        assert_eq!(CongestionLevel::from_speeds(14.9, 60.0), CongestionLevel::Blocked);
        assert_eq!(CongestionLevel::from_speeds(30.0, 0.0), CongestionLevel::Unknown);
        assert_eq!(CongestionLevel::Moderate.as_str(), "moderate");
        assert_eq!(CongestionLevel::Unknown.display_name(), "Sconosciuto");
    }

    #[test]
    fn test_congestion_level_monotonic_in_speed() {
        let free_flow = 73.0;
        let mut previous = CongestionLevel::from_speeds(0.0, free_flow).rank();
        for step in 1..=200 {
            let current = f64::from(step) * 0.5;
            let rank = CongestionLevel::from_speeds(current, free_flow).rank();
            assert!(rank <= previous, "rank rose at {} km/h", current);
            previous = rank;
        }
    }

    #[test]
    fn test_summarize_flows_example() {
        let now = Utc::now();
        let records = vec![flow("Via Roma", 30.0, 60.0)];
        let response = summarize_flows(&bbox(), &records, now);

        assert_eq!(response.total_flow_records, 1);
        assert_eq!(response.traffic_data[0].congestion_percent, 50.0);
        assert_eq!(response.traffic_data[0].congestion_level, CongestionLevel::Moderate);
        assert_eq!(response.traffic_data[0].congestion_label, "Moderato");
        assert_eq!(response.average_speed, 30.0);
        assert_eq!(response.average_congestion, 50.0);
        assert_eq!(response.query_time, now);
    }

    #[test]
    fn test_summarize_flows_empty_is_zero() {
        let response = summarize_flows(&bbox(), &[], Utc::now());
        assert_eq!(response.total_flow_records, 0);
        assert_eq!(response.average_speed, 0.0);
        assert_eq!(response.average_congestion, 0.0);
        assert!(response.average_speed_by_road.is_empty());
        assert!(!response.average_speed.is_nan());
    }

    #[test]
    fn test_summarize_flows_rounds_values() {
        let records = vec![flow("SS35", 33.333, 70.0), flow("SS35", 41.26, 70.0)];
        let response = summarize_flows(&bbox(), &records, Utc::now());

        assert_eq!(response.traffic_data[0].current_speed, 33.3);
        assert_eq!(response.traffic_data[1].current_speed, 41.3);
        // Mean of the rounded speeds: (33.3 + 41.3) / 2.
        assert_eq!(response.average_speed, 37.3);
    }

    #[test]
    fn test_average_speed_by_road() {
        let records = vec![
            flow("Via Roma", 30.0, 50.0),
            flow("Via Roma", 40.0, 50.0),
            flow("SS35", 90.0, 100.0),
        ];
        let by_road = average_speed_by_road(&records);

        assert_eq!(by_road.len(), 2);
        assert_eq!(by_road["Via Roma"], 35.0);
        assert_eq!(by_road["SS35"], 90.0);
    }

    #[test]
    fn test_filter_composition() {
        let now = Utc::now();
        let events = vec![
            incident(IncidentType::Accident, Severity::Major, now - Duration::hours(1)),
            incident(IncidentType::Accident, Severity::Low, now - Duration::hours(2)),
            incident(IncidentType::Construction, Severity::Major, now - Duration::hours(3)),
            incident(IncidentType::Accident, Severity::Major, now - Duration::hours(10)),
        ];

        let filter = EventFilter {
            event_type: Some(IncidentType::Accident),
            severity: Some(Severity::Major),
            from_date: Some(now - Duration::hours(5)),
            to_date: None,
        };
        let result = filter.apply(events.clone());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, events[0].id);

        // Composition equals applying each constraint in sequence.
        let by_type = EventFilter {
            event_type: filter.event_type,
            ..EventFilter::default()
        }
        .apply(events.clone());
        let by_severity = EventFilter {
            severity: filter.severity,
            ..EventFilter::default()
        }
        .apply(by_type);
        let by_from = EventFilter {
            from_date: filter.from_date,
            ..EventFilter::default()
        }
        .apply(by_severity);
        assert_eq!(by_from, result);

        assert_eq!(EventFilter::default().apply(events.clone()), events);
    }

    #[test]
    fn test_filter_over_synthetic_batch() {
        let now = Utc::now();
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        let events = SyntheticGenerator::new(0, 400).generate_incidents(&bbox(), &mut rng, now);

        let filter = EventFilter {
            event_type: Some(IncidentType::Accident),
            severity: Some(Severity::Critical),
            ..EventFilter::default()
        };
        let expected = events
            .iter()
            .filter(|e| e.event_type == IncidentType::Accident && e.severity == Severity::Critical)
            .count();
        assert!(expected > 0);

        let response = summarize_events(&bbox(), &filter, events, now);
        assert_eq!(response.total_events, expected);
        assert_eq!(response.events.len(), expected);
        assert_eq!(response.events_by_type.values().sum::<usize>(), response.total_events);
        assert_eq!(response.events_by_type.len(), 1);
        assert!(response
            .events
            .iter()
            .all(|e| e.event_type == IncidentType::Accident && e.severity == Severity::Critical));
        assert_eq!(response.applied_filters, Some(filter));
    }

    #[test]
    fn test_inverted_date_range_matches_nothing() {
        let now = Utc::now();
        let events = vec![incident(IncidentType::Weather, Severity::Low, now)];
        let filter = EventFilter {
            from_date: Some(now + Duration::hours(1)),
            to_date: Some(now - Duration::hours(1)),
            ..EventFilter::default()
        };
        assert!(filter.apply(events).is_empty());
    }

    #[test]
    fn test_group_by_type_sums_to_total() {
        let now = Utc::now();
        let events = vec![
            incident(IncidentType::Accident, Severity::Major, now),
            incident(IncidentType::Accident, Severity::Low, now),
            incident(IncidentType::Weather, Severity::Low, now),
        ];
        let response = summarize_events(&bbox(), &EventFilter::default(), events, now);

        assert_eq!(response.total_events, 3);
        assert_eq!(response.events_by_type.values().sum::<usize>(), 3);
        assert_eq!(response.events_by_type[&IncidentType::Accident], 2);
        assert!(!response.events_by_type.contains_key(&IncidentType::Roadblock));
        assert!(response.applied_filters.is_none());
    }

    #[test]
    fn test_event_info_labels() {
        let event = incident(IncidentType::Construction, Severity::Critical, Utc::now());
        let info = to_event_info(&event);

        assert_eq!(info.type_display_name, "Lavori Stradali");
        assert_eq!(info.severity_display_name, "Critica");
        assert_eq!(info.event_id, event.external_event_id);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "Construction");
        assert_eq!(json["severity"], "Critical");
    }

    #[test]
    fn test_response_serialization() {
        let now = Utc::now();
        let events = vec![incident(IncidentType::TrafficJam, Severity::Moderate, now)];
        let filter = EventFilter {
            severity: Some(Severity::Moderate),
            ..EventFilter::default()
        };
        let response = summarize_events(&bbox(), &filter, events, now)
            .with_cache_status(CacheOutcome::Fresh);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["cache_status"], "fresh");
        assert_eq!(json["events_by_type"]["TrafficJam"], 1);
        assert_eq!(json["applied_filters"]["severity"], "Moderate");
        assert_eq!(json["area"]["lat1"], 45.0);
    }

    #[test]
    fn test_label_listings() {
        let types = event_type_labels();
        assert_eq!(types.len(), 7);
        assert_eq!(
            types[0],
            LabelEntry {
                code: "Accident",
                label: "Incidente"
            }
        );

        let severities = severity_labels();
        assert_eq!(severities.len(), 4);
        assert_eq!(severities[2].label, "Alta");
    }
}
