//! Azure Maps traffic API payloads.
//!
//! Only the fields the cache consumes are modelled; everything else in the
//! upstream JSON is ignored.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::geo::{BoundingBox, IncidentType, Severity};
use crate::storage::{FlowRecord, IncidentEvent};

/// Response of the traffic flow segment endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSegmentResponse {
    pub flow_segment_data: Option<FlowSegmentData>,
}

/// Flow measurements for the segment nearest to the query point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSegmentData {
    /// Functional road class, e.g. "FRC2".
    pub frc: Option<String>,
    pub current_speed: Option<f64>,
    pub free_flow_speed: Option<f64>,
    pub current_travel_time: Option<f64>,
    pub free_flow_travel_time: Option<f64>,
    pub confidence: Option<f64>,
    pub coordinates: Option<CoordinateList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinateList {
    #[serde(default)]
    pub coordinate: Vec<CoordinatePoint>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CoordinatePoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Response of the traffic incident detail endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IncidentDetailResponse {
    #[serde(default)]
    pub incidents: Vec<IncidentData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncidentData {
    pub id: Option<String>,
    pub geometry: Option<IncidentGeometry>,
    pub properties: Option<IncidentProperties>,
}

/// GeoJSON-style geometry; each position is `[lon, lat]`.
#[derive(Debug, Clone, Deserialize)]
pub struct IncidentGeometry {
    #[serde(default)]
    pub coordinates: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentProperties {
    pub icon_category: Option<i64>,
    pub magnitude_of_delay: Option<i64>,
    pub description: Option<String>,
    #[serde(default)]
    pub road_numbers: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl FlowSegmentResponse {
    /// Convert to at most one flow record.
    ///
    /// The segment's first coordinate is used as the sample position, falling
    /// back to the query box's minimum corner.
    pub fn into_flow_records(self, bbox: &BoundingBox, now: DateTime<Utc>) -> Vec<FlowRecord> {
        let Some(data) = self.flow_segment_data else {
            return Vec::new();
        };

        let position = data
            .coordinates
            .as_ref()
            .and_then(|c| c.coordinate.first().copied());
        let (latitude, longitude) = match position {
            Some(point) => (point.latitude, point.longitude),
            None => (bbox.min_lat(), bbox.min_lon()),
        };

        let record = FlowRecord::new(
            latitude,
            longitude,
            data.frc.unwrap_or_else(|| "Unknown".to_string()),
            data.current_speed.unwrap_or(0.0),
            data.free_flow_speed.unwrap_or(0.0),
            now,
        )
        .with_travel_times(
            data.current_travel_time.unwrap_or(0.0),
            data.free_flow_travel_time.unwrap_or(0.0),
        )
        .with_confidence(data.confidence.unwrap_or(0.5));

        vec![record]
    }
}

impl IncidentDetailResponse {
    /// Convert every incident that carries a usable position.
    pub fn into_incident_events(self, now: DateTime<Utc>) -> Vec<IncidentEvent> {
        self.incidents
            .into_iter()
            .filter_map(|incident| incident.into_event(now))
            .collect()
    }
}

impl IncidentData {
    fn into_event(self, now: DateTime<Utc>) -> Option<IncidentEvent> {
        let position = self.geometry.as_ref()?.coordinates.first()?;
        let (longitude, latitude) = match position.as_slice() {
            [lon, lat, ..] => (*lon, *lat),
            _ => return None,
        };

        let props = self.properties.unwrap_or_default();
        let road_name = props
            .road_numbers
            .into_iter()
            .next()
            .unwrap_or_else(|| "Strada sconosciuta".to_string());

        let mut event = IncidentEvent::new(
            IncidentType::from_icon_category(props.icon_category),
            Severity::from_magnitude(props.magnitude_of_delay),
            props
                .description
                .unwrap_or_else(|| "Evento stradale".to_string()),
            latitude,
            longitude,
            road_name,
            props.start_time.unwrap_or(now),
            now,
        )
        .with_external_id(self.id.unwrap_or_else(|| Uuid::new_v4().to_string()));

        if let Some(end) = props.end_time {
            event = event.with_end_time(end);
        }

        Some(event)
    }
}
