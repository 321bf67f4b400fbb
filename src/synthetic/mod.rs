//! Synthetic traffic data for areas with no live provider data.
//!
//! The caller supplies the random source and the clock, so a seeded RNG
//! reproduces the same positions and values. Record ids are always fresh
//! v4 UUIDs: a replayed seed must not collide with rows already stored.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::geo::{BoundingBox, IncidentType, Severity};
use crate::storage::{FlowRecord, IncidentEvent};

/// Default number of flow records per synthetic batch.
pub const FLOW_BATCH_SIZE: usize = 15;
/// Default number of incident events per synthetic batch.
pub const INCIDENT_BATCH_SIZE: usize = 8;

const FLOW_ROADS: [&str; 9] = [
    "Via Roma",
    "Corso Italia",
    "Viale Europa",
    "Via Garibaldi",
    "Piazza Duomo",
    "Tangenziale Nord",
    "SS35",
    "Via Milano",
    "Corso Cavour",
];

const INCIDENT_ROADS: [&str; 6] = [
    "Via Roma",
    "Corso Italia",
    "Viale Europa",
    "Via Garibaldi",
    "SS35",
    "Tangenziale",
];

/// Segment length the synthetic travel times are computed over.
const SEGMENT_KM: f64 = 1.0;

/// Produces plausible flow and incident batches inside a bounding box.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticGenerator {
    flow_batch: usize,
    incident_batch: usize,
}

impl Default for SyntheticGenerator {
    fn default() -> Self {
        Self::new(FLOW_BATCH_SIZE, INCIDENT_BATCH_SIZE)
    }
}

impl SyntheticGenerator {
    pub fn new(flow_batch: usize, incident_batch: usize) -> Self {
        Self {
            flow_batch,
            incident_batch,
        }
    }

    /// Generate one batch of flow samples, all recorded at `now`.
    pub fn generate_flows<R: Rng + ?Sized>(
        &self,
        bbox: &BoundingBox,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<FlowRecord> {
        (0..self.flow_batch)
            .map(|_| {
                let (latitude, longitude) = random_point(bbox, rng);
                let free_flow = f64::from(rng.gen_range(50_u32..100));
                let current = free_flow * (0.3 + rng.gen::<f64>() * 0.7);
                let road = FLOW_ROADS.choose(rng).copied().unwrap_or(FLOW_ROADS[0]);

                FlowRecord::new(latitude, longitude, road, current, free_flow, now)
                    .with_travel_times(travel_seconds(current), travel_seconds(free_flow))
                    .with_confidence(0.8 + rng.gen::<f64>() * 0.2)
            })
            .collect()
    }

    /// Generate one batch of incidents, all recorded at `now`.
    ///
    /// Start times lie 1–23 hours in the past; about half the incidents get
    /// an end time 1–11 hours in the future.
    pub fn generate_incidents<R: Rng + ?Sized>(
        &self,
        bbox: &BoundingBox,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<IncidentEvent> {
        (0..self.incident_batch)
            .map(|_| {
                let (latitude, longitude) = random_point(bbox, rng);
                let event_type = *IncidentType::ALL
                    .choose(rng)
                    .unwrap_or(&IncidentType::Event);
                let severity = *Severity::ALL.choose(rng).unwrap_or(&Severity::Low);
                let road = INCIDENT_ROADS
                    .choose(rng)
                    .copied()
                    .unwrap_or(INCIDENT_ROADS[0]);
                let start_time = now - Duration::hours(rng.gen_range(1..24));

                let mut event = IncidentEvent::new(
                    event_type,
                    severity,
                    format!("{} rilevato sulla strada", event_type.display_name()),
                    latitude,
                    longitude,
                    road,
                    start_time,
                    now,
                );

                if rng.gen_bool(0.5) {
                    event = event.with_end_time(now + Duration::hours(rng.gen_range(1..12)));
                }

                event
            })
            .collect()
    }
}

/// Uniform point inside `bbox`, never outside it even after rounding.
fn random_point<R: Rng + ?Sized>(bbox: &BoundingBox, rng: &mut R) -> (f64, f64) {
    let lat = bbox.min_lat() + rng.gen::<f64>() * (bbox.max_lat() - bbox.min_lat());
    let lon = bbox.min_lon() + rng.gen::<f64>() * (bbox.max_lon() - bbox.min_lon());
    (
        lat.clamp(bbox.min_lat(), bbox.max_lat()),
        lon.clamp(bbox.min_lon(), bbox.max_lon()),
    )
}

fn travel_seconds(speed_kmh: f64) -> f64 {
    if speed_kmh > 0.0 {
        SEGMENT_KM / speed_kmh * 3600.0
    } else {
        0.0
    }
}
