//! Geographic query primitives and the incident vocabulary.
//!
//! [`BoundingBox`] is the only way a query region enters the core, so every
//! box the cache sees has already been range-checked. [`IncidentType`] and
//! [`Severity`] are closed enumerations with fixed display labels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ToolError;

/// Axis-aligned latitude/longitude rectangle.
///
/// Built from two opposite corners in any order and normalised to min/max
/// bounds. A box whose min equals its max on either axis is degenerate but
/// valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
}

impl BoundingBox {
    /// Validate and build a box from two corners.
    pub fn new(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Result<Self, ToolError> {
        check_latitude("lat1", lat1)?;
        check_longitude("lon1", lon1)?;
        check_latitude("lat2", lat2)?;
        check_longitude("lon2", lon2)?;
        Ok(Self {
            lat1,
            lon1,
            lat2,
            lon2,
        })
    }

    pub fn min_lat(&self) -> f64 {
        self.lat1.min(self.lat2)
    }

    pub fn max_lat(&self) -> f64 {
        self.lat1.max(self.lat2)
    }

    pub fn min_lon(&self) -> f64 {
        self.lon1.min(self.lon2)
    }

    pub fn max_lon(&self) -> f64 {
        self.lon1.max(self.lon2)
    }

    /// The corners as originally supplied, `(lat1, lon1, lat2, lon2)`.
    pub fn corners(&self) -> (f64, f64, f64, f64) {
        (self.lat1, self.lon1, self.lat2, self.lon2)
    }

    /// Inclusive containment on both axes.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat()
            && latitude <= self.max_lat()
            && longitude >= self.min_lon()
            && longitude <= self.max_lon()
    }

    pub fn is_degenerate(&self) -> bool {
        self.min_lat() == self.max_lat() || self.min_lon() == self.max_lon()
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{} to {},{}",
            self.min_lat(),
            self.min_lon(),
            self.max_lat(),
            self.max_lon()
        )
    }
}

fn check_latitude(field: &str, value: f64) -> Result<(), ToolError> {
    if value.is_finite() && (-90.0..=90.0).contains(&value) {
        Ok(())
    } else {
        Err(ToolError::validation(
            field,
            format!("latitude must be between -90 and 90, got {}", value),
        ))
    }
}

fn check_longitude(field: &str, value: f64) -> Result<(), ToolError> {
    if value.is_finite() && (-180.0..=180.0).contains(&value) {
        Ok(())
    } else {
        Err(ToolError::validation(
            field,
            format!("longitude must be between -180 and 180, got {}", value),
        ))
    }
}

/// Kind of traffic incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IncidentType {
    Accident,
    Construction,
    Roadblock,
    TrafficJam,
    RoadHazard,
    Event,
    Weather,
}

impl IncidentType {
    /// Every variant, in declaration order.
    pub const ALL: [IncidentType; 7] = [
        IncidentType::Accident,
        IncidentType::Construction,
        IncidentType::Roadblock,
        IncidentType::TrafficJam,
        IncidentType::RoadHazard,
        IncidentType::Event,
        IncidentType::Weather,
    ];

    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::Accident => "Accident",
            IncidentType::Construction => "Construction",
            IncidentType::Roadblock => "Roadblock",
            IncidentType::TrafficJam => "TrafficJam",
            IncidentType::RoadHazard => "RoadHazard",
            IncidentType::Event => "Event",
            IncidentType::Weather => "Weather",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            IncidentType::Accident => "Incidente",
            IncidentType::Construction => "Lavori Stradali",
            IncidentType::Roadblock => "Blocco Stradale",
            IncidentType::TrafficJam => "Ingorgo",
            IncidentType::RoadHazard => "Pericolo Stradale",
            IncidentType::Event => "Manifestazione",
            IncidentType::Weather => "Condizioni Meteo",
        }
    }

    /// Map an Azure Maps icon category to an incident type.
    pub fn from_icon_category(category: Option<i64>) -> Self {
        match category {
            Some(1..=4) => IncidentType::Accident,
            Some(5 | 6) => IncidentType::RoadHazard,
            Some(7..=9) => IncidentType::Construction,
            Some(10 | 11) => IncidentType::Roadblock,
            Some(12..=14) => IncidentType::TrafficJam,
            _ => IncidentType::Event,
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IncidentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Unknown event type: {} (expected one of {})",
                    s,
                    IncidentType::ALL.map(|t| t.as_str()).join(", ")
                )
            })
    }
}

/// Incident severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Moderate,
    Major,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Moderate,
        Severity::Major,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Moderate => "Moderate",
            Severity::Major => "Major",
            Severity::Critical => "Critical",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Severity::Low => "Bassa",
            Severity::Moderate => "Moderata",
            Severity::Major => "Alta",
            Severity::Critical => "Critica",
        }
    }

    /// Map an Azure Maps delay magnitude to a severity.
    pub fn from_magnitude(magnitude: Option<i64>) -> Self {
        match magnitude {
            Some(1) => Severity::Moderate,
            Some(2) => Severity::Major,
            Some(3 | 4) => Severity::Critical,
            _ => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Unknown severity: {} (expected one of {})",
                    s,
                    Severity::ALL.map(|v| v.as_str()).join(", ")
                )
            })
    }
}

/// Display label for a raw event type name; unknown names label themselves.
pub fn event_type_label(raw: &str) -> String {
    raw.parse::<IncidentType>()
        .map(|t| t.display_name().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Display label for a raw severity name; unknown names label themselves.
pub fn severity_label(raw: &str) -> String {
    raw.parse::<Severity>()
        .map(|s| s.display_name().to_string())
        .unwrap_or_else(|_| raw.to_string())
}
