use geo_types::Coord;
use serde::{Deserialize, Deserializer, Serialize};

/// A position on the globe, always stored latitude first.
///
/// External services disagree on orientation (the road matcher and GeoJSON
/// both speak `[lon, lat]`), so every conversion in or out of this type goes
/// through [`LatLon::from_lon_lat`] / [`LatLon::to_lon_lat`] or the
/// `geo_types::Coord` impls, where `x` is longitude and `y` latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Build from an external `[lon, lat]` pair
    pub fn from_lon_lat(pair: [f64; 2]) -> Self {
        Self {
            lat: pair[1],
            lon: pair[0],
        }
    }

    /// Export as an external `[lon, lat]` pair
    pub fn to_lon_lat(self) -> [f64; 2] {
        [self.lon, self.lat]
    }
}

impl From<LatLon> for Coord<f64> {
    fn from(value: LatLon) -> Self {
        Coord {
            x: value.lon,
            y: value.lat,
        }
    }
}

impl From<Coord<f64>> for LatLon {
    fn from(value: Coord<f64>) -> Self {
        Self {
            lat: value.y,
            lon: value.x,
        }
    }
}

/// A single GPS reading for a vehicle, as delivered on `location.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    #[serde(alias = "carId", deserialize_with = "string_or_number")]
    pub vehicle_id: String,
    pub message_id: i64,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: f64,
}

impl LocationFix {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

/// Envelope of the `location.update` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    #[serde(default)]
    pub event: String,
    pub data: LocationFix,
}

/// Two consecutive fixes of one vehicle, bounding one map-match call.
/// Never leaves the map-matcher process.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub vehicle_id: String,
    pub message_id: i64,
    pub fix_a: LocationFix,
    pub fix_b: LocationFix,
}

impl Segment {
    /// Timestamp of the most recent fix in the pair
    pub fn timestamp(&self) -> &str {
        &self.fix_b.timestamp
    }
}

/// Road-snapped path between the two fixes of a [`Segment`], origin first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPath {
    pub message_id: i64,
    #[serde(alias = "carId", deserialize_with = "string_or_number")]
    pub vehicle_id: String,
    pub timestamp: String,
    #[serde(rename = "route")]
    pub waypoints: Vec<LatLon>,
}

/// Envelope of the `location.matched` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationMatched {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub topic: String,
    pub data: MatchedPath,
}

/// Part of a matched path lying inside one pollution zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollutionZoneHit {
    #[serde(rename = "segmentId")]
    pub zone_id: i64,
    pub pollution_level: i32,
    #[serde(rename = "segmentSections")]
    pub boundary: [LatLon; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollutionMatched {
    pub message_id: i64,
    #[serde(alias = "carId", deserialize_with = "string_or_number")]
    pub vehicle_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub segments: Vec<PollutionZoneHit>,
}

/// Envelope of the `pollution.matched` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollutionMatchedMessage {
    pub data: PollutionMatched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TollCalculated {
    pub message_id: i64,
    pub vehicle_id: String,
    pub timestamp: String,
    pub sender: String,
    pub topic: String,
    pub increment: f64,
    pub total_toll: f64,
}

/// Envelope of the `toll.calculated` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollCalculatedMessage {
    pub data: TollCalculated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub message_id: i64,
    pub sender: String,
    pub framework: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub timestamp: String,
}

/// Envelope of the `logs` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogMessage {
    pub data: AuditRecord,
}

// Simulators emit numeric car ids; everything downstream keys on strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
