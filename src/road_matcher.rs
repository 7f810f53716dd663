use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;

use crate::error::MatchError;
use crate::model::{LatLon, MatchedPath, Segment};
use crate::windower::WINDOW_SIZE;

/// Snaps the raw coordinates of a segment onto the road network
#[async_trait]
pub trait RoadMatcher: Send + Sync + 'static {
    async fn match_segment(&self, segment: &Segment) -> Result<MatchedPath, MatchError>;
}

/// Road matching backed by an OSRM-compatible `/match` endpoint
#[derive(Debug, Clone)]
pub struct OsrmMatcher {
    client: reqwest::Client,
    base_url: String,
    /// Search radius around each fix (meters)
    radius_meters: f64,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Deserialize)]
struct Tracepoint {
    /// `[lon, lat]`
    location: [f64; 2],
}

impl OsrmMatcher {
    /// `timeout` bounds every request; it is the only timeout applied to a
    /// match call.
    pub fn new(base_url: impl Into<String>, radius_meters: f64, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            radius_meters,
        })
    }

    /// Request URL for a segment, coordinates in the service's lon,lat order
    pub fn match_url(&self, segment: &Segment) -> String {
        let a = segment.fix_a.position();
        let b = segment.fix_b.position();
        format!(
            "{}/match/v1/car/{},{};{},{}?radiuses={};{}",
            self.base_url.trim_end_matches('/'),
            a.lon,
            a.lat,
            b.lon,
            b.lat,
            self.radius_meters,
            self.radius_meters
        )
    }
}

#[async_trait]
impl RoadMatcher for OsrmMatcher {
    async fn match_segment(&self, segment: &Segment) -> Result<MatchedPath, MatchError> {
        let url = self.match_url(segment);
        debug!("Matching segment {} via {}", segment.message_id, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MatchError::unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(MatchError::unavailable(format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| MatchError::unavailable(e.to_string()))?;
        let waypoints = parse_match_response(&body, WINDOW_SIZE)?;

        Ok(MatchedPath {
            message_id: segment.message_id,
            vehicle_id: segment.vehicle_id.clone(),
            timestamp: segment.timestamp().to_string(),
            waypoints,
        })
    }
}

/// Extract one waypoint per queried fix from a `/match` response body.
///
/// Any fix the service could not snap, or a tracepoint count other than
/// `fixes`, makes the whole trace unusable; a partial path is never returned.
pub fn parse_match_response(body: &[u8], fixes: usize) -> Result<Vec<LatLon>, MatchError> {
    let response: MatchResponse =
        serde_json::from_slice(body).map_err(|e| MatchError::decode(e.to_string()))?;

    if response.code != "Ok" {
        let detail = match response.message {
            Some(message) => format!("{}: {}", response.code, message),
            None => response.code,
        };
        warn!("Road matcher rejected trace: {}", detail);
        return Err(MatchError::decode(detail));
    }

    if response.tracepoints.len() != fixes {
        return Err(MatchError::decode(format!(
            "expected {} tracepoints, got {}",
            fixes,
            response.tracepoints.len()
        )));
    }

    response
        .tracepoints
        .into_iter()
        .enumerate()
        .map(|(i, tracepoint)| {
            tracepoint
                .map(|tp| LatLon::from_lon_lat(tp.location))
                .ok_or_else(|| MatchError::decode(format!("fix {} could not be matched", i)))
        })
        .collect()
}
