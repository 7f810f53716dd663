use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use geo_types::{Coord, LineString};
use log::{debug, info, warn};
use migration::POLLUTION_ZONE_TABLE;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement, Value};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::model::{LatLon, MatchedPath, PollutionZoneHit};

/// One zone crossed by a path, as returned by the geospatial store
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneIntersection {
    pub zone_id: i64,
    pub pollution_level: i32,
    /// GeoJSON geometry of the zone/path intersection, `[lon, lat]` ordered
    pub geojson: String,
}

/// Query capability over the stored pollution-zone polygons
#[async_trait]
pub trait ZoneStore: Send + Sync + 'static {
    /// All zones whose outline intersects the line through `waypoints`,
    /// in the store's own order
    async fn intersecting_zones(&self, waypoints: &[LatLon]) -> Result<Vec<ZoneIntersection>>;
}

/// PostGIS-backed zone store
pub struct PostgisZoneStore {
    db: DatabaseConnection,
}

impl PostgisZoneStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect to the store; failure here is fatal for the stage
    pub async fn connect(uri: &str) -> Result<Self, PipelineError> {
        let db = Database::connect(uri)
            .await
            .map_err(|e| PipelineError::Fatal(format!("cannot reach zone store: {}", e)))?;
        info!("Connected to zone store");
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Builds the intersection query for a path of `points` vertices.
/// Vertices are bound as `$1, $2, ...` in lon, lat order.
fn intersection_sql(points: usize) -> String {
    let vertices = (0..points)
        .map(|i| format!("ST_MakePoint(${}, ${})", 2 * i + 1, 2 * i + 2))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "WITH path AS (SELECT ST_SetSRID(ST_MakeLine(ARRAY[{vertices}]), 4326) AS geom) \
         SELECT z.id::bigint AS zone_id, \
                z.pollution AS pollution_level, \
                ST_AsGeoJSON(ST_Intersection(z.outline, path.geom)) AS geometry \
         FROM {table} z, path \
         WHERE ST_Intersects(z.outline, path.geom) \
           AND NOT ST_IsEmpty(ST_Intersection(z.outline, path.geom))",
        vertices = vertices,
        table = POLLUTION_ZONE_TABLE,
    )
}

#[async_trait]
impl ZoneStore for PostgisZoneStore {
    async fn intersecting_zones(&self, waypoints: &[LatLon]) -> Result<Vec<ZoneIntersection>> {
        // a single vertex cannot cross a zone boundary with any length
        if waypoints.len() < 2 {
            return Ok(Vec::new());
        }

        let values: Vec<Value> = waypoints
            .iter()
            .flat_map(|p| p.to_lon_lat())
            .map(Value::from)
            .collect();
        let statement = Statement::from_sql_and_values(
            DbBackend::Postgres,
            intersection_sql(waypoints.len()),
            values,
        );

        let rows = self.db.query_all(statement).await?;
        rows.iter()
            .map(|row| -> Result<ZoneIntersection> {
                Ok(ZoneIntersection {
                    zone_id: row.try_get("", "zone_id")?,
                    pollution_level: row.try_get("", "pollution_level")?,
                    geojson: row.try_get("", "geometry")?,
                })
            })
            .collect()
    }
}

/// GeoJSON geometries `ST_Intersection` of a polygon and a line can yield
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum IntersectionGeometry {
    Point {},
    MultiPoint {},
    LineString {
        coordinates: Vec<Vec<f64>>,
    },
    MultiLineString {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    GeometryCollection {
        geometries: Vec<IntersectionGeometry>,
    },
}

fn to_coord(position: &[f64]) -> Result<Coord<f64>> {
    match position {
        [lon, lat, ..] => Ok(Coord { x: *lon, y: *lat }),
        _ => Err(anyhow!("position with {} values", position.len())),
    }
}

fn to_line(positions: &[Vec<f64>]) -> Result<LineString<f64>> {
    let coords = positions
        .iter()
        .map(|p| to_coord(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::new(coords))
}

impl IntersectionGeometry {
    fn collect_lines(self, lines: &mut Vec<LineString<f64>>) -> Result<()> {
        match self {
            IntersectionGeometry::Point { .. } | IntersectionGeometry::MultiPoint { .. } => {}
            IntersectionGeometry::LineString { coordinates } => lines.push(to_line(&coordinates)?),
            IntersectionGeometry::MultiLineString { coordinates } => {
                for part in &coordinates {
                    lines.push(to_line(part)?);
                }
            }
            IntersectionGeometry::GeometryCollection { geometries } => {
                for geometry in geometries {
                    geometry.collect_lines(lines)?;
                }
            }
        }
        Ok(())
    }
}

/// Boundary pairs of every non-degenerate line in an intersection geometry.
///
/// Each line contributes its first and last vertex, flipped to `{lat, lon}`.
/// Points and lines with fewer than two vertices are dropped.
pub fn intersection_boundaries(geojson: &str) -> Result<Vec<[LatLon; 2]>> {
    let geometry: IntersectionGeometry =
        serde_json::from_str(geojson).context("unsupported intersection geometry")?;

    let mut lines = Vec::new();
    geometry.collect_lines(&mut lines)?;

    Ok(lines
        .iter()
        .filter(|line| line.0.len() >= 2)
        .filter_map(|line| {
            let first = *line.0.first()?;
            let last = *line.0.last()?;
            Some([LatLon::from(first), LatLon::from(last)])
        })
        .collect())
}

/// Finds the pollution zones a matched path runs through
pub struct ZoneIntersector<S> {
    store: S,
}

impl<S: ZoneStore> ZoneIntersector<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Zone hits along `path`. Never fails: a store or decoding error is
    /// logged and yields no hits.
    pub async fn intersect(&self, path: &MatchedPath) -> Vec<PollutionZoneHit> {
        match self.try_intersect(path).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(
                    "Skipping zone intersection for vehicle {} message {}: {}",
                    path.vehicle_id, path.message_id, e
                );
                Vec::new()
            }
        }
    }

    /// Like [`intersect`](Self::intersect) but surfaces failures, so callers
    /// can abandon the message instead of forwarding an empty result.
    pub async fn try_intersect(
        &self,
        path: &MatchedPath,
    ) -> Result<Vec<PollutionZoneHit>, PipelineError> {
        if path.waypoints.is_empty() {
            return Err(PipelineError::upstream(
                "zone store",
                "matched path has no waypoints",
            ));
        }

        let zones = self
            .store
            .intersecting_zones(&path.waypoints)
            .await
            .map_err(|e| PipelineError::upstream("zone store", format!("{:#}", e)))?;

        let mut hits = Vec::with_capacity(zones.len());
        for zone in zones {
            if !(1..=9).contains(&zone.pollution_level) {
                warn!(
                    "Zone {} has pollution level {} outside 1..9",
                    zone.zone_id, zone.pollution_level
                );
            }
            let boundaries = intersection_boundaries(&zone.geojson).map_err(|e| {
                PipelineError::upstream("zone store", format!("zone {}: {:#}", zone.zone_id, e))
            })?;
            if boundaries.is_empty() {
                debug!("Zone {} intersection is degenerate, skipped", zone.zone_id);
            }
            hits.extend(boundaries.into_iter().map(|boundary| PollutionZoneHit {
                zone_id: zone.zone_id,
                pollution_level: zone.pollution_level,
                boundary,
            }));
        }

        debug!(
            "Vehicle {} message {} crosses {} zone section(s)",
            path.vehicle_id,
            path.message_id,
            hits.len()
        );
        Ok(hits)
    }
}

/// Zone store returning fixed rows, for running the pollution stage without
/// a database
pub struct StaticZoneStore {
    zones: Vec<ZoneIntersection>,
    failure: Option<String>,
}

impl StaticZoneStore {
    pub fn new(zones: Vec<ZoneIntersection>) -> Self {
        Self {
            zones,
            failure: None,
        }
    }

    /// A store whose every query fails with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            zones: Vec::new(),
            failure: Some(reason.into()),
        }
    }
}

#[async_trait]
impl ZoneStore for StaticZoneStore {
    async fn intersecting_zones(&self, _waypoints: &[LatLon]) -> Result<Vec<ZoneIntersection>> {
        if let Some(reason) = &self.failure {
            bail!("{}", reason);
        }
        Ok(self.zones.clone())
    }
}
