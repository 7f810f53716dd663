use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use log::debug;

use crate::model::{LatLon, PollutionZoneHit};

/// Earth radius used for toll distances (meters)
pub const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

pub const MIN_POLLUTION_LEVEL: i32 = 1;
pub const MAX_POLLUTION_LEVEL: i32 = 9;

/// Great-circle distance in meters.
///
/// Charges are compared against reference outputs, so this keeps the exact
/// haversine form and radius rather than using a library distance.
pub fn haversine_distance(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Charge per meter for each pollution level.
///
/// Levels without an entry charge nothing. Rates are never negative, which
/// keeps every ledger total non-decreasing.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    rates: BTreeMap<i32, f64>,
}

impl Default for RateTable {
    /// One unit per meter per pollution level: `rate[level] = level`
    fn default() -> Self {
        Self {
            rates: (MIN_POLLUTION_LEVEL..=MAX_POLLUTION_LEVEL)
                .map(|level| (level, level as f64))
                .collect(),
        }
    }
}

impl RateTable {
    pub fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, level: i32, rate: f64) -> Result<Self> {
        if !(MIN_POLLUTION_LEVEL..=MAX_POLLUTION_LEVEL).contains(&level) {
            bail!(
                "pollution level {} outside {}..={}",
                level,
                MIN_POLLUTION_LEVEL,
                MAX_POLLUTION_LEVEL
            );
        }
        if !rate.is_finite() || rate < 0.0 {
            bail!("rate for level {} must be a non-negative number, got {}", level, rate);
        }
        self.rates.insert(level, rate);
        Ok(self)
    }

    pub fn rate(&self, level: i32) -> f64 {
        self.rates.get(&level).copied().unwrap_or(0.0)
    }
}

impl FromStr for RateTable {
    type Err = anyhow::Error;

    /// Parses `level=rate` pairs separated by commas, e.g. `1=0.5,3=3`.
    /// Levels left out charge nothing.
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .try_fold(RateTable::empty(), |table, pair| {
                let (level, rate) = pair
                    .split_once('=')
                    .with_context(|| format!("expected level=rate, got '{}'", pair))?;
                let level: i32 = level
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid pollution level in '{}'", pair))?;
                let rate: f64 = rate
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid rate in '{}'", pair))?;
                table.with_rate(level, rate)
            })
    }
}

/// Outcome of charging one batch of hits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Charge {
    pub increment: f64,
    /// Vehicle total after the increment was applied
    pub total: f64,
}

/// Running toll per vehicle.
///
/// Entries are created on the first charge and live as long as the process.
/// The per-vehicle read-modify-write runs under the map's entry lock.
pub struct TollLedger {
    rates: RateTable,
    totals: DashMap<String, f64>,
}

impl TollLedger {
    pub fn new(rates: RateTable) -> Self {
        Self {
            rates,
            totals: DashMap::new(),
        }
    }

    /// Price of a batch of hits without touching the ledger
    pub fn increment(&self, hits: &[PollutionZoneHit]) -> f64 {
        hits.iter()
            .map(|hit| {
                haversine_distance(hit.boundary[0], hit.boundary[1])
                    * self.rates.rate(hit.pollution_level)
            })
            .sum()
    }

    /// What charging `hits` would do, without touching the ledger. Only
    /// exact while no other charge for the vehicle lands before the matching
    /// [`apply`](Self::apply).
    pub fn quote(&self, vehicle_id: &str, hits: &[PollutionZoneHit]) -> Charge {
        let increment = self.increment(hits);
        Charge {
            increment,
            total: self.total(vehicle_id).unwrap_or(0.0) + increment,
        }
    }

    /// Add `increment` to the vehicle's total and return the new total
    pub fn apply(&self, vehicle_id: &str, increment: f64) -> f64 {
        let mut total = self.totals.entry(vehicle_id.to_string()).or_insert(0.0);
        *total += increment;
        debug!(
            "Vehicle {} charged {:.3}, total {:.3}",
            vehicle_id, increment, *total
        );
        *total
    }

    /// Add the price of `hits` to the vehicle's total
    pub fn charge(&self, vehicle_id: &str, hits: &[PollutionZoneHit]) -> Charge {
        let increment = self.increment(hits);
        Charge {
            increment,
            total: self.apply(vehicle_id, increment),
        }
    }

    pub fn total(&self, vehicle_id: &str) -> Option<f64> {
        self.totals.get(vehicle_id).map(|total| *total)
    }

    /// All totals, ordered by vehicle id
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut totals: Vec<_> = self
            .totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        totals.sort_by(|a, b| a.0.cmp(&b.0));
        totals
    }
}
