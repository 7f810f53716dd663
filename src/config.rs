use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::stages::RunnerSettings;
use crate::toll::RateTable;

/// Which pipeline stage this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    MapMatcher,
    PollutionMatcher,
    TollCalculator,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::MapMatcher => "map-matcher",
            StageKind::PollutionMatcher => "pollution-matcher",
            StageKind::TollCalculator => "toll-calculator",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "map-matcher" => Ok(StageKind::MapMatcher),
            "pollution-matcher" => Ok(StageKind::PollutionMatcher),
            "toll-calculator" => Ok(StageKind::TollCalculator),
            other => bail!(
                "unknown stage '{}', expected map-matcher, pollution-matcher or toll-calculator",
                other
            ),
        }
    }
}

/// Process configuration, read from the environment
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// NATS server address
    pub nats_uri: String,
    /// PostGIS connection string, only needed by the pollution matcher
    pub pg_uri: Option<String>,
    /// Base URL of the OSRM-compatible road matching service
    pub road_matcher_url: String,
    /// Search radius around each fix when matching (meters)
    pub match_radius_meters: f64,
    /// Transport timeout for road matching requests
    pub http_timeout: Duration,
    pub toll_rates: RateTable,
    /// Drop unpaired fixes after this long without a new fix. `None` keeps
    /// them forever.
    pub pending_fix_ttl: Option<Duration>,
    /// Queued jobs per vehicle before its backlog is logged
    pub worker_backlog_warning: usize,
    /// Release a vehicle's worker after this long without input. `None`
    /// keeps workers for the life of the process.
    pub worker_idle_ttl: Option<Duration>,
    /// Framework label in audit records
    pub audit_framework: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            nats_uri: "nats://localhost:4222".to_string(),
            pg_uri: None,
            road_matcher_url: "http://localhost:5000".to_string(),
            match_radius_meters: 20.0,
            http_timeout: Duration::from_secs(10),
            toll_rates: RateTable::default(),
            pending_fix_ttl: None,
            worker_backlog_warning: 64,
            worker_idle_ttl: Some(Duration::from_secs(600)),
            audit_framework: "tokio".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or blank variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(uri) = var("NATS_URI") {
            config.nats_uri = uri;
        }
        config.pg_uri = var("PG_URI");
        if let Some(url) = var("ROAD_MATCHER_URL") {
            config.road_matcher_url = url;
        }
        if let Some(radius) = var("MATCH_RADIUS_METERS") {
            config.match_radius_meters = radius
                .trim()
                .parse()
                .with_context(|| format!("MATCH_RADIUS_METERS: invalid value '{}'", radius))?;
            if config.match_radius_meters <= 0.0 {
                bail!("MATCH_RADIUS_METERS must be positive");
            }
        }
        if let Some(secs) = var("HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(
                secs.trim()
                    .parse()
                    .with_context(|| format!("HTTP_TIMEOUT_SECS: invalid value '{}'", secs))?,
            );
        }
        if let Some(rates) = var("TOLL_RATES") {
            config.toll_rates = rates.parse().context("TOLL_RATES")?;
        }
        if let Some(secs) = var("PENDING_FIX_TTL_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("PENDING_FIX_TTL_SECS: invalid value '{}'", secs))?;
            config.pending_fix_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(depth) = var("WORKER_BACKLOG_WARNING") {
            config.worker_backlog_warning = depth
                .trim()
                .parse()
                .with_context(|| format!("WORKER_BACKLOG_WARNING: invalid value '{}'", depth))?;
        }
        if let Some(secs) = var("WORKER_IDLE_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("WORKER_IDLE_SECS: invalid value '{}'", secs))?;
            // 0 disables reaping
            config.worker_idle_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(framework) = var("AUDIT_FRAMEWORK") {
            config.audit_framework = framework;
        }

        Ok(config)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            backlog_warning: self.worker_backlog_warning,
            idle_worker_ttl: self.worker_idle_ttl,
            framework: self.audit_framework.clone(),
        }
    }
}
