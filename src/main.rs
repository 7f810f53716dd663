use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use log::{info, warn};
use migration::{Migrator, MigratorTrait};
use tokio::time;

use tollstream::bus::NatsBus;
use tollstream::config::{PipelineConfig, StageKind};
use tollstream::road_matcher::{OsrmMatcher, RoadMatcher};
use tollstream::stages::{
    MapMatcherStage, PollutionMatcherStage, Stage, StageRunner, TollCalculatorStage, log_reports,
};
use tollstream::toll::TollLedger;
use tollstream::zones::PostgisZoneStore;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .target(env_logger::Target::Stderr)
        .init();

    let stage: StageKind = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STAGE").ok())
        .ok_or_else(|| {
            anyhow!("usage: tollstream <map-matcher|pollution-matcher|toll-calculator>")
        })?
        .parse()?;
    let config = PipelineConfig::from_env()?;
    info!("Starting {} stage", stage);

    let bus = Arc::new(NatsBus::connect(&config.nats_uri).await?);

    match stage {
        StageKind::MapMatcher => {
            let matcher = OsrmMatcher::new(
                config.road_matcher_url.clone(),
                config.match_radius_meters,
                config.http_timeout,
            )?;
            let stage = Arc::new(MapMatcherStage::new(matcher));
            if let Some(ttl) = config.pending_fix_ttl {
                spawn_pending_fix_eviction(Arc::clone(&stage), ttl);
            }
            run_stage(stage, bus, &config).await
        }
        StageKind::PollutionMatcher => {
            let uri = config
                .pg_uri
                .as_deref()
                .context("PG_URI must be set for the pollution matcher")?;
            let store = PostgisZoneStore::connect(uri).await?;
            Migrator::up(store.connection(), None)
                .await
                .context("zone table migration failed")?;
            run_stage(Arc::new(PollutionMatcherStage::new(store)), bus, &config).await
        }
        StageKind::TollCalculator => {
            let ledger = TollLedger::new(config.toll_rates.clone());
            run_stage(Arc::new(TollCalculatorStage::new(ledger)), bus, &config).await
        }
    }
}

async fn run_stage<S: Stage>(
    stage: Arc<S>,
    bus: Arc<NatsBus>,
    config: &PipelineConfig,
) -> Result<()> {
    let inbound = bus
        .subscribe(S::INPUT_TOPIC)
        .await?
        .map(|message| message.payload.to_vec());

    let (runner, reports) = StageRunner::new(stage, bus, config.runner_settings());
    tokio::spawn(log_reports(S::SENDER, reports));

    runner.run(inbound).await?;
    Ok(())
}

/// Periodically drops fixes that never got a partner within `ttl`
fn spawn_pending_fix_eviction<M: RoadMatcher>(stage: Arc<MapMatcherStage<M>>, ttl: Duration) {
    info!("Evicting unpaired fixes idle for more than {:?}", ttl);
    tokio::spawn(async move {
        let mut interval = time::interval(ttl.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let evicted = stage.windower().evict_idle(ttl);
            if evicted > 0 {
                warn!("Evicted {} unpaired fix(es)", evicted);
            }
        }
    });
}
