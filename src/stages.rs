use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use crate::bus::{AuditLog, Publisher, topics};
use crate::dispatch::{VehicleDispatcher, VehicleWorker};
use crate::error::PipelineError;
use crate::model::{
    AuditKind, LocationMatched, LocationUpdate, PollutionMatched, PollutionMatchedMessage,
    TollCalculated, TollCalculatedMessage,
};
use crate::road_matcher::RoadMatcher;
use crate::toll::{Charge, TollLedger};
use crate::windower::SegmentWindower;
use crate::zones::{ZoneIntersector, ZoneStore};

/// A message a stage wants published, plus the state change to apply once
/// it is out
#[derive(Debug, Clone)]
pub struct Outbound<C = ()> {
    pub topic: &'static str,
    pub payload: Vec<u8>,
    pub commit: C,
}

impl Outbound {
    pub fn json<T: Serialize>(topic: &'static str, message: &T) -> Result<Self, PipelineError> {
        Ok(Self {
            topic,
            payload: serde_json::to_vec(message)?,
            commit: (),
        })
    }
}

impl<C> Outbound<C> {
    pub fn with_commit<D>(self, commit: D) -> Outbound<D> {
        Outbound {
            topic: self.topic,
            payload: self.payload,
            commit,
        }
    }
}

/// One pipeline stage: consumes one topic, emits at most one message per
/// input. Implementations hold the stage's state; the runner provides
/// decoding, auditing, per-vehicle ordering and publishing.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    /// Held back by `process` and applied only after a successful publish
    type Commit: Send + 'static;

    /// Name written as `sender` in outbound and audit messages
    const SENDER: &'static str;
    const INPUT_TOPIC: &'static str;

    fn vehicle_id(input: &Self::Input) -> &str;
    fn message_id(input: &Self::Input) -> i64;

    /// `Ok(None)` means the input was absorbed without output yet
    async fn process(
        &self,
        input: Self::Input,
    ) -> Result<Option<Outbound<Self::Commit>>, PipelineError>;

    fn commit(&self, _vehicle_id: &str, _commit: Self::Commit) {}
}

/// What happened to one decoded input
#[derive(Debug)]
pub enum StageReport {
    Published {
        vehicle_id: String,
        message_id: i64,
        topic: &'static str,
    },
    Buffered {
        vehicle_id: String,
        message_id: i64,
    },
    Abandoned {
        vehicle_id: String,
        message_id: i64,
        error: PipelineError,
    },
}

/// Pairs fixes into segments and snaps each segment onto the road network.
/// `location.update` -> `location.matched`
pub struct MapMatcherStage<M> {
    windower: SegmentWindower,
    matcher: M,
}

impl<M: RoadMatcher> MapMatcherStage<M> {
    pub fn new(matcher: M) -> Self {
        Self {
            windower: SegmentWindower::new(),
            matcher,
        }
    }

    pub fn windower(&self) -> &SegmentWindower {
        &self.windower
    }
}

#[async_trait]
impl<M: RoadMatcher> Stage for MapMatcherStage<M> {
    type Input = LocationUpdate;
    type Commit = ();

    const SENDER: &'static str = "map-matcher";
    const INPUT_TOPIC: &'static str = topics::LOCATION_UPDATE;

    fn vehicle_id(input: &LocationUpdate) -> &str {
        &input.data.vehicle_id
    }

    fn message_id(input: &LocationUpdate) -> i64 {
        input.data.message_id
    }

    async fn process(&self, input: LocationUpdate) -> Result<Option<Outbound>, PipelineError> {
        let Some(segment) = self.windower.ingest(input.data) else {
            return Ok(None);
        };

        let path = self.matcher.match_segment(&segment).await?;
        let message = LocationMatched {
            sender: Self::SENDER.to_string(),
            topic: topics::LOCATION_MATCHED.to_string(),
            data: path,
        };
        Outbound::json(topics::LOCATION_MATCHED, &message).map(Some)
    }
}

/// Finds the pollution zones crossed by each matched path.
/// `location.matched` -> `pollution.matched`
pub struct PollutionMatcherStage<S> {
    intersector: ZoneIntersector<S>,
}

impl<S: ZoneStore> PollutionMatcherStage<S> {
    pub fn new(store: S) -> Self {
        Self {
            intersector: ZoneIntersector::new(store),
        }
    }
}

#[async_trait]
impl<S: ZoneStore> Stage for PollutionMatcherStage<S> {
    type Input = LocationMatched;
    type Commit = ();

    const SENDER: &'static str = "pollution-matcher";
    const INPUT_TOPIC: &'static str = topics::LOCATION_MATCHED;

    fn vehicle_id(input: &LocationMatched) -> &str {
        &input.data.vehicle_id
    }

    fn message_id(input: &LocationMatched) -> i64 {
        input.data.message_id
    }

    async fn process(&self, input: LocationMatched) -> Result<Option<Outbound>, PipelineError> {
        let path = input.data;
        let segments = self.intersector.try_intersect(&path).await?;

        let message = PollutionMatchedMessage {
            data: PollutionMatched {
                message_id: path.message_id,
                vehicle_id: path.vehicle_id,
                timestamp: path.timestamp,
                sender: Self::SENDER.to_string(),
                topic: topics::POLLUTION_MATCHED.to_string(),
                segments,
            },
        };
        Outbound::json(topics::POLLUTION_MATCHED, &message).map(Some)
    }
}

/// Charges zone hits to each vehicle's running total.
/// `pollution.matched` -> `toll.calculated`
pub struct TollCalculatorStage {
    ledger: TollLedger,
}

impl TollCalculatorStage {
    pub fn new(ledger: TollLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &TollLedger {
        &self.ledger
    }
}

#[async_trait]
impl Stage for TollCalculatorStage {
    type Input = PollutionMatchedMessage;
    type Commit = Charge;

    const SENDER: &'static str = "toll-calculator";
    const INPUT_TOPIC: &'static str = topics::POLLUTION_MATCHED;

    fn vehicle_id(input: &PollutionMatchedMessage) -> &str {
        &input.data.vehicle_id
    }

    fn message_id(input: &PollutionMatchedMessage) -> i64 {
        input.data.message_id
    }

    async fn process(
        &self,
        input: PollutionMatchedMessage,
    ) -> Result<Option<Outbound<Charge>>, PipelineError> {
        let matched = input.data;
        // the ledger only moves once toll.calculated is on the bus
        let charge = self.ledger.quote(&matched.vehicle_id, &matched.segments);

        let message = TollCalculatedMessage {
            data: TollCalculated {
                message_id: matched.message_id,
                vehicle_id: matched.vehicle_id,
                timestamp: matched.timestamp,
                sender: Self::SENDER.to_string(),
                topic: topics::TOLL_CALCULATED.to_string(),
                increment: charge.increment,
                total_toll: charge.total,
            },
        };
        let outbound = Outbound::json(topics::TOLL_CALCULATED, &message)?;
        Ok(Some(outbound.with_commit(charge)))
    }

    fn commit(&self, vehicle_id: &str, charge: Charge) {
        self.ledger.apply(vehicle_id, charge.increment);
    }
}

/// Runs a stage's `process` and publishes whatever it produces
struct StageWorker<S, P> {
    stage: Arc<S>,
    publisher: Arc<P>,
    audit: AuditLog<P>,
    reports: mpsc::UnboundedSender<StageReport>,
}

#[async_trait]
impl<S: Stage, P: Publisher> VehicleWorker for StageWorker<S, P> {
    type Job = S::Input;

    async fn run(&self, input: S::Input) {
        let vehicle_id = S::vehicle_id(&input).to_string();
        let message_id = S::message_id(&input);

        let report = match self.stage.process(input).await {
            Ok(Some(Outbound {
                topic,
                payload,
                commit,
            })) => {
                match self.publisher.publish(topic, payload).await {
                    Ok(()) => {
                        self.stage.commit(&vehicle_id, commit);
                        self.audit.record(message_id, AuditKind::Sent).await;
                        StageReport::Published {
                            vehicle_id,
                            message_id,
                            topic,
                        }
                    }
                    Err(e) => StageReport::Abandoned {
                        vehicle_id,
                        message_id,
                        error: PipelineError::upstream(
                            "bus",
                            format!("publish to {}: {}", topic, e),
                        ),
                    },
                }
            }
            Ok(None) => StageReport::Buffered {
                vehicle_id,
                message_id,
            },
            Err(error) => StageReport::Abandoned {
                vehicle_id,
                message_id,
                error,
            },
        };

        // the runner may have gone away during shutdown
        let _ = self.reports.send(report);
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Queued jobs per vehicle before the backlog is logged
    pub backlog_warning: usize,
    /// Release a vehicle's worker after this long without input
    pub idle_worker_ttl: Option<Duration>,
    pub framework: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            backlog_warning: 64,
            idle_worker_ttl: Some(Duration::from_secs(600)),
            framework: "tokio".to_string(),
        }
    }
}

/// Feeds a stage from its input topic
pub struct StageRunner<S: Stage, P: Publisher> {
    dispatcher: VehicleDispatcher<StageWorker<S, P>>,
    audit: AuditLog<P>,
    idle_worker_ttl: Option<Duration>,
}

impl<S: Stage, P: Publisher> StageRunner<S, P> {
    /// Returns the runner and the channel its [`StageReport`]s arrive on
    pub fn new(
        stage: Arc<S>,
        publisher: Arc<P>,
        settings: RunnerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<StageReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let audit = AuditLog::new(Arc::clone(&publisher), S::SENDER, settings.framework);
        let worker = StageWorker {
            stage,
            publisher,
            audit: audit.clone(),
            reports,
        };

        let runner = Self {
            dispatcher: VehicleDispatcher::new(Arc::new(worker), settings.backlog_warning),
            audit,
            idle_worker_ttl: settings.idle_worker_ttl,
        };
        (runner, rx)
    }

    /// Decode one raw payload and queue it on its vehicle's worker
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let input: S::Input = serde_json::from_slice(payload).map_err(|source| {
            PipelineError::Decode {
                topic: S::INPUT_TOPIC,
                source,
            }
        })?;

        let message_id = S::message_id(&input);
        debug!(
            "[{}] received message {} for vehicle {}",
            S::SENDER,
            message_id,
            S::vehicle_id(&input)
        );
        self.audit.record(message_id, AuditKind::Received).await;

        let vehicle_id = S::vehicle_id(&input).to_string();
        self.dispatcher.dispatch(&vehicle_id, input);
        Ok(())
    }

    /// Consume `inbound` until it ends, releasing idle vehicle workers on
    /// the way. Malformed payloads are dropped; the stream ending means the
    /// bus is gone, which is fatal.
    pub async fn run<I>(self, mut inbound: I) -> Result<(), PipelineError>
    where
        I: Stream<Item = Vec<u8>> + Unpin,
    {
        info!("[{}] consuming {}", S::SENDER, S::INPUT_TOPIC);
        let reap_every = self
            .idle_worker_ttl
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_secs(1));
        let mut reap = time::interval(reap_every);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                payload = inbound.next() => {
                    let Some(payload) = payload else {
                        break;
                    };
                    if let Err(e) = self.handle_payload(&payload).await {
                        warn!("[{}] dropping message: {}", S::SENDER, e);
                    }
                }
                _ = reap.tick(), if self.idle_worker_ttl.is_some() => {
                    if let Some(ttl) = self.idle_worker_ttl {
                        self.dispatcher.reap_idle(ttl);
                    }
                }
            }
        }
        Err(PipelineError::Fatal(format!(
            "subscription to {} closed",
            S::INPUT_TOPIC
        )))
    }
}

/// Log every report a runner's workers send back
pub async fn log_reports(sender: &'static str, mut reports: mpsc::UnboundedReceiver<StageReport>) {
    while let Some(report) = reports.recv().await {
        match report {
            StageReport::Published {
                vehicle_id,
                message_id,
                topic,
            } => debug!(
                "[{}] vehicle {} message {} published to {}",
                sender, vehicle_id, message_id, topic
            ),
            StageReport::Buffered {
                vehicle_id,
                message_id,
            } => debug!(
                "[{}] vehicle {} message {} buffered",
                sender, vehicle_id, message_id
            ),
            StageReport::Abandoned {
                vehicle_id,
                message_id,
                error,
            } => warn!(
                "[{}] vehicle {} message {} abandoned: {}",
                sender, vehicle_id, message_id, error
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::model::{LatLon, LocationFix, MatchedPath, PollutionZoneHit};
    use crate::toll::RateTable;
    use crate::zones::StaticZoneStore;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn pollution_matched(message_id: i64, level: i32) -> Vec<u8> {
        let message = PollutionMatchedMessage {
            data: PollutionMatched {
                message_id,
                vehicle_id: "car1".to_string(),
                timestamp: "2018-11-02T10:00:02Z".to_string(),
                sender: "pollution-matcher".to_string(),
                topic: topics::POLLUTION_MATCHED.to_string(),
                segments: vec![PollutionZoneHit {
                    zone_id: 1,
                    pollution_level: level,
                    boundary: [LatLon::new(0.0, 0.0), LatLon::new(0.0, 0.001)],
                }],
            },
        };
        serde_json::to_vec(&message).unwrap()
    }

    fn toll_stage() -> Arc<TollCalculatorStage> {
        Arc::new(TollCalculatorStage::new(TollLedger::new(RateTable::default())))
    }

    /// Memory bus whose `toll.calculated` topic can be switched off
    struct FlakyTollTopic {
        bus: MemoryBus,
        down: AtomicBool,
    }

    #[async_trait]
    impl Publisher for FlakyTollTopic {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            if topic == topics::TOLL_CALCULATED && self.down.load(Ordering::SeqCst) {
                anyhow::bail!("bus down");
            }
            self.bus.publish(topic, payload).await
        }
    }

    #[tokio::test]
    async fn toll_stage_publishes_increment_and_total() {
        let bus = Arc::new(MemoryBus::new());
        let stage = toll_stage();
        let (runner, mut reports) =
            StageRunner::new(stage.clone(), bus.clone(), RunnerSettings::default());

        runner.handle_payload(&pollution_matched(9, 2)).await.unwrap();

        assert!(matches!(
            reports.recv().await.unwrap(),
            StageReport::Published { message_id: 9, .. }
        ));

        let published = bus.messages(topics::TOLL_CALCULATED).await;
        let value: Value = serde_json::from_slice(&published[0]).unwrap();
        let total = stage.ledger().total("car1").unwrap();
        assert_eq!(value["data"]["totalToll"].as_f64().unwrap(), total);
        assert_eq!(value["data"]["increment"].as_f64().unwrap(), total);
        assert_eq!(value["data"]["sender"], "toll-calculator");

        let logs = bus.messages(topics::LOGS).await;
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn failed_toll_publish_does_not_charge() {
        let bus = Arc::new(FlakyTollTopic {
            bus: MemoryBus::new(),
            down: AtomicBool::new(true),
        });
        let stage = toll_stage();
        let (runner, mut reports) =
            StageRunner::new(stage.clone(), bus.clone(), RunnerSettings::default());

        runner.handle_payload(&pollution_matched(9, 3)).await.unwrap();
        match reports.recv().await.unwrap() {
            StageReport::Abandoned { error, .. } => {
                assert!(matches!(error, PipelineError::Upstream { .. }));
                assert!(error.to_string().contains("bus down"));
            }
            other => panic!("expected abandoned message, got {:?}", other),
        }
        assert_eq!(stage.ledger().total("car1"), None);

        // redelivery once the bus is back charges exactly once
        bus.down.store(false, Ordering::SeqCst);
        runner.handle_payload(&pollution_matched(9, 3)).await.unwrap();
        assert!(matches!(
            reports.recv().await.unwrap(),
            StageReport::Published { message_id: 9, .. }
        ));

        let published = bus.bus.messages(topics::TOLL_CALCULATED).await;
        assert_eq!(published.len(), 1);
        let value: Value = serde_json::from_slice(&published[0]).unwrap();
        let total = stage.ledger().total("car1").unwrap();
        assert!(total > 0.0);
        assert_eq!(value["data"]["increment"].as_f64().unwrap(), total);
        assert_eq!(value["data"]["totalToll"].as_f64().unwrap(), total);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error() {
        let bus = Arc::new(MemoryBus::new());
        let (runner, _reports) =
            StageRunner::new(toll_stage(), bus.clone(), RunnerSettings::default());

        let err = runner.handle_payload(b"{\"data\": 12}").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode {
                topic: topics::POLLUTION_MATCHED,
                ..
            }
        ));
        assert!(bus.messages(topics::LOGS).await.is_empty());
    }

    #[tokio::test]
    async fn run_drops_garbage_and_fails_when_stream_ends() {
        let bus = Arc::new(MemoryBus::new());
        let stage = Arc::new(PollutionMatcherStage::new(StaticZoneStore::new(Vec::new())));
        let (runner, mut reports) = StageRunner::new(stage, bus.clone(), RunnerSettings::default());

        let path = LocationMatched {
            sender: "map-matcher".to_string(),
            topic: topics::LOCATION_MATCHED.to_string(),
            data: MatchedPath {
                message_id: 3,
                vehicle_id: "car1".to_string(),
                timestamp: "2018-11-02T10:00:02Z".to_string(),
                waypoints: vec![LatLon::new(52.52, 13.405), LatLon::new(52.521, 13.406)],
            },
        };
        let inbound = futures::stream::iter(vec![
            b"not json".to_vec(),
            serde_json::to_vec(&path).unwrap(),
        ]);

        let err = runner.run(inbound).await.unwrap_err();
        assert!(err.is_fatal());

        assert!(matches!(
            reports.recv().await.unwrap(),
            StageReport::Published { message_id: 3, .. }
        ));
        let published = bus.messages(topics::POLLUTION_MATCHED).await;
        let value: Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(value["data"]["segments"], json!([]));
        assert_eq!(value["data"]["vehicleId"], "car1");
    }

    #[tokio::test]
    async fn first_fix_is_buffered_without_output() {
        struct Unreachable;

        #[async_trait]
        impl RoadMatcher for Unreachable {
            async fn match_segment(
                &self,
                _segment: &crate::model::Segment,
            ) -> Result<MatchedPath, crate::error::MatchError> {
                Err(crate::error::MatchError::unavailable("not expected"))
            }
        }

        let bus = Arc::new(MemoryBus::new());
        let stage = Arc::new(MapMatcherStage::new(Unreachable));
        let (runner, mut reports) =
            StageRunner::new(stage.clone(), bus.clone(), RunnerSettings::default());

        let update = LocationUpdate {
            event: "location.update".to_string(),
            data: LocationFix {
                vehicle_id: "car1".to_string(),
                message_id: 1,
                timestamp: "2018-11-02T10:00:01Z".to_string(),
                latitude: 52.52,
                longitude: 13.405,
                accuracy: 3.0,
            },
        };
        runner
            .handle_payload(&serde_json::to_vec(&update).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            reports.recv().await.unwrap(),
            StageReport::Buffered { message_id: 1, .. }
        ));
        assert_eq!(stage.windower().pending_len("car1"), 1);
        assert!(bus.messages(topics::LOCATION_MATCHED).await.is_empty());
    }
}
