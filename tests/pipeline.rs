use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

use tollstream::bus::{MemoryBus, topics};
use tollstream::error::{MatchError, PipelineError};
use tollstream::model::{LatLon, MatchedPath, Segment};
use tollstream::road_matcher::RoadMatcher;
use tollstream::stages::{
    MapMatcherStage, PollutionMatcherStage, RunnerSettings, StageReport, StageRunner,
    TollCalculatorStage,
};
use tollstream::toll::{RateTable, TollLedger, haversine_distance};
use tollstream::zones::{StaticZoneStore, ZoneIntersection};

/// Road matcher that snaps every segment exactly onto its own fixes
struct EchoMatcher;

#[async_trait]
impl RoadMatcher for EchoMatcher {
    async fn match_segment(&self, segment: &Segment) -> Result<MatchedPath, MatchError> {
        Ok(MatchedPath {
            message_id: segment.message_id,
            vehicle_id: segment.vehicle_id.clone(),
            timestamp: segment.timestamp().to_string(),
            waypoints: vec![segment.fix_a.position(), segment.fix_b.position()],
        })
    }
}

struct DownMatcher;

#[async_trait]
impl RoadMatcher for DownMatcher {
    async fn match_segment(&self, _segment: &Segment) -> Result<MatchedPath, MatchError> {
        Err(MatchError::unavailable("connection refused"))
    }
}

fn location_update(vehicle: &str, message_id: i64, lat: f64, lon: f64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": "location.update",
        "data": {
            "vehicleId": vehicle,
            "messageId": message_id,
            "timestamp": format!("2018-11-02T10:00:{:02}Z", message_id),
            "latitude": lat,
            "longitude": lon,
            "accuracy": 4.0
        }
    }))
    .unwrap()
}

fn scenario_zone() -> ZoneIntersection {
    ZoneIntersection {
        zone_id: 17,
        pollution_level: 3,
        geojson: r#"{"type":"LineString","coordinates":[[13.405,52.52],[13.406,52.521]]}"#
            .to_string(),
    }
}

fn toll_stage() -> Arc<TollCalculatorStage> {
    let rates = RateTable::empty().with_rate(3, 3.0).unwrap();
    Arc::new(TollCalculatorStage::new(TollLedger::new(rates)))
}

async fn next_report(reports: &mut UnboundedReceiver<StageReport>) -> StageReport {
    tokio::time::timeout(std::time::Duration::from_secs(5), reports.recv())
        .await
        .expect("stage did not report in time")
        .expect("report channel closed")
}

#[tokio::test]
async fn two_fixes_produce_one_toll_charge() {
    let bus = Arc::new(MemoryBus::new());

    let (map_runner, mut map_reports) = StageRunner::new(
        Arc::new(MapMatcherStage::new(EchoMatcher)),
        bus.clone(),
        RunnerSettings::default(),
    );
    let (zone_runner, mut zone_reports) = StageRunner::new(
        Arc::new(PollutionMatcherStage::new(StaticZoneStore::new(vec![scenario_zone()]))),
        bus.clone(),
        RunnerSettings::default(),
    );
    let tolls = toll_stage();
    let (toll_runner, mut toll_reports) =
        StageRunner::new(tolls.clone(), bus.clone(), RunnerSettings::default());

    map_runner
        .handle_payload(&location_update("car1", 1, 52.5200, 13.4050))
        .await
        .unwrap();
    assert!(matches!(next_report(&mut map_reports).await, StageReport::Buffered { .. }));

    map_runner
        .handle_payload(&location_update("car1", 2, 52.5210, 13.4060))
        .await
        .unwrap();
    assert!(matches!(
        next_report(&mut map_reports).await,
        StageReport::Published {
            message_id: 2,
            topic: topics::LOCATION_MATCHED,
            ..
        }
    ));

    let matched = bus.messages(topics::LOCATION_MATCHED).await;
    assert_eq!(matched.len(), 1);
    let value: Value = serde_json::from_slice(&matched[0]).unwrap();
    assert_eq!(value["data"]["route"][0], json!({"lat": 52.52, "lon": 13.405}));
    assert_eq!(value["data"]["route"][1], json!({"lat": 52.521, "lon": 13.406}));

    zone_runner.handle_payload(&matched[0]).await.unwrap();
    assert!(matches!(
        next_report(&mut zone_reports).await,
        StageReport::Published { .. }
    ));

    let polluted = bus.messages(topics::POLLUTION_MATCHED).await;
    let value: Value = serde_json::from_slice(&polluted[0]).unwrap();
    assert_eq!(value["data"]["segments"][0]["segmentId"], 17);
    assert_eq!(value["data"]["segments"][0]["pollutionLevel"], 3);
    assert_eq!(
        value["data"]["segments"][0]["segmentSections"],
        json!([{"lat": 52.52, "lon": 13.405}, {"lat": 52.521, "lon": 13.406}])
    );

    toll_runner.handle_payload(&polluted[0]).await.unwrap();
    assert!(matches!(
        next_report(&mut toll_reports).await,
        StageReport::Published { .. }
    ));

    let expected =
        haversine_distance(LatLon::new(52.52, 13.405), LatLon::new(52.521, 13.406)) * 3.0;
    assert_eq!(tolls.ledger().total("car1"), Some(expected));

    let charged = bus.messages(topics::TOLL_CALCULATED).await;
    let value: Value = serde_json::from_slice(&charged[0]).unwrap();
    assert_eq!(value["data"]["vehicleId"], "car1");
    assert_eq!(value["data"]["messageId"], 2);
    assert_eq!(value["data"]["increment"].as_f64(), Some(expected));
    assert_eq!(value["data"]["totalToll"].as_f64(), Some(expected));

    // every stage logs receipt of each input and each publish
    let logs = bus.messages(topics::LOGS).await;
    let kinds: Vec<(String, String)> = logs
        .iter()
        .map(|raw| {
            let v: Value = serde_json::from_slice(raw).unwrap();
            (
                v["data"]["sender"].as_str().unwrap().to_string(),
                v["data"]["type"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    let count = |sender: &str, kind: &str| {
        kinds
            .iter()
            .filter(|(s, k)| s == sender && k == kind)
            .count()
    };
    assert_eq!(count("map-matcher", "received"), 2);
    assert_eq!(count("map-matcher", "sent"), 1);
    assert_eq!(count("pollution-matcher", "received"), 1);
    assert_eq!(count("pollution-matcher", "sent"), 1);
    assert_eq!(count("toll-calculator", "received"), 1);
    assert_eq!(count("toll-calculator", "sent"), 1);
}

#[tokio::test]
async fn road_matcher_failure_publishes_nothing() {
    let bus = Arc::new(MemoryBus::new());
    let (map_runner, mut map_reports) = StageRunner::new(
        Arc::new(MapMatcherStage::new(DownMatcher)),
        bus.clone(),
        RunnerSettings::default(),
    );

    map_runner
        .handle_payload(&location_update("car1", 1, 52.5200, 13.4050))
        .await
        .unwrap();
    map_runner
        .handle_payload(&location_update("car1", 2, 52.5210, 13.4060))
        .await
        .unwrap();

    assert!(matches!(next_report(&mut map_reports).await, StageReport::Buffered { .. }));
    match next_report(&mut map_reports).await {
        StageReport::Abandoned { message_id, error, .. } => {
            assert_eq!(message_id, 2);
            assert!(matches!(error, PipelineError::Upstream { .. }));
            assert!(error.to_string().contains("service_unavailable"));
        }
        other => panic!("expected abandoned segment, got {:?}", other),
    }

    assert!(bus.messages(topics::LOCATION_MATCHED).await.is_empty());
}

#[tokio::test]
async fn zone_store_failure_publishes_nothing_downstream() {
    let bus = Arc::new(MemoryBus::new());
    let (zone_runner, mut zone_reports) = StageRunner::new(
        Arc::new(PollutionMatcherStage::new(StaticZoneStore::failing(
            "relation does not exist",
        ))),
        bus.clone(),
        RunnerSettings::default(),
    );

    let matched = json!({
        "sender": "map-matcher",
        "topic": "location.matched",
        "data": {
            "messageId": 2,
            "vehicleId": "car1",
            "timestamp": "2018-11-02T10:00:02Z",
            "route": [{"lat": 52.52, "lon": 13.405}, {"lat": 52.521, "lon": 13.406}]
        }
    });
    zone_runner
        .handle_payload(&serde_json::to_vec(&matched).unwrap())
        .await
        .unwrap();

    assert!(matches!(
        next_report(&mut zone_reports).await,
        StageReport::Abandoned { .. }
    ));
    assert!(bus.messages(topics::POLLUTION_MATCHED).await.is_empty());
}

#[tokio::test]
async fn interleaved_vehicles_are_paired_separately() {
    let bus = Arc::new(MemoryBus::new());
    let (map_runner, mut map_reports) = StageRunner::new(
        Arc::new(MapMatcherStage::new(EchoMatcher)),
        bus.clone(),
        RunnerSettings::default(),
    );

    let fixes = [
        ("car1", 1, 52.50),
        ("car2", 2, 48.10),
        ("car1", 3, 52.51),
        ("car2", 4, 48.11),
    ];
    for (vehicle, id, lat) in fixes {
        map_runner
            .handle_payload(&location_update(vehicle, id, lat, 13.0))
            .await
            .unwrap();
    }
    for _ in 0..4 {
        next_report(&mut map_reports).await;
    }

    let mut routes: Vec<(String, Vec<f64>)> = bus
        .messages(topics::LOCATION_MATCHED)
        .await
        .iter()
        .map(|raw| {
            let v: Value = serde_json::from_slice(raw).unwrap();
            let lats = v["data"]["route"]
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p["lat"].as_f64().unwrap())
                .collect();
            (v["data"]["vehicleId"].as_str().unwrap().to_string(), lats)
        })
        .collect();
    routes.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        routes,
        vec![
            ("car1".to_string(), vec![52.50, 52.51]),
            ("car2".to_string(), vec![48.10, 48.11]),
        ]
    );
}

#[tokio::test]
async fn unknown_pollution_level_is_charged_zero() {
    let bus = Arc::new(MemoryBus::new());
    let tolls = toll_stage();
    let (toll_runner, mut toll_reports) =
        StageRunner::new(tolls.clone(), bus.clone(), RunnerSettings::default());

    let message = json!({
        "data": {
            "messageId": 5,
            "carId": 2,
            "timestamp": "2018-11-02T10:00:05Z",
            "sender": "pollution-matcher",
            "topic": "pollution.matched",
            "segments": [{
                "segmentId": 1,
                "pollutionLevel": 7,
                "segmentSections": [{"lat": 52.52, "lon": 13.405}, {"lat": 52.521, "lon": 13.406}]
            }]
        }
    });
    toll_runner
        .handle_payload(&serde_json::to_vec(&message).unwrap())
        .await
        .unwrap();

    assert!(matches!(
        next_report(&mut toll_reports).await,
        StageReport::Published { .. }
    ));
    assert_eq!(tolls.ledger().total("2"), Some(0.0));
}
