//! Group addressing across the codec, the bus matcher and running devices

use std::sync::Arc;
use std::time::Duration;

use objsim::address::{subscription_patterns, target_topic, Identity, Segment, Suffix, TargetPattern};
use objsim::app::{launch, Stores};
use objsim::config::{DeviceSpec, KindName, SimConfig};
use objsim::device::{Device, PublishingMode};
use objsim::objsim_runtime::{topic_matches, ServiceManager};
use objsim::protocol::CONTROL_TOPIC;
use objsim::store::MetricValue;
use objsim::{Value, WILDCARD};

fn identities() -> Vec<Identity> {
    [
        ("EF", "1", "1.32", "Lamp", "Ceiling Lamp 01"),
        ("EF", "1", "1.32", "Lamp", "Desk Lamp"),
        ("EF", "1", "1.40", "Lamp", "Ceiling Lamp 01"),
        ("EF", "2", "2.01", "Lamp", "Hall Lamp"),
        ("EF", "4", "4.21", "Smoke Detector", "Corridor smoke detector"),
        ("EF", "1", "1.32", "SystemData Publisher", "Computer 01"),
        ("BC", "1", "1.32", "Lamp", "Ceiling Lamp 01"),
    ]
    .into_iter()
    .map(|(b, f, r, t, n)| Identity::new(b, f, r, t, n).unwrap())
    .collect()
}

/// The pattern keeping `identity`'s component wherever `mask` has a bit set
fn shape(identity: &Identity, mask: u8) -> TargetPattern {
    let [b, f, r, t, n] = identity.components().map(|value| value.to_string());
    let pick = |bit: u8, value: String| {
        if mask & (1 << bit) != 0 {
            Segment::Literal(value)
        } else {
            Segment::Any
        }
    };
    TargetPattern::new(pick(4, b), pick(3, f), pick(2, r), pick(1, t), pick(0, n))
}

fn reaches(topic: &str, identity: &Identity) -> bool {
    let change = format!("{}/{}", topic, Suffix::Change);
    subscription_patterns(identity)
        .iter()
        .any(|filter| topic_matches(filter, &change))
}

#[test]
fn every_shape_is_delivered_exactly_to_its_group_or_rejected() {
    let fleet = identities();

    for source in &fleet {
        let mut routable = 0;
        for mask in 0..32u8 {
            let pattern = shape(source, mask);
            let Ok(topic) = target_topic(&pattern) else {
                assert!(!pattern.is_routable(), "{pattern} rejected but routable");
                continue;
            };
            routable += 1;

            for device in &fleet {
                assert_eq!(
                    reaches(&topic, device),
                    pattern.covers(device),
                    "{topic} vs {device}"
                );
            }
        }
        assert_eq!(routable, 9, "routable shapes for {source}");
    }
}

#[test]
fn own_address_is_always_subscribed() {
    for identity in identities() {
        let patterns = subscription_patterns(&identity);
        assert_eq!(patterns[0], format!("{}/+", identity.base_topic()));
        assert!(reaches(&identity.base_topic(), &identity));
        assert!(patterns.iter().all(|p| p.ends_with("/+")));
    }
}

#[test]
fn type_group_skips_other_types() {
    let topic = target_topic(&TargetPattern::of_type("Lamp")).unwrap();
    let detector = Identity::new("EF", "4", "4.21", "Smoke Detector", "Corridor smoke detector").unwrap();
    assert!(!reaches(&topic, &detector));

    let everything = target_topic(&TargetPattern::everything()).unwrap();
    assert_eq!(everything, [WILDCARD; 5].join("/"));
    assert!(reaches(&everything, &detector));
}

// ─────────────────────────────────────────────────────────────────────────────
// Running fleet
// ─────────────────────────────────────────────────────────────────────────────

struct Fleet {
    manager: ServiceManager,
    stores: Stores,
    ceiling: Arc<Device>,
    hall: Arc<Device>,
    detector: Arc<Device>,
    computer: Arc<Device>,
}

async fn fleet() -> Fleet {
    let mut config = SimConfig::default();
    config.devices = vec![
        DeviceSpec::new(KindName::Lamp, "EF", "1", "1.32", "Ceiling Lamp 01"),
        DeviceSpec::new(KindName::Lamp, "EF", "2", "2.01", "Hall Lamp"),
        DeviceSpec::new(KindName::SmokeDetector, "EF", "4", "4.21", "Corridor smoke detector"),
        DeviceSpec::new(KindName::SystemDataPublisher, "EF", "1", "1.32", "Computer 01"),
    ];

    let manager = ServiceManager::new();
    let stores = Stores::memory();
    let devices = tokio_test::assert_ok!(launch(&config, &manager, &stores).await);
    let [ceiling, hall, detector, computer]: [Arc<Device>; 4] = devices.try_into().unwrap();

    Fleet {
        manager,
        stores,
        ceiling,
        hall,
        detector,
        computer,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn shutdown_scenario_halts_continuous_publishing() {
    let fleet = fleet().await;
    let computer = fleet.computer.identity().clone();
    let mut metrics = fleet
        .manager
        .subscribe([format!("{}/metrics/+", computer.base_topic())])
        .unwrap();

    fleet
        .manager
        .emit(computer.topic(&Suffix::Change), "config,publishing_period,20", "test")
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(1), metrics.recv()).await.is_ok());

    fleet.manager.emit(CONTROL_TOPIC, "1", "test").unwrap();
    assert!(
        eventually(|| {
            [&fleet.ceiling, &fleet.hall, &fleet.detector, &fleet.computer]
                .iter()
                .all(|d| d.publishing_mode() == PublishingMode::OnDemand)
        })
        .await
    );

    // Let a cycle already in flight finish, then expect silence
    tokio::time::sleep(Duration::from_millis(100)).await;
    while metrics.try_recv().is_some() {}
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(metrics.try_recv().is_none());

    fleet.manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn lamp_scenario_only_touches_lamps() {
    let fleet = fleet().await;
    let detector_before = fleet.detector.description();

    fleet.manager.emit(CONTROL_TOPIC, "1", "test").unwrap();

    for lamp in [&fleet.ceiling, &fleet.hall] {
        assert!(
            eventually(|| lamp.field_value("brightness").ok() == Some(Value::Integer(0))).await,
            "{} still lit",
            lamp.identity()
        );
        assert_eq!(lamp.field_value("status").unwrap(), Value::text("OFF"));
    }

    // Only the config entry reaches the detector
    let detector_after = fleet.detector.description();
    assert_eq!(detector_after.fields, detector_before.fields);
    assert_eq!(fleet.detector.field_value("status").unwrap(), Value::text("OFF"));

    // The recorder saw the lamp metrics
    let stores = fleet.stores.clone();
    assert!(
        eventually(|| {
            let now = chrono::Utc::now();
            stores
                .metrics
                .query_points("Lamp", now - chrono::Duration::minutes(1), now, None)
                .map(|points| points.iter().any(|p| p.value == MetricValue::Number(0.0)))
                .unwrap_or(false)
        })
        .await
    );

    fleet.manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn smoke_alarm_switches_lamps_on() {
    let fleet = fleet().await;
    let mut control = fleet.manager.subscribe([CONTROL_TOPIC]).unwrap();

    fleet
        .manager
        .emit(
            fleet.detector.identity().topic(&Suffix::Change),
            "field,status,ON",
            "test",
        )
        .unwrap();

    let trigger = tokio::time::timeout(Duration::from_secs(1), control.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trigger.payload, "2");

    for lamp in [&fleet.ceiling, &fleet.hall] {
        assert!(eventually(|| lamp.field_value("brightness").ok() == Some(Value::Integer(255))).await);
        assert_eq!(lamp.field_value("status").unwrap(), Value::text("ON"));
    }

    fleet.manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn room_wide_latency_delays_answers() {
    let fleet = fleet().await;
    let lamp = fleet.ceiling.identity().clone();
    let mut answers = fleet
        .manager
        .subscribe([format!("{}/answer/+", lamp.base_topic())])
        .unwrap();

    let room = target_topic(&TargetPattern::new("EF", "1", "1.32", WILDCARD, WILDCARD)).unwrap();
    fleet
        .manager
        .emit(format!("{room}/change"), "config,response_latency,120", "test")
        .unwrap();

    let sent = tokio::time::Instant::now();
    fleet
        .manager
        .emit(lamp.topic(&Suffix::Request), "field,status,room-1", "test")
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), answers.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(sent.elapsed() >= Duration::from_millis(120));
    assert_eq!(reply.topic, lamp.topic(&Suffix::Answer("room-1".into())));
    assert_eq!(reply.payload, "ON");

    // The hall lamp is on another floor and answers at once
    assert_eq!(
        fleet.hall.config_value("response_latency").unwrap(),
        Value::Integer(0)
    );

    fleet.manager.shutdown_all().await.unwrap();
}
