//! End-to-end scenarios for the early-warning pipeline.
//!
//! Each test assembles a simulation system (recording notification channels,
//! scripted feeds, fixed user location) and drives it through the public API:
//! 1. Feed reports and crowd candidates enter the pipeline
//! 2. The event store merges them into canonical events
//! 3. Store updates are evaluated for the user and dispatched
//!
//! Sensor input is synthetic and deterministic; no network is touched.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;

use quakeguard_eew::alerting::ChannelKind;
use quakeguard_eew::consensus::{ClusterOutcome, IngestOutcome};
use quakeguard_eew::{
    DeliveryMode, DetectionCandidate, DeviceId, EarlyWarningSystem, EewConfig, EventStatus, EventStore,
    GeoPoint, LocatedFix, RawFeedReport, SourceId, SourceRank, SourceReport, StoreConfig, UpsertOutcome,
    WaveCalculator, WaveSpeeds,
};

/// User in Izmir
fn user_location() -> GeoPoint {
    GeoPoint::new(38.42, 27.14)
}

/// Epicenter roughly 150 km south-east of the user
fn epicenter() -> GeoPoint {
    user_location().offset_km(-110.0, 100.0)
}

fn raw_report(id: &str, magnitude: f64, at: GeoPoint, origin: DateTime<Utc>) -> RawFeedReport {
    RawFeedReport {
        id: id.into(),
        magnitude,
        latitude: at.latitude,
        longitude: at.longitude,
        depth_km: Some(10.0),
        origin_time: origin,
        reported_at: None,
    }
}

fn candidate(device: usize, at: GeoPoint, timestamp: DateTime<Utc>) -> DetectionCandidate {
    DetectionCandidate::new(DeviceId::new(format!("phone-{device}")), timestamp, 4.5, 0.12, 0.8)
        .with_location(at)
}

async fn simulation(config: EewConfig) -> EarlyWarningSystem {
    let fix = LocatedFix::new(user_location(), Utc::now());
    let mut system = EarlyWarningSystem::simulation(config, Some(fix)).unwrap();
    system.start().await.unwrap();
    system
}

/// Poll until `condition` holds or two seconds pass
async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_two_feeds_merge_into_one_confirmed_event() {
    let mut system = simulation(EewConfig::default()).await;
    let origin = Utc::now() - Duration::seconds(2);

    let first = system
        .ingest_report("afad", &raw_report("afad-1", 6.1, epicenter(), origin), Utc::now())
        .unwrap();
    assert!(matches!(first, Some(UpsertOutcome::Created(_))));

    let shifted = epicenter().offset_km(8.0, 0.0);
    let second = system
        .ingest_report(
            "usgs",
            &raw_report("us-1", 6.0, shifted, origin + Duration::seconds(2)),
            Utc::now(),
        )
        .unwrap();
    assert!(matches!(second, Some(UpsertOutcome::Updated { .. })));

    let events = system.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.status(), EventStatus::Confirmed);
    assert_eq!(event.confirming_sources().len(), 2);
    // Parameters follow the higher-priority feed
    assert_eq!(event.magnitude(), 6.1);

    assert!(wait_until(|| !system.dispatch_history().is_empty()).await);
    let report = &system.dispatch_history()[0];
    assert_eq!(report.event_id, *event.id());
    assert!(report.delivered_any());

    system.shutdown().await;
}

#[tokio::test]
async fn test_crowd_quorum_creates_event_and_alerts() {
    let mut system = simulation(EewConfig::default()).await;
    let t0 = Utc::now() - Duration::seconds(8);
    let centre = epicenter();

    let mut promoted = None;
    for device in 0..5 {
        let at = centre.offset_km(device as f64 * 1.5, -(device as f64));
        let ts = t0 + Duration::seconds(device as i64 * 2);
        let outcome = system.submit_candidate(candidate(device, at, ts), ts).unwrap();
        if let IngestOutcome::Promoted { outcome, .. } = outcome {
            promoted.get_or_insert(outcome.event_id());
        }
    }

    let event_id = promoted.expect("quorum reached");
    let events = system.events();
    assert_eq!(events.len(), 1);
    assert_eq!(*events[0].id(), event_id);
    assert!(events[0].is_confirmed());
    assert_eq!(events[0].confirming_device_cluster_size(), 5);
    assert!(events[0].confirming_sources().is_empty());

    assert!(wait_until(|| system.announced(&event_id).is_some()).await);
    system.shutdown().await;
}

#[tokio::test]
async fn test_lone_device_never_alerts() {
    let mut system = simulation(EewConfig::default()).await;
    let now = Utc::now();

    let outcome = system.submit_candidate(candidate(0, epicenter(), now), now).unwrap();
    assert!(matches!(outcome, IngestOutcome::Pooled { devices: 1, .. }));

    let closed = system.consensus().expire(now + Duration::seconds(60));
    assert!(matches!(closed.as_slice(), [ClusterOutcome::Discarded { devices: 1, .. }]));

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert!(system.events().is_empty());
    assert!(system.decisions().is_empty());
    assert!(system.dispatch_history().is_empty());

    system.shutdown().await;
}

#[tokio::test]
async fn test_critical_magnitude_bypasses_silent_hours() {
    let now = Utc::now();
    let mut config = EewConfig::builder().critical_magnitude(5.5).build();
    config.alerting.preferences = config.alerting.preferences.clone().with_silent_hours(
        (now - Duration::hours(1)).time(),
        (now + Duration::hours(1)).time(),
    );
    let mut system = simulation(config).await;

    let outcome = system
        .ingest_report("afad", &raw_report("afad-2", 6.0, epicenter(), now), now)
        .unwrap()
        .unwrap();

    let decision = system.evaluate(&outcome.event_id(), Utc::now()).unwrap();
    assert!(decision.bypass_quiet_hours);
    assert_eq!(decision.delivery_mode, DeliveryMode::Critical);

    assert!(wait_until(|| !system.dispatch_history().is_empty()).await);
    let report = &system.dispatch_history()[0];
    assert_eq!(
        report.outcome_for(ChannelKind::Sound),
        Some(&quakeguard_eew::alerting::ChannelOutcome::Delivered)
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_moderate_event_in_silent_hours_is_silent() {
    let now = Utc::now();
    let mut config = EewConfig::default();
    config.alerting.preferences = config.alerting.preferences.clone().with_silent_hours(
        (now - Duration::hours(1)).time(),
        (now + Duration::hours(1)).time(),
    );
    let mut system = simulation(config).await;

    let outcome = system
        .ingest_report("afad", &raw_report("afad-3", 4.8, epicenter(), now), now)
        .unwrap()
        .unwrap();

    let decision = system.evaluate(&outcome.event_id(), Utc::now()).unwrap();
    assert!(!decision.bypass_quiet_hours);
    assert_eq!(decision.delivery_mode, DeliveryMode::Silent);

    system.shutdown().await;
}

#[tokio::test]
async fn test_status_never_regresses() {
    let mut system = simulation(EewConfig::default()).await;
    let now = Utc::now();

    // Non-authoritative first report: candidate only
    system
        .ingest_report("emsc", &raw_report("em-1", 5.2, epicenter(), now), now)
        .unwrap();
    let event = system.events().remove(0);
    assert_eq!(event.status(), EventStatus::Candidate);
    assert!(system.evaluate(event.id(), now).is_none());

    // Crowd quorum over the same spot confirms it
    for device in 0..3 {
        let ts = now + Duration::seconds(device as i64);
        system
            .submit_candidate(candidate(device, epicenter().offset_km(device as f64, 0.0), ts), ts)
            .unwrap();
    }
    let confirmed = system.store().get(event.id()).unwrap();
    assert_eq!(confirmed.status(), EventStatus::Confirmed);

    // A later candidate-grade revision keeps it confirmed
    system
        .ingest_report("emsc", &raw_report("em-1", 5.0, epicenter(), now), now)
        .unwrap();
    assert_eq!(system.store().get(event.id()).unwrap().status(), EventStatus::Confirmed);
    assert!(system.store().get(event.id()).unwrap().revision() >= confirmed.revision());

    system.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_all_callbacks() {
    let mut system = simulation(EewConfig::default()).await;
    system.shutdown().await;
    assert!(!system.is_running());

    let now = Utc::now();
    assert!(system
        .ingest_report("afad", &raw_report("afad-9", 6.5, epicenter(), now), now)
        .unwrap()
        .is_none());
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert!(system.events().is_empty());
    assert!(system.dispatch_history().is_empty());
    assert!(!system.health().device.is_sampling());
}

fn report(source: &str, magnitude: f64, at: GeoPoint, origin: DateTime<Utc>) -> SourceReport {
    SourceReport {
        source_id: SourceId::new(source),
        external_event_id: format!("{source}-evt"),
        magnitude,
        epicenter: at,
        depth_km: 10.0,
        origin_time: origin,
        reported_at: origin,
    }
}

proptest! {
    #[test]
    fn prop_dedup_independent_of_arrival_order(
        order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
        jitter_km in 0.0f64..10.0,
        jitter_sec in 0i64..3,
    ) {
        let origin = Utc::now() - Duration::seconds(30);
        let base = GeoPoint::new(38.0, 27.0);
        let reports = [
            (report("afad", 6.1, base, origin), SourceRank::new(1, true)),
            (report("kandilli", 6.0, base.offset_km(jitter_km, 0.0), origin + Duration::seconds(jitter_sec)), SourceRank::new(2, true)),
            (report("usgs", 5.9, base.offset_km(0.0, jitter_km), origin - Duration::seconds(jitter_sec)), SourceRank::new(3, false)),
            // A separate quake far away
            (report("emsc", 5.5, GeoPoint::new(40.5, 30.0), origin), SourceRank::new(4, false)),
        ];

        let store = EventStore::new(StoreConfig::default());
        store.init();
        for i in order {
            let (r, rank) = &reports[i];
            store.upsert_report(r, *rank, Utc::now()).unwrap();
        }

        let mut events = store.events();
        events.sort_by(|a, b| b.confirming_sources().len().cmp(&a.confirming_sources().len()));
        prop_assert_eq!(events.len(), 2);
        prop_assert_eq!(events[0].confirming_sources().len(), 3);
        prop_assert_eq!(events[0].status(), EventStatus::Confirmed);
        // Highest-priority parameters win whatever the order
        prop_assert_eq!(events[0].magnitude(), 6.1);
        prop_assert_eq!(events[1].confirming_sources().len(), 1);
    }

    #[test]
    fn prop_warning_time_monotonic_in_distance(
        near in 0.0f64..800.0,
        extra in 0.0f64..800.0,
        elapsed_sec in 0i64..300,
    ) {
        let calc = WaveCalculator::new(WaveSpeeds::default()).unwrap();
        let origin = Utc::now();
        let now = origin + Duration::seconds(elapsed_sec);

        let w_near = calc.warning_time_sec(now, calc.s_arrival(near, origin).unwrap());
        let w_far = calc.warning_time_sec(now, calc.s_arrival(near + extra, origin).unwrap());
        prop_assert!(w_near >= 0.0);
        prop_assert!(w_far + 1e-3 >= w_near);
    }

    #[test]
    fn prop_warning_time_never_grows_as_time_passes(
        distance_km in 0.0f64..800.0,
        first_ms in -30_000i64..300_000,
        later_ms in 0i64..120_000,
    ) {
        let calc = WaveCalculator::new(WaveSpeeds::default()).unwrap();
        let origin = Utc::now();
        let s_arrival = calc.s_arrival(distance_km, origin).unwrap();
        let earlier = origin + Duration::milliseconds(first_ms);
        let later = earlier + Duration::milliseconds(later_ms);

        let w_earlier = calc.warning_time_sec(earlier, s_arrival);
        let w_later = calc.warning_time_sec(later, s_arrival);
        prop_assert!(w_later >= 0.0);
        prop_assert!(w_later <= w_earlier);
    }
}

#[tokio::test]
async fn test_decisions_wait_for_a_location_fix() {
    use quakeguard_eew::alerting::StaticLocation;

    let location = Arc::new(StaticLocation::new(None));
    let mut system = EarlyWarningSystem::builder(EewConfig::default())
        .location(location.clone())
        .build()
        .unwrap();
    system.start().await.unwrap();
    let now = Utc::now();

    // No feeds registered: nothing routes through the monitor
    assert!(system
        .monitor()
        .ingest("afad", &raw_report("afad-4", 5.0, epicenter(), now), now)
        .is_none());

    let store_outcome = system
        .store()
        .upsert_report(&report("afad", 5.0, epicenter(), now), SourceRank::new(1, true), now)
        .unwrap();
    assert!(system.evaluate(&store_outcome.event_id(), now).is_none());

    location.update(Some(LocatedFix::new(user_location(), now)));
    assert!(system.evaluate(&store_outcome.event_id(), now).is_some());

    system.shutdown().await;
}
