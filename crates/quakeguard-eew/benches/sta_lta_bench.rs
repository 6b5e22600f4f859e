//! Performance benchmarks for the on-device detection path and the event store.
//!
//! Run with: cargo bench --package quakeguard-eew
//!
//! Benchmarks cover:
//! - Per-sample STA/LTA trigger update
//! - Full detector sample processing at foreground and background rates
//! - Wave arrival computation
//! - Feed report dedup-on-write

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use quakeguard_eew::detection::ShakingBurst;
use quakeguard_eew::{
    DetectorConfig, DeviceId, EventStore, GeoPoint, Hypocenter, OnDeviceDetector, SoilClass, SourceId,
    SourceRank, SourceReport, StaLtaTrigger, StoreConfig, SyntheticWaveform, WaveCalculator, WaveSpeeds,
};

// =============================================================================
// Test Data Generators
// =============================================================================

/// One minute of quiet data with a strong burst in the middle
fn waveform() -> SyntheticWaveform {
    SyntheticWaveform::quiet(Utc::now()).with_burst(ShakingBurst {
        start_sec: 30.0,
        duration_sec: 8.0,
        amplitude_g: 0.15,
        frequency_hz: 3.0,
    })
}

fn energies(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| {
            let t = i as f64 * 0.01;
            let base = 1e-6 * (1.0 + (17.3 * t).sin().abs());
            if (3000..3800).contains(&i) {
                base + 0.02
            } else {
                base
            }
        })
        .collect()
}

// =============================================================================
// Detection
// =============================================================================

fn bench_sta_lta_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("sta_lta_push");
    let input = energies(6000);
    group.throughput(Throughput::Elements(input.len() as u64));

    group.bench_function("6000_samples", |b| {
        b.iter(|| {
            let mut trigger = StaLtaTrigger::new(100, 1000, 3.0, 0.02, 3);
            let mut fired = 0usize;
            for &e in &input {
                if trigger.push(black_box(e)).triggered {
                    fired += 1;
                }
            }
            black_box(fired)
        })
    });
    group.finish();
}

fn bench_detector(c: &mut Criterion) {
    let mut group = c.benchmark_group("detector_process_sample");

    for rate_hz in [10.0, 100.0] {
        let samples = waveform().samples(rate_hz, 60.0);
        group.throughput(Throughput::Elements(samples.len() as u64));
        group.bench_with_input(BenchmarkId::new("rate_hz", rate_hz as u32), &samples, |b, samples| {
            b.iter(|| {
                let mut detector = OnDeviceDetector::new(DetectorConfig::default(), DeviceId::new("bench"));
                detector.start(rate_hz).unwrap();
                let mut candidates = 0usize;
                for sample in samples {
                    if detector.process_sample(black_box(sample)).is_some() {
                        candidates += 1;
                    }
                }
                black_box(candidates)
            })
        });
    }
    group.finish();
}

// =============================================================================
// Physics and Store
// =============================================================================

fn bench_wave_arrivals(c: &mut Criterion) {
    let calc = WaveCalculator::new(WaveSpeeds::default()).unwrap();
    let origin = Utc::now();
    let hypocenter = Hypocenter::new(GeoPoint::new(38.0, 27.0), 12.0);
    let observer = GeoPoint::new(39.9, 32.8);

    c.bench_function("wave_arrivals", |b| {
        b.iter(|| {
            calc.arrivals(
                black_box(&hypocenter),
                origin,
                black_box(&observer),
                6.4,
                SoilClass::D,
                origin,
            )
        })
    });
}

fn bench_store_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_upsert");

    for events in [10usize, 100] {
        group.bench_with_input(BenchmarkId::new("distinct_events", events), &events, |b, &events| {
            b.iter(|| {
                let store = EventStore::new(StoreConfig::default());
                store.init();
                let origin = Utc::now();
                for i in 0..events {
                    let report = SourceReport {
                        source_id: SourceId::new("usgs"),
                        external_event_id: format!("us-{i}"),
                        magnitude: 5.0,
                        epicenter: GeoPoint::new(30.0 + (i % 20) as f64, 20.0 + (i / 20) as f64),
                        depth_km: 10.0,
                        origin_time: origin + Duration::seconds(i as i64 * 60),
                        reported_at: origin,
                    };
                    let _ = store.upsert_report(&report, SourceRank::new(3, false), origin);
                }
                black_box(store.len())
            })
        });
    }
    group.finish();
}

criterion_group!(
    name = detection_benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(300))
        .measurement_time(std::time::Duration::from_secs(1));
    targets = bench_sta_lta_push, bench_detector
);

criterion_group!(
    name = pipeline_benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(300))
        .measurement_time(std::time::Duration::from_secs(1));
    targets = bench_wave_arrivals, bench_store_upsert
);

criterion_main!(detection_benches, pipeline_benches);
