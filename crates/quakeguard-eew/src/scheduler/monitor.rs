//! Monitor scheduler: the sole owner of [`DeviceState`] and the sensor
//! subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::background::{BackgroundHost, BackgroundRegistration, BackgroundTask};
use super::power::SchedulerConfig;
use crate::alerting::LocationProvider;
use crate::consensus::{ClusterOutcome, CrowdsourcedConsensus, IngestOutcome};
use crate::detection::{run_sample_loop, DrainExit, SensorPort, SensorSubscription, SharedDetector};
use crate::domain::{CandidateId, DeviceState, PowerMode, PowerPolicy, SeismicSample};
use crate::error::SensorError;
use crate::sources::{Backoff, BackoffConfig};

/// What one scheduler tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Candidates handed to consensus and what became of them
    pub forwarded: Vec<IngestOutcome>,
    /// Local candidate that timed out unreported
    pub expired_candidate: Option<CandidateId>,
    /// Consensus clusters that aged out
    pub clusters: Vec<ClusterOutcome>,
}

/// Periodic work: drain detector candidates into consensus and run expiry.
///
/// Every step is driven by the `now` passed in, so a skipped or late tick
/// only delays forwarding; expiry catches up on the next run.
pub struct DetectionTick {
    detector: SharedDetector,
    consensus: Arc<CrowdsourcedConsensus>,
    location: Option<Arc<dyn LocationProvider>>,
}

impl DetectionTick {
    /// Create the tick worker
    pub fn new(
        detector: SharedDetector,
        consensus: Arc<CrowdsourcedConsensus>,
        location: Option<Arc<dyn LocationProvider>>,
    ) -> Self {
        Self {
            detector,
            consensus,
            location,
        }
    }

    /// Run one tick
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let (candidate, expired) = {
            let mut detector = self.detector.lock();
            if let Some(provider) = &self.location {
                detector.set_location(provider.last_known().map(|fix| fix.point));
            }
            let candidate = detector.take_pending(now);
            let expired = if candidate.is_none() { detector.expire(now) } else { None };
            (candidate, expired)
        };
        report.expired_candidate = expired;

        if let Some(candidate) = candidate {
            match self.consensus.ingest(candidate, now) {
                Ok(outcome) => report.forwarded.push(outcome),
                Err(e) => tracing::warn!(error = %e, "Consensus rejected candidate"),
            }
        }
        report.clusters = self.consensus.expire(now);
        report
    }
}

impl BackgroundTask for DetectionTick {
    fn run(&self, now: DateTime<Utc>) {
        let report = self.tick(now);
        if !report.forwarded.is_empty() || !report.clusters.is_empty() {
            tracing::debug!(
                forwarded = report.forwarded.len(),
                clusters_closed = report.clusters.len(),
                "Scheduler tick"
            );
        }
    }
}

struct SampleDrain {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    dropped: Arc<Mutex<Arc<AtomicU64>>>,
}

struct SamplingContext {
    sensor: Arc<dyn SensorPort>,
    detector: SharedDetector,
    rate_hz: f64,
    buffer: usize,
    backoff: BackoffConfig,
    dropped: Arc<Mutex<Arc<AtomicU64>>>,
    resubscriptions: Arc<AtomicU64>,
}

/// Drain one subscription after another until stopped.
///
/// When the sensor ends its stream the detector is disabled and the
/// sensor is resubscribed with backoff. The detector re-arms on the first
/// sample of the new stream.
async fn supervise_sampling(
    ctx: SamplingContext,
    mut subscription: SensorSubscription,
    mut samples: mpsc::Receiver<SeismicSample>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(&ctx.backoff);
    loop {
        let exit = run_sample_loop(ctx.detector.clone(), ctx.rate_hz, samples, stop_rx.clone()).await;
        subscription.unsubscribe().await;
        let DrainExit::StreamClosed { samples: drained } = exit else {
            return;
        };
        if drained > 0 {
            backoff.reset();
        }
        ctx.detector.lock().mark_unavailable(&SensorError::StreamClosed);
        tracing::warn!(sensor = %ctx.sensor.name(), drained, "Sensor stream ended, resubscribing");

        (subscription, samples) = loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let (tx, rx) = mpsc::channel(ctx.buffer);
            match ctx.sensor.subscribe(ctx.rate_hz, tx).await {
                Ok(next) => {
                    ctx.resubscriptions.fetch_add(1, Ordering::Relaxed);
                    *ctx.dropped.lock() = next.dropped_counter();
                    tracing::info!(sensor = %ctx.sensor.name(), rate_hz = ctx.rate_hz, "Sensor resubscribed");
                    break (next, rx);
                }
                Err(e) => {
                    tracing::warn!(sensor = %ctx.sensor.name(), error = %e, attempts = backoff.attempts(), "Sensor resubscribe failed");
                }
            }
        };
    }
}

/// Owns device power state and drives the detector's duty cycle.
pub struct MonitorScheduler {
    config: SchedulerConfig,
    policy: PowerPolicy,
    state: DeviceState,
    sensor: Arc<dyn SensorPort>,
    detector: SharedDetector,
    worker: Arc<DetectionTick>,
    drain: Option<SampleDrain>,
    registration: Option<BackgroundRegistration>,
    resubscriptions: Arc<AtomicU64>,
}

impl MonitorScheduler {
    /// Create a scheduler. Monitoring starts asleep until a lifecycle event.
    pub fn new(
        config: SchedulerConfig,
        sensor: Arc<dyn SensorPort>,
        detector: SharedDetector,
        worker: Arc<DetectionTick>,
    ) -> Self {
        Self {
            config,
            policy: PowerPolicy::default(),
            state: DeviceState {
                power_mode: PowerMode::Sleep,
                sample_rate_hz: 0.0,
            },
            sensor,
            detector,
            worker,
            drain: None,
            registration: None,
            resubscriptions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current device state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Current power policy
    pub fn policy(&self) -> PowerPolicy {
        self.policy
    }

    /// Tick worker shared with the background host
    pub fn worker(&self) -> &Arc<DetectionTick> {
        &self.worker
    }

    /// Whether the sensor is currently subscribed
    pub fn is_sampling(&self) -> bool {
        self.drain.is_some()
    }

    /// Samples the sensor dropped on the current subscription
    pub fn dropped_samples(&self) -> u64 {
        self.drain
            .as_ref()
            .map_or(0, |d| d.dropped.lock().load(Ordering::Relaxed))
    }

    /// Times a sensor stream that ended on its own was resubscribed
    pub fn resubscriptions(&self) -> u64 {
        self.resubscriptions.load(Ordering::Relaxed)
    }

    /// Register the periodic tick with `host`
    pub async fn register_background(&mut self, host: &dyn BackgroundHost) {
        if let Some(old) = self.registration.take() {
            old.cancel().await;
        }
        let period = std::time::Duration::from_secs_f64(self.config.tick_interval_sec.max(0.01));
        let registration = host.register(period, self.worker.clone()).await;
        tracing::info!(host = %host.name(), period_ms = period.as_millis() as u64, "Background tick registered");
        self.registration = Some(registration);
    }

    /// App moved to the foreground
    pub async fn on_foreground(&mut self) -> DeviceState {
        self.transition(PowerMode::Foreground).await
    }

    /// App moved to the background
    pub async fn on_background(&mut self) -> DeviceState {
        self.transition(PowerMode::Background).await
    }

    /// Stop continuous sampling; only motion wake-ups remain
    pub async fn on_sleep(&mut self) -> DeviceState {
        self.transition(PowerMode::Sleep).await
    }

    /// Motion event reported by the platform while asleep.
    ///
    /// Above-baseline motion promotes sleep to background sampling.
    pub async fn on_motion(&mut self, acceleration_g: f64) -> DeviceState {
        let above_baseline = (acceleration_g - 1.0).abs() >= self.config.motion_wake_threshold_g;
        if self.state.power_mode == PowerMode::Sleep && above_baseline {
            tracing::info!(acceleration_g, "Motion wake-up");
            return self.transition(PowerMode::Background).await;
        }
        self.state
    }

    /// Change the battery policy, re-applying the current mode's rate
    pub async fn set_policy(&mut self, policy: PowerPolicy) -> DeviceState {
        if self.policy == policy {
            return self.state;
        }
        self.policy = policy;
        let mode = self.state.power_mode;
        self.transition(mode).await
    }

    /// Run one tick inline
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.worker.tick(now)
    }

    /// Tear down the sensor subscription, drain loop and background tick.
    /// Nothing fires after this returns.
    pub async fn shutdown(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel().await;
        }
        self.stop_sampling().await;
        self.state = DeviceState {
            power_mode: PowerMode::Sleep,
            sample_rate_hz: 0.0,
        };
    }

    async fn transition(&mut self, mode: PowerMode) -> DeviceState {
        let rate = self.config.rate_for(mode, self.policy);
        let previous = self.state;
        if previous.power_mode == mode && (previous.sample_rate_hz - rate).abs() < f64::EPSILON && self.is_sampling()
        {
            return self.state;
        }

        self.stop_sampling().await;
        self.state = DeviceState {
            power_mode: mode,
            sample_rate_hz: 0.0,
        };

        if mode != PowerMode::Sleep {
            match self.start_sampling(rate).await {
                Ok(()) => self.state.sample_rate_hz = rate,
                Err(e) => {
                    tracing::warn!(error = %e, sensor = %self.sensor.name(), "Sensor unavailable, continuing on feeds and consensus");
                    self.detector.lock().mark_unavailable(&e);
                }
            }
        }

        tracing::info!(
            from = %previous.power_mode,
            to = %self.state.power_mode,
            rate_hz = self.state.sample_rate_hz,
            "Power mode transition"
        );
        self.state
    }

    async fn start_sampling(&mut self, rate_hz: f64) -> Result<(), SensorError> {
        if !self.sensor.is_available() {
            return Err(SensorError::Unavailable);
        }
        {
            let mut detector = self.detector.lock();
            detector.mark_available();
            detector.start(rate_hz)?;
        }

        let buffer = self.config.sample_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let subscription = self.sensor.subscribe(rate_hz, tx).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let dropped = Arc::new(Mutex::new(subscription.dropped_counter()));
        let ctx = SamplingContext {
            sensor: self.sensor.clone(),
            detector: self.detector.clone(),
            rate_hz,
            buffer,
            backoff: self.config.resubscribe_backoff.clone(),
            dropped: dropped.clone(),
            resubscriptions: self.resubscriptions.clone(),
        };
        let handle = tokio::spawn(supervise_sampling(ctx, subscription, rx, stop_rx));
        self.drain = Some(SampleDrain {
            stop_tx,
            handle,
            dropped,
        });
        Ok(())
    }

    async fn stop_sampling(&mut self) {
        if let Some(drain) = self.drain.take() {
            let _ = drain.stop_tx.send(true);
            let _ = drain.handle.await;
            self.detector.lock().stop(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{LocatedFix, StaticLocation};
    use crate::consensus::ConsensusConfig;
    use crate::detection::{
        DetectorConfig, DetectorState, OnDeviceDetector, ShakingBurst, SimulatedSensor, SyntheticWaveform,
    };
    use crate::domain::{DeviceId, GeoPoint};
    use crate::scheduler::background::TokioIntervalHost;
    use crate::store::{EventStore, StoreConfig};
    use crate::wave::WaveCalculator;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    struct Fixture {
        scheduler: MonitorScheduler,
        detector: SharedDetector,
        consensus: Arc<CrowdsourcedConsensus>,
        store: EventStore,
    }

    fn fixture(sensor: SimulatedSensor) -> Fixture {
        fixture_with(Arc::new(sensor))
    }

    fn fixture_with(sensor: Arc<dyn SensorPort>) -> Fixture {
        let store = EventStore::new(StoreConfig::default());
        store.init();
        let consensus = Arc::new(CrowdsourcedConsensus::new(
            ConsensusConfig::default(),
            WaveCalculator::default(),
            store.clone(),
        ));
        let detector = OnDeviceDetector::new(DetectorConfig::default(), DeviceId::new("dev-1")).into_shared();
        let location = Arc::new(StaticLocation::new(Some(LocatedFix::new(GeoPoint::new(38.4, 27.1), Utc::now()))));
        let worker = Arc::new(DetectionTick::new(detector.clone(), consensus.clone(), Some(location)));
        Fixture {
            scheduler: MonitorScheduler::new(SchedulerConfig::default(), sensor, detector.clone(), worker),
            detector,
            consensus,
            store,
        }
    }

    fn quiet() -> SimulatedSensor {
        SimulatedSensor::new("sim", SyntheticWaveform::quiet(Utc::now()))
    }

    /// Ends its first stream after a few samples, then behaves.
    struct FlakySensor {
        subscribes: AtomicU64,
        steady: SimulatedSensor,
    }

    #[async_trait::async_trait]
    impl SensorPort for FlakySensor {
        fn name(&self) -> &str {
            "flaky"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn subscribe(
            &self,
            rate_hz: f64,
            tx: mpsc::Sender<SeismicSample>,
        ) -> Result<SensorSubscription, SensorError> {
            if self.subscribes.fetch_add(1, Ordering::SeqCst) > 0 {
                return self.steady.subscribe(rate_hz, tx).await;
            }
            let (stop_tx, _) = watch::channel(false);
            let waveform = SyntheticWaveform::quiet(Utc::now());
            let handle = tokio::spawn(async move {
                for i in 0..5 {
                    let _ = tx.send(waveform.sample_at(i as f64 / rate_hz)).await;
                }
            });
            Ok(SensorSubscription::new(rate_hz, stop_tx, handle, Arc::new(AtomicU64::new(0))))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_transitions_set_rates() {
        let mut f = fixture(quiet());
        assert_eq!(f.scheduler.state().power_mode, PowerMode::Sleep);

        assert_eq!(f.scheduler.on_foreground().await.sample_rate_hz, 100.0);
        assert_eq!(f.detector.lock().sample_rate_hz(), 100.0);
        assert_eq!(f.scheduler.on_background().await.sample_rate_hz, 10.0);
        assert_eq!(f.scheduler.set_policy(PowerPolicy::BatterySaver).await.sample_rate_hz, 5.0);

        let asleep = f.scheduler.on_sleep().await;
        assert_eq!(asleep.sample_rate_hz, 0.0);
        assert!(!f.scheduler.is_sampling());
        assert_eq!(f.detector.lock().state(), DetectorState::Idle);
        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_wakes_from_sleep_only_above_baseline() {
        let mut f = fixture(quiet());
        assert_eq!(f.scheduler.on_motion(1.005).await.power_mode, PowerMode::Sleep);
        let woke = f.scheduler.on_motion(1.2).await;
        assert_eq!(woke.power_mode, PowerMode::Background);
        assert!(f.scheduler.is_sampling());
        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_sensor_is_contained() {
        let mut f = fixture(SimulatedSensor::unavailable("none"));
        let state = f.scheduler.on_foreground().await;
        assert_eq!(state.power_mode, PowerMode::Foreground);
        assert_eq!(state.sample_rate_hz, 0.0);
        assert!(!f.detector.lock().is_available());
        // Ticks still run consensus expiry without a sensor.
        let report = f.scheduler.tick(Utc::now());
        assert!(report.forwarded.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_reach_detector_and_stop_after_shutdown() {
        let mut f = fixture(quiet());
        f.scheduler.on_foreground().await;
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        let processed = f.detector.lock().samples_processed();
        assert!(processed >= 150, "processed {processed}");

        f.scheduler.shutdown().await;
        let after = f.detector.lock().samples_processed();
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert_eq!(f.detector.lock().samples_processed(), after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_disables_detector_then_resubscribes() {
        let sensor = Arc::new(FlakySensor {
            subscribes: AtomicU64::new(0),
            steady: quiet(),
        });
        let mut f = fixture_with(sensor.clone());
        f.scheduler.on_foreground().await;

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(f.detector.lock().samples_processed(), 5);
        assert!(!f.detector.lock().is_available());
        assert_eq!(f.detector.lock().state(), DetectorState::Idle);
        assert!(f.scheduler.is_sampling());

        // First retry after the 1 s base backoff
        tokio::time::sleep(StdDuration::from_secs(3)).await;
        assert_eq!(sensor.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(f.scheduler.resubscriptions(), 1);
        let detector = f.detector.lock();
        assert!(detector.is_available());
        assert_eq!(detector.state(), DetectorState::Sampling);
        assert!(detector.samples_processed() > 100, "processed {}", detector.samples_processed());
        drop(detector);

        f.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_trigger_is_forwarded_but_never_creates_event() {
        let waveform = SyntheticWaveform::quiet(Utc::now()).with_burst(ShakingBurst {
            start_sec: 12.0,
            duration_sec: 3.0,
            amplitude_g: 0.2,
            frequency_hz: 3.0,
        });
        let mut f = fixture(SimulatedSensor::new("sim", waveform));
        f.scheduler.on_foreground().await;
        let host = TokioIntervalHost::skipping_every(3);
        f.scheduler.register_background(&host).await;

        tokio::time::sleep(StdDuration::from_secs(20)).await;
        assert!(f
            .detector
            .lock()
            .history()
            .any(|r| r.outcome == crate::detection::CandidateOutcome::Reported));

        // Long after the cluster window, the lone cluster is gone and nothing was created.
        f.scheduler.tick(Utc::now() + Duration::seconds(120));
        assert_eq!(f.consensus.cluster_count(), 0);
        assert!(f.store.is_empty());
        f.scheduler.shutdown().await;
    }
}
