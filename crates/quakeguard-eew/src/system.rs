//! Pipeline assembly and lifecycle.
//!
//! [`EarlyWarningSystem`] wires the detector, scheduler, feeds, consensus,
//! event store, decision engine and dispatcher together. Store updates reach
//! the decision engine through the store's broadcast channel, so a slow
//! notification channel never stalls feed ingestion or sampling. Each fresh
//! decision is dispatched on its own task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::alerting::{
    AlertDecisionEngine, ChannelKind, DecisionTracker, DispatchReport, LocatedFix, LocationProvider, LogChannel,
    NotificationDispatcher, PreferencesProvider, StaticLocation, StaticPreferences,
};
use crate::config::EewConfig;
use crate::consensus::{CrowdsourcedConsensus, IngestOutcome};
use crate::detection::{DetectorState, OnDeviceDetector, SensorPort, SharedDetector, SimulatedSensor, SyntheticWaveform};
use crate::domain::{
    AlertDecision, DetectionCandidate, DeviceId, DeviceState, DomainEvent, EarthquakeEvent, EventId, PowerPolicy,
};
use crate::error::{EewError, Result};
use crate::scheduler::{BackgroundHost, DetectionTick, MonitorScheduler, TickReport, TokioIntervalHost};
use crate::sources::{
    FeedHandle, FeedHealth, FeedMode, MultiSourceMonitor, RawFeedReport, ScriptedPollingFeed, ScriptedStreamingFeed,
};
use crate::store::{EventStore, UpsertOutcome};
use crate::wave::WaveCalculator;

/// Device id used when the configuration leaves it empty
pub const DEFAULT_DEVICE_ID: &str = "local-device";

/// How often retained events are pruned
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Decisions kept for inspection
const DECISION_LOG_LEN: usize = 100;

/// Overall pipeline health
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Current power mode and sampling rate
    pub device: DeviceState,
    /// Accelerometer present and the detector able to use it
    pub sensor_available: bool,
    /// Detector lifecycle state
    pub detector: DetectorState,
    /// Per-feed reachability, in priority order
    pub feeds: Vec<FeedHealth>,
    /// Neither the sensor nor any feed is usable
    pub degraded: bool,
}

/// Evaluates store updates for the local user and dispatches what changed.
struct DecisionPipeline {
    engine: AlertDecisionEngine,
    tracker: Mutex<DecisionTracker>,
    dispatcher: Arc<NotificationDispatcher>,
    location: Arc<dyn LocationProvider>,
    preferences: Arc<dyn PreferencesProvider>,
    decisions: RwLock<VecDeque<AlertDecision>>,
}

impl DecisionPipeline {
    fn evaluate(&self, event: &EarthquakeEvent, now: DateTime<Utc>) -> Option<AlertDecision> {
        let prefs = self.preferences.preferences();
        self.engine.evaluate(event, self.location.last_known(), &prefs, now)
    }

    /// Evaluate and log `event`; returns the decision worth announcing.
    fn decide(&self, event: &EarthquakeEvent, now: DateTime<Utc>) -> Option<AlertDecision> {
        let decision = self.evaluate(event, now)?;
        {
            let mut log = self.decisions.write();
            if log.len() >= DECISION_LOG_LEN {
                log.pop_front();
            }
            log.push_back(decision.clone());
        }

        // Only first decisions and upgrades are re-announced
        self.tracker.lock().observe(decision)
    }

    fn announce(&self, decision: AlertDecision, inflight: &mut JoinSet<DispatchReport>) {
        let dispatcher = self.dispatcher.clone();
        let toggles = self.preferences.preferences().channels;
        inflight.spawn(async move { dispatcher.dispatch(&decision, &toggles).await });
    }

    fn handle(&self, notification: DomainEvent, inflight: &mut JoinSet<DispatchReport>) {
        match notification {
            DomainEvent::EventCreated { event, .. } | DomainEvent::EventUpdated { event, .. } => {
                if let Some(fresh) = self.decide(&event, Utc::now()) {
                    self.announce(fresh, inflight);
                }
            }
            DomainEvent::EventPruned { event_id, .. } => {
                self.tracker.lock().forget(&event_id);
            }
        }
    }

    fn rescan(&self, store: &EventStore, inflight: &mut JoinSet<DispatchReport>) {
        let snapshot = store.snapshot();
        let now = Utc::now();
        for event in snapshot.values().filter(|e| e.is_confirmed()) {
            if let Some(fresh) = self.decide(event, now) {
                self.announce(fresh, inflight);
            }
        }
    }
}

fn reap_dispatch(joined: std::result::Result<DispatchReport, JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Dispatch task panicked");
    }
}

/// Decisions are taken one notification at a time; their dispatches run
/// side by side so a slow channel on one event never holds back another.
/// In-flight dispatches are awaited before the loop returns.
async fn run_decision_loop(
    pipeline: Arc<DecisionPipeline>,
    store: EventStore,
    mut updates: broadcast::Receiver<DomainEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut inflight = JoinSet::new();
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                reap_dispatch(joined);
                continue;
            }
            received = updates.recv() => received,
        };
        match received {
            Ok(notification) => pipeline.handle(notification, &mut inflight),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Decision loop lagged, re-evaluating store snapshot");
                pipeline.rescan(&store, &mut inflight);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if !inflight.is_empty() {
        tracing::debug!(pending = inflight.len(), "Waiting for in-flight dispatches");
    }
    while let Some(joined) = inflight.join_next().await {
        reap_dispatch(joined);
    }
    tracing::debug!("Decision loop stopped");
}

async fn run_prune_loop(store: EventStore, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let pruned = store.prune(Utc::now());
                if pruned > 0 {
                    tracing::info!(pruned, remaining = store.len(), "Pruned expired events");
                }
            }
        }
    }
}

/// Builder for [`EarlyWarningSystem`]
pub struct EarlyWarningSystemBuilder {
    config: EewConfig,
    sensor: Option<Arc<dyn SensorPort>>,
    feeds: Vec<FeedHandle>,
    dispatcher: Option<NotificationDispatcher>,
    location: Option<Arc<dyn LocationProvider>>,
    preferences: Option<Arc<dyn PreferencesProvider>>,
    host: Option<Arc<dyn BackgroundHost>>,
}

impl EarlyWarningSystemBuilder {
    /// Motion sensor (default: a quiet simulated accelerometer)
    pub fn sensor(mut self, sensor: Arc<dyn SensorPort>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    /// Add an external feed
    pub fn feed(mut self, feed: FeedHandle) -> Self {
        self.feeds.push(feed);
        self
    }

    /// Notification dispatcher (default: log channels for every kind)
    pub fn dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// User location source (default: no fix)
    pub fn location(mut self, location: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(location);
        self
    }

    /// User preferences source (default: the configured preferences)
    pub fn preferences(mut self, preferences: Arc<dyn PreferencesProvider>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Background execution host (default: tokio interval)
    pub fn background_host(mut self, host: Arc<dyn BackgroundHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Validate the configuration and assemble the pipeline
    pub fn build(self) -> Result<EarlyWarningSystem> {
        let mut config = self.config;
        if config.device_id.trim().is_empty() {
            config.device_id = DEFAULT_DEVICE_ID.to_string();
        }
        config.validate()?;

        let calculator = WaveCalculator::new(config.wave)?;
        let store = EventStore::new(config.store.clone());

        let detector: SharedDetector =
            OnDeviceDetector::new(config.detector.clone(), DeviceId::new(config.device_id.clone())).into_shared();

        let location = self
            .location
            .unwrap_or_else(|| Arc::new(StaticLocation::new(None)));
        let preferences = self
            .preferences
            .unwrap_or_else(|| Arc::new(StaticPreferences::new(config.alerting.preferences.clone())));

        let consensus = Arc::new(CrowdsourcedConsensus::new(
            config.consensus.clone(),
            calculator,
            store.clone(),
        ));
        let worker = Arc::new(DetectionTick::new(
            detector.clone(),
            consensus.clone(),
            Some(location.clone()),
        ));

        let sensor = self.sensor.unwrap_or_else(|| {
            Arc::new(SimulatedSensor::new(
                "simulated-accelerometer",
                SyntheticWaveform::quiet(Utc::now()),
            ))
        });
        let scheduler = MonitorScheduler::new(config.scheduler.clone(), sensor.clone(), detector.clone(), worker);

        let mut monitor = MultiSourceMonitor::new(store.clone(), config.sources.backoff.clone());
        for feed in self.feeds {
            monitor.add_feed(feed);
        }

        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            let mut dispatcher = NotificationDispatcher::new(config.dispatcher.clone());
            for kind in [
                ChannelKind::Visual,
                ChannelKind::Sound,
                ChannelKind::Vibration,
                ChannelKind::Speech,
            ] {
                dispatcher.add_channel(Arc::new(LogChannel::new(kind)));
            }
            dispatcher
        });

        let pipeline = Arc::new(DecisionPipeline {
            engine: AlertDecisionEngine::new(calculator, &config.alerting),
            tracker: Mutex::new(DecisionTracker::new()),
            dispatcher: Arc::new(dispatcher),
            location,
            preferences,
            decisions: RwLock::new(VecDeque::new()),
        });

        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            device_id = %config.device_id,
            feeds = monitor.feeds().len(),
            quorum = config.consensus.quorum,
            "Early-warning system assembled"
        );

        Ok(EarlyWarningSystem {
            config,
            store,
            sensor,
            detector,
            consensus,
            monitor: Arc::new(monitor),
            scheduler,
            pipeline,
            host: self.host.unwrap_or_else(|| Arc::new(TokioIntervalHost::new())),
            shutdown_tx,
            tasks: Vec::new(),
            running: false,
        })
    }
}

/// Main early-warning coordinator
pub struct EarlyWarningSystem {
    config: EewConfig,
    store: EventStore,
    sensor: Arc<dyn SensorPort>,
    detector: SharedDetector,
    consensus: Arc<CrowdsourcedConsensus>,
    monitor: Arc<MultiSourceMonitor>,
    scheduler: MonitorScheduler,
    pipeline: Arc<DecisionPipeline>,
    host: Arc<dyn BackgroundHost>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl EarlyWarningSystem {
    /// Create a builder
    pub fn builder(config: EewConfig) -> EarlyWarningSystemBuilder {
        EarlyWarningSystemBuilder {
            config,
            sensor: None,
            feeds: Vec::new(),
            dispatcher: None,
            location: None,
            preferences: None,
            host: None,
        }
    }

    /// Assemble with every default collaborator
    pub fn new(config: EewConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Assemble a self-contained pipeline: recording channels, scripted
    /// stand-ins for each configured feed and a fixed user location.
    pub fn simulation(config: EewConfig, location: Option<LocatedFix>) -> Result<Self> {
        let dispatcher = NotificationDispatcher::simulation(config.dispatcher.clone());
        let mut builder = Self::builder(config.clone())
            .dispatcher(dispatcher)
            .location(Arc::new(StaticLocation::new(location)));

        for descriptor in &config.sources.feeds {
            let feed = match descriptor.mode {
                FeedMode::Streaming => FeedHandle::Streaming(Arc::new(ScriptedStreamingFeed::new(descriptor.clone()))),
                FeedMode::Polling => FeedHandle::Polling(Arc::new(ScriptedPollingFeed::new(descriptor.clone()))),
            };
            builder = builder.feed(feed);
        }
        builder.build()
    }

    /// Start feeds, sampling, the background tick and the decision loop
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.store.init();
        self.shutdown_tx.send_replace(false);

        // Subscribe before anything can write to the store
        let updates = self.store.subscribe();
        self.tasks.push(tokio::spawn(run_decision_loop(
            self.pipeline.clone(),
            self.store.clone(),
            updates,
            self.shutdown_tx.subscribe(),
        )));
        self.tasks
            .push(tokio::spawn(run_prune_loop(self.store.clone(), self.shutdown_tx.subscribe())));

        self.monitor.start();
        self.scheduler.set_policy(self.config.power_policy).await;
        self.scheduler.register_background(self.host.as_ref()).await;
        let state = self.scheduler.on_background().await;

        self.running = true;
        tracing::info!(
            mode = %state.power_mode,
            rate_hz = state.sample_rate_hz,
            host = self.host.name(),
            "Early-warning system started"
        );
        Ok(())
    }

    /// Stop every task. No decision or notification is produced afterwards.
    pub async fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.scheduler.shutdown().await;
        self.monitor.shutdown().await;
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
        self.store.shutdown();
        tracing::info!("Early-warning system stopped");
    }

    /// Whether [`EarlyWarningSystem::start`] has run without a shutdown since
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// App came to the foreground
    pub async fn on_foreground(&mut self) -> DeviceState {
        self.scheduler.on_foreground().await
    }

    /// App went to the background
    pub async fn on_background(&mut self) -> DeviceState {
        self.scheduler.on_background().await
    }

    /// Device went idle
    pub async fn on_sleep(&mut self) -> DeviceState {
        self.scheduler.on_sleep().await
    }

    /// Motion reading while asleep
    pub async fn on_motion(&mut self, acceleration_g: f64) -> DeviceState {
        self.scheduler.on_motion(acceleration_g).await
    }

    /// Change the battery policy
    pub async fn set_power_policy(&mut self, policy: PowerPolicy) -> DeviceState {
        self.scheduler.set_policy(policy).await
    }

    /// Run one scheduler tick immediately
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.scheduler.tick(now)
    }

    /// Feed one raw report through the named feed's normalisation path
    pub fn ingest_report(
        &self,
        feed_id: &str,
        raw: &RawFeedReport,
        now: DateTime<Utc>,
    ) -> Result<Option<UpsertOutcome>> {
        if !self.monitor.feeds().iter().any(|f| f.descriptor().id == feed_id) {
            return Err(EewError::Domain(format!("unknown feed '{}'", feed_id)));
        }
        Ok(self.monitor.ingest(feed_id, raw, now))
    }

    /// Submit a candidate reported by another device
    pub fn submit_candidate(&self, candidate: DetectionCandidate, now: DateTime<Utc>) -> Result<IngestOutcome> {
        self.consensus.ingest(candidate, now)
    }

    /// Evaluate one stored event for the local user without dispatching
    pub fn evaluate(&self, event_id: &EventId, now: DateTime<Utc>) -> Option<AlertDecision> {
        let event = self.store.get(event_id)?;
        self.pipeline.evaluate(&event, now)
    }

    /// Overall health
    pub fn health(&self) -> SystemHealth {
        let (detector_available, detector_state) = {
            let detector = self.detector.lock();
            (detector.is_available(), detector.state())
        };
        let sensor_available = self.sensor.is_available() && detector_available;
        let feeds = self.monitor.health();
        let degraded = !sensor_available && self.monitor.all_feeds_unreachable();
        if degraded {
            tracing::warn!("No sensor and no reachable feed, early warning unavailable");
        }
        SystemHealth {
            device: self.scheduler.state(),
            sensor_available,
            detector: detector_state,
            feeds,
            degraded,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &EewConfig {
        &self.config
    }

    /// Event store
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// All stored events
    pub fn events(&self) -> Vec<EarthquakeEvent> {
        self.store.events()
    }

    /// Local detector
    pub fn detector(&self) -> &SharedDetector {
        &self.detector
    }

    /// Crowd consensus
    pub fn consensus(&self) -> &Arc<CrowdsourcedConsensus> {
        &self.consensus
    }

    /// Feed monitor
    pub fn monitor(&self) -> &Arc<MultiSourceMonitor> {
        &self.monitor
    }

    /// Notification dispatcher
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.pipeline.dispatcher
    }

    /// Current device state
    pub fn device_state(&self) -> DeviceState {
        self.scheduler.state()
    }

    /// Recent decisions, oldest first, including ones not re-announced
    pub fn decisions(&self) -> Vec<AlertDecision> {
        self.pipeline.decisions.read().iter().cloned().collect()
    }

    /// Latest announced decision for an event
    pub fn announced(&self, event_id: &EventId) -> Option<AlertDecision> {
        self.pipeline.tracker.lock().get(event_id).cloned()
    }

    /// Recent dispatch reports, oldest first
    pub fn dispatch_history(&self) -> Vec<DispatchReport> {
        self.pipeline.dispatcher.history()
    }
}
