//! Multi-channel alert delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::channels::{AlertId, AlertPayload, ChannelKind, NotificationChannel, RecordingChannel};
use super::preferences::ChannelToggles;
use crate::domain::{AlertDecision, DeliveryMode, EventId, SeverityTier};
use crate::error::ChannelError;

/// Configuration for alert dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Per-attempt timeout and target time to first channel (default: 800 ms)
    pub latency_budget_ms: u64,
    /// Delivery attempts per channel (default: 3)
    pub max_attempts: u32,
    /// First retry delay, doubled per retry (default: 50 ms)
    pub retry_base_ms: u64,
    /// Reports kept in the dispatch history (default: 100)
    pub history_len: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 800,
            max_attempts: 3,
            retry_base_ms: 50,
            history_len: 100,
        }
    }
}

/// Why a channel was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Turned off in user preferences
    Disabled,
    /// Capability check failed
    Unavailable,
    /// Intrusive channel muted by silent delivery
    Muted,
}

/// Final outcome on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    /// Delivered
    Delivered,
    /// Every attempt failed; holds the last error
    Failed(ChannelError),
    /// Not attempted
    Skipped(SkipReason),
}

/// Per-channel part of a [`DispatchReport`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    /// Channel name
    pub channel: String,
    /// Channel kind
    pub kind: ChannelKind,
    /// Outcome
    pub outcome: ChannelOutcome,
    /// Attempts made
    pub attempts: u32,
    /// Time from dispatch start to success
    pub latency: Option<Duration>,
}

/// Result of dispatching one decision
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Alert id
    pub alert_id: AlertId,
    /// Event id
    pub event_id: EventId,
    /// Severity delivered
    pub severity: SeverityTier,
    /// Delivery mode
    pub mode: DeliveryMode,
    /// Past the warning window; logged only, nothing delivered
    pub suppressed: bool,
    /// Per-channel outcomes
    pub channels: Vec<ChannelReport>,
    /// Time to the first successful channel
    pub first_delivery: Option<Duration>,
    /// When dispatch started
    pub dispatched_at: DateTime<Utc>,
}

impl DispatchReport {
    /// Whether any channel delivered
    pub fn delivered_any(&self) -> bool {
        self.channels.iter().any(|c| c.outcome == ChannelOutcome::Delivered)
    }

    /// Outcome on the first channel of `kind`
    pub fn outcome_for(&self, kind: ChannelKind) -> Option<&ChannelOutcome> {
        self.channels.iter().find(|c| c.kind == kind).map(|c| &c.outcome)
    }
}

/// Delivers decisions to every registered channel concurrently.
pub struct NotificationDispatcher {
    config: DispatcherConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    recorders: Vec<Arc<RecordingChannel>>,
    history: RwLock<VecDeque<DispatchReport>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher with no channels
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            channels: Vec::new(),
            recorders: Vec::new(),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Dispatcher whose every channel is an in-memory recorder.
    ///
    /// Exercises the full delivery path with no external side effects.
    pub fn simulation(config: DispatcherConfig) -> Self {
        let mut dispatcher = Self::new(config);
        for kind in [ChannelKind::Visual, ChannelKind::Sound, ChannelKind::Vibration, ChannelKind::Speech] {
            let recorder = Arc::new(RecordingChannel::new(kind));
            dispatcher.channels.push(recorder.clone());
            dispatcher.recorders.push(recorder);
        }
        dispatcher
    }

    /// Add a channel
    pub fn add_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.push(channel);
    }

    /// Whether this dispatcher only records deliveries
    pub fn is_simulation(&self) -> bool {
        !self.recorders.is_empty()
    }

    /// Recorders registered by [`NotificationDispatcher::simulation`]
    pub fn recorders(&self) -> &[Arc<RecordingChannel>] {
        &self.recorders
    }

    /// Registered channels
    pub fn channels(&self) -> &[Arc<dyn NotificationChannel>] {
        &self.channels
    }

    /// Get configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Recent reports, oldest first
    pub fn history(&self) -> Vec<DispatchReport> {
        self.history.read().iter().cloned().collect()
    }

    /// Deliver a decision on every eligible channel.
    ///
    /// Channels run concurrently; a slow or failing channel never delays
    /// the others. Decisions past their warning window are logged and not
    /// delivered.
    pub async fn dispatch(&self, decision: &AlertDecision, toggles: &ChannelToggles) -> DispatchReport {
        let started = Instant::now();
        let payload = Arc::new(AlertPayload::render(decision));
        let mut report = DispatchReport {
            alert_id: payload.alert_id,
            event_id: decision.event_id,
            severity: decision.severity_tier,
            mode: decision.delivery_mode,
            suppressed: false,
            channels: Vec::with_capacity(self.channels.len()),
            first_delivery: None,
            dispatched_at: Utc::now(),
        };

        if !decision.within_warning_window() {
            tracing::info!(
                event_id = %decision.event_id,
                severity = %decision.severity_tier,
                distance_km = decision.distance_km,
                "S-wave already arrived, warning suppressed"
            );
            report.suppressed = true;
            self.record(report.clone());
            return report;
        }

        tracing::info!(
            alert_id = %payload.alert_id,
            event_id = %decision.event_id,
            severity = %decision.severity_tier,
            mode = %decision.delivery_mode,
            warning_time_sec = decision.warning_time_sec,
            "Dispatching alert"
        );
        if decision.delivery_mode == DeliveryMode::Critical {
            tracing::warn!(alert_id = %payload.alert_id, "Critical delivery, bypassing do-not-disturb");
        }

        let mut tasks = JoinSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            if let Some(reason) = skip_reason(channel.as_ref(), decision.delivery_mode, toggles) {
                report.channels.push(ChannelReport {
                    channel: channel.name().to_string(),
                    kind: channel.kind(),
                    outcome: ChannelOutcome::Skipped(reason),
                    attempts: 0,
                    latency: None,
                });
                continue;
            }
            let channel = channel.clone();
            let payload = payload.clone();
            let config = self.config.clone();
            tasks.spawn(async move { (index, deliver_with_retry(channel, payload, config, started).await) });
        }

        let mut delivered = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => delivered.push(result),
                Err(e) => tracing::error!(error = %e, "Channel task panicked"),
            }
        }
        delivered.sort_by_key(|(index, _)| *index);
        for (_, channel_report) in delivered {
            if let ChannelOutcome::Failed(e) = &channel_report.outcome {
                tracing::warn!(
                    alert_id = %payload.alert_id,
                    channel = %channel_report.channel,
                    attempts = channel_report.attempts,
                    error = %e,
                    "Channel delivery failed"
                );
            }
            report.channels.push(channel_report);
        }

        report.first_delivery = report.channels.iter().filter_map(|c| c.latency).min();
        match report.first_delivery {
            Some(latency) if latency > Duration::from_millis(self.config.latency_budget_ms) => {
                tracing::warn!(
                    alert_id = %payload.alert_id,
                    latency_ms = latency.as_millis() as u64,
                    budget_ms = self.config.latency_budget_ms,
                    "First delivery exceeded latency budget"
                );
            }
            Some(_) => {}
            None => tracing::error!(alert_id = %payload.alert_id, "Alert not delivered on any channel"),
        }

        self.record(report.clone());
        report
    }

    fn record(&self, report: DispatchReport) {
        let mut history = self.history.write();
        history.push_back(report);
        while history.len() > self.config.history_len.max(1) {
            history.pop_front();
        }
    }
}

fn skip_reason(channel: &dyn NotificationChannel, mode: DeliveryMode, toggles: &ChannelToggles) -> Option<SkipReason> {
    let kind = channel.kind();
    let enabled = match kind {
        ChannelKind::Visual => toggles.visual,
        ChannelKind::Sound => toggles.sound,
        ChannelKind::Vibration => toggles.vibration,
        ChannelKind::Speech => toggles.speech,
    };
    // Critical delivery always sounds, whatever the toggles say.
    if !enabled && !(mode == DeliveryMode::Critical && kind != ChannelKind::Speech) {
        return Some(SkipReason::Disabled);
    }
    if mode == DeliveryMode::Silent && kind.is_intrusive() {
        return Some(SkipReason::Muted);
    }
    if !channel.is_available() {
        return Some(SkipReason::Unavailable);
    }
    None
}

async fn deliver_with_retry(
    channel: Arc<dyn NotificationChannel>,
    payload: Arc<AlertPayload>,
    config: DispatcherConfig,
    started: Instant,
) -> ChannelReport {
    let budget = Duration::from_millis(config.latency_budget_ms);
    let max_attempts = config.max_attempts.max(1);
    let mut delay = Duration::from_millis(config.retry_base_ms);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let result = match tokio::time::timeout(budget, channel.deliver(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                channel: channel.name().to_string(),
                after_ms: config.latency_budget_ms,
            }),
        };
        match result {
            Ok(()) => {
                return ChannelReport {
                    channel: channel.name().to_string(),
                    kind: channel.kind(),
                    outcome: ChannelOutcome::Delivered,
                    attempts: attempt,
                    latency: Some(started.elapsed()),
                };
            }
            Err(e) => {
                tracing::debug!(channel = %channel.name(), attempt, error = %e, "Delivery attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    ChannelReport {
        channel: channel.name().to_string(),
        kind: channel.kind(),
        outcome: ChannelOutcome::Failed(last_error.unwrap_or_else(|| ChannelError::Unavailable {
            channel: channel.name().to_string(),
        })),
        attempts: max_attempts,
        latency: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(warning: f64, mode: DeliveryMode) -> AlertDecision {
        AlertDecision {
            event_id: EventId::new(),
            event_revision: 0,
            user_relevant: true,
            distance_km: 30.0,
            warning_time_sec: warning,
            intensity: 7.0,
            magnitude: 5.8,
            severity_tier: SeverityTier::Strong,
            bypass_quiet_hours: mode == DeliveryMode::Critical,
            delivery_mode: mode,
            computed_at: Utc::now(),
        }
    }

    fn all_on() -> ChannelToggles {
        ChannelToggles {
            visual: true,
            sound: true,
            vibration: true,
            speech: true,
        }
    }

    #[tokio::test]
    async fn test_simulation_delivers_on_every_channel() {
        let dispatcher = NotificationDispatcher::simulation(DispatcherConfig::default());
        let report = dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &all_on()).await;
        assert!(!report.suppressed);
        assert_eq!(report.channels.len(), 4);
        assert!(report.channels.iter().all(|c| c.outcome == ChannelOutcome::Delivered));
        assert!(report.first_delivery.is_some());
        assert!(dispatcher.recorders().iter().all(|r| r.delivered().len() == 1));
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_channel_does_not_block_others() {
        let mut dispatcher = NotificationDispatcher::new(DispatcherConfig::default());
        let visual = Arc::new(RecordingChannel::new(ChannelKind::Visual));
        let broken = Arc::new(RecordingChannel::new(ChannelKind::Sound).failing());
        dispatcher.add_channel(broken.clone());
        dispatcher.add_channel(visual.clone());

        let report = dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &all_on()).await;
        assert_eq!(broken.attempts(), 3);
        assert!(matches!(report.outcome_for(ChannelKind::Sound), Some(ChannelOutcome::Failed(_))));
        assert_eq!(report.outcome_for(ChannelKind::Visual), Some(&ChannelOutcome::Delivered));
        assert_eq!(report.first_delivery, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let mut dispatcher = NotificationDispatcher::new(DispatcherConfig::default());
        let flaky = Arc::new(RecordingChannel::new(ChannelKind::Vibration).fail_next(2));
        dispatcher.add_channel(flaky.clone());

        let report = dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &all_on()).await;
        assert_eq!(report.channels[0].outcome, ChannelOutcome::Delivered);
        assert_eq!(report.channels[0].attempts, 3);
        // 50 ms + 100 ms of backoff
        let latency = report.first_delivery.unwrap();
        assert!(latency >= Duration::from_millis(150) && latency < Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_channel_times_out() {
        let mut dispatcher = NotificationDispatcher::new(DispatcherConfig {
            max_attempts: 1,
            ..DispatcherConfig::default()
        });
        dispatcher.add_channel(Arc::new(
            RecordingChannel::new(ChannelKind::Speech).with_delay(Duration::from_secs(5)),
        ));
        let report = dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &all_on()).await;
        assert!(matches!(
            report.channels[0].outcome,
            ChannelOutcome::Failed(ChannelError::Timeout { after_ms: 800, .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_warning_time_is_suppressed() {
        let dispatcher = NotificationDispatcher::simulation(DispatcherConfig::default());
        let report = dispatcher.dispatch(&decision(0.0, DeliveryMode::Critical), &all_on()).await;
        assert!(report.suppressed);
        assert!(report.channels.is_empty());
        assert!(dispatcher.recorders().iter().all(|r| r.delivered().is_empty()));
    }

    #[tokio::test]
    async fn test_silent_mode_is_visual_only() {
        let dispatcher = NotificationDispatcher::simulation(DispatcherConfig::default());
        let report = dispatcher.dispatch(&decision(10.0, DeliveryMode::Silent), &all_on()).await;
        assert_eq!(report.outcome_for(ChannelKind::Visual), Some(&ChannelOutcome::Delivered));
        assert_eq!(
            report.outcome_for(ChannelKind::Sound),
            Some(&ChannelOutcome::Skipped(SkipReason::Muted))
        );
    }

    #[tokio::test]
    async fn test_critical_overrides_sound_toggle() {
        let dispatcher = NotificationDispatcher::simulation(DispatcherConfig::default());
        let toggles = ChannelToggles {
            sound: false,
            ..all_on()
        };
        let quiet = dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &toggles).await;
        assert_eq!(
            quiet.outcome_for(ChannelKind::Sound),
            Some(&ChannelOutcome::Skipped(SkipReason::Disabled))
        );
        let loud = dispatcher.dispatch(&decision(10.0, DeliveryMode::Critical), &toggles).await;
        assert_eq!(loud.outcome_for(ChannelKind::Sound), Some(&ChannelOutcome::Delivered));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dispatcher = NotificationDispatcher::simulation(DispatcherConfig {
            history_len: 2,
            ..DispatcherConfig::default()
        });
        for _ in 0..5 {
            dispatcher.dispatch(&decision(10.0, DeliveryMode::Standard), &all_on()).await;
        }
        assert_eq!(dispatcher.history().len(), 2);
    }
}
