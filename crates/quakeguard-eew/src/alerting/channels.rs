//! Notification channels and the payload they render.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AlertDecision, DeliveryMode, EventId, SeverityTier};
use crate::error::ChannelError;

/// Unique identifier for one dispatched alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(Uuid);

impl AlertId {
    /// Create a new random alert ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of sink a channel writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    /// On-screen banner
    Visual,
    /// Alarm sound
    Sound,
    /// Vibration pattern
    Vibration,
    /// Spoken announcement
    Speech,
}

impl ChannelKind {
    /// Whether this kind is intrusive (muted in silent delivery)
    pub fn is_intrusive(&self) -> bool {
        !matches!(self, ChannelKind::Visual)
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Visual => write!(f, "visual"),
            ChannelKind::Sound => write!(f, "sound"),
            ChannelKind::Vibration => write!(f, "vibration"),
            ChannelKind::Speech => write!(f, "speech"),
        }
    }
}

/// Rendered alert content handed to every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Alert id
    pub alert_id: AlertId,
    /// Event the alert is about
    pub event_id: EventId,
    /// Banner title
    pub title: String,
    /// Banner body
    pub body: String,
    /// Text for speech synthesis
    pub speech: String,
    /// Sound pattern, absent in silent delivery
    pub sound: Option<String>,
    /// Vibration on/off durations in ms, empty in silent delivery
    pub vibration: Vec<u64>,
    /// Severity tier
    pub severity: SeverityTier,
    /// Delivery mode
    pub mode: DeliveryMode,
    /// Seconds until S-wave arrival at render time
    pub warning_time_sec: f64,
}

impl AlertPayload {
    /// Render a payload from a decision
    pub fn render(decision: &AlertDecision) -> Self {
        let tier = decision.severity_tier;
        let seconds = decision.warning_time_sec.floor() as u64;
        let title = match tier {
            SeverityTier::Extreme | SeverityTier::Severe => format!("EARTHQUAKE! M{:.1}", decision.magnitude),
            SeverityTier::Strong => format!("Earthquake warning M{:.1}", decision.magnitude),
            SeverityTier::Moderate | SeverityTier::Advisory => format!("Earthquake M{:.1}", decision.magnitude),
        };
        let body = if decision.within_warning_window() {
            format!(
                "{tier} shaking expected in {seconds} s. Epicenter {:.0} km away. Drop, cover, hold on.",
                decision.distance_km
            )
        } else {
            format!("{tier} shaking reported {:.0} km away.", decision.distance_km)
        };
        let speech = if decision.within_warning_window() {
            format!("Earthquake. Shaking in {seconds} seconds. Drop, cover, hold on.")
        } else {
            "Earthquake nearby.".to_string()
        };

        let silent = decision.delivery_mode == DeliveryMode::Silent;
        Self {
            alert_id: AlertId::new(),
            event_id: decision.event_id,
            title,
            body,
            speech,
            sound: (!silent).then(|| tier.sound_pattern().to_string()),
            vibration: if silent { Vec::new() } else { tier.vibration_pattern().to_vec() },
            severity: tier,
            mode: decision.delivery_mode,
            warning_time_sec: decision.warning_time_sec,
        }
    }
}

/// A notification sink.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Channel kind
    fn kind(&self) -> ChannelKind;

    /// Capability check
    fn is_available(&self) -> bool {
        true
    }

    /// Deliver one payload
    async fn deliver(&self, payload: &AlertPayload) -> Result<(), ChannelError>;
}

/// Channel that writes deliveries to the tracing log.
pub struct LogChannel {
    name: String,
    kind: ChannelKind,
}

impl LogChannel {
    /// Create a log channel of the given kind
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            name: format!("log-{kind}"),
            kind,
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), ChannelError> {
        match self.kind {
            ChannelKind::Visual => tracing::info!(
                alert_id = %payload.alert_id,
                severity = %payload.severity,
                mode = %payload.mode,
                title = %payload.title,
                body = %payload.body,
                "Alert banner"
            ),
            ChannelKind::Sound => tracing::info!(alert_id = %payload.alert_id, sound = ?payload.sound, "Alert sound"),
            ChannelKind::Vibration => {
                tracing::info!(alert_id = %payload.alert_id, pattern = ?payload.vibration, "Alert vibration")
            }
            ChannelKind::Speech => tracing::info!(alert_id = %payload.alert_id, text = %payload.speech, "Alert speech"),
        }
        Ok(())
    }
}

/// Channel that records payloads in memory, with optional failure injection.
pub struct RecordingChannel {
    name: String,
    kind: ChannelKind,
    available: AtomicBool,
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<AlertPayload>>,
}

impl RecordingChannel {
    /// Create a recording channel
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            name: format!("recording-{kind}"),
            kind,
            available: AtomicBool::new(true),
            failures_left: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            delay: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` deliveries
    pub fn fail_next(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every delivery
    pub fn failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep before each delivery
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Report the channel as unavailable
    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Delivery attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successfully delivered payloads
    pub fn delivered(&self) -> Vec<AlertPayload> {
        self.delivered.lock().clone()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ChannelError::DeliveryFailed {
                channel: self.name.clone(),
                reason: "injected failure".into(),
            });
        }
        let pending = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(ChannelError::DeliveryFailed {
                channel: self.name.clone(),
                reason: "injected transient failure".into(),
            });
        }
        self.delivered.lock().push(payload.clone());
        Ok(())
    }
}
