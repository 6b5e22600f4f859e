//! Per-user alert decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EventId;

/// Severity tiers, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SeverityTier {
    /// Weak shaking, informational
    Advisory,
    /// Light to moderate shaking
    Moderate,
    /// Strong shaking, take cover
    Strong,
    /// Very strong shaking, damage likely
    Severe,
    /// Violent shaking
    Extreme,
}

impl SeverityTier {
    /// Map expected intensity at the user's location to a tier.
    ///
    /// Intensity already combines magnitude with proximity, so a moderate
    /// quake close by can outrank a large distant one.
    pub fn from_intensity(intensity: f64) -> Self {
        if intensity >= 9.0 {
            SeverityTier::Extreme
        } else if intensity >= 7.5 {
            SeverityTier::Severe
        } else if intensity >= 6.0 {
            SeverityTier::Strong
        } else if intensity >= 4.5 {
            SeverityTier::Moderate
        } else {
            SeverityTier::Advisory
        }
    }

    /// Display color
    pub fn color(&self) -> &'static str {
        match self {
            SeverityTier::Extreme => "purple",
            SeverityTier::Severe => "red",
            SeverityTier::Strong => "orange",
            SeverityTier::Moderate => "yellow",
            SeverityTier::Advisory => "blue",
        }
    }

    /// Sound pattern for audible delivery
    pub fn sound_pattern(&self) -> &'static str {
        match self {
            SeverityTier::Extreme | SeverityTier::Severe => "siren",
            SeverityTier::Strong => "rapid_beep",
            SeverityTier::Moderate => "double_beep",
            SeverityTier::Advisory => "soft_tone",
        }
    }

    /// Vibration pattern as alternating on/off durations in ms
    pub fn vibration_pattern(&self) -> &'static [u64] {
        match self {
            SeverityTier::Extreme | SeverityTier::Severe => &[1000, 200, 1000, 200, 1000],
            SeverityTier::Strong => &[500, 200, 500, 200, 500],
            SeverityTier::Moderate => &[300, 300, 300],
            SeverityTier::Advisory => &[200],
        }
    }
}

impl std::fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeverityTier::Extreme => write!(f, "EXTREME"),
            SeverityTier::Severe => write!(f, "SEVERE"),
            SeverityTier::Strong => write!(f, "STRONG"),
            SeverityTier::Moderate => write!(f, "MODERATE"),
            SeverityTier::Advisory => write!(f, "ADVISORY"),
        }
    }
}

/// How intrusive a delivery may be. Ordered by intrusiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Visual only, no sound or vibration
    Silent,
    /// Normal notification, respects do-not-disturb
    Standard,
    /// Bypasses do-not-disturb
    Critical,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Silent => write!(f, "silent"),
            DeliveryMode::Standard => write!(f, "standard"),
            DeliveryMode::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of evaluating one event for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDecision {
    /// Event this decision is about
    pub event_id: EventId,
    /// Event revision the decision was computed from
    pub event_revision: u32,
    /// Passed the user's magnitude and distance filters
    pub user_relevant: bool,
    /// Surface distance from the user to the epicenter
    pub distance_km: f64,
    /// Seconds until S-wave arrival, never negative
    pub warning_time_sec: f64,
    /// Expected intensity at the user's location
    pub intensity: f64,
    /// Event magnitude used for the decision
    pub magnitude: f64,
    /// Severity tier
    pub severity_tier: SeverityTier,
    /// Magnitude reached the user's critical threshold
    pub bypass_quiet_hours: bool,
    /// Intrusiveness of delivery
    pub delivery_mode: DeliveryMode,
    /// When the decision was computed
    pub computed_at: DateTime<Utc>,
}

impl AlertDecision {
    /// Whether the S-wave has not yet arrived
    pub fn within_warning_window(&self) -> bool {
        self.warning_time_sec > 0.0
    }
}
