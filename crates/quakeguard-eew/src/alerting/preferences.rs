//! User alert preferences and the external providers that supply them.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::GeoPoint;
use crate::wave::SoilClass;

/// Daily quiet period. May wrap past midnight (e.g. 22:00–07:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilentHours {
    /// Start of the quiet period (inclusive)
    pub start: NaiveTime,
    /// End of the quiet period (exclusive)
    pub end: NaiveTime,
}

impl SilentHours {
    /// Create a quiet period
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `time` falls inside the period. An empty period (start == end)
    /// contains nothing.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Which channels the user allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelToggles {
    /// On-screen banner
    pub visual: bool,
    /// Alarm sound
    pub sound: bool,
    /// Vibration pattern
    pub vibration: bool,
    /// Spoken announcement
    pub speech: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            visual: true,
            sound: true,
            vibration: true,
            speech: false,
        }
    }
}

/// Per-user alert settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    /// Ignore events below this magnitude (default: 4.0)
    pub min_magnitude: f64,
    /// Ignore events further than this (default: 500 km)
    pub max_distance_km: f64,
    /// Events at or above this magnitude bypass quiet hours (default: 5.5)
    pub critical_magnitude: f64,
    /// Optional quiet period in local time of the device clock
    pub silent_hours: Option<SilentHours>,
    /// Channel toggles
    pub channels: ChannelToggles,
    /// Site soil class for intensity
    pub soil_class: SoilClass,
    /// Also cap distance by a magnitude-scaled relevance radius
    pub use_magnitude_radius: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            min_magnitude: 4.0,
            max_distance_km: 500.0,
            critical_magnitude: 5.5,
            silent_hours: None,
            channels: ChannelToggles::default(),
            soil_class: SoilClass::default(),
            use_magnitude_radius: true,
        }
    }
}

impl UserPreferences {
    /// Set the quiet period
    pub fn with_silent_hours(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.silent_hours = Some(SilentHours::new(start, end));
        self
    }

    /// Whether `at` falls in the quiet period
    pub fn in_silent_hours(&self, at: DateTime<Utc>) -> bool {
        self.silent_hours.is_some_and(|h| h.contains(at.time()))
    }
}

/// A location fix with the time it was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocatedFix {
    /// Position
    pub point: GeoPoint,
    /// When the fix was taken
    pub at: DateTime<Utc>,
}

impl LocatedFix {
    /// Create a fix
    pub fn new(point: GeoPoint, at: DateTime<Utc>) -> Self {
        Self { point, at }
    }

    /// Whether the fix is older than `max_age_sec` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_sec: f64) -> bool {
        now - self.at > Duration::milliseconds((max_age_sec * 1000.0) as i64)
    }
}

/// Best-effort last known user location
pub trait LocationProvider: Send + Sync {
    /// Last fix, if any
    fn last_known(&self) -> Option<LocatedFix>;
}

/// Read-only access to user alert settings
pub trait PreferencesProvider: Send + Sync {
    /// Current preferences
    fn preferences(&self) -> UserPreferences;
}

/// In-memory location holder, updated by whoever owns the platform API.
#[derive(Debug, Default)]
pub struct StaticLocation {
    fix: RwLock<Option<LocatedFix>>,
}

impl StaticLocation {
    /// Holder with an initial fix
    pub fn new(fix: Option<LocatedFix>) -> Self {
        Self { fix: RwLock::new(fix) }
    }

    /// Replace the fix
    pub fn update(&self, fix: Option<LocatedFix>) {
        *self.fix.write() = fix;
    }
}

impl LocationProvider for StaticLocation {
    fn last_known(&self) -> Option<LocatedFix> {
        *self.fix.read()
    }
}

/// In-memory preferences holder
#[derive(Debug, Default)]
pub struct StaticPreferences {
    prefs: RwLock<UserPreferences>,
}

impl StaticPreferences {
    /// Holder with initial preferences
    pub fn new(prefs: UserPreferences) -> Self {
        Self {
            prefs: RwLock::new(prefs),
        }
    }

    /// Replace the preferences
    pub fn update(&self, prefs: UserPreferences) {
        *self.prefs.write() = prefs;
    }
}

impl PreferencesProvider for StaticPreferences {
    fn preferences(&self) -> UserPreferences {
        self.prefs.read().clone()
    }
}
