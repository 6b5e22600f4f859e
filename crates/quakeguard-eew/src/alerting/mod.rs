//! Alerting: per-user decisions, channels and multi-channel dispatch.

pub mod channels;
pub mod dispatcher;
pub mod engine;
pub mod preferences;

pub use channels::{AlertId, AlertPayload, ChannelKind, LogChannel, NotificationChannel, RecordingChannel};
pub use dispatcher::{
    ChannelOutcome, ChannelReport, DispatchReport, DispatcherConfig, NotificationDispatcher, SkipReason,
};
pub use engine::{magnitude_radius_km, AlertDecisionEngine, AlertingConfig, DecisionTracker};
pub use preferences::{
    ChannelToggles, LocatedFix, LocationProvider, PreferencesProvider, SilentHours, StaticLocation,
    StaticPreferences, UserPreferences,
};
