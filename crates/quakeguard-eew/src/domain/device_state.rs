//! Power and sampling state owned by the monitor scheduler.

use serde::{Deserialize, Serialize};

/// Power mode of the monitoring device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerMode {
    /// App visible, full-rate sampling
    Foreground,
    /// App backgrounded, reduced rate
    Background,
    /// Continuous sampling stopped, motion wake-up only
    Sleep,
}

impl std::fmt::Display for PowerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerMode::Foreground => write!(f, "foreground"),
            PowerMode::Background => write!(f, "background"),
            PowerMode::Sleep => write!(f, "sleep"),
        }
    }
}

/// User-selected battery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PowerPolicy {
    /// Default rates
    #[default]
    Normal,
    /// Lower background rate
    BatterySaver,
}

/// Current sampling state. `sample_rate_hz` is 0 while asleep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Power mode
    pub power_mode: PowerMode,
    /// Active sampling rate
    pub sample_rate_hz: f64,
}

impl DeviceState {
    /// Whether the sensor should be subscribed
    pub fn is_sampling(&self) -> bool {
        self.power_mode != PowerMode::Sleep && self.sample_rate_hz > 0.0
    }
}
