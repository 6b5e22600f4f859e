//! Power-mode sampling rates.

use serde::{Deserialize, Serialize};

use crate::domain::{PowerMode, PowerPolicy};
use crate::sources::BackoffConfig;

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Rate while the app is visible (default: 100 Hz)
    pub foreground_rate_hz: f64,
    /// Background rate under the normal policy (default: 10 Hz)
    pub background_rate_hz: f64,
    /// Background rate under battery saver (default: 5 Hz)
    pub battery_saver_rate_hz: f64,
    /// Nominal background tick period (default: 1 s)
    pub tick_interval_sec: f64,
    /// Capacity of the sensor sample channel (default: 512)
    pub sample_buffer: usize,
    /// Deviation from 1 g that wakes the device from sleep (default: 0.03 g)
    pub motion_wake_threshold_g: f64,
    /// Delay between attempts to resubscribe a sensor whose stream ended
    pub resubscribe_backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            foreground_rate_hz: 100.0,
            background_rate_hz: 10.0,
            battery_saver_rate_hz: 5.0,
            tick_interval_sec: 1.0,
            sample_buffer: 512,
            motion_wake_threshold_g: 0.03,
            resubscribe_backoff: BackoffConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Sampling rate for a power mode under a policy. Zero while asleep.
    pub fn rate_for(&self, mode: PowerMode, policy: PowerPolicy) -> f64 {
        match (mode, policy) {
            (PowerMode::Foreground, _) => self.foreground_rate_hz,
            (PowerMode::Background, PowerPolicy::Normal) => self.background_rate_hz,
            (PowerMode::Background, PowerPolicy::BatterySaver) => self.battery_saver_rate_hz,
            (PowerMode::Sleep, _) => 0.0,
        }
    }
}
