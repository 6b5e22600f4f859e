//! Pipeline configuration.
//!
//! [`EewConfig`] gathers every tuning parameter of the pipeline. Thresholds,
//! windows and quorum sizes are engineering choices rather than physical
//! constants, so they live here instead of being hard-coded.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::alerting::{AlertingConfig, DispatcherConfig};
use crate::consensus::ConsensusConfig;
use crate::detection::DetectorConfig;
use crate::domain::PowerPolicy;
use crate::error::ConfigError;
use crate::scheduler::SchedulerConfig;
use crate::sources::{FeedMode, SourcesConfig};
use crate::store::StoreConfig;
use crate::wave::WaveSpeeds;

/// Trigger ratio at sensitivity 0.0
const LEAST_SENSITIVE_RATIO: f64 = 6.0;
/// Trigger ratio at sensitivity 1.0
const MOST_SENSITIVE_RATIO: f64 = 1.5;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EewConfig {
    /// Device id reported with local candidates
    pub device_id: String,
    /// Wave propagation speeds
    pub wave: WaveSpeeds,
    /// On-device detector
    pub detector: DetectorConfig,
    /// Power modes and background tick
    pub scheduler: SchedulerConfig,
    /// Initial battery policy
    pub power_policy: PowerPolicy,
    /// External feeds
    pub sources: SourcesConfig,
    /// Event store
    pub store: StoreConfig,
    /// Crowd consensus
    pub consensus: ConsensusConfig,
    /// Decision engine and default preferences
    pub alerting: AlertingConfig,
    /// Notification dispatch
    pub dispatcher: DispatcherConfig,
}

impl EewConfig {
    /// Create a new configuration builder
    pub fn builder() -> EewConfigBuilder {
        EewConfigBuilder::default()
    }

    /// Load and validate a JSON config file
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EewConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn to_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Sensitivity in [0, 1] implied by the current trigger ratio
    pub fn sensitivity(&self) -> f64 {
        ((LEAST_SENSITIVE_RATIO - self.detector.trigger_ratio) / (LEAST_SENSITIVE_RATIO - MOST_SENSITIVE_RATIO))
            .clamp(0.0, 1.0)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wave
            .validate()
            .map_err(|e| ConfigError::invalid_value("wave", e.to_string()))?;
        if self.wave.s_km_s >= self.wave.p_km_s {
            return Err(ConfigError::invalid_value("wave.s_km_s", "S-wave must be slower than P-wave"));
        }

        let d = &self.detector;
        positive("detector.sta_window_sec", d.sta_window_sec)?;
        if d.lta_window_sec <= d.sta_window_sec {
            return Err(ConfigError::invalid_value(
                "detector.lta_window_sec",
                "must be longer than the short-term window",
            ));
        }
        if !d.trigger_ratio.is_finite() || d.trigger_ratio <= 1.0 {
            return Err(ConfigError::invalid_value("detector.trigger_ratio", "must be greater than 1"));
        }
        if d.debounce_samples == 0 {
            return Err(ConfigError::invalid_value("detector.debounce_samples", "must be at least 1"));
        }
        non_negative("detector.min_acceleration_g", d.min_acceleration_g)?;
        positive("detector.highpass_cutoff_hz", d.highpass_cutoff_hz)?;
        positive("detector.candidate_expiry_sec", d.candidate_expiry_sec)?;

        let s = &self.scheduler;
        positive("scheduler.foreground_rate_hz", s.foreground_rate_hz)?;
        positive("scheduler.background_rate_hz", s.background_rate_hz)?;
        positive("scheduler.battery_saver_rate_hz", s.battery_saver_rate_hz)?;
        positive("scheduler.tick_interval_sec", s.tick_interval_sec)?;
        if s.sample_buffer == 0 {
            return Err(ConfigError::invalid_value("scheduler.sample_buffer", "must be at least 1"));
        }
        if s.background_rate_hz > s.foreground_rate_hz {
            return Err(ConfigError::invalid_value(
                "scheduler.background_rate_hz",
                "must not exceed the foreground rate",
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for feed in &self.sources.feeds {
            if feed.id.is_empty() {
                return Err(ConfigError::invalid_value("sources.feeds.id", "must not be empty"));
            }
            if !ids.insert(feed.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "sources.feeds.id",
                    format!("duplicate feed id '{}'", feed.id),
                ));
            }
            if feed.priority == 0 {
                return Err(ConfigError::invalid_value("sources.feeds.priority", "1 is the highest priority"));
            }
            if feed.mode == FeedMode::Polling {
                positive("sources.feeds.poll_interval_sec", feed.poll_interval_sec)?;
            }
        }
        let b = &self.sources.backoff;
        if b.base_ms == 0 || b.max_ms < b.base_ms {
            return Err(ConfigError::invalid_value(
                "sources.backoff",
                "base must be positive and not exceed max",
            ));
        }

        let dedup = &self.store.dedup;
        positive("store.dedup.time_window_sec", dedup.time_window_sec)?;
        positive("store.dedup.base_distance_km", dedup.base_distance_km)?;
        if dedup.max_distance_km < dedup.base_distance_km {
            return Err(ConfigError::invalid_value(
                "store.dedup.max_distance_km",
                "must be at least the base distance",
            ));
        }
        positive("store.retention_hours", self.store.retention_hours)?;

        let c = &self.consensus;
        positive("consensus.cell_size_km", c.cell_size_km)?;
        positive("consensus.window_sec", c.window_sec)?;
        if c.quorum < 2 {
            return Err(ConfigError::invalid_value(
                "consensus.quorum",
                "a single device must never be sufficient",
            ));
        }
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(ConfigError::invalid_value("consensus.min_confidence", "must be within [0, 1]"));
        }
        if c.cluster_expiry_sec < c.window_sec {
            return Err(ConfigError::invalid_value(
                "consensus.cluster_expiry_sec",
                "must cover at least one grid window",
            ));
        }

        let p = &self.alerting.preferences;
        non_negative("alerting.preferences.max_distance_km", p.max_distance_km)?;
        if p.critical_magnitude < p.min_magnitude {
            return Err(ConfigError::invalid_value(
                "alerting.preferences.critical_magnitude",
                "must not be below min_magnitude",
            ));
        }
        positive("alerting.max_location_age_sec", self.alerting.max_location_age_sec)?;

        if self.dispatcher.latency_budget_ms == 0 {
            return Err(ConfigError::invalid_value("dispatcher.latency_budget_ms", "must be positive"));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::invalid_value("dispatcher.max_attempts", "must be at least 1"));
        }

        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be positive, got {value}")))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("must be non-negative, got {value}")))
    }
}

/// Builder for EewConfig
#[derive(Debug, Default)]
pub struct EewConfigBuilder {
    config: EewConfig,
}

impl EewConfigBuilder {
    /// Set the device id
    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.config.device_id = id.into();
        self
    }

    /// Detection sensitivity (0.0-1.0), mapped onto the STA/LTA trigger ratio
    pub fn sensitivity(mut self, sensitivity: f64) -> Self {
        let s = sensitivity.clamp(0.0, 1.0);
        self.config.detector.trigger_ratio =
            LEAST_SENSITIVE_RATIO - s * (LEAST_SENSITIVE_RATIO - MOST_SENSITIVE_RATIO);
        self
    }

    /// Distinct devices needed to promote a cluster
    pub fn quorum(mut self, quorum: usize) -> Self {
        self.config.consensus.quorum = quorum.max(2);
        self
    }

    /// Magnitude at or above which alerts bypass quiet hours
    pub fn critical_magnitude(mut self, magnitude: f64) -> Self {
        self.config.alerting.preferences.critical_magnitude = magnitude.clamp(3.0, 9.5);
        self
    }

    /// Minimum magnitude the user wants to hear about
    pub fn min_magnitude(mut self, magnitude: f64) -> Self {
        self.config.alerting.preferences.min_magnitude = magnitude.clamp(0.0, 9.5);
        self
    }

    /// Maximum distance the user wants to hear about
    pub fn max_distance_km(mut self, km: f64) -> Self {
        self.config.alerting.preferences.max_distance_km = km.max(0.0);
        self
    }

    /// Initial battery policy
    pub fn power_policy(mut self, policy: PowerPolicy) -> Self {
        self.config.power_policy = policy;
        self
    }

    /// Build the configuration
    pub fn build(self) -> EewConfig {
        self.config
    }
}
