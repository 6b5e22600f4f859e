//! Error types for the quakeguard early-warning pipeline.
//!
//! Every module imports its error type from here, keeping the hierarchy in
//! one place.
//!
//! ## Hierarchy
//!
//! ```text
//! EewError (top-level)
//! ├── WaveError     (invalid physics inputs, fail fast)
//! ├── SensorError   (motion sensor unavailable / subscription failed)
//! ├── FeedError     (feed unreachable, malformed report)
//! ├── ChannelError  (notification channel delivery failure)
//! ├── StoreError    (event store lifecycle)
//! └── ConfigError   (config validation / file loading)
//! ```
//!
//! Component-local failures (sensor, one feed, one channel, one malformed
//! report) are contained at the component boundary and logged. Only
//! orchestration entry points surface [`EewError`].

use std::path::PathBuf;

use thiserror::Error;

/// Convenient `Result` alias used by orchestration-level functions.
pub type Result<T> = std::result::Result<T, EewError>;

/// Top-level error type for the early-warning pipeline.
#[derive(Debug, Error)]
pub enum EewError {
    /// Invalid input to a wave/physics calculation
    #[error("Wave calculation error: {0}")]
    Wave(#[from] WaveError),

    /// Motion sensor error
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    /// Seismic feed error
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Notification channel error
    #[error("Notification channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Event store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Domain invariant violation
    #[error("Domain error: {0}")]
    Domain(String),
}

/// Invalid input passed to a [`crate::wave::WaveCalculator`] function.
///
/// Physics helpers never silently return zero for garbage input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaveError {
    /// Value is NaN or infinite
    #[error("{name} must be finite, got {value}")]
    NotFinite {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// Value is negative where only non-negative values make sense
    #[error("{name} must be non-negative, got {value}")]
    Negative {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// Value must be strictly positive (e.g. a wave speed)
    #[error("{name} must be > 0, got {value}")]
    NotPositive {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },
}

impl WaveError {
    /// Validate a finite, non-negative input.
    pub fn check_non_negative(name: &'static str, value: f64) -> std::result::Result<f64, WaveError> {
        if !value.is_finite() {
            return Err(WaveError::NotFinite { name, value });
        }
        if value < 0.0 {
            return Err(WaveError::Negative { name, value });
        }
        Ok(value)
    }

    /// Validate a finite, strictly positive input.
    pub fn check_positive(name: &'static str, value: f64) -> std::result::Result<f64, WaveError> {
        if !value.is_finite() {
            return Err(WaveError::NotFinite { name, value });
        }
        if value <= 0.0 {
            return Err(WaveError::NotPositive { name, value });
        }
        Ok(value)
    }
}

/// Motion sensor failures. The detector disables itself on these and the
/// system keeps running on feeds and consensus alone.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// No accelerometer on this device (or permission denied)
    #[error("motion sensor unavailable")]
    Unavailable,

    /// Requested sampling rate is not usable
    #[error("invalid sampling rate {rate_hz} Hz")]
    InvalidRate {
        /// Requested rate
        rate_hz: f64,
    },

    /// Sensor driver rejected the subscription
    #[error("sensor subscription failed: {0}")]
    SubscriptionFailed(String),

    /// The sample stream ended without being unsubscribed
    #[error("sensor sample stream closed")]
    StreamClosed,
}

/// Errors from a single seismic feed. Never halts the other feeds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    /// Network failure / endpoint down
    #[error("feed '{feed}' unreachable: {reason}")]
    Unreachable {
        /// Feed id
        feed: String,
        /// Human-readable description
        reason: String,
    },

    /// Streaming connection dropped
    #[error("feed '{feed}' disconnected")]
    Disconnected {
        /// Feed id
        feed: String,
    },

    /// Payload could not be normalised into a `SourceReport`
    #[error("malformed report from '{feed}': {reason}")]
    MalformedReport {
        /// Feed id
        feed: String,
        /// What was wrong with the payload
        reason: String,
    },

    /// Feed capability not available on this host
    #[error("feed '{feed}' not available")]
    Unavailable {
        /// Feed id
        feed: String,
    },
}

impl FeedError {
    /// Build a `MalformedReport` error.
    pub fn malformed(feed: impl Into<String>, reason: impl Into<String>) -> Self {
        FeedError::MalformedReport {
            feed: feed.into(),
            reason: reason.into(),
        }
    }

    /// Build an `Unreachable` error.
    pub fn unreachable(feed: impl Into<String>, reason: impl Into<String>) -> Self {
        FeedError::Unreachable {
            feed: feed.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of one notification channel. Other channels are unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Channel not available on this device
    #[error("channel '{channel}' unavailable")]
    Unavailable {
        /// Channel name
        channel: String,
    },

    /// The sink rejected the payload
    #[error("delivery on '{channel}' failed: {reason}")]
    DeliveryFailed {
        /// Channel name
        channel: String,
        /// Human-readable description
        reason: String,
    },

    /// The sink did not answer within the per-channel timeout
    #[error("delivery on '{channel}' timed out after {after_ms} ms")]
    Timeout {
        /// Channel name
        channel: String,
        /// Timeout in milliseconds
        after_ms: u64,
    },
}

/// Event store lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// `init()` has not been called yet
    #[error("event store not initialised")]
    NotInitialized,

    /// The store was shut down; no further writes are accepted
    #[error("event store is shut down")]
    ShutDown,
}

/// Errors produced when loading or validating an [`crate::config::EewConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The config file could not be read or written.
    #[error("cannot access config file {path:?}: {source}")]
    FileRead {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Construct an [`ConfigError::InvalidValue`].
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_non_negative() {
        assert_eq!(WaveError::check_non_negative("d", 0.0), Ok(0.0));
        assert!(matches!(
            WaveError::check_non_negative("d", -1.0),
            Err(WaveError::Negative { name: "d", .. })
        ));
        assert!(matches!(
            WaveError::check_non_negative("d", f64::NAN),
            Err(WaveError::NotFinite { .. })
        ));
    }

    #[test]
    fn test_check_positive_rejects_zero() {
        assert!(WaveError::check_positive("v", 0.0).is_err());
        assert!(WaveError::check_positive("v", f64::INFINITY).is_err());
        assert_eq!(WaveError::check_positive("v", 3.5), Ok(3.5));
    }

    #[test]
    fn test_error_conversion() {
        let err: EewError = FeedError::malformed("usgs", "missing magnitude").into();
        assert!(matches!(err, EewError::Feed(FeedError::MalformedReport { .. })));
        assert!(err.to_string().contains("missing magnitude"));
    }
}
