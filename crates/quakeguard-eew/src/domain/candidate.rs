//! Single-device trigger candidates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GeoPoint;

/// Unique identifier for a detection candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateId(Uuid);

impl CandidateId {
    /// Create a new random candidate ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a reporting device, assigned outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// STA/LTA trigger emitted by one device.
///
/// A candidate is only ever a contributing signal. It reaches alerting
/// solely through a consensus cluster or an official feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    /// Candidate id
    pub id: CandidateId,
    /// Emitting device
    pub device_id: DeviceId,
    /// Time of the trigger
    pub timestamp: DateTime<Utc>,
    /// STA/LTA ratio at trigger
    pub sta_lta_ratio: f64,
    /// Peak high-passed acceleration during the trigger (g)
    pub peak_amplitude: f64,
    /// Device location, if known
    pub estimated_location: Option<GeoPoint>,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl DetectionCandidate {
    /// Create a candidate with a fresh id
    pub fn new(
        device_id: DeviceId,
        timestamp: DateTime<Utc>,
        sta_lta_ratio: f64,
        peak_amplitude: f64,
        confidence: f64,
    ) -> Self {
        Self {
            id: CandidateId::new(),
            device_id,
            timestamp,
            sta_lta_ratio,
            peak_amplitude,
            estimated_location: None,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Attach the device location
    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.estimated_location = Some(location);
        self
    }
}
