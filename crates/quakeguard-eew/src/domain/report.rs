//! Observations published by external seismic feeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GeoPoint;

/// Identity of a feed (e.g. `"afad"`, `"usgs"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    /// Wrap a feed identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One feed's observation of a physical quake. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    /// Feed that produced the report
    pub source_id: SourceId,
    /// Event id assigned by the feed
    pub external_event_id: String,
    /// Reported magnitude
    pub magnitude: f64,
    /// Reported epicenter
    pub epicenter: GeoPoint,
    /// Reported focal depth in km
    pub depth_km: f64,
    /// Origin time of the quake
    pub origin_time: DateTime<Utc>,
    /// When the feed published the report
    pub reported_at: DateTime<Utc>,
}

impl SourceReport {
    /// Key identifying this observation across feed revisions
    pub fn external_key(&self) -> (SourceId, String) {
        (self.source_id.clone(), self.external_event_id.clone())
    }
}
