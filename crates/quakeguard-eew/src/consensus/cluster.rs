//! Consensus clusters: candidates from distinct devices that may describe
//! the same quake.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::grid::GridCell;
use crate::domain::{DetectionCandidate, DeviceId, EventId, GeoPoint};

/// Unique identifier for a consensus cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    /// Create a new random cluster ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transient group of candidates within one space/time neighbourhood.
#[derive(Debug, Clone)]
pub struct ConsensusCluster {
    id: ClusterId,
    anchor: GridCell,
    candidates: Vec<DetectionCandidate>,
    devices: BTreeSet<DeviceId>,
    locations: Vec<GeoPoint>,
    centroid: GeoPoint,
    first_trigger: DateTime<Utc>,
    last_trigger: DateTime<Utc>,
    peak_amplitude: f64,
    event_id: Option<EventId>,
}

impl ConsensusCluster {
    /// Open a cluster with its first candidate
    pub fn open(anchor: GridCell, candidate: DetectionCandidate, location: GeoPoint) -> Self {
        let mut devices = BTreeSet::new();
        devices.insert(candidate.device_id.clone());
        Self {
            id: ClusterId::new(),
            anchor,
            first_trigger: candidate.timestamp,
            last_trigger: candidate.timestamp,
            peak_amplitude: candidate.peak_amplitude,
            centroid: location,
            locations: vec![location],
            candidates: vec![candidate],
            devices,
            event_id: None,
        }
    }

    /// Cluster id
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Grid cell the cluster was opened in
    pub fn anchor(&self) -> GridCell {
        self.anchor
    }

    /// Distinct reporting devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether `device` already contributed
    pub fn has_device(&self, device: &DeviceId) -> bool {
        self.devices.contains(device)
    }

    /// Mean device location
    pub fn centroid(&self) -> &GeoPoint {
        &self.centroid
    }

    /// Earliest trigger in the cluster
    pub fn first_trigger(&self) -> DateTime<Utc> {
        self.first_trigger
    }

    /// Latest trigger in the cluster
    pub fn last_trigger(&self) -> DateTime<Utc> {
        self.last_trigger
    }

    /// Largest peak amplitude reported (g)
    pub fn peak_amplitude(&self) -> f64 {
        self.peak_amplitude
    }

    /// Member candidates
    pub fn candidates(&self) -> &[DetectionCandidate] {
        &self.candidates
    }

    /// Event this cluster was promoted into
    pub fn event_id(&self) -> Option<EventId> {
        self.event_id
    }

    /// Whether the cluster reached quorum
    pub fn is_promoted(&self) -> bool {
        self.event_id.is_some()
    }

    pub(crate) fn mark_promoted(&mut self, event_id: EventId) {
        self.event_id = Some(event_id);
    }

    /// Add a candidate from a device not yet in the cluster.
    pub(crate) fn add(&mut self, candidate: DetectionCandidate, location: GeoPoint) {
        self.devices.insert(candidate.device_id.clone());
        self.first_trigger = self.first_trigger.min(candidate.timestamp);
        self.last_trigger = self.last_trigger.max(candidate.timestamp);
        self.peak_amplitude = self.peak_amplitude.max(candidate.peak_amplitude);
        self.locations.push(location);
        if let Some(c) = GeoPoint::centroid(self.locations.iter()) {
            self.centroid = c;
        }
        self.candidates.push(candidate);
    }
}
