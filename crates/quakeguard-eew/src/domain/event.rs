//! Canonical earthquake event aggregate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GeoPoint, Hypocenter, SourceId, SourceReport};

/// Priority assigned to crowd-derived parameters, below every feed.
pub const CROWD_PRIORITY: u8 = u8::MAX;

/// Unique identifier for an earthquake event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verification status. Ordered so that `max` never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// Seen, not yet verified
    Candidate,
    /// Verified by an authoritative feed, two independent feeds, or a crowd quorum
    Confirmed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Candidate => write!(f, "CANDIDATE"),
            EventStatus::Confirmed => write!(f, "CONFIRMED"),
        }
    }
}

/// How much a feed's report is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRank {
    /// 1 is the highest priority
    pub priority: u8,
    /// A single report from this feed confirms an event
    pub authoritative: bool,
}

impl SourceRank {
    /// Create a rank
    pub fn new(priority: u8, authoritative: bool) -> Self {
        Self { priority, authoritative }
    }
}

/// Summary of a crowd cluster that reached quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrowdEvidence {
    /// Centroid of the reporting devices
    pub centroid: GeoPoint,
    /// Tiered crowd magnitude
    pub magnitude: f64,
    /// Estimated origin time
    pub origin_time: DateTime<Utc>,
    /// Assumed focal depth in km
    pub depth_km: f64,
    /// Distinct devices in the cluster
    pub device_count: usize,
}

/// Canonical record of one physical earthquake.
///
/// The id never changes once created. Parameters are refined as evidence
/// arrives, and `status` only moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarthquakeEvent {
    id: EventId,
    epicenter: GeoPoint,
    magnitude: f64,
    origin_time: DateTime<Utc>,
    depth_km: f64,
    confirming_sources: BTreeSet<SourceId>,
    authoritative_sources: BTreeSet<SourceId>,
    confirming_device_cluster_size: usize,
    status: EventStatus,
    parameter_priority: u8,
    revision: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EarthquakeEvent {
    /// Create a candidate event from a first feed report
    pub fn from_report(report: &SourceReport, rank: SourceRank, now: DateTime<Utc>) -> Self {
        let mut event = Self {
            id: EventId::new(),
            epicenter: report.epicenter,
            magnitude: report.magnitude,
            origin_time: report.origin_time,
            depth_km: report.depth_km,
            confirming_sources: BTreeSet::new(),
            authoritative_sources: BTreeSet::new(),
            confirming_device_cluster_size: 0,
            status: EventStatus::Candidate,
            parameter_priority: rank.priority,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        event.record_source(&report.source_id, rank);
        event.reevaluate();
        event
    }

    /// Create a network-verified event from a crowd cluster that reached quorum
    pub fn from_crowd(evidence: &CrowdEvidence, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            epicenter: evidence.centroid,
            magnitude: evidence.magnitude,
            origin_time: evidence.origin_time,
            depth_km: evidence.depth_km,
            confirming_sources: BTreeSet::new(),
            authoritative_sources: BTreeSet::new(),
            confirming_device_cluster_size: evidence.device_count,
            status: EventStatus::Confirmed,
            parameter_priority: CROWD_PRIORITY,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the event ID
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Get the epicenter
    pub fn epicenter(&self) -> &GeoPoint {
        &self.epicenter
    }

    /// Get the magnitude
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Get the origin time
    pub fn origin_time(&self) -> DateTime<Utc> {
        self.origin_time
    }

    /// Get the focal depth in km
    pub fn depth_km(&self) -> f64 {
        self.depth_km
    }

    /// Epicenter plus depth
    pub fn hypocenter(&self) -> Hypocenter {
        Hypocenter::new(self.epicenter, self.depth_km)
    }

    /// Feeds that reported this event
    pub fn confirming_sources(&self) -> &BTreeSet<SourceId> {
        &self.confirming_sources
    }

    /// Largest crowd cluster that corroborated this event
    pub fn confirming_device_cluster_size(&self) -> usize {
        self.confirming_device_cluster_size
    }

    /// Current status
    pub fn status(&self) -> EventStatus {
        self.status
    }

    /// Whether the event is verified
    pub fn is_confirmed(&self) -> bool {
        self.status == EventStatus::Confirmed
    }

    /// Incremented on every change
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// When the event was first created
    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    /// When the event last changed
    pub fn updated_at(&self) -> &DateTime<Utc> {
        &self.updated_at
    }

    /// Merge a corroborating feed report. Returns true if anything changed.
    ///
    /// Parameters are taken from the highest-priority source seen so far;
    /// between equal priorities the latest report wins.
    pub fn apply_report(&mut self, report: &SourceReport, rank: SourceRank, now: DateTime<Utc>) -> bool {
        let before = (self.status, self.confirming_sources.len(), self.magnitude, self.epicenter);

        self.record_source(&report.source_id, rank);
        if rank.priority <= self.parameter_priority {
            self.parameter_priority = rank.priority;
            self.epicenter = report.epicenter;
            self.magnitude = report.magnitude;
            self.origin_time = report.origin_time;
            self.depth_km = report.depth_km;
        }
        self.reevaluate();

        let after = (self.status, self.confirming_sources.len(), self.magnitude, self.epicenter);
        let changed = before != after;
        if changed {
            self.touch(now);
        }
        changed
    }

    /// Record crowd corroboration from a cluster that reached quorum.
    ///
    /// A quorum cluster is network-verified evidence and confirms the event.
    /// Crowd parameters only refine an event no feed has reported yet.
    pub fn apply_cluster(&mut self, evidence: &CrowdEvidence, now: DateTime<Utc>) -> bool {
        let before = (self.status, self.confirming_device_cluster_size, self.magnitude, self.epicenter);
        self.confirming_device_cluster_size = self.confirming_device_cluster_size.max(evidence.device_count);
        if self.parameter_priority == CROWD_PRIORITY && evidence.device_count >= self.confirming_device_cluster_size {
            self.epicenter = evidence.centroid;
            self.magnitude = evidence.magnitude;
            self.origin_time = evidence.origin_time;
        }
        self.promote(EventStatus::Confirmed);
        let after = (self.status, self.confirming_device_cluster_size, self.magnitude, self.epicenter);
        let changed = before != after;
        if changed {
            self.touch(now);
        }
        changed
    }

    /// Raise the status; never lowers it.
    pub fn promote(&mut self, status: EventStatus) {
        self.status = self.status.max(status);
    }

    /// Drop events whose origin is older than `horizon`
    pub fn is_older_than(&self, horizon: DateTime<Utc>) -> bool {
        self.origin_time < horizon
    }

    fn record_source(&mut self, source: &SourceId, rank: SourceRank) {
        self.confirming_sources.insert(source.clone());
        if rank.authoritative {
            self.authoritative_sources.insert(source.clone());
        }
    }

    fn reevaluate(&mut self) {
        let non_authoritative = self.confirming_sources.len() - self.authoritative_sources.len();
        if !self.authoritative_sources.is_empty() || non_authoritative >= 2 {
            self.promote(EventStatus::Confirmed);
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = now;
    }
}
