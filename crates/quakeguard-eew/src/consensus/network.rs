//! Crowdsourced consensus over detection candidates from many devices.
//!
//! Candidates are bucketed on a coarse space/time grid so that each new
//! candidate is only compared against clusters in its 3×3 neighbourhood
//! over the adjacent time windows.
//! A cluster that reaches a quorum of distinct devices is promoted into
//! the event store; one that expires first is silently discarded.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::cluster::{ClusterId, ConsensusCluster};
use super::grid::{GridCell, SpaceTimeGrid};
use crate::domain::{CrowdEvidence, DetectionCandidate, EventId};
use crate::error::EewError;
use crate::store::{EventStore, UpsertOutcome};
use crate::wave::{magnitude_from_pga, WaveCalculator, DEFAULT_DEPTH_KM};

/// Consensus tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Grid cell edge in km (default: 15)
    pub cell_size_km: f64,
    /// Grid time window in seconds (default: 12)
    pub window_sec: f64,
    /// Distinct devices needed for promotion (default: 3)
    pub quorum: usize,
    /// Candidates below this confidence are not pooled (default: 0.4)
    pub min_confidence: f64,
    /// Seconds after its first trigger that a cluster is dropped (default: 20)
    pub cluster_expiry_sec: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            cell_size_km: 15.0,
            window_sec: 12.0,
            quorum: 3,
            min_confidence: 0.4,
            cluster_expiry_sec: 20.0,
        }
    }
}

/// Why a candidate was not pooled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Confidence below the pooling floor
    LowConfidence,
    /// No device location
    NoLocation,
}

/// Result of [`CrowdsourcedConsensus::ingest`]
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Candidate was not pooled
    Rejected(RejectReason),
    /// Device already counted in the matching cluster
    Duplicate(ClusterId),
    /// Added to a cluster still below quorum
    Pooled {
        /// Cluster joined or opened
        cluster_id: ClusterId,
        /// Distinct devices so far
        devices: usize,
    },
    /// Cluster reached (or had reached) quorum and was written to the store
    Promoted {
        /// Promoted cluster
        cluster_id: ClusterId,
        /// Store result
        outcome: UpsertOutcome,
    },
}

/// Result of expiring a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOutcome {
    /// Never reached quorum
    Discarded {
        /// Expired cluster
        cluster_id: ClusterId,
        /// Devices it had gathered
        devices: usize,
    },
    /// Reached quorum earlier and has now aged out
    Completed {
        /// Expired cluster
        cluster_id: ClusterId,
        /// Event it was promoted into
        event_id: EventId,
    },
}

#[derive(Default)]
struct ConsensusState {
    clusters: HashMap<ClusterId, ConsensusCluster>,
    index: HashMap<GridCell, Vec<ClusterId>>,
}

/// Pools candidates from many devices and promotes quorum clusters.
pub struct CrowdsourcedConsensus {
    config: ConsensusConfig,
    grid: SpaceTimeGrid,
    calculator: WaveCalculator,
    store: EventStore,
    state: Mutex<ConsensusState>,
}

impl CrowdsourcedConsensus {
    /// Create a consensus pool writing promotions into `store`
    pub fn new(config: ConsensusConfig, calculator: WaveCalculator, store: EventStore) -> Self {
        Self {
            grid: SpaceTimeGrid::new(config.cell_size_km, config.window_sec),
            config,
            calculator,
            store,
            state: Mutex::new(ConsensusState::default()),
        }
    }

    /// Configured quorum
    pub fn quorum(&self) -> usize {
        self.config.quorum
    }

    /// Open clusters
    pub fn cluster_count(&self) -> usize {
        self.state.lock().clusters.len()
    }

    /// Clone of one cluster
    pub fn cluster(&self, id: &ClusterId) -> Option<ConsensusCluster> {
        self.state.lock().clusters.get(id).cloned()
    }

    /// Pool one candidate.
    ///
    /// Expired clusters are swept first so that a late candidate can never
    /// revive a cluster that should already have been discarded.
    pub fn ingest(&self, candidate: DetectionCandidate, now: DateTime<Utc>) -> Result<IngestOutcome, EewError> {
        if candidate.confidence < self.config.min_confidence {
            tracing::debug!(device = %candidate.device_id, confidence = candidate.confidence, "Candidate below pooling confidence");
            return Ok(IngestOutcome::Rejected(RejectReason::LowConfidence));
        }
        let Some(location) = candidate.estimated_location else {
            tracing::debug!(device = %candidate.device_id, "Candidate without location not pooled");
            return Ok(IngestOutcome::Rejected(RejectReason::NoLocation));
        };

        self.expire(now);

        let mut state = self.state.lock();
        let window = Duration::milliseconds((self.config.window_sec * 1000.0) as i64);

        let nearest = self
            .grid
            .neighbourhood(&location, candidate.timestamp)
            .iter()
            .filter_map(|cell| state.index.get(cell))
            .flatten()
            .filter_map(|id| state.clusters.get(id))
            .filter(|c| {
                // The cluster's trigger span, this candidate included, must fit one window.
                let first = c.first_trigger().min(candidate.timestamp);
                let last = c.last_trigger().max(candidate.timestamp);
                last - first <= window
            })
            .map(|c| (c.centroid().distance_km(&location), c.id()))
            .filter(|(d, _)| *d <= self.grid.cell_km())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id);

        let cluster_id = match nearest {
            Some(id) => {
                let Some(cluster) = state.clusters.get_mut(&id) else {
                    return Err(EewError::Domain(format!("cluster {id} indexed but missing")));
                };
                if cluster.has_device(&candidate.device_id) {
                    return Ok(IngestOutcome::Duplicate(id));
                }
                cluster.add(candidate, location);
                id
            }
            None => {
                let anchor = self.grid.cell_of(&location, candidate.timestamp);
                let cluster = ConsensusCluster::open(anchor, candidate, location);
                let id = cluster.id();
                state.index.entry(anchor).or_default().push(id);
                state.clusters.insert(id, cluster);
                id
            }
        };

        let Some(cluster) = state.clusters.get_mut(&cluster_id) else {
            return Err(EewError::Domain(format!("cluster {cluster_id} vanished")));
        };
        let devices = cluster.device_count();
        if devices < self.config.quorum {
            tracing::debug!(cluster_id = %cluster_id, devices, quorum = self.config.quorum, "Candidate pooled");
            return Ok(IngestOutcome::Pooled { cluster_id, devices });
        }

        let evidence = self.evidence(cluster)?;
        let outcome = match cluster.event_id() {
            Some(event_id) => self.store.upsert_crowd_into(event_id, &evidence, now)?,
            None => self.store.upsert_crowd(&evidence, now)?,
        };
        if !cluster.is_promoted() {
            tracing::info!(
                cluster_id = %cluster_id,
                devices,
                magnitude = evidence.magnitude,
                centroid = %evidence.centroid,
                "Crowd cluster reached quorum"
            );
        }
        cluster.mark_promoted(outcome.event_id());
        Ok(IngestOutcome::Promoted { cluster_id, outcome })
    }

    /// Drop clusters older than the expiry window.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<ClusterOutcome> {
        let expiry = Duration::milliseconds((self.config.cluster_expiry_sec * 1000.0) as i64);
        let mut state = self.state.lock();

        let expired: Vec<ClusterId> = state
            .clusters
            .values()
            .filter(|c| now - c.first_trigger() >= expiry)
            .map(|c| c.id())
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(cluster) = state.clusters.remove(&id) else {
                continue;
            };
            if let Some(ids) = state.index.get_mut(&cluster.anchor()) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    state.index.remove(&cluster.anchor());
                }
            }
            let outcome = match cluster.event_id() {
                Some(event_id) => ClusterOutcome::Completed { cluster_id: id, event_id },
                None => {
                    tracing::debug!(cluster_id = %id, devices = cluster.device_count(), "Cluster expired below quorum");
                    ClusterOutcome::Discarded {
                        cluster_id: id,
                        devices: cluster.device_count(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn evidence(&self, cluster: &ConsensusCluster) -> Result<CrowdEvidence, EewError> {
        let devices = cluster.device_count();
        let magnitude = crowd_magnitude(cluster.peak_amplitude(), devices)?;

        // Devices trigger on the P-wave; step back by its travel time from
        // an assumed focus under the centroid.
        let hypo_km = self.calculator.hypocentral_distance_km(0.0, DEFAULT_DEPTH_KM)?;
        let travel_ms = (hypo_km / self.calculator.speeds().p_km_s * 1000.0) as i64;

        Ok(CrowdEvidence {
            centroid: *cluster.centroid(),
            magnitude,
            origin_time: cluster.first_trigger() - Duration::milliseconds(travel_ms),
            depth_km: DEFAULT_DEPTH_KM,
            device_count: devices,
        })
    }
}

/// Tiered crowd magnitude from the largest peak amplitude (g).
///
/// Larger clusters imply a wider felt area and get a small upward bump.
/// The result is rounded to half-magnitude tiers.
pub fn crowd_magnitude(peak_amplitude_g: f64, devices: usize) -> Result<f64, EewError> {
    let base = magnitude_from_pga(peak_amplitude_g)?;
    let bump = if devices >= 10 {
        0.3
    } else if devices >= 5 {
        0.2
    } else {
        0.0
    };
    Ok(((base + bump) * 2.0).round() / 2.0)
}
