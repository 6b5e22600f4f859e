//! Crowdsourced consensus: pools detection candidates from many devices and
//! promotes space/time clusters that reach a device quorum.

pub mod cluster;
pub mod grid;
pub mod network;

pub use cluster::{ClusterId, ConsensusCluster};
pub use grid::{GridCell, SpaceTimeGrid};
pub use network::{
    crowd_magnitude, ClusterOutcome, ConsensusConfig, CrowdsourcedConsensus, IngestOutcome, RejectReason,
};
