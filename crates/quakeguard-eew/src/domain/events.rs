//! Store change notifications broadcast to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EarthquakeEvent, EventId, EventStatus, SourceId};

/// Where a piece of evidence came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvidenceOrigin {
    /// An external feed report
    Feed(SourceId),
    /// A crowd cluster that reached quorum
    Crowd {
        /// Distinct devices in the cluster
        devices: usize,
    },
}

/// All store-level domain events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A new canonical event was created
    EventCreated {
        event: EarthquakeEvent,
        origin: EvidenceOrigin,
        timestamp: DateTime<Utc>,
    },

    /// An existing event absorbed new evidence
    EventUpdated {
        event: EarthquakeEvent,
        previous_status: EventStatus,
        origin: EvidenceOrigin,
        timestamp: DateTime<Utc>,
    },

    /// An event fell out of the retention horizon
    EventPruned {
        event_id: EventId,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::EventCreated { timestamp, .. } => *timestamp,
            Self::EventUpdated { timestamp, .. } => *timestamp,
            Self::EventPruned { timestamp, .. } => *timestamp,
        }
    }

    /// Get event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::EventCreated { .. } => "EventCreated",
            Self::EventUpdated { .. } => "EventUpdated",
            Self::EventPruned { .. } => "EventPruned",
        }
    }

    /// The earthquake event carried by this notification, if any
    pub fn event(&self) -> Option<&EarthquakeEvent> {
        match self {
            Self::EventCreated { event, .. } | Self::EventUpdated { event, .. } => Some(event),
            Self::EventPruned { .. } => None,
        }
    }

    /// Whether this update moved an event from candidate to confirmed
    pub fn is_promotion(&self) -> bool {
        match self {
            Self::EventCreated { event, .. } => event.is_confirmed(),
            Self::EventUpdated {
                event, previous_status, ..
            } => *previous_status == EventStatus::Candidate && event.is_confirmed(),
            Self::EventPruned { .. } => false,
        }
    }
}
