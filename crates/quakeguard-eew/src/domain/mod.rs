//! Domain module containing the core entities and value objects.
//!
//! - **Value objects**: `GeoPoint`, `SeismicSample`, `SourceReport`, `DeviceState`
//! - **Entities**: `DetectionCandidate`, `AlertDecision`
//! - **Aggregate root**: `EarthquakeEvent`
//! - **Domain events**: `DomainEvent`, broadcast by the event store

pub mod candidate;
pub mod coordinates;
pub mod decision;
pub mod device_state;
pub mod event;
pub mod events;
pub mod report;
pub mod sample;

pub use candidate::*;
pub use coordinates::*;
pub use decision::*;
pub use device_state::*;
pub use event::*;
pub use events::*;
pub use report::*;
pub use sample::*;
