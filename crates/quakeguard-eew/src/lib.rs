//! # QuakeGuard EEW (Earthquake Early Warning)
//!
//! A real-time pipeline that detects earthquakes and warns users before the
//! damaging S-wave arrives.
//!
//! Evidence comes from two directions:
//!
//! - **On-device detection**: an STA/LTA trigger over the phone's
//!   accelerometer raises local detection candidates
//! - **External feeds**: seismic agencies push or publish reports that are
//!   normalised, merged and failed over by priority
//!
//! Candidates from many devices are pooled by crowdsourced consensus; a
//! cluster that reaches a device quorum becomes an event. Every confirmed
//! event is evaluated against the user's location and preferences, and the
//! resulting decision is fanned out to visual, sound, vibration and speech
//! channels concurrently.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        quakeguard-eew                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │  Detection   │   │   Sources    │   │     Scheduler    │  │
//! │  │ (STA/LTA)    │   │ (feed chain) │   │ (power / ticks)  │  │
//! │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘  │
//! │         │ candidates       │ reports            │ ticks      │
//! │  ┌──────▼───────┐          │                    │            │
//! │  │  Consensus   │◄─────────┼────────────────────┘            │
//! │  └──────┬───────┘          │                                 │
//! │         └─────────┬────────┘                                 │
//! │           ┌───────▼────────┐   broadcast   ┌──────────────┐  │
//! │           │  Event Store   ├──────────────►│   Alerting   │  │
//! │           └────────────────┘               │ (decide/send)│  │
//! │                                            └──────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use quakeguard_eew::{EarlyWarningSystem, EewConfig, GeoPoint, LocatedFix};
//!
//! #[tokio::main]
//! async fn main() -> quakeguard_eew::Result<()> {
//!     let config = EewConfig::builder()
//!         .device_id("phone-1")
//!         .sensitivity(0.7)
//!         .critical_magnitude(5.5)
//!         .build();
//!
//!     let fix = LocatedFix::new(GeoPoint::new(38.42, 27.14), chrono::Utc::now());
//!     let mut system = EarlyWarningSystem::simulation(config, Some(fix))?;
//!     system.start().await?;
//!
//!     // ... feeds and sensors run in the background ...
//!
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alerting;
pub mod config;
pub mod consensus;
pub mod detection;
pub mod domain;
pub mod error;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod system;
pub mod wave;

// Re-export main types
pub use domain::{
    AlertDecision, CandidateId, CrowdEvidence, DeliveryMode, DetectionCandidate, DeviceId, DeviceState,
    DomainEvent, EarthquakeEvent, EventId, EventStatus, EvidenceOrigin, GeoPoint, Hypocenter, PowerMode,
    PowerPolicy, SeismicSample, SeverityTier, SourceId, SourceRank, SourceReport,
};

pub use wave::{SoilClass, WaveArrivals, WaveCalculator, WaveSpeeds};

pub use detection::{
    DetectorConfig, DetectorState, OnDeviceDetector, SensorPort, SharedDetector, SimulatedSensor,
    StaLtaTrigger, SyntheticWaveform,
};

pub use sources::{
    FeedDescriptor, FeedHandle, FeedHealth, FeedMode, FeedStatus, MultiSourceMonitor, RawFeedReport,
    SourcesConfig,
};

pub use store::{EventStore, StoreConfig, UpsertOutcome};

pub use consensus::{ConsensusConfig, CrowdsourcedConsensus, IngestOutcome};

pub use scheduler::{BackgroundHost, MonitorScheduler, SchedulerConfig, TokioIntervalHost};

pub use alerting::{
    AlertDecisionEngine, AlertingConfig, ChannelKind, ChannelToggles, DispatchReport, DispatcherConfig,
    LocatedFix, LocationProvider, NotificationChannel, NotificationDispatcher, PreferencesProvider,
    UserPreferences,
};

pub use config::{EewConfig, EewConfigBuilder};
pub use error::{ChannelError, ConfigError, EewError, FeedError, Result, SensorError, StoreError, WaveError};
pub use system::{EarlyWarningSystem, EarlyWarningSystemBuilder, SystemHealth};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        EarlyWarningSystem, EewConfig, EewConfigBuilder, EewError, Result,
        // Domain types
        AlertDecision, DetectionCandidate, EarthquakeEvent, EventId, EventStatus, GeoPoint, SeverityTier,
        // Physics
        SoilClass, WaveCalculator,
        // Pipeline components
        CrowdsourcedConsensus, EventStore, MultiSourceMonitor, OnDeviceDetector,
        // Alerting
        AlertDecisionEngine, LocatedFix, NotificationDispatcher, UserPreferences,
    };
}
