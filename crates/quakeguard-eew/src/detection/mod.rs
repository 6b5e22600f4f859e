//! On-device detection: motion sensor capability, STA/LTA trigger and the
//! detector state machine.

pub mod detector;
pub mod sensor;
pub mod sta_lta;

pub use detector::{
    candidate_confidence, run_sample_loop, CandidateOutcome, CandidateRecord, DetectorConfig,
    DetectorState, DrainExit, OnDeviceDetector, SharedDetector,
};
pub use sensor::{SensorPort, SensorSubscription, ShakingBurst, SimulatedSensor, SyntheticWaveform};
pub use sta_lta::{HighPassFilter, StaLtaTrigger, TriggerReading};
