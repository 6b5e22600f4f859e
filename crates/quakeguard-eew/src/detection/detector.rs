//! On-device P-wave detector.
//!
//! State machine:
//!
//! ```text
//! Idle → Sampling → CandidateDetected → (Reported | Expired) → Sampling
//! ```
//!
//! A trigger is only a contributing signal. The detector hands candidates
//! to the scheduler, which forwards them to crowd consensus; it never
//! raises a user alert on its own.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::sta_lta::{HighPassFilter, StaLtaTrigger, TriggerReading};
use crate::domain::{CandidateId, DetectionCandidate, DeviceId, GeoPoint, SeismicSample};
use crate::error::SensorError;

/// Detector tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Short-term window in seconds (default: 1.0)
    pub sta_window_sec: f64,
    /// Long-term window in seconds (default: 10.0)
    pub lta_window_sec: f64,
    /// STA/LTA ratio that triggers (default: 3.0)
    pub trigger_ratio: f64,
    /// Consecutive elevated samples required (default: 3)
    pub debounce_samples: usize,
    /// Minimum STA RMS acceleration in g (default: 0.02)
    pub min_acceleration_g: f64,
    /// High-pass cutoff for gravity removal (default: 0.5 Hz)
    pub highpass_cutoff_hz: f64,
    /// Seconds before an unreported candidate expires (default: 30)
    pub candidate_expiry_sec: f64,
    /// Resolved candidates kept for inspection (default: 100)
    pub history_len: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sta_window_sec: 1.0,
            lta_window_sec: 10.0,
            trigger_ratio: 3.0,
            debounce_samples: 3,
            min_acceleration_g: 0.02,
            highpass_cutoff_hz: 0.5,
            candidate_expiry_sec: 30.0,
            history_len: 100,
        }
    }
}

/// Detector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    /// Not sampling
    Idle,
    /// Consuming samples, no open candidate
    Sampling,
    /// A candidate is waiting to be forwarded
    CandidateDetected,
    /// The last candidate was handed off
    Reported,
    /// The last candidate timed out before hand-off
    Expired,
}

/// How a candidate left the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateOutcome {
    /// Forwarded to consensus
    Reported,
    /// Timed out on the device
    Expired,
    /// Dropped because sampling stopped
    Abandoned,
}

/// Resolved candidate kept in the detector history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Final candidate values
    pub candidate: DetectionCandidate,
    /// How it was resolved
    pub outcome: CandidateOutcome,
    /// When it was resolved
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingCandidate {
    candidate: DetectionCandidate,
    detected_at: DateTime<Utc>,
    persistence: usize,
}

/// Shared handle used by the sample loop and the scheduler tick
pub type SharedDetector = Arc<Mutex<OnDeviceDetector>>;

/// STA/LTA detector for one device.
pub struct OnDeviceDetector {
    config: DetectorConfig,
    device_id: DeviceId,
    location: Option<GeoPoint>,
    available: bool,
    sample_rate_hz: f64,
    filter: HighPassFilter,
    trigger: StaLtaTrigger,
    state: DetectorState,
    pending: Option<PendingCandidate>,
    armed: bool,
    history: VecDeque<CandidateRecord>,
    samples_processed: u64,
}

impl OnDeviceDetector {
    /// Create an idle detector
    pub fn new(config: DetectorConfig, device_id: DeviceId) -> Self {
        let rate = 100.0;
        Self {
            filter: HighPassFilter::new(config.highpass_cutoff_hz, rate),
            trigger: build_trigger(&config, rate),
            config,
            device_id,
            location: None,
            available: true,
            sample_rate_hz: rate,
            state: DetectorState::Idle,
            pending: None,
            armed: true,
            history: VecDeque::new(),
            samples_processed: 0,
        }
    }

    /// Wrap into a shared handle
    pub fn into_shared(self) -> SharedDetector {
        Arc::new(Mutex::new(self))
    }

    /// Current state
    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Whether the motion sensor can be used
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Disable the detector after a sensor failure
    pub fn mark_unavailable(&mut self, error: &SensorError) {
        if self.available {
            tracing::warn!(device = %self.device_id, error = %error, "Motion sensor unavailable, detector disabled");
        }
        self.available = false;
        self.stop(Utc::now());
    }

    /// Re-enable after the sensor came back
    pub fn mark_available(&mut self) {
        self.available = true;
    }

    /// Device identity stamped on candidates
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Update the best-effort device location
    pub fn set_location(&mut self, location: Option<GeoPoint>) {
        self.location = location;
    }

    /// Active sampling rate
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Trigger ratio currently in use
    pub fn trigger_ratio(&self) -> f64 {
        self.trigger.threshold()
    }

    /// Change sensitivity at runtime
    pub fn set_trigger_ratio(&mut self, ratio: f64) {
        self.config.trigger_ratio = ratio;
        self.trigger.set_threshold(ratio);
    }

    /// Begin sampling at `rate_hz`, rebuilding the windows.
    pub fn start(&mut self, rate_hz: f64) -> Result<(), SensorError> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SensorError::InvalidRate { rate_hz });
        }
        if !self.available {
            return Err(SensorError::Unavailable);
        }
        if (rate_hz - self.sample_rate_hz).abs() > f64::EPSILON || self.state == DetectorState::Idle {
            self.sample_rate_hz = rate_hz;
            self.filter = HighPassFilter::new(self.config.highpass_cutoff_hz, rate_hz);
            self.trigger = build_trigger(&self.config, rate_hz);
            self.armed = true;
        }
        if self.state == DetectorState::Idle {
            self.state = DetectorState::Sampling;
        }
        tracing::debug!(device = %self.device_id, rate_hz, "Detector sampling");
        Ok(())
    }

    /// Stop sampling. An open candidate is abandoned.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if let Some(pending) = self.pending.take() {
            self.record(pending.candidate, CandidateOutcome::Abandoned, now);
        }
        self.filter.reset();
        self.trigger.reset();
        self.state = DetectorState::Idle;
    }

    /// Process one sample. Returns a candidate when a new trigger fires.
    pub fn process_sample(&mut self, sample: &SeismicSample) -> Option<DetectionCandidate> {
        if !self.available || self.state == DetectorState::Idle {
            return None;
        }
        if !sample.is_finite() {
            tracing::debug!(device = %self.device_id, "Dropping non-finite sample");
            return None;
        }
        if matches!(self.state, DetectorState::Reported | DetectorState::Expired) {
            self.state = DetectorState::Sampling;
        }

        let [x, y, z] = self.filter.apply(sample);
        let energy = x * x + y * y + z * z;
        let amplitude = energy.sqrt();
        let reading = self.trigger.push(energy);
        self.samples_processed += 1;

        if reading.ratio < self.trigger.threshold() {
            self.armed = true;
        }

        match self.state {
            DetectorState::CandidateDetected => {
                self.refresh_pending(&reading, amplitude);
                None
            }
            DetectorState::Sampling if reading.triggered && self.armed => {
                self.armed = false;
                let persistence = self.trigger.persistence();
                let confidence = candidate_confidence(
                    reading.ratio,
                    self.trigger.threshold(),
                    amplitude,
                    persistence as f64 / self.sample_rate_hz,
                );
                let mut candidate = DetectionCandidate::new(
                    self.device_id.clone(),
                    sample.timestamp,
                    reading.ratio,
                    amplitude,
                    confidence,
                );
                candidate.estimated_location = self.location;

                tracing::info!(
                    device = %self.device_id,
                    candidate_id = %candidate.id,
                    ratio = reading.ratio,
                    peak_g = amplitude,
                    confidence,
                    "STA/LTA trigger"
                );

                self.pending = Some(PendingCandidate {
                    candidate: candidate.clone(),
                    detected_at: sample.timestamp,
                    persistence,
                });
                self.state = DetectorState::CandidateDetected;
                Some(candidate)
            }
            _ => None,
        }
    }

    /// Hand off the open candidate, if any.
    pub fn take_pending(&mut self, now: DateTime<Utc>) -> Option<DetectionCandidate> {
        if self.state != DetectorState::CandidateDetected {
            return None;
        }
        let pending = self.pending.take()?;
        self.state = DetectorState::Reported;
        self.record(pending.candidate.clone(), CandidateOutcome::Reported, now);
        Some(pending.candidate)
    }

    /// Expire an open candidate older than the configured window.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<CandidateId> {
        let pending = self.pending.as_ref()?;
        let expiry = Duration::milliseconds((self.config.candidate_expiry_sec * 1000.0) as i64);
        if now - pending.detected_at < expiry {
            return None;
        }
        let pending = self.pending.take()?;
        let id = pending.candidate.id;
        tracing::debug!(device = %self.device_id, candidate_id = %id, "Candidate expired unreported");
        self.state = DetectorState::Expired;
        self.record(pending.candidate, CandidateOutcome::Expired, now);
        Some(id)
    }

    /// Currently open candidate
    pub fn pending(&self) -> Option<&DetectionCandidate> {
        self.pending.as_ref().map(|p| &p.candidate)
    }

    /// Background RMS noise level in g, once the long window has filled
    pub fn calibrate(&self) -> Option<f64> {
        self.trigger.is_warmed_up().then(|| self.trigger.noise_rms())
    }

    /// Recently resolved candidates, oldest first
    pub fn history(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.history.iter()
    }

    /// Samples consumed since creation
    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    fn refresh_pending(&mut self, reading: &TriggerReading, amplitude: f64) {
        let threshold = self.trigger.threshold();
        let rate = self.sample_rate_hz;
        let persistence_now = self.trigger.persistence();
        if let Some(pending) = self.pending.as_mut() {
            let c = &mut pending.candidate;
            c.peak_amplitude = c.peak_amplitude.max(amplitude);
            c.sta_lta_ratio = c.sta_lta_ratio.max(reading.ratio);
            pending.persistence = pending.persistence.max(persistence_now);
            c.confidence = candidate_confidence(
                c.sta_lta_ratio,
                threshold,
                c.peak_amplitude,
                pending.persistence as f64 / rate,
            );
        }
    }

    fn record(&mut self, candidate: DetectionCandidate, outcome: CandidateOutcome, now: DateTime<Utc>) {
        if self.config.history_len == 0 {
            return;
        }
        while self.history.len() >= self.config.history_len {
            self.history.pop_front();
        }
        self.history.push_back(CandidateRecord {
            candidate,
            outcome,
            resolved_at: now,
        });
    }
}

fn build_trigger(config: &DetectorConfig, rate_hz: f64) -> StaLtaTrigger {
    let sta_len = (config.sta_window_sec * rate_hz).round().max(1.0) as usize;
    let lta_len = (config.lta_window_sec * rate_hz).round().max(sta_len as f64 + 1.0) as usize;
    StaLtaTrigger::new(
        sta_len,
        lta_len,
        config.trigger_ratio,
        config.min_acceleration_g,
        config.debounce_samples,
    )
}

/// Confidence in [0, 1] from ratio excess, peak acceleration and persistence.
pub fn candidate_confidence(ratio: f64, threshold: f64, peak_g: f64, persistence_sec: f64) -> f64 {
    let excess = if threshold > 0.0 { ratio / threshold - 1.0 } else { 0.0 };
    let ratio_term = excess.clamp(0.0, 3.0) / 3.0 * 0.3;

    let peak_term = if peak_g > 0.3 {
        0.4
    } else if peak_g > 0.1 {
        0.3
    } else if peak_g > 0.05 {
        0.2
    } else if peak_g > 0.02 {
        0.1
    } else {
        0.0
    };

    let persistence_term = if persistence_sec >= 2.0 {
        0.2
    } else if persistence_sec >= 1.0 {
        0.15
    } else if persistence_sec >= 0.5 {
        0.1
    } else {
        0.05
    };

    (0.1 + ratio_term + peak_term + persistence_term).min(1.0)
}

/// Why a sample loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    /// Shutdown was signalled
    Shutdown,
    /// The sensor side closed the channel
    StreamClosed {
        /// Samples drained before the close
        samples: u64,
    },
}

/// Drain the sample channel into the detector until shutdown or until the
/// sensor side closes the channel.
///
/// A detector disabled by an earlier stream failure is re-armed at
/// `rate_hz` by the first sample that arrives.
pub async fn run_sample_loop(
    detector: SharedDetector,
    rate_hz: f64,
    mut samples: mpsc::Receiver<SeismicSample>,
    mut shutdown: watch::Receiver<bool>,
) -> DrainExit {
    let mut drained: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return DrainExit::Shutdown,
            next = samples.recv() => match next {
                Some(sample) => {
                    let mut detector = detector.lock();
                    if !detector.is_available() {
                        detector.mark_available();
                        if let Err(e) = detector.start(rate_hz) {
                            tracing::warn!(error = %e, "Detector could not resume");
                        } else {
                            tracing::info!(device = %detector.device_id(), rate_hz, "Sensor stream resumed");
                        }
                    }
                    detector.process_sample(&sample);
                    drained += 1;
                }
                None => {
                    tracing::debug!(samples = drained, "Sample stream closed");
                    return DrainExit::StreamClosed { samples: drained };
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::sensor::{ShakingBurst, SyntheticWaveform};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn detector() -> OnDeviceDetector {
        let mut d = OnDeviceDetector::new(DetectorConfig::default(), DeviceId::new("dev-1"));
        d.start(100.0).unwrap();
        d
    }

    fn quake_waveform() -> SyntheticWaveform {
        SyntheticWaveform::quiet(start()).with_burst(ShakingBurst {
            start_sec: 15.0,
            duration_sec: 4.0,
            amplitude_g: 0.15,
            frequency_hz: 3.0,
        })
    }

    #[test]
    fn test_idle_detector_ignores_samples() {
        let mut d = OnDeviceDetector::new(DetectorConfig::default(), DeviceId::new("dev-1"));
        assert_eq!(d.state(), DetectorState::Idle);
        assert!(d.process_sample(&SeismicSample::at_rest(start())).is_none());
        assert_eq!(d.samples_processed(), 0);
    }

    #[test]
    fn test_quiet_signal_never_triggers() {
        let mut d = detector();
        let wf = SyntheticWaveform::quiet(start());
        let triggers = wf.samples(100.0, 30.0).iter().filter_map(|s| d.process_sample(s)).count();
        assert_eq!(triggers, 0);
        assert_eq!(d.state(), DetectorState::Sampling);
        assert!(d.calibrate().unwrap() < 0.01);
    }

    #[test]
    fn test_burst_triggers_exactly_one_candidate() {
        let mut d = detector();
        d.set_location(Some(GeoPoint::new(40.0, 29.0)));
        let candidates: Vec<_> = quake_waveform()
            .samples(100.0, 25.0)
            .iter()
            .filter_map(|s| d.process_sample(s))
            .collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(d.state(), DetectorState::CandidateDetected);
        assert!(candidates[0].estimated_location.is_some());

        let pending = d.pending().unwrap();
        assert!(pending.peak_amplitude >= candidates[0].peak_amplitude);
        assert!(pending.confidence >= candidates[0].confidence);
    }

    #[test]
    fn test_take_pending_reports_and_returns_to_sampling() {
        let mut d = detector();
        let samples = quake_waveform().samples(100.0, 25.0);
        for s in &samples {
            d.process_sample(s);
        }
        let c = d.take_pending(start()).unwrap();
        assert_eq!(d.state(), DetectorState::Reported);
        assert!(d.take_pending(start()).is_none());
        assert_eq!(d.history().last().unwrap().candidate.id, c.id);

        d.process_sample(&SeismicSample::at_rest(start()));
        assert_eq!(d.state(), DetectorState::Sampling);
    }

    #[test]
    fn test_unreported_candidate_expires() {
        let mut d = detector();
        let samples = quake_waveform().samples(100.0, 25.0);
        for s in &samples {
            d.process_sample(s);
        }
        let detected_at = d.pending().unwrap().timestamp;
        assert!(d.expire(detected_at + Duration::seconds(5)).is_none());
        assert!(d.expire(detected_at + Duration::seconds(31)).is_some());
        assert_eq!(d.state(), DetectorState::Expired);
        assert_eq!(d.history().last().unwrap().outcome, CandidateOutcome::Expired);
    }

    #[test]
    fn test_unavailable_sensor_disables_detector() {
        let mut d = detector();
        d.mark_unavailable(&SensorError::Unavailable);
        assert!(!d.is_available());
        assert_eq!(d.state(), DetectorState::Idle);
        assert!(matches!(d.start(100.0), Err(SensorError::Unavailable)));
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(candidate_confidence(3.0, 3.0, 0.0, 0.0) > 0.0);
        assert!(candidate_confidence(100.0, 3.0, 1.0, 10.0) <= 1.0);
        assert!(candidate_confidence(9.0, 3.0, 0.2, 1.0) > candidate_confidence(3.5, 3.0, 0.03, 0.1));
    }
}
