//! High-pass filtering and the STA/LTA trigger.
//!
//! Both run in constant time per sample: the filter keeps one previous input
//! and output per axis, and the trigger keeps running sums over two ring
//! buffers.

use std::collections::VecDeque;

use crate::domain::SeismicSample;

/// First-order IIR high-pass filter applied per axis.
///
/// Removes gravity and slow orientation drift so that only transient
/// acceleration contributes to signal energy.
#[derive(Debug, Clone)]
pub struct HighPassFilter {
    alpha: f64,
    prev_input: Option<[f64; 3]>,
    prev_output: [f64; 3],
}

impl HighPassFilter {
    /// Create a filter for the given cutoff and sampling rate.
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate_hz;
        Self {
            alpha: rc / (rc + dt),
            prev_input: None,
            prev_output: [0.0; 3],
        }
    }

    /// Filter one sample, returning the high-passed (x, y, z) acceleration.
    ///
    /// The first sample primes the filter and yields zero, so a device at
    /// rest does not see gravity as a step.
    pub fn apply(&mut self, sample: &SeismicSample) -> [f64; 3] {
        let input = [sample.ax, sample.ay, sample.az];
        let Some(prev) = self.prev_input else {
            self.prev_input = Some(input);
            return [0.0; 3];
        };

        let mut out = [0.0; 3];
        for axis in 0..3 {
            out[axis] = self.alpha * (self.prev_output[axis] + input[axis] - prev[axis]);
        }
        self.prev_input = Some(input);
        self.prev_output = out;
        out
    }

    /// Forget filter history
    pub fn reset(&mut self) {
        self.prev_input = None;
        self.prev_output = [0.0; 3];
    }
}

/// Running-mean window over a ring buffer.
#[derive(Debug, Clone)]
struct RunningWindow {
    buf: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    pushes_since_resum: usize,
}

impl RunningWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            pushes_since_resum: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.buf.len() == self.capacity {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old;
            }
        }
        self.buf.push_back(value);
        self.sum += value;

        // Re-sum once per window length to bound floating-point drift.
        self.pushes_since_resum += 1;
        if self.pushes_since_resum >= self.capacity {
            self.sum = self.buf.iter().sum();
            self.pushes_since_resum = 0;
        }
    }

    fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            0.0
        } else {
            (self.sum / self.buf.len() as f64).max(0.0)
        }
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.sum = 0.0;
        self.pushes_since_resum = 0;
    }
}

/// Result of feeding one energy value to the trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerReading {
    /// Current STA/LTA ratio (0 until the LTA window has filled)
    pub ratio: f64,
    /// Root-mean-square acceleration over the STA window (g)
    pub sta_rms: f64,
    /// Ratio, RMS floor and debounce all satisfied
    pub triggered: bool,
}

/// Energy floor added to the LTA so a perfectly still sensor cannot divide by zero.
const LTA_EPSILON: f64 = 1e-12;

/// Classic STA/LTA trigger over signal energy.
#[derive(Debug, Clone)]
pub struct StaLtaTrigger {
    sta: RunningWindow,
    lta: RunningWindow,
    threshold: f64,
    min_sta_rms: f64,
    debounce: usize,
    above_count: usize,
}

impl StaLtaTrigger {
    /// Create a trigger with window lengths in samples.
    pub fn new(sta_len: usize, lta_len: usize, threshold: f64, min_sta_rms: f64, debounce: usize) -> Self {
        Self {
            sta: RunningWindow::new(sta_len),
            lta: RunningWindow::new(lta_len),
            threshold,
            min_sta_rms,
            debounce: debounce.max(1),
            above_count: 0,
        }
    }

    /// Feed one energy value (squared acceleration).
    pub fn push(&mut self, energy: f64) -> TriggerReading {
        self.sta.push(energy);
        self.lta.push(energy);

        let sta_rms = self.sta.mean().sqrt();
        if !self.lta.is_full() {
            return TriggerReading {
                ratio: 0.0,
                sta_rms,
                triggered: false,
            };
        }

        let ratio = self.sta.mean() / (self.lta.mean() + LTA_EPSILON);
        // A sample only counts toward debounce if it is itself above the
        // background; a lone spike keeps the STA high but not the samples after it.
        let elevated = energy > self.lta.mean();
        if ratio >= self.threshold && sta_rms >= self.min_sta_rms && elevated {
            self.above_count += 1;
        } else {
            self.above_count = 0;
        }

        TriggerReading {
            ratio,
            sta_rms,
            triggered: self.above_count >= self.debounce,
        }
    }

    /// Consecutive samples above threshold
    pub fn persistence(&self) -> usize {
        self.above_count
    }

    /// Trigger threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Change the trigger threshold without losing window state
    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    /// Whether the LTA window has filled
    pub fn is_warmed_up(&self) -> bool {
        self.lta.is_full()
    }

    /// Background noise level: RMS acceleration over the LTA window
    pub fn noise_rms(&self) -> f64 {
        self.lta.mean().sqrt()
    }

    /// Clear both windows
    pub fn reset(&mut self) {
        self.sta.clear();
        self.lta.clear();
        self.above_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_high_pass_removes_gravity() {
        let mut hp = HighPassFilter::new(0.5, 100.0);
        let now = Utc::now();
        let mut last = [1.0; 3];
        for _ in 0..500 {
            last = hp.apply(&SeismicSample::at_rest(now));
        }
        assert!(last.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_high_pass_passes_step_change() {
        let mut hp = HighPassFilter::new(0.5, 100.0);
        let now = Utc::now();
        hp.apply(&SeismicSample::at_rest(now));
        let out = hp.apply(&SeismicSample::new(now, 0.2, 0.0, 1.0));
        assert!(out[0] > 0.15);
    }

    #[test]
    fn test_no_trigger_before_warm_up() {
        let mut trig = StaLtaTrigger::new(5, 50, 3.0, 0.0, 1);
        for _ in 0..49 {
            assert!(!trig.push(1.0).triggered);
        }
        assert!(!trig.is_warmed_up());
    }

    #[test]
    fn test_triggers_on_energy_burst() {
        let mut trig = StaLtaTrigger::new(5, 50, 3.0, 0.0, 2);
        for _ in 0..100 {
            trig.push(1e-4);
        }
        let mut fired = false;
        for _ in 0..5 {
            fired |= trig.push(0.05).triggered;
        }
        assert!(fired);
    }

    #[test]
    fn test_single_spike_is_debounced() {
        let mut trig = StaLtaTrigger::new(5, 50, 3.0, 0.0, 3);
        for _ in 0..100 {
            trig.push(1e-4);
        }
        let spike = trig.push(1.0);
        assert!(spike.ratio > 3.0);
        assert!(!spike.triggered);
        for _ in 0..10 {
            assert!(!trig.push(1e-4).triggered);
        }
    }

    #[test]
    fn test_rms_floor_blocks_tiny_disturbances() {
        let mut trig = StaLtaTrigger::new(5, 50, 3.0, 0.02, 1);
        for _ in 0..100 {
            trig.push(1e-10);
        }
        // 0.001 g is far above the LTA but below the 0.02 g floor
        for _ in 0..5 {
            assert!(!trig.push(1e-6).triggered);
        }
    }
}
