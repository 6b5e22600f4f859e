//! Motion sensor capability and a synthetic implementation.
//!
//! The core depends only on "subscribe at a rate, receive samples on a
//! bounded channel, unsubscribe". Producers use `try_send` so a slow
//! consumer drops samples instead of stalling the sensor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::SeismicSample;
use crate::error::SensorError;

/// Motion sensor capability.
#[async_trait]
pub trait SensorPort: Send + Sync {
    /// Sensor name for logging
    fn name(&self) -> &str;

    /// Whether an accelerometer is present and permitted
    fn is_available(&self) -> bool;

    /// Start delivering samples at `rate_hz` into `tx`.
    async fn subscribe(
        &self,
        rate_hz: f64,
        tx: mpsc::Sender<SeismicSample>,
    ) -> Result<SensorSubscription, SensorError>;
}

/// Handle to a running sensor subscription.
///
/// Dropping the handle stops the producer; [`SensorSubscription::unsubscribe`]
/// additionally waits for it to exit.
pub struct SensorSubscription {
    rate_hz: f64,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl SensorSubscription {
    /// Wrap a producer task
    pub fn new(rate_hz: f64, stop_tx: watch::Sender<bool>, handle: JoinHandle<()>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            rate_hz,
            stop_tx,
            handle: Some(handle),
            dropped,
        }
    }

    /// Sampling rate of this subscription
    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    /// Samples dropped because the consumer channel was full
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, for observers that outlive this handle
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    /// Stop the producer and wait until it has exited
    pub async fn unsubscribe(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// A shaking episode in a synthetic waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShakingBurst {
    /// Seconds after the waveform start
    pub start_sec: f64,
    /// Burst length in seconds
    pub duration_sec: f64,
    /// Peak acceleration in g
    pub amplitude_g: f64,
    /// Dominant frequency in Hz
    pub frequency_hz: f64,
}

/// Deterministic accelerometer signal: gravity, low background noise and
/// optional shaking bursts.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticWaveform {
    /// Wall-clock time of `t = 0`
    pub start: DateTime<Utc>,
    /// Background noise amplitude in g
    pub noise_g: f64,
    /// Shaking episodes
    pub bursts: Vec<ShakingBurst>,
}

impl SyntheticWaveform {
    /// Quiet device at rest
    pub fn quiet(start: DateTime<Utc>) -> Self {
        Self {
            start,
            noise_g: 0.002,
            bursts: Vec::new(),
        }
    }

    /// Add a shaking burst
    pub fn with_burst(mut self, burst: ShakingBurst) -> Self {
        self.bursts.push(burst);
        self
    }

    /// Sample the waveform at `t` seconds
    pub fn sample_at(&self, t: f64) -> SeismicSample {
        // Incommensurate sinusoids stand in for sensor noise.
        let noise = |phase: f64| {
            self.noise_g * ((17.3 * t + phase).sin() * 0.6 + (41.9 * t + 2.0 * phase).sin() * 0.4)
        };
        let mut shake = 0.0;
        for burst in &self.bursts {
            let local = t - burst.start_sec;
            if (0.0..burst.duration_sec).contains(&local) {
                shake += burst.amplitude_g * (2.0 * std::f64::consts::PI * burst.frequency_hz * local).sin();
            }
        }

        let timestamp = self.start + Duration::microseconds((t * 1_000_000.0) as i64);
        SeismicSample::new(timestamp, noise(0.0) + shake, noise(1.3) + 0.5 * shake, 1.0 + noise(2.7))
    }

    /// All samples for `duration_sec` at `rate_hz`
    pub fn samples(&self, rate_hz: f64, duration_sec: f64) -> Vec<SeismicSample> {
        let count = (rate_hz * duration_sec).round() as usize;
        (0..count).map(|n| self.sample_at(n as f64 / rate_hz)).collect()
    }
}

/// Sensor that replays a [`SyntheticWaveform`] in real (tokio) time.
///
/// The waveform clock runs across subscriptions: a resubscribe continues
/// from the last emitted sample rather than restarting at `t = 0`.
pub struct SimulatedSensor {
    name: String,
    available: bool,
    waveform: SyntheticWaveform,
    elapsed_us: Arc<AtomicU64>,
}

impl SimulatedSensor {
    /// Sensor producing the given waveform
    pub fn new(name: impl Into<String>, waveform: SyntheticWaveform) -> Self {
        Self {
            name: name.into(),
            available: true,
            waveform,
            elapsed_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sensor that reports no accelerometer
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: false,
            waveform: SyntheticWaveform::quiet(Utc::now()),
            elapsed_us: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl SensorPort for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn subscribe(
        &self,
        rate_hz: f64,
        tx: mpsc::Sender<SeismicSample>,
    ) -> Result<SensorSubscription, SensorError> {
        if !self.available {
            return Err(SensorError::Unavailable);
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SensorError::InvalidRate { rate_hz });
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_counter = dropped.clone();
        let waveform = self.waveform.clone();
        let elapsed_us = self.elapsed_us.clone();
        let name = self.name.clone();
        let period = std::time::Duration::from_secs_f64(1.0 / rate_hz);
        let step_us = period.as_micros().max(1) as u64;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let t_us = elapsed_us.fetch_add(step_us, Ordering::Relaxed);
                        let sample = waveform.sample_at(t_us as f64 / 1_000_000.0);
                        n += 1;
                        match tx.try_send(sample) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                let total = dropped_counter.fetch_add(1, Ordering::Relaxed) + 1;
                                if total.is_power_of_two() {
                                    tracing::warn!(sensor = %name, dropped = total, "Sample channel full, dropping samples");
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            tracing::debug!(sensor = %name, samples = n, "Sensor producer stopped");
        });

        tracing::info!(sensor = %self.name, rate_hz, "Sensor subscribed");
        Ok(SensorSubscription::new(rate_hz, stop_tx, handle, dropped))
    }
}
