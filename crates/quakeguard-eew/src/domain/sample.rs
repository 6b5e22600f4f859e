//! Raw accelerometer samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One three-axis accelerometer reading, in g.
///
/// Samples are ephemeral: the detector keeps them only inside its ring
/// buffers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeismicSample {
    /// Sensor timestamp
    pub timestamp: DateTime<Utc>,
    /// X acceleration (g)
    pub ax: f64,
    /// Y acceleration (g)
    pub ay: f64,
    /// Z acceleration (g)
    pub az: f64,
}

impl SeismicSample {
    /// Create a new sample
    pub fn new(timestamp: DateTime<Utc>, ax: f64, ay: f64, az: f64) -> Self {
        Self { timestamp, ax, ay, az }
    }

    /// A device lying flat and at rest
    pub fn at_rest(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, 0.0, 0.0, 1.0)
    }

    /// Euclidean norm of the acceleration vector
    pub fn magnitude(&self) -> f64 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }

    /// Whether every component is a finite number
    pub fn is_finite(&self) -> bool {
        self.ax.is_finite() && self.ay.is_finite() && self.az.is_finite()
    }
}
