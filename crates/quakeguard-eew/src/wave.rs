//! Seismic wave physics: arrival times, warning time and intensity attenuation.
//!
//! Speeds are engineering approximations for crustal propagation, not
//! physical constants, and are configurable through [`WaveSpeeds`].
//!
//! All functions are pure. Invalid inputs (NaN, infinite, negative where a
//! magnitude of distance is expected) return [`WaveError`] instead of a
//! silently wrong number.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GeoPoint, Hypocenter};
use crate::error::WaveError;

/// Conversion factor from g to cm/s².
pub const G_TO_CM_S2: f64 = 980.665;

/// Focal depth assumed when a source does not report one.
pub const DEFAULT_DEPTH_KM: f64 = 10.0;

/// Lowest value on the intensity scale.
pub const MIN_INTENSITY: f64 = 1.0;

/// Highest value on the intensity scale.
pub const MAX_INTENSITY: f64 = 12.0;

/// Propagation speeds in km/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveSpeeds {
    /// Primary (compressional) wave
    pub p_km_s: f64,
    /// Secondary (shear) wave
    pub s_km_s: f64,
    /// Surface (Love/Rayleigh) wave
    pub surface_km_s: f64,
}

impl Default for WaveSpeeds {
    fn default() -> Self {
        Self {
            p_km_s: 6.0,
            s_km_s: 3.5,
            surface_km_s: 2.5,
        }
    }
}

impl WaveSpeeds {
    /// Validate that every speed is finite and strictly positive.
    pub fn validate(&self) -> Result<(), WaveError> {
        WaveError::check_positive("p_km_s", self.p_km_s)?;
        WaveError::check_positive("s_km_s", self.s_km_s)?;
        WaveError::check_positive("surface_km_s", self.surface_km_s)?;
        Ok(())
    }
}

/// Site soil class, from hard rock (A) to liquefiable soft soil (F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SoilClass {
    /// Hard rock
    A,
    /// Rock
    B,
    /// Very dense soil / soft rock (reference class)
    #[default]
    C,
    /// Stiff soil
    D,
    /// Soft clay
    E,
    /// Liquefiable or sensitive soil
    F,
}

impl SoilClass {
    /// Site amplification relative to class C.
    pub fn amplification(&self) -> f64 {
        match self {
            SoilClass::A => 0.8,
            SoilClass::B => 0.9,
            SoilClass::C => 1.0,
            SoilClass::D => 1.3,
            SoilClass::E => 1.6,
            SoilClass::F => 2.0,
        }
    }

    /// Parse a single-letter class, case-insensitive.
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.trim().to_ascii_uppercase().as_str() {
            "A" => Some(SoilClass::A),
            "B" => Some(SoilClass::B),
            "C" => Some(SoilClass::C),
            "D" => Some(SoilClass::D),
            "E" => Some(SoilClass::E),
            "F" => Some(SoilClass::F),
            _ => None,
        }
    }
}

impl std::fmt::Display for SoilClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SoilClass::A => "A",
            SoilClass::B => "B",
            SoilClass::C => "C",
            SoilClass::D => "D",
            SoilClass::E => "E",
            SoilClass::F => "F",
        };
        f.write_str(s)
    }
}

/// Full per-observer result of [`WaveCalculator::arrivals`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveArrivals {
    /// Epicentral (surface) distance from the observer in km
    pub distance_km: f64,
    /// Straight-line distance to the focus in km
    pub hypocentral_km: f64,
    /// P-wave arrival at the observer
    pub p_arrival: DateTime<Utc>,
    /// S-wave arrival at the observer
    pub s_arrival: DateTime<Utc>,
    /// Surface wave arrival at the observer
    pub surface_arrival: DateTime<Utc>,
    /// Seconds until the S-wave arrives, never negative
    pub warning_time_sec: f64,
    /// Expected intensity at the observer (1..12)
    pub intensity: f64,
}

/// Stateless wave-physics calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveCalculator {
    speeds: WaveSpeeds,
}

impl WaveCalculator {
    /// Create a calculator, rejecting non-positive speeds.
    pub fn new(speeds: WaveSpeeds) -> Result<Self, WaveError> {
        speeds.validate()?;
        Ok(Self { speeds })
    }

    /// Configured speeds
    pub fn speeds(&self) -> &WaveSpeeds {
        &self.speeds
    }

    /// Time at which a wave travelling at `speed_km_s` covers `distance_km`.
    pub fn arrival_time(
        &self,
        speed_km_s: f64,
        distance_km: f64,
        origin_time: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, WaveError> {
        let speed = WaveError::check_positive("speed_km_s", speed_km_s)?;
        let distance = WaveError::check_non_negative("distance_km", distance_km)?;
        let travel_us = (distance / speed * 1_000_000.0).round() as i64;
        Ok(origin_time + Duration::microseconds(travel_us))
    }

    /// P-wave arrival for a hypocentral distance.
    pub fn p_arrival(&self, distance_km: f64, origin_time: DateTime<Utc>) -> Result<DateTime<Utc>, WaveError> {
        self.arrival_time(self.speeds.p_km_s, distance_km, origin_time)
    }

    /// S-wave arrival for a hypocentral distance.
    pub fn s_arrival(&self, distance_km: f64, origin_time: DateTime<Utc>) -> Result<DateTime<Utc>, WaveError> {
        self.arrival_time(self.speeds.s_km_s, distance_km, origin_time)
    }

    /// Seconds left before the S-wave arrives, clamped at zero.
    pub fn warning_time_sec(&self, now: DateTime<Utc>, s_arrival: DateTime<Utc>) -> f64 {
        let remaining = (s_arrival - now).num_milliseconds() as f64 / 1000.0;
        remaining.max(0.0)
    }

    /// Straight-line distance to the focus.
    pub fn hypocentral_distance_km(&self, epicentral_km: f64, depth_km: f64) -> Result<f64, WaveError> {
        let d = WaveError::check_non_negative("epicentral_km", epicentral_km)?;
        let h = WaveError::check_non_negative("depth_km", depth_km)?;
        Ok(d.hypot(h))
    }

    /// Expected intensity at `distance_km` from the source.
    ///
    /// Decreases monotonically with distance; distances under 1 km are
    /// treated as 1 km. The soil multiplier is applied before clamping to
    /// the 1..12 scale.
    pub fn attenuated_intensity(&self, magnitude: f64, distance_km: f64, soil: SoilClass) -> Result<f64, WaveError> {
        if !magnitude.is_finite() {
            return Err(WaveError::NotFinite {
                name: "magnitude",
                value: magnitude,
            });
        }
        let distance = WaveError::check_non_negative("distance_km", distance_km)?.max(1.0);
        let base = 1.5 * magnitude - 1.5 * distance.log10() + 1.5;
        Ok((base * soil.amplification()).clamp(MIN_INTENSITY, MAX_INTENSITY))
    }

    /// Arrival times, warning time and intensity for one observer.
    pub fn arrivals(
        &self,
        hypocenter: &Hypocenter,
        origin_time: DateTime<Utc>,
        observer: &GeoPoint,
        magnitude: f64,
        soil: SoilClass,
        now: DateTime<Utc>,
    ) -> Result<WaveArrivals, WaveError> {
        let distance_km = hypocenter.epicenter.distance_km(observer);
        let hypocentral_km = self.hypocentral_distance_km(distance_km, hypocenter.depth_km)?;

        let p_arrival = self.arrival_time(self.speeds.p_km_s, hypocentral_km, origin_time)?;
        let s_arrival = self.arrival_time(self.speeds.s_km_s, hypocentral_km, origin_time)?;
        let surface_arrival = self.arrival_time(self.speeds.surface_km_s, distance_km, origin_time)?;

        Ok(WaveArrivals {
            distance_km,
            hypocentral_km,
            p_arrival,
            s_arrival,
            surface_arrival,
            warning_time_sec: self.warning_time_sec(now, s_arrival),
            intensity: self.attenuated_intensity(magnitude, hypocentral_km, soil)?,
        })
    }
}

/// Instrumental intensity from peak ground acceleration given in g
/// (Wald et al. 1999), clamped to 1..12.
pub fn intensity_from_pga(pga_g: f64) -> Result<f64, WaveError> {
    let pga = WaveError::check_positive("pga_g", pga_g)? * G_TO_CM_S2;
    Ok((3.66 * pga.log10() - 1.66).clamp(MIN_INTENSITY, MAX_INTENSITY))
}

/// Coarse magnitude estimate from peak ground acceleration given in g,
/// clamped to 3..8.
pub fn magnitude_from_pga(pga_g: f64) -> Result<f64, WaveError> {
    let pga = WaveError::check_positive("pga_g", pga_g)? * G_TO_CM_S2;
    Ok((pga.log10() + 2.5).clamp(3.0, 8.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_rejects_non_positive_speed() {
        let speeds = WaveSpeeds {
            s_km_s: 0.0,
            ..Default::default()
        };
        assert!(WaveCalculator::new(speeds).is_err());
    }

    #[test]
    fn test_arrival_time() {
        let calc = WaveCalculator::default();
        let arrival = calc.arrival_time(3.5, 70.0, t0()).unwrap();
        assert_eq!((arrival - t0()).num_milliseconds(), 20_000);
    }

    #[test]
    fn test_arrival_time_fails_fast_on_nan() {
        let calc = WaveCalculator::default();
        assert!(matches!(
            calc.arrival_time(3.5, f64::NAN, t0()),
            Err(WaveError::NotFinite { .. })
        ));
        assert!(matches!(
            calc.arrival_time(3.5, -5.0, t0()),
            Err(WaveError::Negative { .. })
        ));
    }

    #[test]
    fn test_warning_time_never_negative() {
        let calc = WaveCalculator::default();
        let s = t0() + Duration::seconds(10);
        assert_relative_eq!(calc.warning_time_sec(t0(), s), 10.0);
        assert_relative_eq!(calc.warning_time_sec(s + Duration::seconds(3), s), 0.0);
    }

    #[test]
    fn test_intensity_decreases_with_distance() {
        let calc = WaveCalculator::default();
        let near = calc.attenuated_intensity(6.0, 10.0, SoilClass::C).unwrap();
        let far = calc.attenuated_intensity(6.0, 200.0, SoilClass::C).unwrap();
        assert!(near > far);
    }

    #[test]
    fn test_soft_soil_amplifies() {
        let calc = WaveCalculator::default();
        let rock = calc.attenuated_intensity(5.0, 50.0, SoilClass::B).unwrap();
        let soft = calc.attenuated_intensity(5.0, 50.0, SoilClass::D).unwrap();
        let ratio = soft / rock;
        assert!((1.2..=1.5).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn test_intensity_clamped() {
        let calc = WaveCalculator::default();
        assert_relative_eq!(
            calc.attenuated_intensity(9.5, 0.0, SoilClass::F).unwrap(),
            MAX_INTENSITY
        );
        assert_relative_eq!(
            calc.attenuated_intensity(2.0, 5000.0, SoilClass::A).unwrap(),
            MIN_INTENSITY
        );
    }

    #[test]
    fn test_hypocentral_distance() {
        let calc = WaveCalculator::default();
        assert_relative_eq!(calc.hypocentral_distance_km(30.0, 40.0).unwrap(), 50.0);
    }

    #[test]
    fn test_arrivals_ordering() {
        let calc = WaveCalculator::default();
        let hypo = Hypocenter::new(GeoPoint::new(40.0, 29.0), 10.0);
        let observer = GeoPoint::new(41.0, 29.0);
        let a = calc.arrivals(&hypo, t0(), &observer, 6.5, SoilClass::C, t0()).unwrap();
        assert!(a.p_arrival < a.s_arrival);
        assert!(a.s_arrival < a.surface_arrival);
        assert!(a.warning_time_sec > 25.0);
        assert!(a.hypocentral_km > a.distance_km);
    }

    #[test]
    fn test_pga_helpers() {
        // 0.1 g = 98 cm/s², log10 ≈ 1.99
        assert_relative_eq!(magnitude_from_pga(0.1).unwrap(), 4.49, epsilon = 0.01);
        assert!(intensity_from_pga(0.1).unwrap() > 5.0);
        assert_relative_eq!(magnitude_from_pga(1e-6).unwrap(), 3.0);
        assert!(magnitude_from_pga(0.0).is_err());
    }
}
