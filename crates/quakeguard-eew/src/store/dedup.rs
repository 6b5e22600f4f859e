//! Same-event matching and the coarse write buckets derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::GeoPoint;

/// Earth radius used to project coordinates for bucketing.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Rule deciding whether two observations describe the same physical quake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupRule {
    /// Maximum origin-time difference between feed reports (Tw)
    pub time_window_sec: f64,
    /// Epicenter distance allowed for small quakes (Dw base)
    pub base_distance_km: f64,
    /// Extra distance per magnitude unit above M5, since location
    /// uncertainty grows with rupture size
    pub distance_per_magnitude_km: f64,
    /// Upper bound on the distance window
    pub max_distance_km: f64,
    /// Extra origin-time slack when one side is a crowd estimate
    pub crowd_time_slack_sec: f64,
}

impl Default for DedupRule {
    fn default() -> Self {
        Self {
            time_window_sec: 5.0,
            base_distance_km: 30.0,
            distance_per_magnitude_km: 10.0,
            max_distance_km: 100.0,
            crowd_time_slack_sec: 10.0,
        }
    }
}

/// One side of a same-event comparison
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Origin time
    pub origin_time: DateTime<Utc>,
    /// Epicenter
    pub epicenter: GeoPoint,
    /// Magnitude
    pub magnitude: f64,
    /// Origin time is a crowd estimate
    pub crowd_estimate: bool,
}

impl DedupRule {
    /// Distance window (Dw) for the larger of two magnitudes
    pub fn distance_window_km(&self, magnitude: f64) -> f64 {
        let extra = (magnitude - 5.0).max(0.0) * self.distance_per_magnitude_km;
        (self.base_distance_km + extra).min(self.max_distance_km)
    }

    /// Time window (Tw), widened when either side is a crowd estimate
    pub fn time_window_for(&self, a: &Observation, b: &Observation) -> f64 {
        if a.crowd_estimate || b.crowd_estimate {
            self.time_window_sec + self.crowd_time_slack_sec
        } else {
            self.time_window_sec
        }
    }

    /// Widest time window the rule can produce
    pub fn max_time_window_sec(&self) -> f64 {
        self.time_window_sec + self.crowd_time_slack_sec
    }

    /// Whether `a` and `b` are the same physical event.
    pub fn matches(&self, a: &Observation, b: &Observation) -> bool {
        let dt = (a.origin_time - b.origin_time).num_milliseconds().abs() as f64 / 1000.0;
        if dt >= self.time_window_for(a, b) {
            return false;
        }
        let dw = self.distance_window_km(a.magnitude.max(b.magnitude));
        a.epicenter.distance_km(&b.epicenter) < dw
    }

    /// Ranking score among several matches: lower is closer
    pub fn closeness(&self, a: &Observation, b: &Observation) -> f64 {
        let dt = (a.origin_time - b.origin_time).num_milliseconds().abs() as f64 / 1000.0;
        a.epicenter.distance_km(&b.epicenter) / self.max_distance_km.max(1.0) + dt / self.max_time_window_sec().max(1.0)
    }

    /// Write-lock bucket keys that any matching observation must share
    /// with `obs`.
    ///
    /// Buckets are twice the widest match window in every axis, so a point
    /// in the lower half of a bucket can only match points in this bucket
    /// or the one below, and likewise for the upper half. Any two matching
    /// observations therefore produce overlapping key sets.
    pub fn lock_keys(&self, obs: &Observation) -> Vec<BucketKey> {
        let time_size = 2.0 * self.max_time_window_sec().max(0.001);
        let space_size = 2.0 * self.max_distance_km.max(0.001);
        let t = obs.origin_time.timestamp_millis() as f64 / 1000.0;
        let [x, y, z] = to_cartesian_km(&obs.epicenter);

        let ts = near_pair(t, time_size);
        let xs = near_pair(x, space_size);
        let ys = near_pair(y, space_size);
        let zs = near_pair(z, space_size);

        let mut keys = Vec::with_capacity(16);
        for &t in &ts {
            for &x in &xs {
                for &y in &ys {
                    for &z in &zs {
                        keys.push(BucketKey { t, x, y, z });
                    }
                }
            }
        }
        keys
    }
}

/// Coarse (time, location) bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    t: i64,
    x: i64,
    y: i64,
    z: i64,
}

fn near_pair(value: f64, size: f64) -> [i64; 2] {
    let scaled = value / size;
    let idx = scaled.floor();
    if scaled - idx < 0.5 {
        [idx as i64 - 1, idx as i64]
    } else {
        [idx as i64, idx as i64 + 1]
    }
}

/// Chord distance never exceeds great-circle distance, so per-axis
/// differences are bounded by the surface distance.
fn to_cartesian_km(p: &GeoPoint) -> [f64; 3] {
    let lat = p.latitude.to_radians();
    let lon = p.longitude.to_radians();
    [
        EARTH_RADIUS_KM * lat.cos() * lon.cos(),
        EARTH_RADIUS_KM * lat.cos() * lon.sin(),
        EARTH_RADIUS_KM * lat.sin(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn obs(t_offset_ms: i64, lat: f64, lon: f64, mag: f64) -> Observation {
        Observation {
            origin_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(t_offset_ms),
            epicenter: GeoPoint::new(lat, lon),
            magnitude: mag,
            crowd_estimate: false,
        }
    }

    #[test]
    fn test_match_within_windows() {
        let rule = DedupRule::default();
        let a = obs(0, 38.0, 27.0, 6.1);
        let b = obs(2000, 38.0, 27.0, 6.0);
        let b = Observation {
            epicenter: a.epicenter.offset_km(8.0, 0.0),
            ..b
        };
        assert!(rule.matches(&a, &b));
    }

    #[test]
    fn test_no_match_outside_time_window() {
        let rule = DedupRule::default();
        assert!(!rule.matches(&obs(0, 38.0, 27.0, 5.0), &obs(6000, 38.0, 27.0, 5.0)));
    }

    #[test]
    fn test_crowd_estimate_widens_time_window() {
        let rule = DedupRule::default();
        let a = obs(0, 38.0, 27.0, 5.0);
        let b = Observation {
            crowd_estimate: true,
            ..obs(8000, 38.0, 27.0, 5.0)
        };
        assert!(rule.matches(&a, &b));
    }

    #[test]
    fn test_distance_window_scales_with_magnitude() {
        let rule = DedupRule::default();
        assert_eq!(rule.distance_window_km(4.0), 30.0);
        assert_eq!(rule.distance_window_km(7.0), 50.0);
        assert_eq!(rule.distance_window_km(15.0), 100.0);
        let a = obs(0, 38.0, 27.0, 7.0);
        let b = Observation {
            epicenter: a.epicenter.offset_km(40.0, 0.0),
            ..obs(0, 0.0, 0.0, 7.0)
        };
        assert!(rule.matches(&a, &b));
    }

    proptest! {
        #[test]
        fn prop_matching_observations_share_a_lock_key(
            lat in -70.0f64..70.0,
            lon in -179.0f64..179.0,
            north in -40.0f64..40.0,
            east in -40.0f64..40.0,
            dt_ms in -4999i64..4999,
            base_ms in 0i64..100_000_000,
        ) {
            let rule = DedupRule::default();
            let a = obs(base_ms, lat, lon, 5.0);
            let b = Observation {
                epicenter: a.epicenter.offset_km(north, east),
                ..obs(base_ms + dt_ms, 0.0, 0.0, 5.0)
            };
            prop_assume!(rule.matches(&a, &b));
            let ka = rule.lock_keys(&a);
            let kb = rule.lock_keys(&b);
            prop_assert!(ka.iter().any(|k| kb.contains(k)));
        }
    }
}
