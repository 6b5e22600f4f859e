//! Geographic coordinate value objects.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// Mean kilometres per degree of latitude.
pub const KM_PER_DEGREE_LAT: f64 = 111.32;

/// A WGS84 latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, [-90, 90]
    pub latitude: f64,
    /// Longitude in degrees, [-180, 180]
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check that both components are finite and in range
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Convert to a `geo` point (x = longitude, y = latitude)
    pub fn to_point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great-circle distance to another point in kilometres
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        self.to_point().haversine_distance(&other.to_point()) / 1000.0
    }

    /// Point displaced by the given north/east offsets (small-distance approximation)
    pub fn offset_km(&self, north_km: f64, east_km: f64) -> GeoPoint {
        let lat = self.latitude + north_km / KM_PER_DEGREE_LAT;
        let cos_lat = self.latitude.to_radians().cos().max(1e-6);
        let lon = self.longitude + east_km / (KM_PER_DEGREE_LAT * cos_lat);
        GeoPoint::new(lat, lon)
    }

    /// Arithmetic mean of a set of points.
    ///
    /// Adequate for clusters spanning tens of kilometres away from the
    /// antimeridian.
    pub fn centroid<'a, I>(points: I) -> Option<GeoPoint>
    where
        I: IntoIterator<Item = &'a GeoPoint>,
    {
        let mut count = 0usize;
        let (mut lat, mut lon) = (0.0, 0.0);
        for p in points {
            lat += p.latitude;
            lon += p.longitude;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(GeoPoint::new(lat / count as f64, lon / count as f64))
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        p.to_point()
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Earthquake focus: epicenter plus depth below the surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hypocenter {
    /// Surface projection of the focus
    pub epicenter: GeoPoint,
    /// Focal depth in km
    pub depth_km: f64,
}

impl Hypocenter {
    /// Create a new hypocenter
    pub fn new(epicenter: GeoPoint, depth_km: f64) -> Self {
        Self { epicenter, depth_km }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = GeoPoint::new(40.0, 29.0);
        let b = GeoPoint::new(41.0, 29.0);
        assert_relative_eq!(a.distance_km(&b), 111.2, epsilon = 0.5);
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_self() {
        let a = GeoPoint::new(40.76, 29.92);
        let b = GeoPoint::new(41.01, 28.97);
        assert_relative_eq!(a.distance_km(&b), b.distance_km(&a), epsilon = 1e-9);
        assert_relative_eq!(a.distance_km(&a), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_offset_round_trip_distance() {
        let origin = GeoPoint::new(38.0, 27.0);
        let moved = origin.offset_km(6.0, 8.0);
        assert_relative_eq!(origin.distance_km(&moved), 10.0, epsilon = 0.1);
    }

    #[test]
    fn test_validity() {
        assert!(GeoPoint::new(0.0, 0.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_centroid() {
        let pts = [GeoPoint::new(0.0, 0.0), GeoPoint::new(2.0, 4.0)];
        let c = GeoPoint::centroid(pts.iter()).unwrap();
        assert_relative_eq!(c.latitude, 1.0);
        assert_relative_eq!(c.longitude, 2.0);
        assert!(GeoPoint::centroid(std::iter::empty()).is_none());
    }
}
