//! Coarse space/time grid used to bucket candidates.

use chrono::{DateTime, Utc};

use crate::domain::{GeoPoint, KM_PER_DEGREE_LAT};

/// One grid cell in one time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    /// Latitude row
    pub row: i64,
    /// Longitude column within the row
    pub col: i64,
    /// Time window index
    pub window: i64,
}

/// Grid geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceTimeGrid {
    cell_km: f64,
    window_sec: f64,
}

impl SpaceTimeGrid {
    /// Create a grid with square cells of `cell_km` and windows of `window_sec`
    pub fn new(cell_km: f64, window_sec: f64) -> Self {
        Self {
            cell_km: cell_km.max(0.1),
            window_sec: window_sec.max(0.1),
        }
    }

    /// Cell edge length in km
    pub fn cell_km(&self) -> f64 {
        self.cell_km
    }

    /// Window length in seconds
    pub fn window_sec(&self) -> f64 {
        self.window_sec
    }

    /// Cell containing a point at a time
    pub fn cell_of(&self, point: &GeoPoint, at: DateTime<Utc>) -> GridCell {
        let row = self.row_of(point);
        GridCell {
            row,
            col: self.col_of(row, point),
            window: self.window_of(at),
        }
    }

    /// The 3×3 spatial neighbourhood of `point` in its own time window and
    /// the windows either side, home cell first.
    ///
    /// Candidates may arrive out of order, so a late report of an earlier
    /// trigger must still see clusters opened in the following window.
    pub fn neighbourhood(&self, point: &GeoPoint, at: DateTime<Utc>) -> Vec<GridCell> {
        let home = self.cell_of(point, at);
        let mut cells = Vec::with_capacity(27);
        cells.push(home);
        for window in [home.window, home.window - 1, home.window + 1] {
            for dr in -1..=1 {
                let row = home.row + dr;
                let col = self.col_of(row, point);
                for dc in -1..=1 {
                    let cell = GridCell {
                        row,
                        col: col + dc,
                        window,
                    };
                    if cell != home {
                        cells.push(cell);
                    }
                }
            }
        }
        cells
    }

    fn row_of(&self, point: &GeoPoint) -> i64 {
        (point.latitude * KM_PER_DEGREE_LAT / self.cell_km).floor() as i64
    }

    /// Columns are sized with the row's centre latitude so cells stay
    /// roughly square away from the equator.
    fn col_of(&self, row: i64, point: &GeoPoint) -> i64 {
        let centre_lat = ((row as f64 + 0.5) * self.cell_km / KM_PER_DEGREE_LAT).clamp(-89.0, 89.0);
        let km_per_deg_lon = KM_PER_DEGREE_LAT * centre_lat.to_radians().cos();
        (point.longitude * km_per_deg_lon / self.cell_km).floor() as i64
    }

    fn window_of(&self, at: DateTime<Utc>) -> i64 {
        (at.timestamp_millis() as f64 / 1000.0 / self.window_sec).floor() as i64
    }
}
