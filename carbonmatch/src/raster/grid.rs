//! Raster grid geometry.
//!
//! All covariate layers share one geographic (EPSG:4326) grid. Cells are
//! addressed either by (row, col) or by a flat cell id `row * width + col`,
//! which is the stable pixel identifier used across all artifacts.

use serde::{Deserialize, Serialize};

/// WGS84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Georeferencing for one raster grid.
///
/// `dy` is negative: row 0 is the northernmost row, matching the GeoTIFF
/// convention of an upper-left origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridInfo {
    pub width: u32,
    pub height: u32,
    /// Longitude of the grid's upper-left corner.
    pub origin_x: f64,
    /// Latitude of the grid's upper-left corner.
    pub origin_y: f64,
    /// Cell width in degrees (positive).
    pub dx: f64,
    /// Cell height in degrees (negative).
    pub dy: f64,
    /// Value representing missing data, if the layer declares one.
    pub nodata: Option<f64>,
}

/// A rectangular pixel region, half-open on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub col0: u32,
    pub row0: u32,
    pub cols: u32,
    pub rows: u32,
}

impl Window {
    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    /// Iterate (row, col) pairs in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (r0, c0, nr, nc) = (self.row0, self.col0, self.rows, self.cols);
        (r0..r0 + nr).flat_map(move |r| (c0..c0 + nc).map(move |c| (r, c)))
    }
}

impl GridInfo {
    /// Flat cell id for (row, col).
    pub fn cell_id(&self, row: u32, col: u32) -> u64 {
        row as u64 * self.width as u64 + col as u64
    }

    /// Longitude/latitude of a cell's center.
    pub fn cell_center(&self, row: u32, col: u32) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.dx,
            self.origin_y + (row as f64 + 0.5) * self.dy,
        )
    }

    /// (west, south, east, north) bounds of a cell.
    pub fn cell_bounds(&self, row: u32, col: u32) -> (f64, f64, f64, f64) {
        let west = self.origin_x + col as f64 * self.dx;
        let north = self.origin_y + row as f64 * self.dy;
        (west, north + self.dy, west + self.dx, north)
    }

    /// Pixel window covering a lon/lat bounding box, clamped to the grid.
    /// Returns an empty window when the box misses the grid entirely.
    pub fn window_for_bounds(&self, west: f64, south: f64, east: f64, north: f64) -> Window {
        let col_lo = ((west - self.origin_x) / self.dx).floor().max(0.0) as i64;
        let col_hi = ((east - self.origin_x) / self.dx).ceil() as i64;
        // dy < 0: north edge maps to the smaller row index
        let row_lo = ((north - self.origin_y) / self.dy).floor().max(0.0) as i64;
        let row_hi = ((south - self.origin_y) / self.dy).ceil() as i64;

        let col0 = col_lo.min(self.width as i64) as u32;
        let row0 = row_lo.min(self.height as i64) as u32;
        let col1 = col_hi.clamp(col0 as i64, self.width as i64) as u32;
        let row1 = row_hi.clamp(row0 as i64, self.height as i64) as u32;

        Window {
            col0,
            row0,
            cols: col1 - col0,
            rows: row1 - row0,
        }
    }

    /// True ellipsoidal area of one cell in hectares.
    ///
    /// Cell area varies meaningfully with latitude at global covariate
    /// resolutions, so a flat approximation is not acceptable. This uses
    /// the closed-form area of a WGS84 latitude zone slice.
    pub fn cell_area_ha(&self, row: u32) -> f64 {
        let (_, south, _, north) = self.cell_bounds(row, 0);
        ellipsoidal_cell_area_ha(south, north, self.dx)
    }

    /// Whether two grids are the same shape and georeferencing, ignoring
    /// nodata (which legitimately differs per layer).
    pub fn same_grid(&self, other: &GridInfo) -> bool {
        const EPS: f64 = 1e-9;
        self.width == other.width
            && self.height == other.height
            && (self.origin_x - other.origin_x).abs() < EPS
            && (self.origin_y - other.origin_y).abs() < EPS
            && (self.dx - other.dx).abs() < EPS
            && (self.dy - other.dy).abs() < EPS
    }
}

/// Area in hectares of the lat/lon rectangle between `south`..`north`
/// latitude (degrees) spanning `dlon_deg` degrees of longitude, on the
/// WGS84 ellipsoid.
pub fn ellipsoidal_cell_area_ha(south: f64, north: f64, dlon_deg: f64) -> f64 {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let e = e2.sqrt();
    let b = WGS84_A * (1.0 - WGS84_F);

    // Integral of the meridional area element between two latitudes.
    let zone = |phi_deg: f64| -> f64 {
        let s = phi_deg.to_radians().sin();
        s / (1.0 - e2 * s * s) + ((1.0 + e * s) / (1.0 - e * s)).ln() / (2.0 * e)
    };

    let dlon = dlon_deg.abs().to_radians();
    let area_m2 = (b * b / 2.0) * dlon * (zone(north) - zone(south)).abs();
    area_m2 / 10_000.0
}
