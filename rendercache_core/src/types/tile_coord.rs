//! Slippy-map tile coordinates and their conversion to geographic coordinates.
//!
//! Tiles are addressed XYZ-style: `y = 0` is the northernmost row. Every tile owns its
//! western and southern edge, so the south-west corner returned by [`point_for_tile`] maps
//! back to the same tile in [`tile_for_point`].
//!
//! ```
//! use rendercache_core::{point_for_tile, tile_for_point};
//!
//! let (lon, lat) = point_for_tile(8803, 5376, 14);
//! assert_eq!(tile_for_point(lat, lon, 14).unwrap(), (8803, 5376));
//! ```

use super::{BBox, MAX_MERCATOR_LAT, geo_to_mercator};
use anyhow::{Result, ensure};
use std::{f64::consts::PI, fmt};

/// Highest zoom level whose tile indices fit into `u32` arithmetic.
pub const MAX_ZOOM: u8 = 30;

/// Values this close to an integer (relative to the number of tiles per axis) are treated as
/// lying on the tile edge. Round trips through `sinh`/`ln` stay around 1e-14 of `n`.
const EDGE_EPSILON: f64 = 1e-12;

fn snap(value: f64, n: f64) -> f64 {
	let rounded = value.round();
	if (value - rounded).abs() < EDGE_EPSILON * n {
		rounded
	} else {
		value
	}
}

pub(super) fn tiles_at(zoom: u8) -> f64 {
	2.0f64.powi(i32::from(zoom))
}

/// Fractional column of a longitude.
pub(super) fn column_of(lon_deg: f64, n: f64) -> f64 {
	snap((lon_deg.clamp(-180.0, 180.0) + 180.0) / 360.0 * n, n)
}

/// Fractional row of a latitude, clamped to the Mercator world.
pub(super) fn row_of(lat_deg: f64, n: f64) -> f64 {
	let lat = lat_deg.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
	snap((1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n, n)
}

pub(super) fn clamp_index(value: f64, n: f64) -> u32 {
	value.clamp(0.0, n - 1.0) as u32
}

/// Tile `(x, y)` containing a point at the given zoom.
///
/// Columns are truncated; a point exactly on a row boundary belongs to the tile north of it.
/// Points outside the Mercator world are clamped to the outermost tiles.
pub fn tile_for_point(lat_deg: f64, lon_deg: f64, zoom: u8) -> Result<(u32, u32)> {
	ensure!(zoom <= MAX_ZOOM, "zoom ({zoom}) must be <= {MAX_ZOOM}");
	ensure!(
		lat_deg.is_finite() && lon_deg.is_finite(),
		"coordinates must be finite: ({lat_deg}, {lon_deg})"
	);
	let n = tiles_at(zoom);
	let x = column_of(lon_deg, n).floor();
	let y = row_of(lat_deg, n).ceil() - 1.0;
	Ok((clamp_index(x, n), clamp_index(y, n)))
}

/// South-west corner `(lon, lat)` of tile `(x, y)` in degrees.
#[must_use]
pub fn point_for_tile(x: u32, y: u32, zoom: u8) -> (f64, f64) {
	(lon_of_column(x, zoom), lat_of_row(y + 1, zoom))
}

fn lon_of_column(x: u32, zoom: u8) -> f64 {
	f64::from(x) / tiles_at(zoom) * 360.0 - 180.0
}

/// Latitude of the northern edge of row `y`.
fn lat_of_row(y: u32, zoom: u8) -> f64 {
	(PI * (1.0 - 2.0 * f64::from(y) / tiles_at(zoom))).sinh().atan().to_degrees()
}

/// A tile address in the XYZ scheme.
#[derive(Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct TileCoord {
	pub level: u8,
	pub x: u32,
	pub y: u32,
}

impl TileCoord {
	/// Creates a coordinate, checking that `x` and `y` exist at `level`.
	pub fn new(level: u8, x: u32, y: u32) -> Result<TileCoord> {
		ensure!(level <= MAX_ZOOM, "level ({level}) must be <= {MAX_ZOOM}");
		let max = 1u32 << level;
		ensure!(x < max, "x ({x}) out of bounds for level {level}");
		ensure!(y < max, "y ({y}) out of bounds for level {level}");
		Ok(TileCoord { level, x, y })
	}

	/// The tile containing a geographic point.
	pub fn from_geo(lon: f64, lat: f64, level: u8) -> Result<TileCoord> {
		let (x, y) = tile_for_point(lat, lon, level)?;
		TileCoord::new(level, x, y)
	}

	/// Row index in the TMS scheme used by MBTiles (`y = 0` is the southernmost row).
	#[must_use]
	pub fn tms_row(&self) -> u32 {
		(1u32 << self.level) - 1 - self.y
	}

	/// Inverse of [`TileCoord::tms_row`].
	pub fn from_tms(level: u8, x: u32, tms_row: u32) -> Result<TileCoord> {
		ensure!(level <= MAX_ZOOM, "level ({level}) must be <= {MAX_ZOOM}");
		let max = 1u32 << level;
		ensure!(tms_row < max, "row ({tms_row}) out of bounds for level {level}");
		TileCoord::new(level, x, max - 1 - tms_row)
	}

	/// Identifier used for the `tile_id` column of tile stores.
	#[must_use]
	pub fn tile_id(&self) -> String {
		format!("{}:{}:{}", self.level, self.x, self.y)
	}

	/// Geographic footprint `[west, south, east, north]`.
	#[must_use]
	pub fn to_geo_bbox(&self) -> BBox {
		let (west, south) = point_for_tile(self.x, self.y, self.level);
		BBox {
			x_min: west,
			y_min: south,
			x_max: lon_of_column(self.x + 1, self.level),
			y_max: lat_of_row(self.y, self.level),
		}
	}

	/// Footprint in Mercator meters, as handed to the renderer.
	#[must_use]
	pub fn to_mercator_bbox(&self) -> BBox {
		let geo = self.to_geo_bbox();
		let (x_min, y_min) = geo_to_mercator(geo.x_min, geo.y_min);
		let (x_max, y_max) = geo_to_mercator(geo.x_max, geo.y_max);
		BBox {
			x_min,
			y_min,
			x_max,
			y_max,
		}
	}
}

impl fmt::Debug for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "TileCoord({}, [{}, {}])", self.level, self.x, self.y)
	}
}

impl fmt::Display for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.level, self.x, self.y)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;
	use rstest::rstest;

	#[test]
	fn round_trip_all_tiles_low_zoom() {
		for zoom in 0..=8u8 {
			let n = 1u32 << zoom;
			for x in 0..n {
				for y in 0..n {
					let (lon, lat) = point_for_tile(x, y, zoom);
					assert_eq!(tile_for_point(lat, lon, zoom).unwrap(), (x, y), "tile {zoom}/{x}/{y}");
				}
			}
		}
	}

	#[test]
	fn round_trip_sampled_high_zoom() {
		for zoom in 9..=20u8 {
			let n = 1u32 << zoom;
			let step = (n / 97).max(1);
			let mut samples: Vec<u32> = (0..n).step_by(step as usize).collect();
			samples.extend([1, n / 2 - 1, n / 2, n - 2, n - 1]);
			for &x in &samples {
				for &y in &samples {
					let (lon, lat) = point_for_tile(x, y, zoom);
					assert_eq!(tile_for_point(lat, lon, zoom).unwrap(), (x, y), "tile {zoom}/{x}/{y}");
				}
			}
		}
	}

	#[rstest]
	#[case(52.520008, 13.404954, 10, (550, 335))]
	#[case(0.0001, 0.0001, 1, (1, 0))]
	#[case(-0.0001, -0.0001, 1, (0, 1))]
	#[case(89.9, -180.0, 3, (0, 0))]
	#[case(-89.9, 180.0, 3, (7, 7))]
	fn known_points(#[case] lat: f64, #[case] lon: f64, #[case] zoom: u8, #[case] expected: (u32, u32)) {
		assert_eq!(tile_for_point(lat, lon, zoom).unwrap(), expected);
	}

	#[test]
	fn invalid_input() {
		assert!(tile_for_point(f64::NAN, 0.0, 3).is_err());
		assert!(tile_for_point(0.0, 0.0, 31).is_err());
		assert!(TileCoord::new(3, 8, 0).is_err());
		assert!(TileCoord::new(3, 0, 8).is_err());
	}

	#[test]
	fn south_west_corner() {
		let (lon, lat) = point_for_tile(0, 0, 1);
		assert_eq!(lon, -180.0);
		assert_relative_eq!(lat, 0.0, epsilon = 1e-12);
		let (_, lat) = point_for_tile(0, 0, 0);
		assert_relative_eq!(lat, -crate::MAX_MERCATOR_LAT, epsilon = 1e-9);
	}

	#[test]
	fn tms_rows() {
		let coord = TileCoord::new(3, 1, 2).unwrap();
		assert_eq!(coord.tms_row(), 5);
		assert_eq!(TileCoord::from_tms(3, 1, 5).unwrap(), coord);
		assert_eq!(coord.tile_id(), "3:1:2");
		assert_eq!(coord.to_string(), "3/1/2");
	}

	#[test]
	fn footprints() {
		let bbox = TileCoord::new(0, 0, 0).unwrap().to_mercator_bbox();
		assert_relative_eq!(bbox.x_min, -20_037_508.342_789_244, max_relative = 1e-9);
		assert_relative_eq!(bbox.y_max, 20_037_508.342_789_244, max_relative = 1e-9);

		let geo = TileCoord::new(2, 1, 1).unwrap().to_geo_bbox();
		assert_relative_eq!(geo.x_min, -90.0);
		assert_relative_eq!(geo.x_max, 0.0);
		assert_relative_eq!(geo.y_min, 0.0, epsilon = 1e-12);
		assert!(geo.y_max > 66.0 && geo.y_max < 67.0);
	}
}
