//! Rectangular ranges of tiles at a single zoom level.

use super::{
	BBox, MAX_ZOOM, TileCoord,
	tile_coord::{clamp_index, column_of, row_of, tiles_at},
};
use anyhow::{Result, ensure};
use std::fmt;

/// An inclusive range of tile columns and rows (XYZ rows) at one zoom level.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileBBox {
	pub level: u8,
	pub x_min: u32,
	pub y_min: u32,
	pub x_max: u32,
	pub y_max: u32,
}

impl TileBBox {
	pub fn new(level: u8, x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Result<TileBBox> {
		ensure!(level <= MAX_ZOOM, "level ({level}) must be <= {MAX_ZOOM}");
		let max = (1u32 << level) - 1;
		ensure!(x_min <= x_max && x_max <= max, "invalid column range {x_min}..={x_max} at level {level}");
		ensure!(y_min <= y_max && y_max <= max, "invalid row range {y_min}..={y_max} at level {level}");
		Ok(TileBBox {
			level,
			x_min,
			y_min,
			x_max,
			y_max,
		})
	}

	/// All tiles at `level` whose footprint intersects the geographic `bbox`.
	///
	/// Tiles that only touch the box along an edge are excluded, unless the box itself is
	/// degenerate (a line or a point), in which case the tile containing it is included.
	pub fn from_geo(level: u8, bbox: &BBox) -> Result<TileBBox> {
		ensure!(level <= MAX_ZOOM, "level ({level}) must be <= {MAX_ZOOM}");
		let n = tiles_at(level);

		let x_min = clamp_index(column_of(bbox.x_min, n).floor(), n);
		let x_max = clamp_index(column_of(bbox.x_max, n).ceil() - 1.0, n).max(x_min);
		let y_min = clamp_index(row_of(bbox.y_max, n).floor(), n);
		let y_max = clamp_index(row_of(bbox.y_min, n).ceil() - 1.0, n).max(y_min);

		TileBBox::new(level, x_min, y_min, x_max, y_max)
	}

	/// Number of tiles in the range.
	#[must_use]
	pub fn count_tiles(&self) -> u64 {
		u64::from(self.x_max - self.x_min + 1) * u64::from(self.y_max - self.y_min + 1)
	}

	/// Row range in TMS order, `(min, max)`.
	#[must_use]
	pub fn tms_rows(&self) -> (u32, u32) {
		let max = (1u32 << self.level) - 1;
		(max - self.y_max, max - self.y_min)
	}

	#[must_use]
	pub fn contains(&self, coord: &TileCoord) -> bool {
		coord.level == self.level
			&& (self.x_min..=self.x_max).contains(&coord.x)
			&& (self.y_min..=self.y_max).contains(&coord.y)
	}

	/// Iterates row by row over all coordinates of the range.
	pub fn iter_coords(&self) -> impl Iterator<Item = TileCoord> + use<> {
		let TileBBox {
			level,
			x_min,
			y_min,
			x_max,
			y_max,
		} = *self;
		(y_min..=y_max).flat_map(move |y| (x_min..=x_max).map(move |x| TileCoord { level, x, y }))
	}
}

impl fmt::Debug for TileBBox {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}: [{},{},{},{}] ({}x{})",
			self.level,
			self.x_min,
			self.y_min,
			self.x_max,
			self.y_max,
			self.x_max - self.x_min + 1,
			self.y_max - self.y_min + 1
		)
	}
}
