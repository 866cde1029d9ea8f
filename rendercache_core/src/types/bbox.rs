use super::{MAX_MERCATOR_LAT, geo_to_mercator, mercator_to_geo};
use anyhow::{Result, ensure};
use std::fmt::Debug;

/// An axis-aligned bounding box `[x_min, y_min, x_max, y_max]`.
///
/// The same type carries geographic boxes (degrees, `west, south, east, north`) and projected
/// boxes (Mercator meters). Conversions between both are explicit: [`BBox::to_mercator`] and
/// [`BBox::mercator_to_geo`].
///
/// # Examples
/// ```
/// use rendercache_core::BBox;
///
/// let a = BBox::new(-10.0, -5.0, 10.0, 5.0).unwrap();
/// let b = BBox::new(8.0, 4.0, 12.0, 6.0).unwrap();
/// assert!(a.intersects(&b));
/// assert_eq!(a.as_array(), [-10.0, -5.0, 10.0, 5.0]);
/// ```
#[derive(Clone, Copy, PartialEq)]
pub struct BBox {
	pub x_min: f64,
	pub y_min: f64,
	pub x_max: f64,
	pub y_max: f64,
}

impl BBox {
	/// Creates a box, checking that all values are finite and `min <= max`.
	pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<BBox> {
		BBox {
			x_min,
			y_min,
			x_max,
			y_max,
		}
		.checked()
	}

	/// Creates a geographic box and additionally checks the longitude/latitude ranges.
	pub fn new_geo(west: f64, south: f64, east: f64, north: f64) -> Result<BBox> {
		let bbox = BBox::new(west, south, east, north)?;
		ensure!(west >= -180.0, "west ({west}) must be >= -180");
		ensure!(east <= 180.0, "east ({east}) must be <= 180");
		ensure!(south >= -90.0, "south ({south}) must be >= -90");
		ensure!(north <= 90.0, "north ({north}) must be <= 90");
		Ok(bbox)
	}

	fn checked(self) -> Result<Self> {
		ensure!(
			self.as_array().iter().all(|v| v.is_finite()),
			"bbox values must be finite: {self:?}"
		);
		ensure!(
			self.x_min <= self.x_max,
			"x_min ({}) must be <= x_max ({})",
			self.x_min,
			self.x_max
		);
		ensure!(
			self.y_min <= self.y_max,
			"y_min ({}) must be <= y_max ({})",
			self.y_min,
			self.y_max
		);
		Ok(self)
	}

	#[must_use]
	pub fn as_array(&self) -> [f64; 4] {
		[self.x_min, self.y_min, self.x_max, self.y_max]
	}

	/// True if both boxes share at least one point (touching edges count).
	#[must_use]
	pub fn intersects(&self, other: &BBox) -> bool {
		self.x_min <= other.x_max && other.x_min <= self.x_max && self.y_min <= other.y_max && other.y_min <= self.y_max
	}

	/// Projects a geographic box to Mercator meters, clamping latitudes to the Mercator world.
	#[must_use]
	pub fn to_mercator(&self) -> BBox {
		let (x_min, y_min) = geo_to_mercator(self.x_min, self.y_min);
		let (x_max, y_max) = geo_to_mercator(self.x_max, self.y_max);
		BBox {
			x_min,
			y_min,
			x_max,
			y_max,
		}
	}

	/// Converts a Mercator box back to degrees.
	#[must_use]
	pub fn mercator_to_geo(&self) -> BBox {
		let (x_min, y_min) = mercator_to_geo(self.x_min, self.y_min);
		let (x_max, y_max) = mercator_to_geo(self.x_max, self.y_max);
		BBox {
			x_min: x_min.max(-180.0),
			y_min: y_min.max(-MAX_MERCATOR_LAT),
			x_max: x_max.min(180.0),
			y_max: y_max.min(MAX_MERCATOR_LAT),
		}
	}

	/// Closed polygon ring as WKT, counter-clockwise from the south-west corner.
	#[must_use]
	pub fn as_wkt_polygon(&self) -> String {
		let [x1, y1, x2, y2] = self.as_array();
		format!("POLYGON(({x1} {y1}, {x2} {y1}, {x2} {y2}, {x1} {y2}, {x1} {y1}))")
	}

	/// Compact form used inside cache keys: `x_min_y_min_x_max_y_max`.
	#[must_use]
	pub fn as_key_part(&self) -> String {
		self.as_array().map(|v| v.to_string()).join("_")
	}
}

impl Debug for BBox {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "BBox({}, {}, {}, {})", self.x_min, self.y_min, self.x_max, self.y_max)
	}
}

impl TryFrom<[f64; 4]> for BBox {
	type Error = anyhow::Error;

	fn try_from(input: [f64; 4]) -> Result<Self> {
		BBox::new(input[0], input[1], input[2], input[3])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;
	use rstest::rstest;

	#[test]
	fn rejects_inverted_and_nan() {
		assert!(BBox::new(1.0, 0.0, 0.0, 1.0).is_err());
		assert!(BBox::new(0.0, 1.0, 1.0, 0.0).is_err());
		assert!(BBox::new(f64::NAN, 0.0, 1.0, 1.0).is_err());
		assert!(BBox::new_geo(-181.0, 0.0, 1.0, 1.0).is_err());
		assert!(BBox::new_geo(-180.0, -90.0, 180.0, 90.0).is_ok());
	}

	#[rstest]
	#[case([0.0, 0.0, 1.0, 1.0], true)]
	#[case([10.0, 5.0, 12.0, 6.0], true)]
	#[case([10.5, 0.0, 12.0, 1.0], false)]
	#[case([-3.0, -9.0, 3.0, -5.5], false)]
	fn intersections(#[case] other: [f64; 4], #[case] expected: bool) {
		let bbox = BBox::new(-10.0, -5.0, 10.0, 5.0).unwrap();
		let other = BBox::try_from(other).unwrap();
		assert_eq!(bbox.intersects(&other), expected);
		assert_eq!(other.intersects(&bbox), expected);
	}

	#[test]
	fn mercator_round_trip() {
		let geo = BBox::new_geo(13.08, 52.33, 13.76, 52.68).unwrap();
		let back = geo.to_mercator().mercator_to_geo();
		for (a, b) in geo.as_array().iter().zip(back.as_array()) {
			assert_relative_eq!(*a, b, epsilon = 1e-9);
		}
	}

	#[test]
	fn text_forms() {
		let bbox = BBox::new(-1.5, 2.0, 3.0, 4.25).unwrap();
		assert_eq!(
			bbox.as_wkt_polygon(),
			"POLYGON((-1.5 2, 3 2, 3 4.25, -1.5 4.25, -1.5 2))"
		);
		assert_eq!(bbox.as_key_part(), "-1.5_2_3_4.25");
		assert_eq!(format!("{bbox:?}"), "BBox(-1.5, 2, 3, 4.25)");
	}
}
