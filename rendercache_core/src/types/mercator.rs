//! Spherical Mercator (EPSG:3857) projection.
//!
//! Tile stores render in this reference system. It is equivalent to the proj string
//! [`STANDARD_SRS`].

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

/// Proj string of the working reference of all tile stores.
pub const STANDARD_SRS: &str =
	"+proj=merc +a=6378137 +b=6378137 +lat_ts=0.0 +lon_0=0.0 +x_0=0.0 +y_0=0 +k=1.0 +units=m +nadgrids=@null";

/// Sphere radius in meters.
pub const RADIUS: f64 = 6_378_137.0;

/// Latitude at which the square Mercator world ends.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

pub const MAX_MERCATOR_LNG: f64 = 180.0;

/// Projects longitude/latitude in degrees to Mercator meters.
///
/// Latitudes beyond [`MAX_MERCATOR_LAT`] are clamped.
#[must_use]
pub fn geo_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
	let lon = lon.clamp(-MAX_MERCATOR_LNG, MAX_MERCATOR_LNG);
	let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
	(
		RADIUS * lon.to_radians(),
		RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln(),
	)
}

/// Inverse of [`geo_to_mercator`].
#[must_use]
pub fn mercator_to_geo(x: f64, y: f64) -> (f64, f64) {
	(
		(x / RADIUS).to_degrees(),
		(2.0 * (y / RADIUS).exp().atan() - FRAC_PI_2).to_degrees(),
	)
}

/// Resolves a spatial reference name to the descriptor handed to the renderer.
///
/// `EPSG:3857` and `EPSG:900913` become [`STANDARD_SRS`], any other `EPSG:n` becomes
/// `+init=epsg:n`. Proj strings are passed through.
#[must_use]
pub fn normalize_srs(srs: &str) -> String {
	let trimmed = srs.trim();
	if trimmed.to_ascii_lowercase().starts_with("epsg") {
		if trimmed.ends_with("3857") || trimmed.ends_with("900913") {
			STANDARD_SRS.to_string()
		} else {
			format!("+init={}", trimmed.to_ascii_lowercase())
		}
	} else {
		trimmed.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;
	use rstest::rstest;

	#[test]
	fn world_extent() {
		let (x, y) = geo_to_mercator(180.0, MAX_MERCATOR_LAT);
		assert_relative_eq!(x, 20_037_508.342_789_244, max_relative = 1e-12);
		assert_relative_eq!(y, 20_037_508.342_789_244, max_relative = 1e-9);
	}

	#[test]
	fn clamps_poles() {
		assert_eq!(geo_to_mercator(0.0, 90.0), geo_to_mercator(0.0, MAX_MERCATOR_LAT));
	}

	#[rstest]
	#[case(13.404954, 52.520008)]
	#[case(-122.4194, 37.7749)]
	#[case(0.0, 0.0)]
	#[case(-179.9, -84.0)]
	fn inverse(#[case] lon: f64, #[case] lat: f64) {
		let (x, y) = geo_to_mercator(lon, lat);
		let (lon2, lat2) = mercator_to_geo(x, y);
		assert_relative_eq!(lon, lon2, epsilon = 1e-9);
		assert_relative_eq!(lat, lat2, epsilon = 1e-9);
	}

	#[rstest]
	#[case("EPSG:3857", STANDARD_SRS)]
	#[case("epsg:900913", STANDARD_SRS)]
	#[case("EPSG:4326", "+init=epsg:4326")]
	#[case("+proj=longlat +datum=WGS84", "+proj=longlat +datum=WGS84")]
	fn srs_names(#[case] input: &str, #[case] expected: &str) {
		assert_eq!(normalize_srs(input), expected);
	}
}
