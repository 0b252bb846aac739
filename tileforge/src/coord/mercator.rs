//! Spherical Web Mercator (EPSG:3857) projection helpers.
//!
//! World coordinates are expressed in the unit square: `x` grows eastward
//! from longitude -180, `y` grows *southward* from the north clip latitude,
//! matching the slippy-map and MVT axis conventions. Multiplying by
//! `2^zoom * extent` yields absolute pixel positions at a zoom level.

use std::f64::consts::PI;

/// Northern clip latitude of the square Web Mercator world.
pub const MAX_LAT: f64 = 85.05112878;
/// Southern clip latitude.
pub const MIN_LAT: f64 = -85.05112878;

/// Longitude to world x in [0, 1].
#[inline]
pub fn lon_to_world_x(lon: f64) -> f64 {
    (lon + 180.0) / 360.0
}

/// Latitude to world y in [0, 1], 0 at the north clip edge.
#[inline]
pub fn lat_to_world_y(lat: f64) -> f64 {
    let lat = lat.clamp(MIN_LAT, MAX_LAT);
    let sin = (lat * PI / 180.0).sin();
    0.5 - ((1.0 + sin) / (1.0 - sin)).ln() / (4.0 * PI)
}

/// Inverse projection of unit-square world coordinates.
pub fn world_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = x * 360.0 - 180.0;
    let n = PI * (1.0 - 2.0 * y);
    let lat = (n.sinh()).atan() * 180.0 / PI;
    (lon, lat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_island_is_world_center() {
        assert!((lon_to_world_x(0.0) - 0.5).abs() < 1e-12);
        assert!((lat_to_world_y(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_world_edges() {
        assert!((lon_to_world_x(-180.0)).abs() < 1e-12);
        assert!((lon_to_world_x(180.0) - 1.0).abs() < 1e-12);
        assert!(lat_to_world_y(MAX_LAT).abs() < 1e-9);
        assert!((lat_to_world_y(MIN_LAT) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latitudes_beyond_clip_are_clamped() {
        assert_eq!(lat_to_world_y(90.0), lat_to_world_y(MAX_LAT));
        assert_eq!(lat_to_world_y(-90.0), lat_to_world_y(MIN_LAT));
    }

    #[test]
    fn test_projection_round_trip() {
        for &(lon, lat) in &[(0.0, 0.0), (13.4, 52.5), (-122.4, 37.8), (151.2, -33.9)] {
            let (x, y) = (lon_to_world_x(lon), lat_to_world_y(lat));
            let (lon2, lat2) = world_to_lon_lat(x, y);
            assert!((lon - lon2).abs() < 1e-9, "lon {} vs {}", lon, lon2);
            assert!((lat - lat2).abs() < 1e-9, "lat {} vs {}", lat, lat2);
        }
    }
}
