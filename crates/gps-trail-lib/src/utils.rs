//! Utility functions for coordinate conversions and distances
//!
//! The index works in integer area-panel (AP) units: the Web Mercator square is mapped onto
//! `0..max_ap_units` on both axes, x growing eastwards and y growing northwards.

use geo::Point;
use std::f64::consts::{FRAC_PI_2, PI};

/// Half the side of the Web Mercator square (EPSG:3857) in meters
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;
pub const EARTH_MERCATOR_MIN: f64 = -EARTH_MERCATOR_MAX;
/// Side of the whole world in Mercator meters
pub const EARTH_SIZE_METERS: f64 = 2.0 * EARTH_MERCATOR_MAX;

/// Latitudes beyond this are clamped before projecting
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6371000.0;

/// Project WGS84 degrees onto Web Mercator meters (x east, y north)
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    let phi = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = lon / 180.0 * EARTH_MERCATOR_MAX;
    let y = (phi.tan() + 1.0 / phi.cos()).ln() / PI * EARTH_MERCATOR_MAX;
    Point::new(x, y)
}

/// Inverse of [`wgs84_to_mercator`], returning (lat, lon)
#[inline(always)]
pub fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lat = (2.0 * (y / EARTH_MERCATOR_MAX * PI).exp().atan() - FRAC_PI_2).to_degrees();
    (lat, x / EARTH_MERCATOR_MAX * 180.0)
}

/// Convert a Web Mercator point to AP units, clamped to `0..max_ap_units`
#[inline(always)]
pub fn mercator_to_ap_units(point: &Point<f64>, max_ap_units: i64) -> (i64, i64) {
    let to_units = |meters: f64| {
        let units = ((meters - EARTH_MERCATOR_MIN) / EARTH_SIZE_METERS * max_ap_units as f64)
            .floor() as i64;
        units.clamp(0, max_ap_units - 1)
    };
    (to_units(point.x()), to_units(point.y()))
}

/// Convert AP units back to Web Mercator meters
#[inline(always)]
pub fn ap_units_to_mercator(x: f64, y: f64, max_ap_units: i64) -> Point<f64> {
    let scale = EARTH_SIZE_METERS / max_ap_units as f64;
    Point::new(x * scale + EARTH_MERCATOR_MIN, y * scale + EARTH_MERCATOR_MIN)
}

/// Convert WGS84 (lat, lon) to AP units
#[inline(always)]
pub fn wgs84_to_ap_units(lat: f64, lon: f64, max_ap_units: i64) -> (i64, i64) {
    mercator_to_ap_units(&wgs84_to_mercator(lat, lon), max_ap_units)
}

/// Convert AP units to WGS84 (lat, lon)
#[inline(always)]
pub fn ap_units_to_wgs84(x: f64, y: f64, max_ap_units: i64) -> (f64, f64) {
    let point = ap_units_to_mercator(x, y, max_ap_units);
    mercator_to_wgs84(point.x(), point.y())
}

/// Great-circle distance between two WGS84 positions in meters
#[inline]
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Great-circle distance between two positions given in AP units
#[inline]
pub fn ap_distance_m(x1: f64, y1: f64, x2: f64, y2: f64, max_ap_units: i64) -> f64 {
    let (lat1, lon1) = ap_units_to_wgs84(x1, y1, max_ap_units);
    let (lat2, lon2) = ap_units_to_wgs84(x2, y2, max_ap_units);
    haversine_m(lat1, lon1, lat2, lon2)
}
