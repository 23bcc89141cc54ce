// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Coordinate transforms and polyline codecs.
//!
//! Mainland-China providers report GCJ-02 ("mars") coordinates; everything
//! we persist is WGS-84. Outside the China bounding box both transforms are
//! the identity.

use std::f64::consts::PI;

use geo::{Coord, LineString};

use crate::models::LatLng;

/// Krasovsky 1940 ellipsoid, used by the GCJ-02 obfuscation.
const KRASOVSKY_A: f64 = 6_378_245.0;
const KRASOVSKY_EE: f64 = 0.006_693_421_622_965_943;

/// Encoded-polyline precision (Google/Strava format).
const POLYLINE_PRECISION: u32 = 5;

/// Coordinate system of incoming provider data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceCrs {
    #[default]
    Wgs84,
    Gcj02,
}

impl SourceCrs {
    /// Shift a point into WGS-84 if it isn't already.
    pub fn to_wgs84(self, lat: f64, lon: f64) -> (f64, f64) {
        match self {
            SourceCrs::Wgs84 => (lat, lon),
            SourceCrs::Gcj02 => gcj02_to_wgs84(lat, lon),
        }
    }
}

/// True when the point lies outside the GCJ-02 application area.
pub fn out_of_china(lat: f64, lon: f64) -> bool {
    !(72.004..=137.8347).contains(&lon) || !(0.8293..=55.8271).contains(&lat)
}

fn transform_lat(x: f64, y: f64) -> f64 {
    let mut ret =
        -100.0 + 2.0 * x + 3.0 * y + 0.2 * y * y + 0.1 * x * y + 0.2 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (y * PI).sin() + 40.0 * (y / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (160.0 * (y / 12.0 * PI).sin() + 320.0 * (y * PI / 30.0).sin()) * 2.0 / 3.0;
    ret
}

fn transform_lon(x: f64, y: f64) -> f64 {
    let mut ret = 300.0 + x + 2.0 * y + 0.1 * x * x + 0.1 * x * y + 0.1 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (x * PI).sin() + 40.0 * (x / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (150.0 * (x / 12.0 * PI).sin() + 300.0 * (x / 30.0 * PI).sin()) * 2.0 / 3.0;
    ret
}

/// The GCJ-02 offset at a point, evaluated on the Krasovsky ellipsoid.
fn offset(lat: f64, lon: f64) -> (f64, f64) {
    let dlat = transform_lat(lon - 105.0, lat - 35.0);
    let dlon = transform_lon(lon - 105.0, lat - 35.0);
    let rad_lat = lat / 180.0 * PI;
    let magic = 1.0 - KRASOVSKY_EE * rad_lat.sin() * rad_lat.sin();
    let sqrt_magic = magic.sqrt();
    let dlat = (dlat * 180.0) / ((KRASOVSKY_A * (1.0 - KRASOVSKY_EE)) / (magic * sqrt_magic) * PI);
    let dlon = (dlon * 180.0) / (KRASOVSKY_A / sqrt_magic * rad_lat.cos() * PI);
    (dlat, dlon)
}

pub fn wgs84_to_gcj02(lat: f64, lon: f64) -> (f64, f64) {
    if out_of_china(lat, lon) {
        return (lat, lon);
    }
    let (dlat, dlon) = offset(lat, lon);
    (lat + dlat, lon + dlon)
}

/// Inverse transform. The offset varies slowly enough that evaluating it at
/// the GCJ-02 point instead of the true WGS-84 point stays within a meter.
pub fn gcj02_to_wgs84(lat: f64, lon: f64) -> (f64, f64) {
    if out_of_china(lat, lon) {
        return (lat, lon);
    }
    let (dlat, dlon) = offset(lat, lon);
    (lat - dlat, lon - dlon)
}

/// Great-circle distance between two points in meters.
pub fn haversine_distance(a: LatLng, b: LatLng) -> f64 {
    const R: f64 = 6_371_000.0; // Earth's radius in meters

    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().asin();

    R * c
}

/// Decode an encoded polyline (precision 5) into points.
pub fn decode_polyline(encoded: &str) -> Result<Vec<LatLng>, CoordsError> {
    let line: LineString<f64> = polyline::decode_polyline(encoded, POLYLINE_PRECISION)
        .map_err(|e| CoordsError::PolylineDecode(e.to_string()))?;
    Ok(line
        .coords()
        .map(|c| LatLng { lat: c.y, lon: c.x })
        .collect())
}

/// Encode points as a polyline (precision 5).
///
/// Out-of-range coordinates yield an empty string rather than an error;
/// decoded provider tracks have already dropped unparseable points.
pub fn encode_polyline<I>(points: I) -> String
where
    I: IntoIterator<Item = LatLng>,
{
    polyline::encode_coordinates(
        points.into_iter().map(|p| Coord { x: p.lon, y: p.lat }),
        POLYLINE_PRECISION,
    )
    .unwrap_or_default()
}

/// Errors from coordinate operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordsError {
    #[error("Failed to decode polyline: {0}")]
    PolylineDecode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_outside_china() {
        // San Francisco
        let (lat, lon) = gcj02_to_wgs84(37.7749, -122.4194);
        assert_eq!((lat, lon), (37.7749, -122.4194));
        let (lat, lon) = wgs84_to_gcj02(37.7749, -122.4194);
        assert_eq!((lat, lon), (37.7749, -122.4194));
    }

    #[test]
    fn test_gcj02_shifts_inside_china() {
        // Tiananmen Square, Beijing
        let (lat, lon) = wgs84_to_gcj02(39.9042, 116.4074);
        let shift = haversine_distance(
            LatLng { lat: 39.9042, lon: 116.4074 },
            LatLng { lat, lon },
        );
        // The obfuscation moves points by a few hundred meters
        assert!(shift > 100.0 && shift < 1000.0, "shift was {shift} m");
    }

    #[test]
    fn test_round_trip_within_one_meter() {
        let orig = LatLng { lat: 31.2304, lon: 121.4737 }; // Shanghai
        let (glat, glon) = wgs84_to_gcj02(orig.lat, orig.lon);
        let (lat, lon) = gcj02_to_wgs84(glat, glon);
        let err = haversine_distance(orig, LatLng { lat, lon });
        assert!(err < 1.0, "round trip error was {err} m");
    }

    #[test]
    fn test_polyline_round_trip() {
        // Google's reference example for the format
        let encoded = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";
        let points = decode_polyline(encoded).unwrap();
        assert_eq!(points.len(), 3);
        assert!((points[0].lat - 38.5).abs() < 1e-9);
        assert!((points[0].lon - -120.2).abs() < 1e-9);
        assert_eq!(encode_polyline(points), encoded);
    }

    #[test]
    fn test_decode_garbage_polyline_fails() {
        assert!(decode_polyline("\u{1}\u{2}").is_err());
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km
        let a = LatLng { lat: 0.0, lon: 0.0 };
        let b = LatLng { lat: 1.0, lon: 0.0 };
        let d = haversine_distance(a, b);
        assert!((d - 111_195.0).abs() < 100.0, "distance was {d}");
    }
}
