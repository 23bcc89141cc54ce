// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Polyline privacy filter.
//!
//! Redacts a configurable radius around anchor points (home, office) and
//! trims a configurable distance from the head and tail of every polyline.
//! Applied exactly once per record: before upsert when
//! `IGNORE_BEFORE_SAVING` is set, otherwise at JSON export.

use crate::config::Config;
use crate::coords;
use crate::models::LatLng;

/// Privacy redaction settings, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct PrivacyFilter {
    anchors: Vec<LatLng>,
    ignore_range_m: f64,
    ignore_start_end_range_m: f64,
}

impl PrivacyFilter {
    pub fn new(
        anchors: Vec<LatLng>,
        ignore_range_m: f64,
        ignore_start_end_range_m: f64,
    ) -> Self {
        Self {
            anchors,
            ignore_range_m,
            ignore_start_end_range_m,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ignore_points.clone(),
            config.ignore_range_m,
            config.ignore_start_end_range_m,
        )
    }

    /// Whether any redaction is configured at all.
    pub fn is_active(&self) -> bool {
        self.ignore_start_end_range_m > 0.0
            || (!self.anchors.is_empty() && self.ignore_range_m > 0.0)
    }

    /// Filter an encoded polyline. Returns the empty string when fewer
    /// than two points survive; inactive filters pass the input through
    /// byte-identical.
    pub fn filter(&self, encoded: &str) -> String {
        if encoded.is_empty() || !self.is_active() {
            return encoded.to_string();
        }
        let points = match coords::decode_polyline(encoded) {
            Ok(points) => points,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping privacy filter on undecodable polyline");
                return encoded.to_string();
            }
        };
        if points.is_empty() {
            return encoded.to_string();
        }

        let kept = self.filter_points(&points);
        if kept.len() < 2 {
            return String::new();
        }
        coords::encode_polyline(kept)
    }

    /// Point-list form of the filter: head/tail trim, then anchor hiding.
    pub fn filter_points(&self, points: &[LatLng]) -> Vec<LatLng> {
        let trimmed = trim_start_end(points, self.ignore_start_end_range_m);
        trimmed
            .iter()
            .copied()
            .filter(|p| !self.near_any_anchor(*p))
            .collect()
    }

    fn near_any_anchor(&self, point: LatLng) -> bool {
        self.anchors
            .iter()
            .any(|a| coords::haversine_distance(point, *a) < self.ignore_range_m)
    }
}

/// Drop head points until the cumulative great-circle distance exceeds
/// `range_m`, and the tail symmetrically. A polyline shorter than the
/// range on a side is left whole on that side.
fn trim_start_end(points: &[LatLng], range_m: f64) -> &[LatLng] {
    if range_m <= 0.0 || points.len() < 2 {
        return points;
    }

    let mut start_index = 0;
    let mut acc = 0.0;
    for i in 1..points.len() {
        acc += coords::haversine_distance(points[i - 1], points[i]);
        if acc > range_m {
            start_index = i;
            break;
        }
    }

    let mut end_index = points.len() - 1;
    let mut acc = 0.0;
    for i in (0..points.len() - 1).rev() {
        acc += coords::haversine_distance(points[i + 1], points[i]);
        if acc > range_m {
            end_index = i;
            break;
        }
    }

    if start_index >= end_index {
        return &[];
    }
    &points[start_index..=end_index]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points along the equator, one per 0.001 degrees (~111.2 m).
    fn line(n: usize) -> Vec<LatLng> {
        (0..n)
            .map(|i| LatLng {
                lat: 0.0,
                lon: i as f64 * 0.001,
            })
            .collect()
    }

    #[test]
    fn test_inactive_filter_passes_through() {
        let filter = PrivacyFilter::default();
        let encoded = coords::encode_polyline(line(5));
        assert_eq!(filter.filter(&encoded), encoded);
    }

    #[test]
    fn test_trim_start_end() {
        let points = line(11);
        // 111 m steps: the cumulative distance first exceeds 200 m at
        // the third point from each side.
        let kept = trim_start_end(&points, 200.0);
        assert_eq!(kept.len(), 7);
        assert_eq!(kept[0], points[2]);
        assert_eq!(kept[6], points[8]);
        let from_start = coords::haversine_distance(points[0], kept[0]);
        assert!(from_start >= 200.0, "{from_start}");
    }

    #[test]
    fn test_trim_consumes_short_track() {
        // Total length ~445 m, trimming 400 m from each side leaves nothing.
        let points = line(5);
        let kept = trim_start_end(&points, 400.0);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_trim_keeps_track_shorter_than_range() {
        // Neither side accumulates past the range, so the slice survives.
        let points = line(3);
        assert_eq!(trim_start_end(&points, 10_000.0), &points[..]);
    }

    #[test]
    fn test_anchor_hiding() {
        let points = line(11);
        let filter = PrivacyFilter::new(vec![points[0]], 200.0, 0.0);
        let kept = filter.filter_points(&points);
        // The first two points are within 200 m of the anchor.
        assert_eq!(kept.len(), 9);
        assert_eq!(kept[0], points[2]);
    }

    #[test]
    fn test_anchor_hiding_is_idempotent() {
        let points = line(11);
        let filter = PrivacyFilter::new(vec![points[5]], 150.0, 0.0);
        let once = filter.filter(&coords::encode_polyline(points));
        let twice = filter.filter(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_whole_track_near_anchor_is_emptied() {
        let points = line(3);
        let filter = PrivacyFilter::new(vec![points[1]], 1_000.0, 0.0);
        assert_eq!(filter.filter(&coords::encode_polyline(points)), "");
    }

    #[test]
    fn test_single_survivor_is_emptied() {
        let points = line(3);
        // Anchors swallow all but one point.
        let filter = PrivacyFilter::new(vec![points[0]], 150.0, 0.0);
        let kept = filter.filter_points(&points);
        assert_eq!(kept.len(), 1);
        assert_eq!(filter.filter(&coords::encode_polyline(points)), "");
    }

    #[test]
    fn test_never_lengthens() {
        let points = line(20);
        let encoded = coords::encode_polyline(points.clone());
        let filter = PrivacyFilter::new(vec![points[3]], 300.0, 250.0);
        assert!(filter.filter(&encoded).len() <= encoded.len());
    }
}
