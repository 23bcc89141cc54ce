// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Decoded track representation and derived aggregates.
//!
//! Every decoder (GPX, TCX, FIT) and every JSON point-stream provider
//! funnels into [`DecodedTrack::from_points`], so coordinate shifts, pause
//! handling and aggregate math live in one place.

use chrono::{DateTime, Duration, Utc};

use crate::coords::{self, SourceCrs};
use crate::error::DecodeError;
use crate::models::LatLng;

/// Segments slower than this count as stopped, m/s (1 km/h).
const STOPPED_SPEED_THRESHOLD: f64 = 1000.0 / 3600.0;

/// Window for aligning a separate heart-rate stream onto points, seconds.
const HR_ALIGN_WINDOW_S: i64 = 10;

/// One timed sample from a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
}

impl TrackPoint {
    pub fn new(time: DateTime<Utc>, lat: f64, lon: f64) -> Self {
        Self {
            time,
            lat,
            lon,
            elevation: None,
            heart_rate: None,
            cadence: None,
        }
    }

    pub fn latlng(&self) -> LatLng {
        LatLng {
            lat: self.lat,
            lon: self.lon,
        }
    }
}

/// A provider-reported pause: the athlete held still for `duration_s`
/// seconds after `points[index]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pause {
    pub index: usize,
    pub duration_s: f64,
}

/// A decoded track: chronological points plus the aggregates every
/// canonical record needs.
#[derive(Debug, Clone)]
pub struct DecodedTrack {
    pub points: Vec<TrackPoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Meters
    pub distance: f64,
    /// Seconds, pauses excluded
    pub moving_time: i64,
    /// Seconds, wall clock
    pub elapsed_time: i64,
    /// Meters/second over moving time
    pub average_speed: f64,
    pub average_heartrate: Option<f64>,
    pub elevation_gain: Option<f64>,
    pub start_latlng: Option<LatLng>,
    /// Encoded from WGS-84 points; not yet privacy-filtered
    pub summary_polyline: String,
}

impl DecodedTrack {
    /// Build a track from WGS-84 points with no provider pause list.
    pub fn from_wgs84(points: Vec<TrackPoint>) -> Result<Self, DecodeError> {
        Self::from_points(points, SourceCrs::Wgs84, &[])
    }

    /// Normalize a point sequence and compute its aggregates.
    ///
    /// Fails with [`DecodeError::Empty`] when fewer than two usable points
    /// remain; callers whose provider contract tolerates trackless
    /// activities handle that case themselves.
    pub fn from_points(
        mut points: Vec<TrackPoint>,
        crs: SourceCrs,
        pauses: &[Pause],
    ) -> Result<Self, DecodeError> {
        // 1. Shift into WGS-84 before any aggregate sees a coordinate.
        if crs == SourceCrs::Gcj02 {
            for p in &mut points {
                let (lat, lon) = crs.to_wgs84(p.lat, p.lon);
                p.lat = lat;
                p.lon = lon;
            }
        }

        // 2. Re-open provider pauses as gaps in the timeline. Pause
        //    indices refer to the provider's raw point order.
        let mut pause_total_s = 0.0;
        if !pauses.is_empty() {
            let mut sorted = pauses.to_vec();
            sorted.sort_by_key(|p| p.index);
            let mut shift = Duration::zero();
            let mut pending = sorted.iter().peekable();
            for (i, point) in points.iter_mut().enumerate() {
                point.time += shift;
                while let Some(p) = pending.peek() {
                    if p.index != i {
                        break;
                    }
                    shift += Duration::milliseconds((p.duration_s * 1000.0) as i64);
                    pause_total_s += p.duration_s;
                    pending.next();
                }
            }
        }

        // 3. Chronological order, no duplicate timestamps.
        points.sort_by_key(|p| p.time);
        points.dedup_by_key(|p| p.time);

        if points.len() < 2 {
            return Err(DecodeError::Empty);
        }

        // 4. Aggregates over the normalized sequence.
        let start_time = points[0].time;
        let end_time = points[points.len() - 1].time;
        let elapsed_time = (end_time - start_time).num_seconds();

        let mut distance = 0.0;
        let mut stopped_s = 0.0;
        for w in points.windows(2) {
            let d = coords::haversine_distance(w[0].latlng(), w[1].latlng());
            distance += d;
            let dt = (w[1].time - w[0].time).num_milliseconds() as f64 / 1000.0;
            if pauses.is_empty() && dt > 0.0 && d / dt < STOPPED_SPEED_THRESHOLD {
                stopped_s += dt;
            }
        }

        // With an explicit pause list, trust it; otherwise fall back to
        // the slow-segment heuristic.
        let idle_s = if pauses.is_empty() {
            stopped_s
        } else {
            pause_total_s
        };
        let moving_time = ((elapsed_time as f64 - idle_s).round() as i64).clamp(0, elapsed_time);

        let average_speed = if moving_time > 0 {
            distance / moving_time as f64
        } else {
            0.0
        };

        let heart_rates: Vec<f64> = points.iter().filter_map(|p| p.heart_rate).collect();
        let average_heartrate = if heart_rates.is_empty() {
            None
        } else {
            Some(heart_rates.iter().sum::<f64>() / heart_rates.len() as f64)
        };

        let mut gain = 0.0;
        let mut prev_elevation: Option<f64> = None;
        let mut saw_elevation = false;
        for p in &points {
            if let Some(e) = p.elevation {
                saw_elevation = true;
                if let Some(prev) = prev_elevation {
                    if e > prev {
                        gain += e - prev;
                    }
                }
                prev_elevation = Some(e);
            }
        }
        let elevation_gain = saw_elevation.then_some(gain);

        let start_latlng = Some(points[0].latlng());
        let summary_polyline = coords::encode_polyline(points.iter().map(|p| p.latlng()));

        Ok(Self {
            points,
            start_time,
            end_time,
            distance,
            moving_time,
            elapsed_time,
            average_speed,
            average_heartrate,
            elevation_gain,
            start_latlng,
            summary_polyline,
        })
    }
}

/// Align a separate heart-rate stream onto points by nearest timestamp.
///
/// `samples` must be sorted by time. A point takes the closest sample
/// within 10 seconds; points with no sample in the window carry no
/// heart rate.
pub fn align_heart_rate(points: &mut [TrackPoint], samples: &[(DateTime<Utc>, f64)]) {
    if samples.is_empty() {
        return;
    }
    for point in points.iter_mut() {
        let idx = samples.partition_point(|(t, _)| *t < point.time);
        let mut best: Option<(i64, f64)> = None;
        for cand in idx.saturating_sub(1)..=idx.min(samples.len() - 1) {
            let (t, v) = samples[cand];
            let dist = (t - point.time).num_seconds().abs();
            if dist <= HR_ALIGN_WINDOW_S && best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, v));
            }
        }
        if let Some((_, v)) = best {
            point.heart_rate = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_705_300_000 + secs, 0).unwrap()
    }

    /// Points ~10 m apart (≈ 1 m/s at 10 s spacing near the equator).
    fn walking_points(n: usize, step_s: i64) -> Vec<TrackPoint> {
        (0..n)
            .map(|i| TrackPoint::new(t(i as i64 * step_s), 0.0 + i as f64 * 0.0000899, 0.0))
            .collect()
    }

    #[test]
    fn test_too_few_points_is_empty() {
        let err = DecodedTrack::from_wgs84(walking_points(1, 10)).unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }

    #[test]
    fn test_basic_aggregates() {
        let track = DecodedTrack::from_wgs84(walking_points(11, 10)).unwrap();
        assert_eq!(track.elapsed_time, 100);
        assert_eq!(track.moving_time, 100);
        assert!((track.distance - 100.0).abs() < 1.0, "{}", track.distance);
        assert!((track.average_speed - 1.0).abs() < 0.05);
        assert_eq!(track.start_latlng.unwrap().lat, 0.0);
        assert!(!track.summary_polyline.is_empty());
    }

    #[test]
    fn test_pause_list_preserves_gap() {
        // Uniform 5 s cadence, 60 s pause after the second point.
        let points = walking_points(4, 5);
        let pauses = [Pause {
            index: 1,
            duration_s: 60.0,
        }];
        let track = DecodedTrack::from_points(points, SourceCrs::Wgs84, &pauses).unwrap();
        assert_eq!(track.elapsed_time, 75);
        assert_eq!(track.moving_time, 15);
        // The gap shows up between the shifted timestamps.
        let gap = (track.points[2].time - track.points[1].time).num_seconds();
        assert_eq!(gap, 65);
    }

    #[test]
    fn test_slow_segment_heuristic() {
        let mut points = walking_points(5, 10);
        // Stand still for 120 s before the final point.
        let last = points.len() - 1;
        points[last].time += Duration::seconds(120);
        points[last].lat = points[last - 1].lat;
        let track = DecodedTrack::from_wgs84(points).unwrap();
        assert_eq!(track.elapsed_time, 160);
        assert_eq!(track.moving_time, 30);
    }

    #[test]
    fn test_unsorted_duplicate_points_normalized() {
        let mut points = walking_points(4, 10);
        points.swap(1, 2);
        points.push(points[3]); // duplicate timestamp
        let track = DecodedTrack::from_wgs84(points).unwrap();
        assert_eq!(track.points.len(), 4);
        assert!(track
            .points
            .windows(2)
            .all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_elevation_gain_sums_positive_deltas() {
        let mut points = walking_points(4, 10);
        let elevations = [10.0, 15.0, 12.0, 20.0];
        for (p, e) in points.iter_mut().zip(elevations) {
            p.elevation = Some(e);
        }
        let track = DecodedTrack::from_wgs84(points).unwrap();
        assert_eq!(track.elevation_gain, Some(13.0));
    }

    #[test]
    fn test_no_elevation_means_none() {
        let track = DecodedTrack::from_wgs84(walking_points(3, 10)).unwrap();
        assert_eq!(track.elevation_gain, None);
    }

    #[test]
    fn test_gcj02_points_are_shifted() {
        let points: Vec<TrackPoint> = (0..3)
            .map(|i| TrackPoint::new(t(i * 10), 39.9042 + i as f64 * 0.001, 116.4074))
            .collect();
        let track = DecodedTrack::from_points(points, SourceCrs::Gcj02, &[]).unwrap();
        let start = track.start_latlng.unwrap();
        let shift = coords::haversine_distance(
            LatLng {
                lat: 39.9042,
                lon: 116.4074,
            },
            start,
        );
        assert!(shift > 100.0 && shift < 1000.0, "shift was {shift}");
    }

    #[test]
    fn test_hr_alignment_window() {
        let mut points = walking_points(3, 10);
        let samples = vec![
            (t(1), 140.0),  // 1 s from the first point
            (t(9), 150.0),  // 1 s from the second point
            (t(40), 160.0), // 20 s from the third point: out of window
        ];
        align_heart_rate(&mut points, &samples);
        assert_eq!(points[0].heart_rate, Some(140.0));
        assert_eq!(points[1].heart_rate, Some(150.0));
        assert_eq!(points[2].heart_rate, None);
    }

    #[test]
    fn test_average_heartrate() {
        let mut points = walking_points(3, 10);
        points[0].heart_rate = Some(140.0);
        points[1].heart_rate = Some(160.0);
        let track = DecodedTrack::from_wgs84(points).unwrap();
        assert_eq!(track.average_heartrate, Some(150.0));
    }
}
