// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OPPO HeyTap Health adapter.
//!
//! OAuth refresh-token auth, then windowed listing: the brief endpoint
//! only answers ranges up to one month, so the adapter walks 30-day
//! windows (a capped number of months back when starting cold). Records
//! have no upstream id; the canonical id is the leading 16 decimal
//! digits of an MD5 over the detail payload, which is stable across
//! re-ingestion. GPS, heart-rate and the auxiliary sample streams join
//! on equal timestamps; elevation arrives in decimeters. When a record
//! is missing its duration, moving time is rebuilt from the GPS gaps,
//! counting anything past the pause threshold as stopped time.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use md5::{Digest, Md5};
use serde::Deserialize;

use crate::coords::SourceCrs;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, default_name, http_client, ActivityRef, Capabilities, Detail, FetchedActivity,
    Provider,
};
use crate::time_utils;

const TOKEN_REFRESH_URL: &str = "https://sport.health.heytapmobi.com/open/v1/oauth/token";
const WINDOW_MS: i64 = 30 * 24 * 3600 * 1000;
/// A gap between GPS samples longer than this is a pause.
const PAUSE_THRESHOLD_MS: i64 = 5000;

const OUTDOOR_MODES: [i64; 9] = [1, 2, 3, 13, 15, 17, 22, 36, 37];
const INDOOR_MODES: [i64; 6] = [10, 14, 16, 18, 19, 21];

pub struct OppoProvider {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    /// Upstream only retains a few months of data; bounds the cold-start
    /// window walk.
    sync_months: u32,
    tz: Tz,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    body: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct BriefResponse {
    #[serde(default)]
    body: Vec<BriefRecord>,
}

#[derive(Debug, Deserialize)]
struct BriefRecord {
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "endTime")]
    end_time: i64,
    #[serde(rename = "sportMode")]
    sport_mode: i64,
}

#[derive(Debug, Deserialize)]
struct OppoRecord {
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "endTime")]
    end_time: i64,
    #[serde(rename = "sportMode")]
    sport_mode: i64,
    #[serde(rename = "otherSportData", default)]
    other: Option<OtherSportData>,
}

#[derive(Debug, Deserialize)]
struct OtherSportData {
    #[serde(rename = "avgHeartRate", default)]
    avg_heart_rate: Option<f64>,
    #[serde(rename = "totalDistance", default)]
    total_distance: f64,
    /// Milliseconds.
    #[serde(rename = "totalTime", default)]
    total_time: i64,
    #[serde(rename = "gpsPoint", default)]
    gps_points: Vec<GpsPoint>,
    #[serde(rename = "heartRate", default)]
    heart_rate: Vec<SampleValue>,
    #[serde(default)]
    elevation: Vec<SampleValue>,
    #[serde(default)]
    frequency: Vec<SampleValue>,
}

#[derive(Debug, Deserialize)]
struct GpsPoint {
    latitude: f64,
    longitude: f64,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct SampleValue {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    value: f64,
}

fn mode_type(mode: i64) -> ActivityType {
    match mode {
        1 => ActivityType::Walk,
        3 => ActivityType::Ride,
        19 => ActivityType::Hike,
        2 | 13 | 15 | 17 | 22 | 10 | 14 | 16 | 18 | 21 | 37 => ActivityType::Run,
        _ => ActivityType::Other,
    }
}

/// Records carry no upstream id: hash the payload and keep the leading
/// 16 decimal digits.
fn derive_id(raw: &serde_json::Value) -> i64 {
    let digest: [u8; 16] = Md5::digest(raw.to_string().as_bytes()).into();
    let decimal = u128::from_be_bytes(digest).to_string();
    let head = &decimal[..decimal.len().min(16)];
    head.parse().unwrap_or(0)
}

/// Moving time in seconds from the GPS stream: sum the inter-sample
/// gaps, capping each at the pause threshold.
fn moving_time_from_points(points: &[GpsPoint]) -> i64 {
    points
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).clamp(0, PAUSE_THRESHOLD_MS))
        .sum::<i64>()
        / 1000
}

/// 30-day brief windows: forward from `since` when it is recent enough,
/// otherwise the capped months back from now.
fn brief_windows(since_ms: Option<i64>, now_ms: i64, sync_months: u32) -> Vec<(i64, i64)> {
    let horizon = now_ms - WINDOW_MS * sync_months as i64;
    match since_ms {
        Some(since) if since >= horizon => {
            let mut windows = Vec::new();
            let mut cursor = since + 1000;
            while cursor < now_ms {
                windows.push((cursor, cursor + WINDOW_MS));
                cursor += WINDOW_MS;
            }
            windows
        }
        _ => {
            let mut windows = Vec::new();
            let mut cursor = now_ms;
            for _ in 0..=sync_months {
                windows.push((cursor - WINDOW_MS, cursor));
                cursor -= WINDOW_MS;
            }
            windows
        }
    }
}

fn build_track(other: &OtherSportData) -> Result<Option<DecodedTrack>> {
    if other.gps_points.is_empty() {
        return Ok(None);
    }
    // Auxiliary streams are index-aligned with the heart-rate stream;
    // the GPS stream joins it on equal timestamps.
    let hr_index: HashMap<i64, usize> = other
        .heart_rate
        .iter()
        .enumerate()
        .map(|(j, s)| (s.timestamp, j))
        .collect();

    let points: Vec<TrackPoint> = other
        .gps_points
        .iter()
        .filter_map(|g| {
            let time = Utc.timestamp_millis_opt(g.timestamp).single()?;
            let mut p = TrackPoint::new(time, g.latitude, g.longitude);
            if let Some(&j) = hr_index.get(&g.timestamp) {
                p.heart_rate = other.heart_rate.get(j).map(|s| s.value).filter(|&v| v > 0.0);
                // Decimeters upstream.
                p.elevation = other.elevation.get(j).map(|s| s.value / 10.0);
                p.cadence = other.frequency.get(j).map(|s| s.value);
            }
            Some(p)
        })
        .collect();

    match DecodedTrack::from_points(points, SourceCrs::Gcj02, &[]) {
        Ok(track) => Ok(Some(track)),
        Err(DecodeError::Empty) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl OppoProvider {
    pub fn new(
        client_id: String,
        client_secret: String,
        refresh_token: String,
        sync_months: u32,
        tz: Tz,
    ) -> Self {
        Self {
            http: http_client(),
            base_url: "https://sport.health.heytapmobi.com".to_string(),
            client_id,
            client_secret,
            refresh_token,
            sync_months,
            tz,
            access_token: None,
        }
    }

    fn token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("oppo: not authenticated"))
    }

    fn to_activity(
        &self,
        id: i64,
        record: &OppoRecord,
        track: Option<&DecodedTrack>,
    ) -> Result<Activity> {
        let other = record
            .other
            .as_ref()
            .ok_or_else(|| DecodeError::malformed("oppo record", "no sport data"))?;
        // totalTime is in milliseconds, and some watch firmwares omit it.
        let moving_time = match other.total_time {
            ms if ms > 0 => ms / 1000,
            _ => moving_time_from_points(&other.gps_points),
        };
        if moving_time <= 0 {
            return Err(DecodeError::malformed("oppo record", "no usable duration").into());
        }
        let start_date = Utc
            .timestamp_millis_opt(record.start_time)
            .single()
            .ok_or_else(|| DecodeError::malformed("oppo record", "bad startTime"))?;
        let end_date = Utc
            .timestamp_millis_opt(record.end_time)
            .single()
            .ok_or_else(|| DecodeError::malformed("oppo record", "bad endTime"))?;
        let activity_type = mode_type(record.sport_mode);

        Ok(Activity {
            id,
            name: default_name(activity_type, "oppo"),
            activity_type,
            subtype: None,
            start_date,
            start_date_local: time_utils::to_local(start_date, self.tz),
            end_date,
            end_date_local: time_utils::to_local(end_date, self.tz),
            distance: other.total_distance,
            moving_time,
            elapsed_time: (record.end_time - record.start_time) / 1000,
            average_speed: other.total_distance / moving_time as f64,
            average_heartrate: other.avg_heart_rate.filter(|&bpm| bpm > 0.0),
            elevation_gain: track.and_then(|t| t.elevation_gain),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: None,
            source: "oppo".to_string(),
        })
    }
}

#[async_trait]
impl Provider for OppoProvider {
    fn name(&self) -> &'static str {
        "oppo"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_hr: true,
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    fn source_crs(&self) -> SourceCrs {
        SourceCrs::Gcj02
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    async fn authenticate(&mut self) -> Result<()> {
        let response = self
            .http
            .post(TOKEN_REFRESH_URL)
            .json(&serde_json::json!({
                "clientId": self.client_id,
                "clientSecret": self.client_secret,
                "refreshToken": self.refresh_token,
                "grantType": "refreshToken",
            }))
            .send()
            .await?;
        let token: TokenResponse = check_response(response, "oppo token refresh")
            .await?
            .json()
            .await?;
        self.access_token = Some(token.body.access_token);
        Ok(())
    }

    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let token = self.token()?.to_string();
        let windows = brief_windows(
            since.map(|t| t.timestamp_millis()),
            Utc::now().timestamp_millis(),
            self.sync_months,
        );

        let mut refs = Vec::new();
        for (window_start, window_end) in windows {
            let response = self
                .http
                .get(format!("{}/open/v1/data/sport/record", self.base_url))
                .header("access-token", &token)
                .query(&[
                    ("startTimeMillis", window_start.to_string()),
                    ("endTimeMillis", window_end.to_string()),
                ])
                .send()
                .await?;
            let brief: BriefResponse = check_response(response, "oppo brief records")
                .await?
                .json()
                .await?;
            for record in brief.body {
                if !OUTDOOR_MODES.contains(&record.sport_mode)
                    && !INDOOR_MODES.contains(&record.sport_mode)
                {
                    continue;
                }
                let mut aref =
                    ActivityRef::new(format!("{}-{}", record.start_time, record.end_time));
                aref.start_hint = Utc.timestamp_millis_opt(record.start_time).single();
                aref.type_hint = Some(mode_type(record.sport_mode));
                refs.push(aref);
            }
            // Upstream rate-limits eager listing.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let token = self.token()?.to_string();
        let (start, end) = aref
            .provider_id
            .split_once('-')
            .ok_or_else(|| SyncError::Internal(anyhow::anyhow!("bad oppo ref")))?;
        let response = self
            .http
            .get(format!("{}/open/v2/data/sport/record", self.base_url))
            .header("access-token", &token)
            .query(&[
                ("startTimeMillis", start.to_string()),
                ("endTimeMillis", end.to_string()),
            ])
            .send()
            .await?;
        let mut payload: serde_json::Value = check_response(response, "oppo detail record")
            .await?
            .json()
            .await?;
        let raw = payload
            .get_mut("body")
            .and_then(|b| b.as_array_mut())
            .and_then(|a| a.first_mut())
            .map(serde_json::Value::take)
            .ok_or_else(|| DecodeError::malformed("oppo record", "empty detail body"))?;

        let id = derive_id(&raw);
        let record: OppoRecord = serde_json::from_value(raw)
            .map_err(|e| DecodeError::malformed("oppo record", e.to_string()))?;
        let track = match record.other.as_ref() {
            Some(other) => build_track(other)?,
            None => None,
        };
        let activity = self.to_activity(id, &record, track.as_ref())?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_is_stable_and_16_digits() {
        let raw = serde_json::json!({"startTime": 1, "sportMode": 2});
        let id = derive_id(&raw);
        assert_eq!(id, derive_id(&raw));
        assert!(id > 0);
        assert!(id.to_string().len() <= 16);
        assert_ne!(id, derive_id(&serde_json::json!({"startTime": 2})));
    }

    #[test]
    fn test_mode_type_map() {
        assert_eq!(mode_type(1), ActivityType::Walk);
        assert_eq!(mode_type(2), ActivityType::Run);
        assert_eq!(mode_type(21), ActivityType::Run);
        assert_eq!(mode_type(3), ActivityType::Ride);
        assert_eq!(mode_type(19), ActivityType::Hike);
        assert_eq!(mode_type(36), ActivityType::Other);
    }

    #[test]
    fn test_brief_windows_forward_from_recent_since() {
        let now = 1_700_000_000_000;
        let since = now - WINDOW_MS / 2;
        let windows = brief_windows(Some(since), now, 6);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0, since + 1000);
    }

    #[test]
    fn test_brief_windows_cold_start_walks_back() {
        let now = 1_700_000_000_000;
        let windows = brief_windows(None, now, 6);
        assert_eq!(windows.len(), 7);
        assert_eq!(windows[0].1, now);
        // Contiguous, newest first.
        assert_eq!(windows[1].1, windows[0].0);
    }

    fn sport_data(json: serde_json::Value) -> OtherSportData {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_track_join_and_decimeter_elevation() {
        let other = sport_data(serde_json::json!({
            "totalDistance": 100.0,
            "totalTime": 60000,
            "gpsPoint": [
                {"latitude": 39.9, "longitude": 116.4, "timestamp": 1700000000000i64},
                {"latitude": 39.901, "longitude": 116.401, "timestamp": 1700000010000i64}
            ],
            "heartRate": [
                {"timestamp": 1700000000000i64, "value": 150.0},
                {"timestamp": 1700000010000i64, "value": 155.0}
            ],
            "elevation": [
                {"value": 4210.0},
                {"value": 4230.0}
            ]
        }));
        let track = build_track(&other).unwrap().unwrap();
        assert_eq!(track.points[0].elevation, Some(421.0));
        assert_eq!(track.points[0].heart_rate, Some(150.0));
        assert_eq!(track.points[1].heart_rate, Some(155.0));
    }

    #[test]
    fn test_total_time_milliseconds_become_seconds() {
        let provider = OppoProvider::new(
            "i".into(),
            "s".into(),
            "r".into(),
            6,
            chrono_tz::Asia::Shanghai,
        );
        let record = OppoRecord {
            start_time: 1_700_000_000_000,
            end_time: 1_700_001_900_000,
            sport_mode: 2,
            other: Some(sport_data(serde_json::json!({
                "totalDistance": 5000.0,
                "totalTime": 1800000,
                "avgHeartRate": 160.0
            }))),
        };
        let activity = provider.to_activity(9, &record, None).unwrap();
        assert_eq!(activity.moving_time, 1800);
        assert_eq!(activity.elapsed_time, 1900);
        assert!((activity.average_speed - 5000.0 / 1800.0).abs() < 1e-9);
        assert_eq!(activity.name, "Run from oppo");
    }

    #[test]
    fn test_pause_gaps_cap_derived_moving_time() {
        // 0 s -> 2 s -> 62 s: the minute-long gap is a pause and
        // contributes only the threshold.
        let other = sport_data(serde_json::json!({
            "totalDistance": 300.0,
            "gpsPoint": [
                {"latitude": 39.9, "longitude": 116.4, "timestamp": 1700000000000i64},
                {"latitude": 39.9001, "longitude": 116.4, "timestamp": 1700000002000i64},
                {"latitude": 39.9002, "longitude": 116.4, "timestamp": 1700000062000i64}
            ]
        }));
        assert_eq!(moving_time_from_points(&other.gps_points), 7);
    }

    #[test]
    fn test_missing_total_time_falls_back_to_gps_gaps() {
        let provider = OppoProvider::new(
            "i".into(),
            "s".into(),
            "r".into(),
            6,
            chrono_tz::Asia::Shanghai,
        );
        let record = OppoRecord {
            start_time: 1_700_000_000_000,
            end_time: 1_700_000_062_000,
            sport_mode: 2,
            other: Some(sport_data(serde_json::json!({
                "totalDistance": 300.0,
                "gpsPoint": [
                    {"latitude": 39.9, "longitude": 116.4, "timestamp": 1700000000000i64},
                    {"latitude": 39.9001, "longitude": 116.4, "timestamp": 1700000002000i64},
                    {"latitude": 39.9002, "longitude": 116.4, "timestamp": 1700000062000i64}
                ]
            }))),
        };
        let activity = provider.to_activity(9, &record, None).unwrap();
        assert_eq!(activity.moving_time, 7);
        assert_eq!(activity.elapsed_time, 62);

        // No duration and no points is unusable.
        let empty = OppoRecord {
            start_time: 1_700_000_000_000,
            end_time: 1_700_000_062_000,
            sport_mode: 2,
            other: Some(sport_data(serde_json::json!({"totalDistance": 300.0}))),
        };
        assert!(provider.to_activity(9, &empty, None).is_err());
    }
}
