// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Nike Run Club adapter.
//!
//! Bearer auth via the shim OAuth refresh endpoint, cursor paging over
//! `activities/after_id`, and one `?metrics=ALL` detail request per
//! activity. The API drops requests now and then, so every call gets a
//! single retry after a short pause. Coordinates arrive as separate
//! latitude/longitude sample streams that must line up
//! timestamp-for-timestamp; elevation and heart rate are joined onto
//! the points afterwards. Workouts recorded by the NTC training app
//! are skipped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{DecodeError, Result, SyncError};
use crate::models::{align_heart_rate, Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, default_name, http_client, ActivityRef, Capabilities, Detail, FetchedActivity,
    Provider,
};
use crate::time_utils;

const TOKEN_REFRESH_URL: &str = "https://api.nike.com/idn/shim/oauth/2.0/token";
const CLIENT_ID: &str = "VhAeafEGJ6G8e9DxRUz8iE50CZ9MiJMG";
const RETRY_PAUSE: Duration = Duration::from_secs(3);
/// Training-app records carry no route and are not runs.
const NTC_APP_IDS: [&str; 2] = ["com.nike.ntc.brand.ios", "com.nike.ntc.brand.droid"];

pub struct NikeProvider {
    http: reqwest::Client,
    base_url: String,
    refresh_token: String,
    tz: Tz,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ActivitiesPage {
    #[serde(default)]
    activities: Vec<ListedActivity>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    after_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedActivity {
    id: String,
    #[serde(default)]
    app_id: String,
    #[serde(rename = "type", default)]
    type_label: Option<String>,
    #[serde(default)]
    start_epoch_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NikeActivity {
    start_epoch_ms: i64,
    end_epoch_ms: i64,
    active_duration_ms: i64,
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    summaries: Vec<Summary>,
    #[serde(default)]
    tags: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    #[serde(rename = "type")]
    metric_type: String,
    #[serde(default)]
    values: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    start_epoch_ms: i64,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    metric: String,
    #[serde(default)]
    value: f64,
}

impl NikeActivity {
    fn metric(&self, name: &str) -> Option<&[Sample]> {
        self.metrics
            .iter()
            .find(|m| m.metric_type == name)
            .map(|m| m.values.as_slice())
    }

    fn summary(&self, name: &str) -> Option<f64> {
        self.summaries
            .iter()
            .find(|s| s.metric == name)
            .map(|s| s.value)
    }

    fn title(&self) -> Option<String> {
        self.tags
            .get("com.nike.name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Zip the latitude and longitude streams into points. The streams are
/// index-aligned; a timestamp mismatch means the payload is unusable.
fn build_track(activity: &NikeActivity) -> Result<Option<DecodedTrack>> {
    let (lats, lons) = match (activity.metric("latitude"), activity.metric("longitude")) {
        (Some(lats), Some(lons)) if !lats.is_empty() && !lons.is_empty() => (lats, lons),
        _ => return Ok(None),
    };

    let mut points = Vec::with_capacity(lats.len().min(lons.len()));
    for (lat, lon) in lats.iter().zip(lons.iter()) {
        if lat.start_epoch_ms != lon.start_epoch_ms {
            return Err(
                DecodeError::malformed("nike metrics", "latitude/longitude out of order").into(),
            );
        }
        let Some(time) = Utc.timestamp_millis_opt(lat.start_epoch_ms).single() else {
            continue;
        };
        points.push(TrackPoint::new(time, lat.value, lon.value));
    }

    if let Some(elevations) = activity.metric("elevation") {
        fill_elevation(&mut points, elevations);
    }
    if let Some(heart_rates) = activity.metric("heart_rate") {
        let samples: Vec<(DateTime<Utc>, f64)> = heart_rates
            .iter()
            .filter_map(|s| {
                Utc.timestamp_millis_opt(s.start_epoch_ms)
                    .single()
                    .map(|t| (t, s.value))
            })
            .collect();
        align_heart_rate(&mut points, &samples);
    }

    match DecodedTrack::from_wgs84(points) {
        Ok(track) => Ok(Some(track)),
        Err(DecodeError::Empty) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Elevation is a sparse step function: each point takes the most
/// recent sample at or before it.
fn fill_elevation(points: &mut [TrackPoint], samples: &[Sample]) {
    if samples.is_empty() {
        return;
    }
    let mut idx = 0usize;
    for p in points {
        let t = p.time.timestamp_millis();
        while idx + 1 < samples.len() && samples[idx + 1].start_epoch_ms <= t {
            idx += 1;
        }
        if samples[idx].start_epoch_ms <= t {
            p.elevation = Some(samples[idx].value);
        }
    }
}

impl NikeProvider {
    pub fn new(refresh_token: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://api.nike.com/sport/v3/me".to_string(),
            refresh_token,
            tz,
            access_token: None,
        }
    }

    fn token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("nike: not authenticated"))
    }

    async fn try_get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
        what: &str,
    ) -> Result<T> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Ok(check_response(response, what).await?.json().await?)
    }

    /// One authenticated GET, retried once after a pause when it fails.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
        what: &str,
    ) -> Result<T> {
        match self.try_get_json(token, url, what).await {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::warn!(error = %first, url, "Nike request failed, retrying once");
                tokio::time::sleep(RETRY_PAUSE).await;
                self.try_get_json(token, url, what).await
            }
        }
    }

    fn to_activity(&self, detail: &NikeActivity, track: Option<&DecodedTrack>) -> Result<Activity> {
        let start_date = Utc
            .timestamp_millis_opt(detail.start_epoch_ms)
            .single()
            .ok_or_else(|| DecodeError::malformed("nike activity", "bad start_epoch_ms"))?;
        let end_date = Utc
            .timestamp_millis_opt(detail.end_epoch_ms)
            .single()
            .ok_or_else(|| DecodeError::malformed("nike activity", "bad end_epoch_ms"))?;

        let distance = track
            .map(|t| t.distance)
            .or_else(|| detail.summary("distance").map(|km| km * 1000.0))
            .filter(|&m| m > 0.0)
            .ok_or_else(|| DecodeError::malformed("nike activity", "no distance"))?;
        let moving_time = detail.active_duration_ms / 1000;
        let elapsed_time = (detail.end_epoch_ms - detail.start_epoch_ms) / 1000;
        let average_heartrate = track
            .and_then(|t| t.average_heartrate)
            .or_else(|| detail.summary("heart_rate"));

        Ok(Activity {
            id: detail.end_epoch_ms,
            name: detail
                .title()
                .unwrap_or_else(|| default_name(ActivityType::Run, "nike")),
            activity_type: ActivityType::Run,
            subtype: None,
            start_date,
            start_date_local: time_utils::to_local(start_date, self.tz),
            end_date,
            end_date_local: time_utils::to_local(end_date, self.tz),
            distance,
            moving_time,
            elapsed_time,
            average_speed: if moving_time > 0 {
                distance / moving_time as f64
            } else {
                0.0
            },
            average_heartrate,
            elevation_gain: track.and_then(|t| t.elevation_gain),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: None,
            source: "nike".to_string(),
        })
    }
}

#[async_trait]
impl Provider for NikeProvider {
    fn name(&self) -> &'static str {
        "nike"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_hr: true,
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    async fn authenticate(&mut self) -> Result<()> {
        let response = self
            .http
            .post(TOKEN_REFRESH_URL)
            .json(&serde_json::json!({
                "refresh_token": self.refresh_token,
                "client_id": CLIENT_ID,
                "grant_type": "refresh_token",
            }))
            .send()
            .await?;
        let token: TokenResponse = check_response(response, "nike token refresh")
            .await?
            .json()
            .await?;
        self.access_token = Some(token.access_token);
        Ok(())
    }

    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let token = self.token()?.to_string();
        let after_time = since.map(|t| t.timestamp_millis()).unwrap_or(0);
        let mut refs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let url = match &cursor {
                Some(id) => format!("{}/activities/after_id/{id}", self.base_url),
                None => format!("{}/activities/after_time/{after_time}", self.base_url),
            };
            let page: ActivitiesPage = self.get_json(&token, &url, "nike activity list").await?;
            if page.activities.is_empty() {
                break;
            }
            for listed in &page.activities {
                if NTC_APP_IDS.contains(&listed.app_id.as_str()) {
                    tracing::debug!(id = %listed.id, "Skipping NTC training record");
                    continue;
                }
                let mut aref = ActivityRef::new(listed.id.clone());
                aref.start_hint = listed
                    .start_epoch_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                aref.type_hint = listed.type_label.as_deref().map(ActivityType::from_label);
                refs.push(aref);
            }
            cursor = page.paging.after_id;
            if cursor.is_none() {
                break;
            }
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let token = self.token()?.to_string();
        let url = format!("{}/activity/{}?metrics=ALL", self.base_url, aref.provider_id);
        let detail: NikeActivity = self.get_json(&token, &url, "nike activity detail").await?;

        let track = build_track(&detail)?;
        let activity = self.to_activity(&detail, track.as_ref())?;
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

    fn sample(ms: i64, value: f64) -> Sample {
        Sample {
            start_epoch_ms: ms,
            value,
        }
    }

    fn detail_with_metrics(metrics: Vec<Metric>) -> NikeActivity {
        NikeActivity {
            start_epoch_ms: 1_700_000_000_000,
            end_epoch_ms: 1_700_001_800_000,
            active_duration_ms: 1_500_000,
            metrics,
            summaries: Vec::new(),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_build_track_zips_streams() {
        let detail = detail_with_metrics(vec![
            Metric {
                metric_type: "latitude".into(),
                values: vec![sample(1_700_000_000_000, 37.4), sample(1_700_000_005_000, 37.41)],
            },
            Metric {
                metric_type: "longitude".into(),
                values: vec![
                    sample(1_700_000_000_000, -122.1),
                    sample(1_700_000_005_000, -122.11),
                ],
            },
        ]);
        let track = build_track(&detail).unwrap().unwrap();
        assert_eq!(track.points.len(), 2);
        assert!(track.distance > 0.0);
    }

    #[test]
    fn test_build_track_rejects_misaligned_streams() {
        let detail = detail_with_metrics(vec![
            Metric {
                metric_type: "latitude".into(),
                values: vec![sample(1_700_000_000_000, 37.4)],
            },
            Metric {
                metric_type: "longitude".into(),
                values: vec![sample(1_700_000_001_000, -122.1)],
            },
        ]);
        assert!(build_track(&detail).is_err());
    }

    #[test]
    fn test_fill_elevation_steps_forward() {
        let t0 = Utc.timestamp_millis_opt(10_000).unwrap();
        let mut points = vec![
            TrackPoint::new(t0, 1.0, 1.0),
            TrackPoint::new(t0 + chrono::Duration::seconds(10), 1.0, 1.0),
            TrackPoint::new(t0 + chrono::Duration::seconds(20), 1.0, 1.0),
        ];
        fill_elevation(
            &mut points,
            &[sample(10_000, 100.0), sample(25_000, 110.0)],
        );
        assert_eq!(points[0].elevation, Some(100.0));
        assert_eq!(points[1].elevation, Some(100.0));
        assert_eq!(points[2].elevation, Some(110.0));
    }

    #[test]
    fn test_trackless_uses_summaries_and_duration_split() {
        let mut detail = detail_with_metrics(Vec::new());
        detail.summaries = vec![
            Summary {
                metric: "distance".into(),
                value: 5.2,
            },
            Summary {
                metric: "heart_rate".into(),
                value: 148.0,
            },
        ];
        let provider = NikeProvider::new("r".into(), chrono_tz::UTC);
        let activity = provider.to_activity(&detail, None).unwrap();
        assert_eq!(activity.id, 1_700_001_800_000);
        assert_eq!(activity.distance, 5200.0);
        // Active duration is the moving time; wall clock is the spread
        // between the epoch bounds.
        assert_eq!(activity.moving_time, 1500);
        assert_eq!(activity.elapsed_time, 1800);
        assert_eq!(activity.average_heartrate, Some(148.0));
    }

    #[test]
    fn test_trackless_without_distance_is_rejected() {
        let detail = detail_with_metrics(Vec::new());
        let provider = NikeProvider::new("r".into(), chrono_tz::UTC);
        assert!(provider.to_activity(&detail, None).is_err());
    }
}
