// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Tulipsport open-platform adapter.
//!
//! The open API takes a pre-issued access token verbatim in the
//! `Authorization` header. Upstream ids are UUIDs, which cannot live in
//! the numeric id column; the canonical id is rebuilt as
//! `666 + start-epoch + distance-in-meters` (distance zero-padded to
//! six digits), so it stays sortable by start time. The platform is
//! CN-only: all civil times are Asia/Shanghai and coordinates are
//! GCJ-02. Indoor records (empty location) keep their summary numbers
//! but never get a track.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::coords::SourceCrs;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, http_client, value_as_f64, value_as_i64, ActivityRef, Capabilities, Detail,
    FetchedActivity, Provider,
};
use crate::time_utils;

const LOCAL_TZ: Tz = chrono_tz::Asia::Shanghai;
/// Start of the platform's history, local time.
const EPOCH_START: &str = "2015-01-01 00:00:00";
const FAKE_ID_PREFIX: &str = "666";

pub struct TulipsportProvider {
    http: reqwest::Client,
    base_url: String,
    token: String,
    /// Listing summaries keyed by upstream UUID, reused at fetch time.
    summaries: Mutex<HashMap<String, TulipSummary>>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    code: i64,
    #[serde(default)]
    msg: Vec<TulipSummary>,
}

#[derive(Debug, Clone, Deserialize)]
struct TulipSummary {
    activity_id: String,
    activity_type: String,
    start_date_local: String,
    moving_time: serde_json::Value,
    activity_distance: serde_json::Value,
    #[serde(default)]
    device: String,
    #[serde(default)]
    location: String,
}

#[derive(Debug, Deserialize)]
struct TulipDetail {
    #[serde(default)]
    avg_hr: Option<serde_json::Value>,
    /// Rows of `[lat, lon, elevation, section, distance, hr, time, cadence]`.
    #[serde(default)]
    map_data_list: Vec<Vec<serde_json::Value>>,
}

impl TulipSummary {
    fn start_local(&self) -> Result<NaiveDateTime> {
        parse_local(&self.start_date_local)
            .map_err(|_| DecodeError::malformed("tulipsport summary", "bad start_date_local"))
            .map_err(Into::into)
    }

    fn distance_m(&self) -> f64 {
        value_as_f64(&self.activity_distance).unwrap_or(0.0) * 1000.0
    }

    fn moving_secs(&self) -> i64 {
        value_as_i64(&self.moving_time).unwrap_or(0)
    }

    fn outdoor(&self) -> bool {
        self.location != ",,"
    }
}

fn parse_local(s: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    time_utils::parse_civil(s)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
}

/// UUIDs do not fit the numeric id column: `666` + start epoch +
/// distance in meters padded to six digits.
fn fake_id(start_local: NaiveDateTime, distance_m: f64) -> Result<i64> {
    let epoch = time_utils::to_utc(start_local, LOCAL_TZ).timestamp();
    format!("{FAKE_ID_PREFIX}{epoch}{:0>6}", distance_m as i64)
        .parse()
        .map_err(|_| DecodeError::malformed("tulipsport summary", "id out of range").into())
}

/// The list endpoint wants civil timestamps percent-encoded the strict
/// way (`%20` for space), which reqwest's form-style query would not do.
fn quote_time(s: &str) -> String {
    s.replace(' ', "%20").replace(':', "%3A")
}

fn row_point(row: &[serde_json::Value]) -> Option<TrackPoint> {
    let lat = value_as_f64(row.first()?)?;
    let lon = value_as_f64(row.get(1)?)?;
    let civil = parse_local(row.get(6)?.as_str()?).ok()?;
    let mut p = TrackPoint::new(time_utils::to_utc(civil, LOCAL_TZ), lat, lon);
    p.elevation = row.get(2).and_then(value_as_f64);
    p.heart_rate = row.get(5).and_then(value_as_f64).filter(|&v| v > 0.0);
    p.cadence = row.get(7).and_then(value_as_f64);
    Some(p)
}

fn build_track(detail: &TulipDetail) -> Result<Option<DecodedTrack>> {
    let points: Vec<TrackPoint> = detail
        .map_data_list
        .iter()
        .filter_map(|row| row_point(row))
        .collect();
    match DecodedTrack::from_points(points, SourceCrs::Gcj02, &[]) {
        Ok(track) => Ok(Some(track)),
        Err(DecodeError::Empty) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl TulipsportProvider {
    pub fn new(token: String) -> Self {
        Self {
            http: http_client(),
            base_url: "https://open.tulipsport.com".to_string(),
            token,
            summaries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn to_activity(
        &self,
        summary: &TulipSummary,
        detail: &TulipDetail,
        track: Option<&DecodedTrack>,
    ) -> Result<Activity> {
        let start_local = summary.start_local()?;
        let start_date = time_utils::to_utc(start_local, LOCAL_TZ);
        let distance = summary.distance_m();
        let moving_time = summary.moving_secs();
        if moving_time <= 0 {
            return Err(DecodeError::malformed("tulipsport summary", "no moving time").into());
        }
        // Elapsed spans the recorded points when there is a track,
        // otherwise the summary gives no better answer than moving time.
        let elapsed_time = track
            .and_then(|t| {
                let first = t.points.first()?.time;
                let last = t.points.last()?.time;
                Some((last - first).num_seconds())
            })
            .unwrap_or(moving_time);
        let average_heartrate = detail
            .avg_hr
            .as_ref()
            .and_then(value_as_f64)
            .filter(|&bpm| bpm > 0.0);

        Ok(Activity {
            id: fake_id(start_local, distance)?,
            name: format!("run from tulipsport by {}", summary.device),
            activity_type: ActivityType::Run,
            subtype: Some("Run".to_string()),
            start_date,
            start_date_local: start_local,
            end_date: start_date + chrono::Duration::seconds(moving_time),
            end_date_local: start_local + chrono::Duration::seconds(moving_time),
            distance,
            moving_time,
            elapsed_time,
            average_speed: distance / moving_time as f64,
            average_heartrate,
            elevation_gain: track.and_then(|t| t.elevation_gain),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: None,
            source: "tulipsport".to_string(),
        })
    }
}

#[async_trait]
impl Provider for TulipsportProvider {
    fn name(&self) -> &'static str {
        "tulipsport"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_hr: true,
            has_polyline: true,
            is_only_run_supported: true,
            ..Capabilities::default()
        }
    }

    fn source_crs(&self) -> SourceCrs {
        SourceCrs::Gcj02
    }

    fn timezone(&self) -> Tz {
        LOCAL_TZ
    }

    async fn authenticate(&mut self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(SyncError::auth("tulipsport: empty access token"));
        }
        Ok(())
    }

    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let start = since
            .map(|t| time_utils::format_civil(time_utils::to_local(t, LOCAL_TZ)))
            .unwrap_or_else(|| EPOCH_START.to_string());
        let end = time_utils::format_civil(time_utils::to_local(Utc::now(), LOCAL_TZ));
        let url = format!(
            "{}/api/v1/feeds4likes?start_time={}&end_time={}",
            self.base_url,
            quote_time(&start),
            quote_time(&end),
        );
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.token)
            .send()
            .await?;
        let list: ListResponse = check_response(response, "tulipsport feed list")
            .await?
            .json()
            .await?;
        if list.code != 0 {
            return Err(SyncError::auth(format!(
                "tulipsport: feed list returned code {}",
                list.code
            )));
        }

        let mut refs = Vec::new();
        let mut summaries = self.summaries.lock().await;
        for summary in list.msg {
            if summary.activity_type != "run" {
                continue;
            }
            let mut aref = ActivityRef::new(summary.activity_id.clone());
            aref.start_hint = summary
                .start_local()
                .ok()
                .map(|civil| time_utils::to_utc(civil, LOCAL_TZ));
            aref.type_hint = Some(ActivityType::Run);
            refs.push(aref);
            summaries.insert(summary.activity_id.clone(), summary);
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let summary = self
            .summaries
            .lock()
            .await
            .get(&aref.provider_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("tulipsport {}", aref.provider_id)))?;
        let response = self
            .http
            .get(format!("{}/api/v1/feeddetail", self.base_url))
            .header("Authorization", &self.token)
            .query(&[("activity_id", aref.provider_id.as_str())])
            .send()
            .await?;
        let detail: TulipDetail = check_response(response, "tulipsport feed detail")
            .await?
            .json()
            .await?;

        // Treadmill sessions report bogus coordinates, so the track only
        // counts for outdoor records.
        let track = if summary.outdoor() {
            build_track(&detail)?
        } else {
            None
        };
        let activity = self.to_activity(&summary, &detail, track.as_ref())?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }
}
