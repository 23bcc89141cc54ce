// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Keep adapter.
//!
//! Mobile-number login, paged stats listing, one detail request per log.
//! Outdoor logs carry a `rawDataURL` pointing at a base64+gzip blob of
//! GCJ-02 points whose timestamps are centisecond offsets from the log
//! start. Indoor logs stay trackless.

use std::io::Read;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::coords::SourceCrs;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, default_name, http_client, ActivityRef, Capabilities, Detail, FetchedActivity,
    Provider,
};
use crate::time_utils;

/// Sports the stats endpoint can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepSport {
    Running,
    Cycling,
    Hiking,
}

impl KeepSport {
    fn api_type(&self) -> &'static str {
        match self {
            KeepSport::Running => "running",
            KeepSport::Cycling => "cycling",
            KeepSport::Hiking => "hiking",
        }
    }

    fn log_path(&self) -> &'static str {
        match self {
            KeepSport::Running => "runninglog",
            KeepSport::Cycling => "cyclinglog",
            KeepSport::Hiking => "hikinglog",
        }
    }

    fn activity_type(&self) -> ActivityType {
        match self {
            KeepSport::Running => ActivityType::Run,
            KeepSport::Cycling => ActivityType::Ride,
            KeepSport::Hiking => ActivityType::Hike,
        }
    }

    fn from_log_path(path: &str) -> Option<Self> {
        match path {
            "runninglog" => Some(KeepSport::Running),
            "cyclinglog" => Some(KeepSport::Cycling),
            "hikinglog" => Some(KeepSport::Hiking),
            _ => None,
        }
    }
}

pub struct KeepProvider {
    http: reqwest::Client,
    base_url: String,
    mobile: String,
    password: String,
    sports: Vec<KeepSport>,
    tz: Tz,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    data: LoginData,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    data: StatsPage,
}

#[derive(Debug, Deserialize)]
struct StatsPage {
    #[serde(default)]
    records: Vec<StatsRecord>,
    #[serde(rename = "lastTimestamp", default)]
    last_timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct StatsRecord {
    #[serde(default)]
    logs: Vec<StatsLog>,
}

#[derive(Debug, Deserialize)]
struct StatsLog {
    stats: StatsEntry,
}

#[derive(Debug, Deserialize)]
struct StatsEntry {
    /// `"5898009e387e28303988f3b7_9223370441312156007_rn"`; the middle
    /// segment is the canonical id, the whole string addresses the log.
    id: String,
    #[serde(rename = "isDoubtful", default)]
    is_doubtful: bool,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    data: KeepLog,
}

#[derive(Debug, Deserialize)]
struct KeepLog {
    id: String,
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "endTime")]
    end_time: i64,
    /// Seconds in motion; a missing or zero value marks a broken log.
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    distance: f64,
    #[serde(rename = "heartRate", default)]
    heart_rate: Option<KeepHeartRate>,
    #[serde(rename = "rawDataURL", default)]
    raw_data_url: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    vendor: Option<KeepVendor>,
}

#[derive(Debug, Deserialize)]
struct KeepHeartRate {
    #[serde(rename = "averageHeartRate", default)]
    average_heart_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct KeepVendor {
    #[serde(default)]
    source: Option<String>,
}

/// One point of the raw blob; `timestamp` is centiseconds after start.
#[derive(Debug, Deserialize)]
struct RawPoint {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    timestamp: f64,
    #[serde(rename = "verticalAccuracy", default)]
    vertical_accuracy: Option<f64>,
}

/// base64 then gzip, holding a JSON point array.
fn decode_raw_blob(text: &str) -> Result<Vec<RawPoint>> {
    let compressed = BASE64
        .decode(text.trim())
        .map_err(|e| DecodeError::malformed("keep raw data", e.to_string()))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| DecodeError::malformed("keep raw data", e.to_string()))?;
    serde_json::from_slice(&json)
        .map_err(|e| DecodeError::malformed("keep raw data", e.to_string()).into())
}

fn raw_points_to_track(
    raw: &[RawPoint],
    start_ms: i64,
) -> std::result::Result<DecodedTrack, DecodeError> {
    let points = raw
        .iter()
        .filter_map(|p| {
            let ms = start_ms + (p.timestamp * 100.0) as i64;
            let time = Utc.timestamp_millis_opt(ms).single()?;
            let mut tp = TrackPoint::new(time, p.latitude, p.longitude);
            tp.elevation = p.vertical_accuracy;
            Some(tp)
        })
        .collect();
    DecodedTrack::from_points(points, SourceCrs::Gcj02, &[])
}

impl KeepProvider {
    pub fn new(mobile: String, password: String, sports: Vec<KeepSport>, tz: Tz) -> Self {
        let sports = if sports.is_empty() {
            vec![KeepSport::Running]
        } else {
            sports
        };
        Self {
            http: http_client(),
            base_url: "https://api.gotokeep.com".to_string(),
            mobile,
            password,
            sports,
            tz,
            token: None,
        }
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| SyncError::auth("keep: not authenticated"))
    }

    fn log_to_activity(
        &self,
        log: &KeepLog,
        sport: KeepSport,
        track: Option<&DecodedTrack>,
    ) -> Result<Activity> {
        if log.duration <= 0.0 {
            return Err(DecodeError::malformed("keep log", "missing duration").into());
        }
        let id = log
            .id
            .split('_')
            .nth(1)
            .and_then(|mid| mid.parse::<i64>().ok());
        let start_date = Utc
            .timestamp_millis_opt(log.start_time)
            .single()
            .ok_or_else(|| DecodeError::malformed("keep log", "bad startTime"))?;
        let end_date = Utc
            .timestamp_millis_opt(log.end_time)
            .single()
            .ok_or_else(|| DecodeError::malformed("keep log", "bad endTime"))?;
        let tz = time_utils::resolve_tz(log.timezone.as_deref(), self.tz);
        let activity_type = sport.activity_type();
        let average_heartrate = log
            .heart_rate
            .as_ref()
            .and_then(|h| h.average_heart_rate)
            .filter(|&bpm| bpm > 0.0);

        Ok(Activity {
            id: id.unwrap_or_else(|| Activity::id_from_start_time(start_date)),
            name: default_name(activity_type, "keep"),
            activity_type,
            subtype: None,
            start_date,
            start_date_local: time_utils::to_local(start_date, tz),
            end_date,
            end_date_local: time_utils::to_local(end_date, tz),
            distance: log.distance,
            moving_time: log.duration.round() as i64,
            elapsed_time: (log.end_time - log.start_time) / 1000,
            average_speed: log.distance / log.duration,
            average_heartrate,
            elevation_gain: track.and_then(|t| t.elevation_gain),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: log.region.clone().filter(|r| !r.is_empty()),
            source: "keep".to_string(),
        })
    }
}

/// Log ids do not name their sport; the adapter threads it through the
/// listing ref as `"<log_path>/<id>"`.
fn sport_path_of(provider_id: &str) -> &str {
    provider_id.split('/').next().unwrap_or("runninglog")
}

fn log_id_of(provider_id: &str) -> &str {
    provider_id
        .split_once('/')
        .map(|(_, id)| id)
        .unwrap_or(provider_id)
}

#[async_trait]
impl Provider for KeepProvider {
    fn name(&self) -> &'static str {
        "keep"
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
            .post(format!("{}/v1.1/users/login", self.base_url))
            .form(&[
                ("mobile", self.mobile.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "keep login").await?.json().await?;
        self.token = Some(login.data.token);
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let token = self.token()?.to_string();
        let mut refs = Vec::new();
        for sport in &self.sports {
            let mut last_date = 0i64;
            loop {
                let response = self
                    .http
                    .get(format!("{}/pd/v3/stats/detail", self.base_url))
                    .bearer_auth(&token)
                    .query(&[
                        ("dateUnit", "all".to_string()),
                        ("type", sport.api_type().to_string()),
                        ("lastDate", last_date.to_string()),
                    ])
                    .send()
                    .await?;
                let page: StatsResponse = check_response(response, "keep stats page")
                    .await?
                    .json()
                    .await?;
                for record in page.data.records {
                    for log in record.logs {
                        if log.stats.is_doubtful {
                            continue;
                        }
                        refs.push(ActivityRef::new(format!(
                            "{}/{}",
                            sport.log_path(),
                            log.stats.id
                        )));
                    }
                }
                last_date = page.data.last_timestamp;
                if last_date == 0 {
                    break;
                }
                // Upstream rate-limits eager listing.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let token = self.token()?.to_string();
        let response = self
            .http
            .get(format!(
                "{}/pd/v3/{}/{}",
                self.base_url,
                sport_path_of(&aref.provider_id),
                log_id_of(&aref.provider_id)
            ))
            .bearer_auth(&token)
            .send()
            .await?;
        let log: LogResponse = check_response(response, "keep log detail")
            .await?
            .json()
            .await?;
        let log = log.data;

        let mut track = None;
        let from_keep = log
            .vendor
            .as_ref()
            .and_then(|v| v.source.as_deref())
            .is_some_and(|s| s == "Keep");
        if let Some(url) = log.raw_data_url.as_deref().filter(|_| from_keep) {
            let response = self.http.get(url).send().await?;
            let blob = check_response(response, "keep raw data").await?.text().await?;
            let raw = decode_raw_blob(&blob)?;
            match raw_points_to_track(&raw, log.start_time) {
                Ok(t) => track = Some(t),
                Err(DecodeError::Empty) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let sport =
            KeepSport::from_log_path(sport_path_of(&aref.provider_id)).unwrap_or(KeepSport::Running);
        let activity = self.log_to_activity(&log, sport, track.as_ref())?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }
}
