// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Codoon adapter.
//!
//! Every request carries a `signature` header: HMAC-SHA1 (base64) over
//! a pre-string assembled from the Authorization header value, fixed
//! device identifiers, the timestamp, the URL path, the body and the
//! decoded query string. GET requests sign with timestamp 0 and the
//! app's basic credentials; authenticated POSTs sign with the bearer
//! token and the epoch second. Listing pages through the legacy route
//! log; details come back as wall-clock civil times in the account's
//! base timezone. Records started before 2014-03-24 are GCJ-02,
//! anything later is already WGS-84.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tokio::sync::Mutex;

use crate::coords::SourceCrs;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::{align_heart_rate, Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, default_name, http_client, value_as_i64, ActivityRef, Capabilities, Detail,
    FetchedActivity, Provider,
};
use crate::time_utils;

type HmacSha1 = Hmac<Sha1>;

const SIGNING_KEY: &str = "ecc140ad6e1e12f7d972af04add2c7ee";
const APP_UA: &str = "CodoonSport(8.9.0 1170;Android 7;Sony XZ1)";
const DID: &str = "24-ffffffff-faac-3052-0033-c5870033c587";
const DAVINCI: &str = "0";
const CLIENT_ID: &str = "099cce28c05f6c39ad5e04e51ed60704";
const BASIC_AUTH: &str =
    "MDk5Y2NlMjhjMDVmNmMzOWFkNWUwNGU1MWVkNjA3MDQ6YzM5ZDNmYmVhMWU4NWJlY2VlNDFjMTk5N2FjZjBlMzY=";
const PAGE_LIMIT: u32 = 500;
/// Records started before this date arrive in GCJ-02.
const GCJ02_UNTIL: &str = "2014-03-24";

pub struct CodoonProvider {
    http: reqwest::Client,
    base_url: String,
    mobile: String,
    password: String,
    refresh_token: Option<String>,
    user_id: String,
    tz: Tz,
    gcj02_until: NaiveDate,
    access_token: Option<String>,
    /// log id → route id, filled at list time; details are keyed by
    /// route id but the canonical id is the log id.
    route_ids: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    user_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    log_list: Vec<LogEntry>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    log_id: i64,
    route_id: serde_json::Value,
    #[serde(default)]
    sports_type: i64,
}

#[derive(Debug, Deserialize)]
struct SingleLogResponse {
    data: RunRecord,
}

#[derive(Debug, Deserialize)]
struct RunRecord {
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: String,
    #[serde(default)]
    points: Vec<CodoonPoint>,
    /// Heart rate keyed by local-frame epoch second.
    #[serde(default)]
    heart_rate: Option<HashMap<String, f64>>,
    #[serde(default)]
    total_length: f64,
    #[serde(default)]
    total_time: f64,
    #[serde(default)]
    sports_type: i64,
}

#[derive(Debug, Deserialize)]
struct CodoonPoint {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    elevation: Option<f64>,
    time_stamp: String,
}

fn sports_type(code: i64) -> ActivityType {
    match code {
        0 => ActivityType::Hike,
        1 => ActivityType::Run,
        2 => ActivityType::Ride,
        _ => ActivityType::Other,
    }
}

fn make_signature(message: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(SIGNING_KEY.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// `query` must already be percent-decoded; `body` is signed verbatim.
fn presign(auth: &str, path: &str, body: &str, query: &str, timestamp: i64) -> String {
    format!(
        "Authorization={auth}&Davinci={DAVINCI}&Did={DID}&Timestamp={timestamp}\
         |path={path}|body={body}|{query}"
    )
}

fn sign(auth: &str, path: &str, body: &str, query: &str, timestamp: i64) -> String {
    make_signature(&presign(auth, path, body, query, timestamp))
}

/// Timestamps occasionally carry a fractional part; the wire format is
/// otherwise `%Y-%m-%dT%H:%M:%S`.
fn parse_codoon_time(s: &str) -> Result<NaiveDateTime> {
    let trimmed = s.split('.').next().unwrap_or(s);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| DecodeError::malformed("codoon record", format!("bad time {s:?}")).into())
}

fn id_string(v: &serde_json::Value) -> String {
    v.as_str()
        .map(str::to_string)
        .or_else(|| value_as_i64(v).map(|n| n.to_string()))
        .unwrap_or_default()
}

impl CodoonProvider {
    pub fn new(mobile: String, password: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://api.codoon.com".to_string(),
            mobile,
            password,
            refresh_token: None,
            user_id: String::new(),
            tz,
            gcj02_until: NaiveDate::parse_from_str(GCJ02_UNTIL, "%Y-%m-%d")
                .unwrap_or(NaiveDate::MIN),
            access_token: None,
            route_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_refresh_token(refresh_token: String, user_id: String, tz: Tz) -> Self {
        let mut provider = Self::new(String::new(), String::new(), tz);
        provider.refresh_token = Some(refresh_token);
        provider.user_id = user_id;
        provider
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn bearer(&self) -> Result<String> {
        self.access_token
            .as_deref()
            .map(|t| format!("Bearer {t}"))
            .ok_or_else(|| SyncError::auth("codoon: not authenticated"))
    }

    fn record_crs(&self, start_local: NaiveDateTime) -> SourceCrs {
        if start_local.date() < self.gcj02_until {
            SourceCrs::Gcj02
        } else {
            SourceCrs::Wgs84
        }
    }

    async fn refresh_access_token(&mut self, refresh_token: &str) -> Result<()> {
        let query = format!(
            "client_id={CLIENT_ID}&grant_type=refresh_token&refresh_token={refresh_token}&scope=user%2Csports"
        );
        // The signature sees the body verbatim but the query decoded.
        let decoded_query = query.replace("%2C", ",");
        let auth = format!("Basic {BASIC_AUTH}");
        let timestamp = Utc::now().timestamp();
        let response = self
            .http
            .post(format!("{}/token?{}", self.base_url, query))
            .header("authorization", &auth)
            .header("timestamp", timestamp.to_string())
            .header(
                "signature",
                sign(&auth, "/token", &query, &decoded_query, timestamp),
            )
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencode; charset=utf-8",
            )
            .header(reqwest::header::USER_AGENT, APP_UA)
            .header("did", DID)
            .header("davinci", DAVINCI)
            .body(query)
            .send()
            .await?;
        let token: TokenResponse = check_response(response, "codoon token refresh")
            .await?
            .json()
            .await
            .map_err(|_| SyncError::auth("codoon: refresh token expired"))?;
        self.access_token = Some(token.access_token);
        Ok(())
    }

    async fn login_by_phone(&mut self) -> Result<()> {
        let pairs = [
            ("client_id", CLIENT_ID),
            ("email", self.mobile.as_str()),
            ("grant_type", "password"),
            ("password", self.password.as_str()),
            ("scope", "user"),
        ];
        let decoded_query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let auth = format!("Basic {BASIC_AUTH}");
        let response = self
            .http
            .get(format!("{}/token", self.base_url))
            .query(&pairs)
            .header("authorization", &auth)
            .header("timestamp", "0")
            .header("signature", sign(&auth, "/token", "", &decoded_query, 0))
            .header(reqwest::header::USER_AGENT, APP_UA)
            .header("did", DID)
            .header("davinci", DAVINCI)
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "codoon login")
            .await?
            .json()
            .await?;
        if login.status.as_deref() == Some("Error") {
            return Err(SyncError::auth(format!(
                "codoon: {}",
                login.description.unwrap_or_else(|| "login failed".to_string())
            )));
        }
        if login.access_token.is_empty() {
            return Err(SyncError::auth("codoon: login returned no access token"));
        }
        self.refresh_token = Some(login.refresh_token);
        self.user_id = id_string(&login.user_id);
        self.access_token = Some(login.access_token);
        Ok(())
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
        what: &str,
    ) -> Result<T> {
        let body = payload.to_string();
        let auth = self.bearer()?;
        let timestamp = Utc::now().timestamp();
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("authorization", &auth)
            .header("timestamp", timestamp.to_string())
            .header("signature", sign(&auth, path, &body, "", timestamp))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/json; charset=utf-8",
            )
            .header(reqwest::header::USER_AGENT, APP_UA)
            .header("did", DID)
            .header("davinci", DAVINCI)
            .body(body)
            .send()
            .await?;
        Ok(check_response(response, what).await?.json().await?)
    }

    fn build_track(&self, record: &RunRecord, crs: SourceCrs) -> Result<Option<DecodedTrack>> {
        let mut points: Vec<TrackPoint> = record
            .points
            .iter()
            .filter_map(|p| {
                let civil = parse_codoon_time(&p.time_stamp).ok()?;
                let mut tp = TrackPoint::new(
                    time_utils::to_utc(civil, self.tz),
                    p.latitude,
                    p.longitude,
                );
                tp.elevation = p.elevation;
                Some(tp)
            })
            .collect();

        if let Some(series) = self.heart_rate_series(record) {
            align_heart_rate(&mut points, &series);
        }

        match DecodedTrack::from_points(points, crs, &[]) {
            Ok(track) => Ok(Some(track)),
            Err(DecodeError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Heart-rate keys are epoch seconds in the local frame; shifting by
    /// the zone offset lands them on the same axis as the points.
    fn heart_rate_series(&self, record: &RunRecord) -> Option<Vec<(DateTime<Utc>, f64)>> {
        let dict = record.heart_rate.as_ref()?;
        let mut series: Vec<(DateTime<Utc>, f64)> = dict
            .iter()
            .filter_map(|(key, &bpm)| {
                let local_epoch: i64 = key.trim().parse().ok()?;
                let civil = DateTime::from_timestamp(local_epoch, 0)?.naive_utc();
                Some((time_utils::to_utc(civil, self.tz), bpm))
            })
            .collect();
        if series.is_empty() {
            return None;
        }
        series.sort_by_key(|(t, _)| *t);
        Some(series)
    }

    fn to_activity(
        &self,
        log_id: i64,
        record: &RunRecord,
        track: Option<&DecodedTrack>,
    ) -> Result<Activity> {
        let start_str = record
            .start_time
            .as_deref()
            .ok_or_else(|| DecodeError::malformed("codoon record", "no start time"))?;
        let start_local = parse_codoon_time(start_str)?;
        let end_local = parse_codoon_time(&record.end_time)?;
        if record.total_time <= 0.0 {
            return Err(DecodeError::malformed("codoon record", "no total time").into());
        }
        let activity_type = sports_type(record.sports_type);
        let average_heartrate = record
            .heart_rate
            .as_ref()
            .filter(|dict| !dict.is_empty())
            .map(|dict| dict.values().sum::<f64>() / dict.len() as f64)
            .filter(|&bpm| bpm > 0.0);

        Ok(Activity {
            id: log_id,
            name: default_name(activity_type, "codoon"),
            activity_type,
            subtype: Some(activity_type.as_str().to_string()),
            start_date: time_utils::to_utc(start_local, self.tz),
            start_date_local: start_local,
            end_date: time_utils::to_utc(end_local, self.tz),
            end_date_local: end_local,
            distance: record.total_length,
            moving_time: record.total_time.round() as i64,
            elapsed_time: (end_local - start_local).num_seconds(),
            average_speed: record.total_length / record.total_time,
            average_heartrate,
            elevation_gain: track.and_then(|t| t.elevation_gain),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: None,
            source: "codoon".to_string(),
        })
    }
}

#[async_trait]
impl Provider for CodoonProvider {
    fn name(&self) -> &'static str {
        "codoon"
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
        match self.refresh_token.clone() {
            Some(token) => self.refresh_access_token(&token).await,
            None => self.login_by_phone().await,
        }
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let mut refs = Vec::new();
        let mut routes = self.route_ids.lock().await;
        let mut page = 1u32;
        loop {
            let payload = serde_json::json!({
                "limit": PAGE_LIMIT,
                "page": page,
                "user_id": self.user_id,
            });
            let list: ListResponse = self
                .post_json("/api/get_old_route_log", &payload, "codoon route log")
                .await?;
            for entry in &list.data.log_list {
                let provider_id = entry.log_id.to_string();
                let mut aref = ActivityRef::new(provider_id.clone());
                aref.type_hint = Some(sports_type(entry.sports_type));
                refs.push(aref);
                routes.insert(provider_id, id_string(&entry.route_id));
            }
            if !list.data.has_more {
                break;
            }
            page += 1;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let route_id = self
            .route_ids
            .lock()
            .await
            .get(&aref.provider_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("codoon {}", aref.provider_id)))?;
        let log_id: i64 = aref
            .provider_id
            .parse()
            .map_err(|_| SyncError::Internal(anyhow::anyhow!("bad codoon ref")))?;
        let single: SingleLogResponse = self
            .post_json(
                "/api/get_single_log",
                &serde_json::json!({ "route_id": route_id }),
                "codoon single log",
            )
            .await?;
        let record = single.data;

        let start_local = record
            .start_time
            .as_deref()
            .map(parse_codoon_time)
            .transpose()?
            .ok_or_else(|| DecodeError::malformed("codoon record", "no start time"))?;
        let track = self.build_track(&record, self.record_crs(start_local))?;
        let activity = self.to_activity(log_id, &record, track.as_ref())?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }
}
