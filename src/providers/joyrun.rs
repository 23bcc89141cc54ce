// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Joyrun adapter.
//!
//! Every request is double-signed: an MD5 digest over the sorted
//! form/query parameters plus a version-specific salt and the session
//! (uid, sid), sent once as the `signature` parameter and once as the
//! `_sign` header. Run records come back as stringified arrays (points
//! scaled by 1e6, heart rate, altitude) sampled at a fixed five-second
//! cadence, with pauses as (index, seconds) pairs.
//!
//! The upstream app occasionally records the same session twice a few
//! seconds apart; [`Provider::dedup`] collapses those onto the record
//! with the longest distance.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::coords::SourceCrs;
use crate::error::{Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack, Pause, TrackPoint};
use crate::providers::{
    check_response, default_name, http_client, value_as_i64, ActivityRef, Capabilities, Detail,
    FetchedActivity, Provider,
};
use crate::time_utils;

const SALT_V1: &str = "1fd6e28fd158406995f77727b35bf20a";
const SALT_V2: &str = "0C077B1E70F5FDDE6F497C1315687F9C";
/// Seconds between consecutive track points.
const POINT_INTERVAL_S: i64 = 5;

pub struct JoyrunProvider {
    http: reqwest::Client,
    base_url: String,
    phone: Option<String>,
    identifying_code: Option<String>,
    uid: Option<i64>,
    sid: Option<String>,
    /// Start times closer than this are one session recorded twice.
    dedup_threshold_s: i64,
    tz: Tz,
}

fn md5_upper(data: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize()).to_uppercase()
}

/// Sorted `key || value` pairs, then salt, then session. An absent
/// session contributes nothing.
fn presign_string(
    params: &BTreeMap<&'static str, String>,
    uid: Option<i64>,
    sid: Option<&str>,
    salt: &str,
) -> String {
    let mut pre = String::new();
    for (k, v) in params {
        pre.push_str(k);
        pre.push_str(v);
    }
    pre.push_str(salt);
    if let (Some(uid), Some(sid)) = (uid, sid) {
        pre.push_str(&uid.to_string());
        pre.push_str(sid);
    }
    pre
}

fn signature(
    params: &BTreeMap<&'static str, String>,
    uid: Option<i64>,
    sid: Option<&str>,
    salt: &str,
) -> String {
    md5_upper(&presign_string(params, uid, sid, salt))
}

/// The app sends its login cookie URL-encoded and lowercased.
fn ypcookie_value(uid: i64, sid: &str) -> String {
    format!("sid%3D{sid}%26uid%3D{uid}").to_lowercase()
}

/// `"[[39900000,116400000],[39901000,116401000]]"`, degrees scaled by
/// 1e6. Some payloads separate pairs with `]-[` instead of `],[`.
fn parse_content(content: &str) -> Vec<(f64, f64)> {
    if content.is_empty() {
        return Vec::new();
    }
    let fixed = content.replace("]-[", "],[");
    match serde_json::from_str::<Vec<[f64; 2]>>(&fixed) {
        Ok(pairs) => pairs
            .into_iter()
            .map(|[lat, lon]| (lat / 1_000_000.0, lon / 1_000_000.0))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable joyrun point content");
            Vec::new()
        }
    }
}

/// Stringified numeric series; index-aligned with the point list.
fn parse_series(raw: &str) -> Vec<Option<f64>> {
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        Ok(values) => values.iter().map(|v| v.as_f64()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable joyrun data series");
            Vec::new()
        }
    }
}

/// Upstream pause indices are 1-based relative to the gap they extend.
fn parse_pauses(raw: &[Vec<serde_json::Value>]) -> Vec<Pause> {
    raw.iter()
        .filter_map(|pair| {
            let index = value_as_i64(pair.first()?)?;
            let duration = value_as_i64(pair.get(1)?)?;
            if index < 1 {
                return None;
            }
            Some(Pause {
                index: (index - 1) as usize,
                duration_s: duration as f64,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    ret: String,
    #[serde(default)]
    msg: String,
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    sid: String,
    user: LoginUser,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    uid: i64,
}

#[derive(Debug, Deserialize)]
struct RunListResponse {
    #[serde(default)]
    datas: Vec<RunListEntry>,
}

#[derive(Debug, Deserialize)]
struct RunListEntry {
    fid: i64,
}

#[derive(Debug, Deserialize)]
struct RunInfoResponse {
    runrecord: RunRecord,
}

#[derive(Debug, Deserialize)]
struct RunRecord {
    fid: i64,
    starttime: i64,
    endtime: i64,
    meter: f64,
    second: i64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    heartrate: Option<String>,
    #[serde(default)]
    altitude: Option<String>,
    #[serde(default)]
    pause: Vec<Vec<serde_json::Value>>,
    #[serde(rename = "type", default)]
    type_code: i64,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    province: Option<String>,
}

fn type_of(code: i64) -> ActivityType {
    match code {
        0 => ActivityType::Hike,
        2 => ActivityType::Ride,
        _ => ActivityType::Run,
    }
}

impl JoyrunProvider {
    pub fn with_phone_code(phone: String, identifying_code: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://api.thejoyrun.com".to_string(),
            phone: Some(phone),
            identifying_code: Some(identifying_code),
            uid: None,
            sid: None,
            dedup_threshold_s: 10,
            tz,
        }
    }

    pub fn from_uid_sid(uid: i64, sid: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://api.thejoyrun.com".to_string(),
            phone: None,
            identifying_code: None,
            uid: Some(uid),
            sid: Some(sid),
            dedup_threshold_s: 10,
            tz,
        }
    }

    pub fn dedup_threshold(mut self, seconds: i64) -> Self {
        self.dedup_threshold_s = seconds;
        self
    }

    fn session(&self) -> Result<(i64, &str)> {
        match (self.uid, self.sid.as_deref()) {
            (Some(uid), Some(sid)) => Ok((uid, sid)),
            _ => Err(SyncError::auth("joyrun: not authenticated")),
        }
    }

    fn device_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Accept-Language", "en_US")
            .header("User-Agent", "okhttp/3.10.0")
            .header("MODELTYPE", "Xiaomi MI 5")
            .header("SYSVERSION", "8.0.0")
            .header("APPVERSION", "4.2.0")
    }

    fn session_headers(
        &self,
        builder: reqwest::RequestBuilder,
        uid: i64,
        sid: &str,
    ) -> reqwest::RequestBuilder {
        let cookie = format!("sid={sid}&uid={uid}");
        builder
            .header("ypcookie", cookie)
            .header("Cookie", format!("ypcookie={}", ypcookie_value(uid, sid)))
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        mut params: BTreeMap<&'static str, String>,
        what: &str,
    ) -> Result<T> {
        let (uid, sid) = self.session()?;
        params.insert("timestamp", Utc::now().timestamp().to_string());
        let v1 = signature(&params, Some(uid), Some(sid), SALT_V1);
        let v2 = signature(&params, Some(uid), Some(sid), SALT_V2);
        params.insert("signature", v1);

        let form: Vec<(&str, String)> = params.into_iter().collect();
        let builder = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("_sign", v2)
            .form(&form);
        let builder = self.session_headers(self.device_headers(builder), uid, sid);
        let response = builder.send().await?;
        Ok(check_response(response, what).await?.json().await?)
    }
}

#[async_trait]
impl Provider for JoyrunProvider {
    fn name(&self) -> &'static str {
        "joyrun"
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
        if self.uid.is_some() && self.sid.is_some() {
            return Ok(());
        }
        let (phone, code) = match (self.phone.as_ref(), self.identifying_code.as_ref()) {
            (Some(p), Some(c)) => (p.clone(), c.clone()),
            _ => return Err(SyncError::auth("joyrun: need uid+sid or phone+sms code")),
        };

        let mut params = BTreeMap::new();
        params.insert("phoneNumber", phone);
        params.insert("identifyingCode", code);
        params.insert("timestamp", Utc::now().timestamp().to_string());
        let v1 = signature(&params, None, None, SALT_V1);
        let v2 = signature(&params, None, None, SALT_V2);

        let mut query: Vec<(&str, String)> = params.into_iter().collect();
        query.push(("signature", v1));
        let builder = self
            .http
            .get(format!("{}/user/login/phonecode", self.base_url))
            .header("_sign", v2)
            .query(&query);
        let response = self.device_headers(builder).send().await?;
        let login: LoginResponse = check_response(response, "joyrun login")
            .await?
            .json()
            .await?;
        if login.ret != "0" {
            return Err(SyncError::auth(format!(
                "joyrun login rejected: {} {}",
                login.ret, login.msg
            )));
        }
        let data = login
            .data
            .ok_or_else(|| SyncError::auth("joyrun login: empty payload"))?;
        tracing::info!(uid = data.user.uid, "Logged in to joyrun");
        self.uid = Some(data.user.uid);
        self.sid = Some(data.sid);
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let mut params = BTreeMap::new();
        // year 0 = the full history in one page.
        params.insert("year", "0".to_string());
        let list: RunListResponse = self
            .signed_post("/userRunList.aspx", params, "joyrun run list")
            .await?;
        Ok(list
            .datas
            .into_iter()
            .map(|e| ActivityRef::new(e.fid.to_string()))
            .collect())
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let mut params = BTreeMap::new();
        params.insert("fid", aref.provider_id.clone());
        let info: RunInfoResponse = self
            .signed_post("/Run/GetInfo.aspx", params, "joyrun run detail")
            .await?;
        let record = info.runrecord;

        let track = build_track(&record)?;
        let activity = record_to_activity(&record, track.as_ref(), self.tz)?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }

    /// Collapse sessions the app recorded twice: starts within the
    /// threshold are one session, the longest distance wins.
    fn dedup(&self, batch: Vec<FetchedActivity>) -> Vec<FetchedActivity> {
        let mut kept: Vec<FetchedActivity> = Vec::with_capacity(batch.len());
        for candidate in batch {
            let twin = kept.iter().position(|k| {
                (k.activity.start_date - candidate.activity.start_date)
                    .num_seconds()
                    .abs()
                    <= self.dedup_threshold_s
            });
            match twin {
                Some(i) if candidate.activity.distance > kept[i].activity.distance => {
                    tracing::debug!(
                        kept = candidate.activity.id,
                        dropped = kept[i].activity.id,
                        "Collapsed duplicate joyrun session"
                    );
                    kept[i] = candidate;
                }
                Some(i) => {
                    tracing::debug!(
                        kept = kept[i].activity.id,
                        dropped = candidate.activity.id,
                        "Collapsed duplicate joyrun session"
                    );
                }
                None => kept.push(candidate),
            }
        }
        kept
    }
}

fn build_track(record: &RunRecord) -> Result<Option<DecodedTrack>> {
    let pairs = parse_content(record.content.as_deref().unwrap_or(""));
    if pairs.is_empty() {
        return Ok(None);
    }
    let heart_rates = parse_series(record.heartrate.as_deref().unwrap_or(""));
    let altitudes = parse_series(record.altitude.as_deref().unwrap_or(""));

    let points: Vec<TrackPoint> = pairs
        .iter()
        .enumerate()
        .filter_map(|(i, &(lat, lon))| {
            let time = Utc
                .timestamp_opt(record.starttime + POINT_INTERVAL_S * i as i64, 0)
                .single()?;
            let mut p = TrackPoint::new(time, lat, lon);
            p.elevation = altitudes.get(i).copied().flatten();
            p.heart_rate = heart_rates
                .get(i)
                .copied()
                .flatten()
                .filter(|&bpm| bpm > 0.0);
            Some(p)
        })
        .collect();

    let pauses = parse_pauses(&record.pause);
    match DecodedTrack::from_points(points, SourceCrs::Gcj02, &pauses) {
        Ok(track) => Ok(Some(track)),
        Err(crate::error::DecodeError::Empty) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn record_to_activity(
    record: &RunRecord,
    track: Option<&DecodedTrack>,
    tz: Tz,
) -> Result<Activity> {
    let start_date = Utc
        .timestamp_opt(record.starttime, 0)
        .single()
        .ok_or_else(|| SyncError::Internal(anyhow::anyhow!("bad joyrun starttime")))?;
    let end_date = Utc
        .timestamp_opt(record.endtime, 0)
        .single()
        .ok_or_else(|| SyncError::Internal(anyhow::anyhow!("bad joyrun endtime")))?;
    let activity_type = type_of(record.type_code);

    // Average over the full series; a negative mean is a sensor error
    // sentinel.
    let samples: Vec<f64> = parse_series(record.heartrate.as_deref().unwrap_or(""))
        .into_iter()
        .flatten()
        .collect();
    let average_heartrate = if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64).filter(|&bpm| bpm >= 0.0)
    };

    let location_country = match (
        record.city.as_deref().unwrap_or(""),
        record.province.as_deref().unwrap_or(""),
    ) {
        ("", "") => None,
        (city, province) => Some(format!("{city}:{province}")),
    };

    Ok(Activity {
        id: record.fid,
        name: default_name(activity_type, "joyrun"),
        activity_type,
        subtype: Some(activity_type.as_str().to_string()),
        start_date,
        start_date_local: time_utils::to_local(start_date, tz),
        end_date,
        end_date_local: time_utils::to_local(end_date, tz),
        distance: record.meter,
        moving_time: record.second,
        elapsed_time: record.endtime - record.starttime,
        average_speed: if record.second > 0 {
            record.meter / record.second as f64
        } else {
            0.0
        },
        average_heartrate,
        elevation_gain: track.and_then(|t| t.elevation_gain),
        start_latlng: track.and_then(|t| t.start_latlng),
        summary_polyline: track
            .map(|t| t.summary_polyline.clone())
            .unwrap_or_default(),
        location_country,
        source: "joyrun".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_vectors() {
        assert_eq!(md5_upper(""), "D41D8CD98F00B204E9800998ECF8427E");
        assert_eq!(md5_upper("abc"), "900150983CD24FB0D6963F7D28E17F72");
    }

    #[test]
    fn test_presign_string_sorts_and_appends_session() {
        let mut params = BTreeMap::new();
        params.insert("year", "0".to_string());
        params.insert("timestamp", "1700000000".to_string());
        let pre = presign_string(&params, Some(123), Some("deadbeef"), "SALT");
        // BTreeMap iterates sorted: timestamp before year.
        assert_eq!(pre, "timestamp1700000000year0SALT123deadbeef");

        let anon = presign_string(&params, None, None, "SALT");
        assert_eq!(anon, "timestamp1700000000year0SALT");
    }

    #[test]
    fn test_ypcookie_is_quoted_and_lowercased() {
        assert_eq!(ypcookie_value(42, "ABCDEF"), "sid%3dabcdef%26uid%3d42");
    }

    #[test]
    fn test_parse_content_handles_separator_quirk() {
        let points = parse_content("[[39900000,116400000]-[-34132812,-118126177]]");
        assert_eq!(points.len(), 2);
        assert!((points[0].0 - 39.9).abs() < 1e-9);
        assert!((points[1].1 + 118.126177).abs() < 1e-9);
        assert!(parse_content("").is_empty());
        assert!(parse_content("not json").is_empty());
    }

    #[test]
    fn test_parse_pauses_shifts_to_gap_index() {
        let raw = vec![
            vec![serde_json::json!("5"), serde_json::json!("30")],
            vec![serde_json::json!(9), serde_json::json!(12)],
            vec![serde_json::json!(0), serde_json::json!(99)],
        ];
        let pauses = parse_pauses(&raw);
        assert_eq!(pauses.len(), 2);
        assert_eq!(pauses[0].index, 4);
        assert_eq!(pauses[0].duration_s, 30.0);
        assert_eq!(pauses[1].index, 8);
    }

    fn record(fid: i64, starttime: i64, meter: f64) -> RunRecord {
        RunRecord {
            fid,
            starttime,
            endtime: starttime + 600,
            meter,
            second: 590,
            content: None,
            heartrate: None,
            altitude: None,
            pause: Vec::new(),
            type_code: 1,
            city: None,
            province: None,
        }
    }

    #[test]
    fn test_record_to_activity_summary_fields() {
        let mut r = record(77, 1_700_000_000, 2500.0);
        r.heartrate = Some("[0, 150, 160]".to_string());
        r.city = Some("西安".to_string());
        let a = record_to_activity(&r, None, chrono_tz::Asia::Shanghai).unwrap();
        assert_eq!(a.id, 77);
        assert_eq!(a.activity_type, ActivityType::Run);
        assert_eq!(a.moving_time, 590);
        assert_eq!(a.elapsed_time, 600);
        // Zeros count toward the average, matching the upstream app.
        assert!((a.average_heartrate.unwrap() - 310.0 / 3.0).abs() < 1e-9);
        assert_eq!(a.location_country.as_deref(), Some("西安:"));
    }

    #[test]
    fn test_dedup_keeps_longest_distance() {
        let provider = JoyrunProvider::from_uid_sid(1, "s".into(), chrono_tz::Asia::Shanghai);
        let batch = vec![
            FetchedActivity {
                activity: record_to_activity(&record(1, 1_700_000_000, 1000.0), None, chrono_tz::UTC)
                    .unwrap(),
                track: None,
                raw_file: None,
            },
            FetchedActivity {
                activity: record_to_activity(&record(2, 1_700_000_004, 2000.0), None, chrono_tz::UTC)
                    .unwrap(),
                track: None,
                raw_file: None,
            },
            FetchedActivity {
                activity: record_to_activity(&record(3, 1_700_009_000, 500.0), None, chrono_tz::UTC)
                    .unwrap(),
                track: None,
                raw_file: None,
            },
        ];
        let kept = provider.dedup(batch);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].activity.id, 2);
        assert_eq!(kept[1].activity.id, 3);
    }

    #[test]
    fn test_build_track_applies_interval_and_pause() {
        let mut r = record(9, 1_700_000_000, 100.0);
        r.content = Some("[[39900000,116400000],[39900100,116400100],[39900200,116400200]]".into());
        r.pause = vec![vec![serde_json::json!(2), serde_json::json!(60)]];
        let track = build_track(&r).unwrap().unwrap();
        // 2 intervals of 5s plus a 60s pause after the second point.
        assert_eq!((track.end_time - track.start_time).num_seconds(), 70);
    }
}
