// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! FIT decoding via fitparser.
//!
//! Record messages supply the point stream; the session message is
//! authoritative for totals, so a watch that smooths or corrects its own
//! distance wins over our haversine sum. A session with no GPS records
//! (treadmill) still decodes, with an empty point list.

use chrono::{DateTime, Duration, Utc};
use fitparser::profile::MesgNum;
use fitparser::{FitDataRecord, Value};

use crate::coords::SourceCrs;
use crate::error::DecodeError;
use crate::models::{DecodedTrack, TrackPoint};

const SEMICIRCLES_PER_DEGREE: f64 = 11_930_465.0;

/// A decoded FIT file: the track plus the session's sport labels.
#[derive(Debug)]
pub struct DecodedFit {
    pub track: DecodedTrack,
    pub sport: Option<String>,
    pub sub_sport: Option<String>,
}

pub fn decode_fit(bytes: &[u8], crs: SourceCrs) -> Result<DecodedFit, DecodeError> {
    let records = fitparser::from_bytes(bytes)
        .map_err(|e| DecodeError::malformed("fit", e.to_string()))?;

    let mut session: Option<&FitDataRecord> = None;
    let mut points = Vec::new();
    for rec in &records {
        match rec.kind() {
            MesgNum::Session if session.is_none() => session = Some(rec),
            MesgNum::Record => {
                if let Some(p) = record_point(rec) {
                    points.push(p);
                }
            }
            _ => {}
        }
    }

    let session = session
        .ok_or_else(|| DecodeError::unsupported("fit", "no session message"))?;
    let start_time = field_time(session, "start_time")
        .ok_or_else(|| DecodeError::unsupported("fit", "session missing start_time"))?;
    let elapsed = field_f64(session, "total_elapsed_time")
        .ok_or_else(|| DecodeError::unsupported("fit", "session missing total_elapsed_time"))?;
    let moving = field_f64(session, "total_moving_time")
        .or_else(|| field_f64(session, "total_timer_time"))
        .unwrap_or(elapsed);

    let mut track = match DecodedTrack::from_points(points, crs, &[]) {
        Ok(track) => track,
        Err(DecodeError::Empty) => trackless(start_time),
        Err(e) => return Err(e),
    };

    track.start_time = start_time;
    track.end_time = start_time + Duration::milliseconds((elapsed * 1000.0) as i64);
    track.elapsed_time = elapsed.round() as i64;
    track.moving_time = (moving.round() as i64).clamp(0, track.elapsed_time);
    if let Some(d) = field_f64(session, "total_distance") {
        track.distance = d;
    }
    track.average_speed = if track.moving_time > 0 {
        track.distance / track.moving_time as f64
    } else {
        0.0
    };
    if let Some(hr) = field_f64(session, "avg_heart_rate") {
        if hr > 0.0 && hr < 255.0 {
            track.average_heartrate = Some(hr);
        }
    }
    if let Some(gain) = field_f64(session, "total_ascent") {
        track.elevation_gain = Some(gain);
    }

    Ok(DecodedFit {
        track,
        sport: field_string(session, "sport"),
        sub_sport: field_string(session, "sub_sport"),
    })
}

fn trackless(start: DateTime<Utc>) -> DecodedTrack {
    DecodedTrack {
        points: Vec::new(),
        start_time: start,
        end_time: start,
        distance: 0.0,
        moving_time: 0,
        elapsed_time: 0,
        average_speed: 0.0,
        average_heartrate: None,
        elevation_gain: None,
        start_latlng: None,
        summary_polyline: String::new(),
    }
}

fn record_point(rec: &FitDataRecord) -> Option<TrackPoint> {
    let time = field_time(rec, "timestamp")?;
    let lat = field_f64(rec, "position_lat")? / SEMICIRCLES_PER_DEGREE;
    let lon = field_f64(rec, "position_long")? / SEMICIRCLES_PER_DEGREE;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    let mut point = TrackPoint::new(time, lat, lon);
    point.elevation =
        field_f64(rec, "enhanced_altitude").or_else(|| field_f64(rec, "altitude"));
    // 255 is the u8 invalid sentinel.
    point.heart_rate = field_f64(rec, "heart_rate").filter(|hr| *hr > 0.0 && *hr < 255.0);
    point.cadence = field_f64(rec, "cadence");
    Some(point)
}

fn field<'a>(rec: &'a FitDataRecord, name: &str) -> Option<&'a Value> {
    rec.fields().iter().find(|f| f.name() == name).map(|f| f.value())
}

fn field_f64(rec: &FitDataRecord, name: &str) -> Option<f64> {
    field(rec, name).and_then(value_f64)
}

fn field_time(rec: &FitDataRecord, name: &str) -> Option<DateTime<Utc>> {
    match field(rec, name)? {
        Value::Timestamp(t) => Some(t.with_timezone(&Utc)),
        _ => None,
    }
}

fn field_string(rec: &FitDataRecord, name: &str) -> Option<String> {
    match field(rec, name)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::SInt8(n) => Some(f64::from(*n)),
        Value::UInt8(n) | Value::UInt8z(n) | Value::Byte(n) | Value::Enum(n) => {
            Some(f64::from(*n))
        }
        Value::SInt16(n) => Some(f64::from(*n)),
        Value::UInt16(n) | Value::UInt16z(n) => Some(f64::from(*n)),
        Value::SInt32(n) => Some(f64::from(*n)),
        Value::UInt32(n) | Value::UInt32z(n) => Some(f64::from(*n)),
        Value::SInt64(n) => Some(*n as f64),
        Value::UInt64(n) | Value::UInt64z(n) => Some(*n as f64),
        Value::Float32(n) => Some(f64::from(*n)),
        Value::Float64(n) => Some(*n),
        _ => None,
    }
}
