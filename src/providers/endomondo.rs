// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Endomondo export adapter.
//!
//! Endomondo shut down in 2020; the only source left is the GDPR
//! takeout, a `Workouts/` directory of JSON files. Each file is an
//! array of single-key objects that merge into one record. The id is
//! rebuilt from the file name (digits survive, separators are dropped);
//! timestamps in the export are UTC civil with fractional seconds.
//! Location samples hide two levels down: each point is an array of
//! attribute objects whose `location` is a nested lat/lon pair.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::coords;
use crate::error::{DecodeError, Result};
use crate::models::{Activity, ActivityType, LatLng};
use crate::providers::{
    default_name, ActivityRef, Capabilities, Detail, FetchedActivity, Provider,
};
use crate::time_utils;

pub struct EndomondoProvider {
    dir: PathBuf,
    tz: Tz,
}

/// File name up to the first dot, with the separators the export mixes
/// in (spaces, underscores, hyphens) removed.
fn derive_id(file_name: &str) -> Option<i64> {
    let stem = file_name.split('.').next().unwrap_or(file_name);
    let cleaned: String = stem
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect();
    cleaned.parse().ok()
}

fn sport_type(label: Option<&str>) -> ActivityType {
    let Some(label) = label else {
        return ActivityType::Run;
    };
    let lower = label.to_ascii_lowercase();
    if lower.contains("running") {
        ActivityType::Run
    } else if lower.contains("cycling") || lower.contains("biking") {
        ActivityType::Ride
    } else if lower.contains("walking") {
        ActivityType::Walk
    } else if lower.contains("hiking") {
        ActivityType::Hike
    } else {
        ActivityType::from_label(&lower)
    }
}

/// Each point is an array of attribute objects; `location` nests the
/// pair as `[[{"latitude": ..}, {"longitude": ..}]]`.
fn location_points(merged: &serde_json::Map<String, Value>) -> Vec<LatLng> {
    let Some(points) = merged.get("points").and_then(Value::as_array) else {
        return Vec::new();
    };
    points
        .iter()
        .filter_map(Value::as_array)
        .flat_map(|attrs| attrs.iter())
        .filter_map(|attr| {
            let pair = attr.get("location")?.get(0)?.as_array()?;
            let lat = pair.first()?.get("latitude")?.as_f64()?;
            let lon = pair.get(1)?.get("longitude")?.as_f64()?;
            Some(LatLng::new(lat, lon))
        })
        .collect()
}

fn parse_export_time(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|_| DecodeError::malformed("endomondo export", format!("bad time {s:?}")).into())
}

impl EndomondoProvider {
    pub fn new(dir: PathBuf, tz: Tz) -> Self {
        Self { dir, tz }
    }

    fn to_activity(
        &self,
        file_name: &str,
        merged: &serde_json::Map<String, Value>,
    ) -> Result<Activity> {
        let start_str = merged
            .get("start_time")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::malformed("endomondo export", "no start_time"))?;
        let end_str = merged
            .get("end_time")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::malformed("endomondo export", "no end_time"))?;
        let start_date = Utc.from_utc_datetime(&parse_export_time(start_str)?);
        let end_date = Utc.from_utc_datetime(&parse_export_time(end_str)?);

        let duration = merged
            .get("duration_s")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if duration <= 0.0 {
            return Err(DecodeError::malformed("endomondo export", "no duration").into());
        }
        let distance = merged
            .get("distance_km")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            * 1000.0;
        let moving_time = duration.round() as i64;

        let points = location_points(merged);
        let activity_type = sport_type(merged.get("sport").and_then(Value::as_str));
        let id = derive_id(file_name)
            .unwrap_or_else(|| Activity::id_from_start_time(start_date));

        Ok(Activity {
            id,
            name: default_name(activity_type, "endomondo"),
            activity_type,
            subtype: Some(activity_type.as_str().to_string()),
            start_date,
            start_date_local: time_utils::to_local(start_date, self.tz),
            end_date,
            end_date_local: time_utils::to_local(end_date, self.tz),
            distance,
            moving_time,
            elapsed_time: moving_time,
            average_speed: distance / duration,
            average_heartrate: None,
            elevation_gain: None,
            start_latlng: points.first().copied(),
            summary_polyline: if points.is_empty() {
                String::new()
            } else {
                coords::encode_polyline(points)
            },
            location_country: None,
            source: "endomondo".to_string(),
        })
    }
}

#[async_trait]
impl Provider for EndomondoProvider {
    fn name(&self) -> &'static str {
        "endomondo"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    async fn authenticate(&mut self) -> Result<()> {
        // Offline source: the directory standing in for credentials.
        tokio::fs::metadata(&self.dir).await?;
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.into_iter().map(ActivityRef::new).collect())
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let path = self.dir.join(&aref.provider_id);
        let bytes = tokio::fs::read(&path).await?;
        let entries: Vec<serde_json::Map<String, Value>> = serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::malformed("endomondo export", e.to_string()))?;
        let mut merged = serde_json::Map::new();
        for entry in entries {
            merged.extend(entry);
        }
        let activity = self.to_activity(&aref.provider_id, &merged)?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track: None,
            raw_file: None,
        })))
    }
}
