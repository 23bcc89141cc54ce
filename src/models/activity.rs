// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Canonical activity model every provider adapter produces.
//!
//! One value per athletic effort, normalized to WGS-84 coordinates and UTC
//! instants. JSON serialization matches the viewer snapshot format:
//! durations as `HH:MM:SS`, datetimes as `YYYY-MM-DD HH:MM:SS`, absent
//! fields as `null`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A WGS-84 coordinate pair, serialized as `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl Serialize for LatLng {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.lat, self.lon].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LatLng {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [lat, lon] = <[f64; 2]>::deserialize(deserializer)?;
        Ok(LatLng { lat, lon })
    }
}

impl LatLng {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Database representation: `"lat,lon"`.
    pub fn to_db_string(&self) -> String {
        format!("{},{}", self.lat, self.lon)
    }

    /// Parse the database representation.
    pub fn from_db_string(s: &str) -> Option<Self> {
        let (lat, lon) = s.split_once(',')?;
        Some(LatLng {
            lat: lat.trim().parse().ok()?,
            lon: lon.trim().parse().ok()?,
        })
    }
}

/// Canonical activity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActivityType {
    Run,
    VirtualRun,
    Ride,
    VirtualRide,
    Walk,
    Hike,
    Swim,
    RockClimbing,
    Workout,
    #[default]
    #[serde(other)]
    Other,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Run => "Run",
            ActivityType::VirtualRun => "VirtualRun",
            ActivityType::Ride => "Ride",
            ActivityType::VirtualRide => "VirtualRide",
            ActivityType::Walk => "Walk",
            ActivityType::Hike => "Hike",
            ActivityType::Swim => "Swim",
            ActivityType::RockClimbing => "RockClimbing",
            ActivityType::Workout => "Workout",
            ActivityType::Other => "Other",
        }
    }

    /// Map a free-form provider label; unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "run" | "running" | "trail run" | "trailrun" | "trail_running" | "jogging" => {
                ActivityType::Run
            }
            "virtualrun" | "virtual_run" | "treadmill_running" => ActivityType::VirtualRun,
            "ride" | "cycling" | "biking" | "road_biking" | "ebikeride" | "gravelride"
            | "mountainbikeride" | "mtb" | "touringbicycle" | "racebike" => ActivityType::Ride,
            "virtualride" | "virtual_ride" | "indoor cycling" | "indoor_cycling" => {
                ActivityType::VirtualRide
            }
            "walk" | "walking" => ActivityType::Walk,
            "hike" | "hiking" => ActivityType::Hike,
            "swim" | "swimming" | "lap_swimming" | "open_water_swimming" => ActivityType::Swim,
            "rockclimbing" | "rock_climbing" | "climbing" => ActivityType::RockClimbing,
            "workout" | "strength_training" | "fitness_equipment" => ActivityType::Workout,
            _ => ActivityType::Other,
        }
    }

    /// Run-family types, for `--only-run` filtering.
    pub fn is_run(&self) -> bool {
        matches!(self, ActivityType::Run | ActivityType::VirtualRun)
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical activity record, one per normalized activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Provider id when numeric; otherwise derived from the start time.
    /// Stable across re-ingestion.
    #[serde(rename = "run_id")]
    pub id: i64,
    /// Human label; provider-supplied or "Run from <provider>"
    pub name: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    /// Provider's finer-grained label
    pub subtype: Option<String>,
    /// Start instant (UTC); immutable once persisted
    #[serde(with = "instant_format")]
    pub start_date: DateTime<Utc>,
    /// Wall-clock start at the activity location
    #[serde(with = "civil_format")]
    pub start_date_local: NaiveDateTime,
    #[serde(with = "instant_format")]
    pub end_date: DateTime<Utc>,
    #[serde(with = "civil_format")]
    pub end_date_local: NaiveDateTime,
    /// Meters
    pub distance: f64,
    /// Seconds, excluding pauses
    #[serde(with = "duration_format")]
    pub moving_time: i64,
    /// Wall-clock seconds
    #[serde(with = "duration_format")]
    pub elapsed_time: i64,
    /// Meters/second
    pub average_speed: f64,
    /// Beats/minute
    pub average_heartrate: Option<f64>,
    /// Meters climbed (positive deltas only)
    pub elevation_gain: Option<f64>,
    /// Absent for indoor activities
    pub start_latlng: Option<LatLng>,
    /// Encoded polyline, WGS-84, privacy-filtered before persistence.
    /// Empty for trackless activities.
    pub summary_polyline: String,
    /// Reverse-geocoded once per new id
    pub location_country: Option<String>,
    /// Provider tag: "strava" / "keep" / "garmin" / ...
    pub source: String,
}

impl PartialEq for Activity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Activity {}

impl Default for Activity {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: 0,
            name: String::new(),
            activity_type: ActivityType::Other,
            subtype: None,
            start_date: epoch,
            start_date_local: epoch.naive_utc(),
            end_date: epoch,
            end_date_local: epoch.naive_utc(),
            distance: 0.0,
            moving_time: 0,
            elapsed_time: 0,
            average_speed: 0.0,
            average_heartrate: None,
            elevation_gain: None,
            start_latlng: None,
            summary_polyline: String::new(),
            location_country: None,
            source: String::new(),
        }
    }
}

impl Activity {
    /// Deterministic id for providers without numeric activity ids:
    /// the start instant as epoch milliseconds.
    pub fn id_from_start_time(start: DateTime<Utc>) -> i64 {
        start.timestamp_millis()
    }

    /// Column projection for the activities table.
    pub fn to_row(&self) -> ActivityRow {
        ActivityRow {
            run_id: self.id,
            name: self.name.clone(),
            distance: self.distance,
            moving_time: self.moving_time,
            elapsed_time: self.elapsed_time,
            activity_type: self.activity_type.as_str().to_string(),
            subtype: self.subtype.clone(),
            start_date: crate::time_utils::format_instant(self.start_date),
            start_date_local: crate::time_utils::format_civil(self.start_date_local),
            end_date: crate::time_utils::format_instant(self.end_date),
            end_date_local: crate::time_utils::format_civil(self.end_date_local),
            location_country: self.location_country.clone(),
            summary_polyline: self.summary_polyline.clone(),
            average_heartrate: self.average_heartrate,
            average_speed: self.average_speed,
            elevation_gain: self.elevation_gain,
            start_latlng: self.start_latlng.map(|p| p.to_db_string()),
            source: self.source.clone(),
        }
    }
}

/// Flat column values for the `activities` table.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub run_id: i64,
    pub name: String,
    pub distance: f64,
    pub moving_time: i64,
    pub elapsed_time: i64,
    pub activity_type: String,
    pub subtype: Option<String>,
    pub start_date: String,
    pub start_date_local: String,
    pub end_date: String,
    pub end_date_local: String,
    pub location_country: Option<String>,
    pub summary_polyline: String,
    pub average_heartrate: Option<f64>,
    pub average_speed: f64,
    pub elevation_gain: Option<f64>,
    pub start_latlng: Option<String>,
    pub source: String,
}

mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secs: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::time_utils::format_hms(*secs))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::time_utils::parse_hms(&s).map_err(serde::de::Error::custom)
    }
}

mod instant_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        dt: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::time_utils::format_instant(*dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::time_utils::parse_instant(&s).map_err(serde::de::Error::custom)
    }
}

mod civil_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        dt: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::time_utils::format_civil(*dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::time_utils::parse_civil(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Activity {
        Activity {
            id: 1001,
            name: "Morning Run".to_string(),
            activity_type: ActivityType::Run,
            start_date: crate::time_utils::parse_instant("2024-01-15 06:30:00").unwrap(),
            start_date_local: crate::time_utils::parse_civil("2024-01-15 14:30:00").unwrap(),
            end_date: crate::time_utils::parse_instant("2024-01-15 06:56:00").unwrap(),
            end_date_local: crate::time_utils::parse_civil("2024-01-15 14:56:00").unwrap(),
            distance: 5000.0,
            moving_time: 1500,
            elapsed_time: 1560,
            average_speed: 5000.0 / 1500.0,
            source: "strava".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["run_id"], 1001);
        assert_eq!(json["type"], "Run");
        assert_eq!(json["moving_time"], "00:25:00");
        assert_eq!(json["elapsed_time"], "00:26:00");
        assert_eq!(json["start_date"], "2024-01-15 06:30:00");
        assert_eq!(json["start_date_local"], "2024-01-15 14:30:00");
        assert!(json["average_heartrate"].is_null());
        assert!(json["start_latlng"].is_null());
    }

    #[test]
    fn test_json_round_trip() {
        let activity = sample();
        let json = serde_json::to_string(&activity).unwrap();
        let back: Activity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, activity.id);
        assert_eq!(back.moving_time, 1500);
        assert_eq!(back.start_date, activity.start_date);
    }

    #[test]
    fn test_equality_is_by_id() {
        let a = sample();
        let mut b = sample();
        b.name = "Renamed".to_string();
        assert_eq!(a, b);
        b.id = 1002;
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_type_deserializes_to_other() {
        let v: ActivityType = serde_json::from_str("\"Snowboard\"").unwrap();
        assert_eq!(v, ActivityType::Other);
    }

    #[test]
    fn test_type_labels() {
        assert_eq!(ActivityType::from_label("running"), ActivityType::Run);
        assert_eq!(ActivityType::from_label("Indoor Cycling"), ActivityType::VirtualRide);
        assert_eq!(ActivityType::from_label("parachuting"), ActivityType::Other);
        assert!(ActivityType::VirtualRun.is_run());
        assert!(!ActivityType::Ride.is_run());
    }

    #[test]
    fn test_latlng_db_string() {
        let p = LatLng { lat: 39.9, lon: 116.4 };
        assert_eq!(p.to_db_string(), "39.9,116.4");
        assert_eq!(LatLng::from_db_string("39.9, 116.4"), Some(p));
        assert_eq!(LatLng::from_db_string("garbage"), None);
    }

    #[test]
    fn test_id_from_start_time() {
        let start = crate::time_utils::parse_instant("2024-01-15 06:30:00").unwrap();
        assert_eq!(Activity::id_from_start_time(start), start.timestamp() * 1000);
    }
}
