// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SQLite-backed activity store and the derived JSON snapshot.
//!
//! One logical table, `activities`, keyed by `run_id`. The store is the
//! authoritative record; the JSON snapshot under `src/static/` is derived
//! from it on every run.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Activity, ActivityType, LatLng};
use crate::privacy::PrivacyFilter;
use crate::services::geocode::Geocoder;
use crate::time_utils;

/// Column list shared by every SELECT that maps back to an [`Activity`].
const SELECT_COLUMNS: &str = "run_id, name, distance, moving_time, elapsed_time, \
     type, subtype, start_date, start_date_local, end_date, end_date_local, \
     location_country, summary_polyline, average_heartrate, average_speed, \
     elevation_gain, start_latlng, source";

/// Columns appended after the first schema version shipped; old databases
/// get them added on open.
const EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("subtype", "TEXT"),
    ("end_date", "TEXT"),
    ("end_date_local", "TEXT"),
    ("elevation_gain", "REAL"),
    ("start_latlng", "TEXT"),
    ("source", "TEXT"),
];

pub struct ActivityStore {
    conn: Connection,
}

impl ActivityStore {
    /// Open (or create) the store at `path`, creating parent directories
    /// and adding any columns missing from an older database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                run_id INTEGER PRIMARY KEY,
                name TEXT,
                distance REAL,
                moving_time INTEGER,
                elapsed_time INTEGER,
                type TEXT,
                subtype TEXT,
                start_date TEXT,
                start_date_local TEXT,
                end_date TEXT,
                end_date_local TEXT,
                location_country TEXT,
                summary_polyline TEXT,
                average_heartrate REAL,
                average_speed REAL,
                elevation_gain REAL,
                start_latlng TEXT,
                source TEXT
            );
            "#,
        )?;
        Self::add_missing_columns(conn)
    }

    /// Non-destructive schema evolution: add columns an older database
    /// lacks, with nullable defaults.
    fn add_missing_columns(conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(activities)")?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;

        for (name, column_type) in EVOLVED_COLUMNS {
            if !existing.contains(*name) {
                conn.execute(
                    &format!("ALTER TABLE activities ADD COLUMN {name} {column_type}"),
                    [],
                )?;
                tracing::info!(column = name, "Added missing column to activities table");
            }
        }
        Ok(())
    }

    /// Every stored id.
    pub fn known_ids(&self) -> Result<HashSet<i64>> {
        let mut stmt = self.conn.prepare("SELECT run_id FROM activities")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }

    /// Max `start_date` across all rows, or `None` when the store is empty.
    ///
    /// The wire format sorts lexicographically in chronological order, so
    /// `MAX` on the text column is correct.
    pub fn latest_start_date(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<String> =
            self.conn
                .query_row("SELECT MAX(start_date) FROM activities", [], |row| {
                    row.get(0)
                })?;
        match max {
            Some(s) => Ok(Some(time_utils::parse_instant(&s).map_err(|e| {
                anyhow::anyhow!("unparseable start_date {s:?} in store: {e}")
            })?)),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn exists(&self, id: i64) -> rusqlite::Result<bool> {
        self.conn
            .prepare("SELECT 1 FROM activities WHERE run_id = ?1 LIMIT 1")?
            .exists(params![id])
    }

    /// Insert or update one activity. Returns `true` when a new row was
    /// created.
    ///
    /// Insertion reverse-geocodes the start point (best effort); updates
    /// touch only the mutable fields, leaving `start_date` and
    /// `location_country` as first ingested.
    pub async fn upsert(&self, activity: &Activity, geocoder: Option<&Geocoder>) -> Result<bool> {
        if self.exists(activity.id)? {
            self.update(activity)?;
            return Ok(false);
        }

        let mut activity = activity.clone();
        let needs_country = match activity.location_country.as_deref() {
            None | Some("") => true,
            // Country-only values get another chance at a full address.
            Some("China") => true,
            Some(_) => false,
        };
        if needs_country {
            if let (Some(geocoder), Some(point)) = (geocoder, activity.start_latlng) {
                if let Some(country) = geocoder.reverse(point).await {
                    activity.location_country = Some(country);
                }
            }
        }
        self.insert(&activity)?;
        Ok(true)
    }

    fn insert(&self, activity: &Activity) -> Result<()> {
        let row = activity.to_row();
        self.conn.execute(
            "INSERT INTO activities (run_id, name, distance, moving_time, elapsed_time, \
             type, subtype, start_date, start_date_local, end_date, end_date_local, \
             location_country, summary_polyline, average_heartrate, average_speed, \
             elevation_gain, start_latlng, source) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                row.run_id,
                row.name,
                row.distance,
                row.moving_time,
                row.elapsed_time,
                row.activity_type,
                row.subtype,
                row.start_date,
                row.start_date_local,
                row.end_date,
                row.end_date_local,
                row.location_country,
                row.summary_polyline,
                row.average_heartrate,
                row.average_speed,
                row.elevation_gain,
                row.start_latlng,
                row.source,
            ],
        )?;
        Ok(())
    }

    fn update(&self, activity: &Activity) -> Result<()> {
        let row = activity.to_row();
        self.conn.execute(
            "UPDATE activities SET name = ?1, distance = ?2, moving_time = ?3, \
             elapsed_time = ?4, type = ?5, subtype = ?6, average_heartrate = ?7, \
             average_speed = ?8, elevation_gain = ?9, summary_polyline = ?10 \
             WHERE run_id = ?11",
            params![
                row.name,
                row.distance,
                row.moving_time,
                row.elapsed_time,
                row.activity_type,
                row.subtype,
                row.average_heartrate,
                row.average_speed,
                row.elevation_gain,
                row.summary_polyline,
                row.run_id,
            ],
        )?;
        Ok(())
    }

    /// Fetch one activity by id.
    pub fn get(&self, id: i64) -> Result<Option<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM activities WHERE run_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], activity_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All activities ordered by local start time, excluding rows with no
    /// meaningful distance.
    pub fn all_ordered(&self) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM activities WHERE distance > 0.1 \
             ORDER BY start_date_local"
        ))?;
        let activities = stmt
            .query_map([], activity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(activities)
    }

    /// Write the JSON snapshot: all activities ordered by
    /// `start_date_local`, each with its derived `streak`.
    ///
    /// When `filter_on_export` is set the privacy filter runs here (it
    /// already ran before upsert otherwise). The file is written via a
    /// temp-and-rename so readers never observe a partial snapshot.
    pub fn export_json(
        &self,
        path: &Path,
        privacy: &PrivacyFilter,
        filter_on_export: bool,
    ) -> Result<()> {
        let activities = self.all_ordered()?;

        let mut snapshot = Vec::with_capacity(activities.len());
        let mut streak = 0u32;
        let mut last_date: Option<NaiveDate> = None;
        for mut activity in activities {
            let date = activity.start_date_local.date();
            streak = match last_date {
                Some(prev) if date == prev => streak,
                Some(prev) if prev.succ_opt() == Some(date) => streak + 1,
                _ => 1,
            };
            last_date = Some(date);
            if filter_on_export {
                activity.summary_polyline = privacy.filter(&activity.summary_polyline);
            }
            snapshot.push(SnapshotRow { activity, streak });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&snapshot).map_err(anyhow::Error::from)?)?;
        fs::rename(&tmp, path)?;
        tracing::info!(count = snapshot.len(), path = %path.display(), "Wrote activities snapshot");
        Ok(())
    }

    /// Ids of Run-family activities, for `--only-run` bridge filtering.
    pub fn run_ids(&self) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id FROM activities WHERE type IN ('Run', 'VirtualRun')")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }
}

/// One snapshot entry: the activity plus its consecutive-day streak.
#[derive(Serialize)]
struct SnapshotRow {
    #[serde(flatten)]
    activity: Activity,
    streak: u32,
}

fn activity_from_row(row: &rusqlite::Row) -> rusqlite::Result<Activity> {
    let parse_err = |idx: usize, e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    };

    let start_date_s: String = row.get(7)?;
    let start_date = time_utils::parse_instant(&start_date_s).map_err(|e| parse_err(7, e))?;
    let start_local_s: String = row.get(8)?;
    let start_date_local = time_utils::parse_civil(&start_local_s).map_err(|e| parse_err(8, e))?;

    let elapsed_time: i64 = row.get(4)?;
    // Databases that predate the end-date columns fall back to
    // start + elapsed.
    let end_date = match row.get::<_, Option<String>>(9)? {
        Some(s) => time_utils::parse_instant(&s).map_err(|e| parse_err(9, e))?,
        None => start_date + Duration::seconds(elapsed_time),
    };
    let end_date_local = match row.get::<_, Option<String>>(10)? {
        Some(s) => time_utils::parse_civil(&s).map_err(|e| parse_err(10, e))?,
        None => start_date_local + Duration::seconds(elapsed_time),
    };

    let type_s: Option<String> = row.get(5)?;

    Ok(Activity {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        distance: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
        moving_time: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        elapsed_time,
        activity_type: type_s
            .as_deref()
            .map(ActivityType::from_label)
            .unwrap_or_default(),
        subtype: row.get(6)?,
        start_date,
        start_date_local,
        end_date,
        end_date_local,
        location_country: row.get(11)?,
        summary_polyline: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
        average_heartrate: row.get(13)?,
        average_speed: row.get::<_, Option<f64>>(14)?.unwrap_or(0.0),
        elevation_gain: row.get(15)?,
        start_latlng: row
            .get::<_, Option<String>>(16)?
            .as_deref()
            .and_then(LatLng::from_db_string),
        source: row.get::<_, Option<String>>(17)?.unwrap_or_default(),
    })
}
