// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! End-to-end runs against scripted providers that serve raw track
//! files, the way Garmin and Strava do. Covers the decode-normalize
//! path through the runner, raw-file capture, the cross-upload bridge,
//! composite (non-numeric) provider ids, and the batch dedup hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use stride_sync::config::Config;
use stride_sync::db::ActivityStore;
use stride_sync::decoders::TrackFormat;
use stride_sync::error::{Result, SyncError};
use stride_sync::models::{Activity, ActivityType};
use stride_sync::providers::{ActivityRef, Capabilities, Detail, FetchedActivity, Provider};
use stride_sync::services::{SyncOptions, SyncRunner};
use stride_sync::time_utils;

const GPX_EARLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="Garmin Connect" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><name>Coastal loop</name><type>running</type><trkseg>
    <trkpt lat="37.4219" lon="-122.0841"><time>2024-07-01T06:00:00Z</time></trkpt>
    <trkpt lat="37.4229" lon="-122.0841"><time>2024-07-01T06:01:00Z</time></trkpt>
    <trkpt lat="37.4239" lon="-122.0841"><time>2024-07-01T06:02:00Z</time></trkpt>
  </trkseg></trk>
</gpx>"#;

const GPX_LATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="Garmin Connect" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><name>Harbor loop</name><type>running</type><trkseg>
    <trkpt lat="37.8044" lon="-122.2712"><time>2024-07-02T06:00:00Z</time></trkpt>
    <trkpt lat="37.8054" lon="-122.2712"><time>2024-07-02T06:01:00Z</time></trkpt>
    <trkpt lat="37.8064" lon="-122.2712"><time>2024-07-02T06:02:00Z</time></trkpt>
  </trkseg></trk>
</gpx>"#;

/// Serves canned GPX files by provider id, like a raw-file provider.
struct GpxProvider {
    files: HashMap<String, &'static str>,
    fetch_calls: AtomicUsize,
}

impl GpxProvider {
    fn new(files: &[(&str, &'static str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(id, gpx)| (id.to_string(), *gpx))
                .collect(),
            fetch_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provider for GpxProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            fetch_concurrency: 2,
            ..Capabilities::default()
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        Ok(self.files.keys().map(ActivityRef::new).collect())
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gpx = self
            .files
            .get(&aref.provider_id)
            .ok_or_else(|| SyncError::NotFound(aref.provider_id.clone()))?;
        Ok(Detail::Track {
            format: TrackFormat::Gpx,
            bytes: gpx.as_bytes().to_vec(),
        })
    }
}

fn test_config(root: &std::path::Path) -> Config {
    Config {
        root: root.to_path_buf(),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_raw_gpx_provider_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = ActivityStore::in_memory().unwrap();
    let options = SyncOptions {
        with_gpx: true,
        collect_uploads: true,
        ..SyncOptions::default()
    };
    let runner = SyncRunner::new(&store, &config, options).with_geocoder(None);

    let mut provider = GpxProvider::new(&[("9001", GPX_EARLY), ("9002", GPX_LATE)]);
    let report = runner.run(&mut provider).await.unwrap();

    assert_eq!(report.synced, 2);
    assert_eq!(report.skipped, 0);
    // Inserted oldest first even though listing order is arbitrary.
    assert_eq!(report.new_ids, vec![9001, 9002]);

    let early = store.get(9001).unwrap().expect("9001 stored");
    assert_eq!(early.name, "Coastal loop");
    assert_eq!(early.activity_type, ActivityType::Run);
    assert_eq!(early.source, "fake");
    assert_eq!(
        time_utils::format_instant(early.start_date),
        "2024-07-01 06:00:00"
    );
    assert!(early.start_latlng.is_some());
    assert!(!early.summary_polyline.is_empty());
    assert!(early.distance > 200.0, "{}", early.distance);

    // Raw provider bytes are captured verbatim, not re-encoded.
    let captured = std::fs::read(config.track_dir("gpx").join("9001.gpx")).unwrap();
    assert_eq!(captured, GPX_EARLY.as_bytes());

    // The upload bridge carries the same raw file.
    assert_eq!(report.uploads.len(), 2);
    let upload = report.uploads.iter().find(|u| u.id == 9001).unwrap();
    assert_eq!(upload.format, TrackFormat::Gpx);
    assert_eq!(upload.bytes, GPX_EARLY.as_bytes());

    // And the snapshot was rewritten.
    let snapshot = std::fs::read_to_string(config.json_path()).unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(rows.len(), 2);

    // A second run fetches nothing: both numeric ids are known.
    let mut provider = GpxProvider::new(&[("9001", GPX_EARLY), ("9002", GPX_LATE)]);
    let report = runner.run(&mut provider).await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_composite_ids_rely_on_upsert_for_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = ActivityStore::in_memory().unwrap();
    let runner = SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);

    let mut provider = GpxProvider::new(&[("morning-loop", GPX_EARLY)]);
    let report = runner.run(&mut provider).await.unwrap();
    assert_eq!(report.synced, 1);
    // Non-numeric provider ids get a deterministic id from the start time.
    let expected = Utc
        .with_ymd_and_hms(2024, 7, 1, 6, 0, 0)
        .unwrap()
        .timestamp_millis();
    assert_eq!(report.new_ids, vec![expected]);

    // The id cannot be matched against the store from the listing alone,
    // so a second run re-fetches and the upsert absorbs the duplicate.
    let mut provider = GpxProvider::new(&[("morning-loop", GPX_EARLY)]);
    let report = runner.run(&mut provider).await.unwrap();
    assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.synced, 1);
    assert!(report.new_ids.is_empty());
    assert_eq!(store.count().unwrap(), 1);
}

/// Records the same session twice, like the Joyrun app after a crash,
/// and collapses the twins in its dedup hook.
struct TwinProvider;

fn twin_activity(id: i64, distance: f64) -> Activity {
    let start_date = time_utils::parse_instant("2024-08-01 06:00:00").unwrap();
    Activity {
        id,
        name: format!("Run {id}"),
        activity_type: ActivityType::Run,
        start_date,
        start_date_local: start_date.naive_utc(),
        end_date: start_date + chrono::Duration::seconds(1800),
        end_date_local: start_date.naive_utc() + chrono::Duration::seconds(1800),
        distance,
        moving_time: 1700,
        elapsed_time: 1800,
        average_speed: distance / 1700.0,
        source: "fake".to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for TwinProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn authenticate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        Ok(vec![ActivityRef::new("7001"), ActivityRef::new("7002")])
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let activity = match aref.provider_id.as_str() {
            "7001" => twin_activity(7001, 1000.0),
            "7002" => twin_activity(7002, 2000.0),
            other => return Err(SyncError::NotFound(other.to_string())),
        };
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track: None,
            raw_file: None,
        })))
    }

    fn dedup(&self, batch: Vec<FetchedActivity>) -> Vec<FetchedActivity> {
        let mut kept: Vec<FetchedActivity> = Vec::with_capacity(batch.len());
        for candidate in batch {
            let twin = kept.iter().position(|k| {
                (k.activity.start_date - candidate.activity.start_date)
                    .num_seconds()
                    .abs()
                    <= 10
            });
            match twin {
                Some(i) if candidate.activity.distance > kept[i].activity.distance => {
                    kept[i] = candidate;
                }
                Some(_) => {}
                None => kept.push(candidate),
            }
        }
        kept
    }
}

#[tokio::test]
async fn test_batch_dedup_hook_drops_the_shorter_twin() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = ActivityStore::in_memory().unwrap();
    let runner = SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);

    let report = runner.run(&mut TwinProvider).await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.skipped, 1);
    assert!(store.get(7002).unwrap().is_some());
    assert!(store.get(7001).unwrap().is_none());
}
