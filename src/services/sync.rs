// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sync orchestrator: drives one provider through the full pipeline.
//!
//! One run walks a fixed sequence of states:
//! 1. Authenticate against the provider.
//! 2. List upstream activities since the incremental cursor.
//! 3. Subtract ids the store already has; fetch the rest oldest-first,
//!    bounded by the provider's tolerated concurrency.
//! 4. Normalize, dedup, privacy-filter, upsert.
//! 5. Rewrite the JSON snapshot.
//!
//! Auth failures and ids that stay broken after the retry budget abort
//! the run; rows upserted before the abort are kept, and the next run
//! resumes from the persisted cursor.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};

use crate::config::Config;
use crate::db::ActivityStore;
use crate::decoders::{write_gpx, TrackFormat};
use crate::error::{Result, SyncError};
use crate::privacy::PrivacyFilter;
use crate::providers::{ActivityRef, FetchedActivity, Provider};
use crate::services::geocode::Geocoder;

/// Listing restarts this many days before the newest stored activity, to
/// catch records the provider corrected after we first saw them.
const SAFETY_OVERLAP_DAYS: i64 = 7;

/// Fetch attempts per activity before the run is declared failed.
const MAX_ATTEMPTS: u32 = 3;

/// Rate-limit sleeps tolerated per activity.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Per-run options, straight from the CLI flags.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Capture raw GPX bytes (or synthesize GPX for point-stream
    /// providers) under `GPX_OUT/`.
    pub with_gpx: bool,
    pub with_tcx: bool,
    pub with_fit: bool,
    /// Keep only Run-family activities.
    pub only_run: bool,
    /// Retain new activities' track bytes in the report, for the
    /// cross-upload bridge.
    pub collect_uploads: bool,
}

/// A new activity's raw track, retained for cross-upload.
#[derive(Debug)]
pub struct NewTrack {
    pub id: i64,
    pub format: TrackFormat,
    pub bytes: Vec<u8>,
}

/// What one run accomplished.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Activities upserted (new or updated).
    pub synced: usize,
    /// Work-set entries that did not make it into the store: decode
    /// failures, vanished ids, dedup losses, type filtering.
    pub skipped: usize,
    /// Ids inserted for the first time this run, in upsert order.
    pub new_ids: Vec<i64>,
    /// Track files of new activities, when [`SyncOptions::collect_uploads`]
    /// asked for them.
    pub uploads: Vec<NewTrack>,
}

/// Counts reported by an upload sink after pushing a batch of tracks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Drives one provider through authenticate, list, fetch, upsert, export.
pub struct SyncRunner<'a> {
    store: &'a ActivityStore,
    config: &'a Config,
    options: SyncOptions,
    privacy: PrivacyFilter,
    geocoder: Option<Geocoder>,
    backoff_base: Duration,
}

impl<'a> SyncRunner<'a> {
    pub fn new(store: &'a ActivityStore, config: &'a Config, options: SyncOptions) -> Self {
        Self {
            store,
            config,
            options,
            privacy: PrivacyFilter::from_config(config),
            geocoder: Some(Geocoder::new()),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Replace or disable reverse geocoding (tests, offline runs).
    pub fn with_geocoder(mut self, geocoder: Option<Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    #[cfg(test)]
    fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Run the whole pipeline for one provider.
    pub async fn run(&self, provider: &mut dyn Provider) -> Result<SyncReport> {
        let source = provider.name();
        tracing::info!(source, "Starting sync");

        provider.authenticate().await?;

        let since = self.since()?;
        let refs = provider.list_activity_ids(since).await?;
        tracing::info!(source, listed = refs.len(), since = ?since, "Listed activities");

        let known = self.store.known_ids()?;
        let mut work: Vec<ActivityRef> = refs
            .into_iter()
            .filter(|r| {
                // Only numeric provider ids can be matched against the
                // store here; composite ids are caught by the idempotent
                // upsert instead.
                r.provider_id
                    .parse::<i64>()
                    .map_or(true, |id| !known.contains(&id))
            })
            .collect();

        // Oldest first, so an interrupted run leaves the store consistent
        // with a prefix of real history. Refs without a start hint sort
        // ahead of hinted ones.
        work.sort_by_key(|r| r.start_hint);
        let work_len = work.len();
        tracing::info!(source, work = work_len, "Fetching activity details");

        let shared: &dyn Provider = provider;
        let concurrency = shared.capabilities().fetch_concurrency.max(1);
        let results: Vec<(ActivityRef, Result<FetchedActivity>)> = stream::iter(work)
            .map(|aref| async move {
                let outcome = self.fetch_one(shared, &aref).await;
                (aref, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut batch = Vec::with_capacity(results.len());
        for (aref, outcome) in results {
            match outcome {
                Ok(fetched) => batch.push(fetched),
                Err(SyncError::Decode(e)) => {
                    tracing::warn!(source, id = %aref.provider_id, error = %e, "Skipping undecodable activity");
                }
                Err(SyncError::NotFound(what)) => {
                    tracing::warn!(source, id = %aref.provider_id, what, "Activity gone upstream; skipping");
                }
                Err(e) => return Err(e),
            }
        }

        let mut batch = shared.dedup(batch);
        if self.options.only_run {
            batch.retain(|f| f.activity.activity_type.is_run());
        }
        // buffer_unordered scrambles completion order; restore it.
        batch.sort_by_key(|f| f.activity.start_date);

        if self.config.ignore_before_saving {
            for fetched in &mut batch {
                fetched.activity.summary_polyline =
                    self.privacy.filter(&fetched.activity.summary_polyline);
            }
        }

        let mut report = SyncReport::default();
        for fetched in batch {
            match self
                .store
                .upsert(&fetched.activity, self.geocoder.as_ref())
                .await
            {
                Ok(was_new) => {
                    progress_mark(if was_new { '+' } else { '.' });
                    report.synced += 1;
                    if was_new {
                        report.new_ids.push(fetched.activity.id);
                    }
                    self.capture(&fetched)?;
                    if was_new && self.options.collect_uploads {
                        if let Some(upload) = upload_track(&fetched) {
                            report.uploads.push(upload);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(source, id = fetched.activity.id, error = %e, "Upsert failed; continuing");
                }
            }
        }
        println!();
        report.skipped = work_len.saturating_sub(report.synced);

        self.store.export_json(
            &self.config.json_path(),
            &self.privacy,
            !self.config.ignore_before_saving,
        )?;

        println!("{} synced, {} skipped", report.synced, report.skipped);
        tracing::info!(
            source,
            synced = report.synced,
            skipped = report.skipped,
            new = report.new_ids.len(),
            "Sync finished"
        );
        Ok(report)
    }

    /// Incremental cursor: the newest stored start minus the overlap.
    fn since(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .latest_start_date()?
            .map(|latest| latest - chrono::Duration::days(SAFETY_OVERLAP_DAYS)))
    }

    /// Fetch and normalize one activity, absorbing rate limits and
    /// retrying transient failures with exponential backoff.
    async fn fetch_one(
        &self,
        provider: &dyn Provider,
        aref: &ActivityRef,
    ) -> Result<FetchedActivity> {
        let mut backoff = self.backoff_base;
        let mut attempts = 0u32;
        let mut rate_limit_hits = 0u32;
        loop {
            match provider.fetch_detail(aref).await {
                Ok(detail) => return provider.normalize(aref, detail),
                Err(SyncError::RateLimited { retry_after }) => {
                    rate_limit_hits += 1;
                    if rate_limit_hits > MAX_RATE_LIMIT_RETRIES {
                        return Err(SyncError::rate_limited(retry_after));
                    }
                    tracing::warn!(
                        id = %aref.provider_id,
                        retry_after_s = retry_after.as_secs(),
                        "Rate limited; sleeping"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(e);
                    }
                    tracing::warn!(
                        id = %aref.provider_id,
                        error = %e,
                        attempt = attempts,
                        "Transient fetch failure; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write configured track artifacts for one activity. Raw provider
    /// bytes are written as-is; point-stream providers get a synthesized
    /// GPX when `--with-gpx` asked for one.
    fn capture(&self, fetched: &FetchedActivity) -> Result<()> {
        let id = fetched.activity.id;
        if let Some((format, bytes)) = &fetched.raw_file {
            if self.wants(*format) {
                self.write_track_file(id, format.extension(), bytes)?;
            }
            return Ok(());
        }
        if self.options.with_gpx {
            if let Some(track) = &fetched.track {
                let gpx = write_gpx(
                    track,
                    &fetched.activity.name,
                    Some(fetched.activity.activity_type.as_str()),
                    &fetched.activity.source,
                )?;
                self.write_track_file(id, "gpx", gpx.as_bytes())?;
            }
        }
        Ok(())
    }

    fn wants(&self, format: TrackFormat) -> bool {
        match format {
            TrackFormat::Gpx => self.options.with_gpx,
            TrackFormat::Tcx => self.options.with_tcx,
            TrackFormat::Fit => self.options.with_fit,
        }
    }

    /// Atomic `<id>.<ext>` write: temp file in the same directory, then
    /// rename, so readers never observe partial tracks.
    fn write_track_file(&self, id: i64, ext: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.config.track_dir(ext);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{id}.{ext}"));
        let tmp = dir.join(format!("{id}.{ext}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), "Captured track file");
        Ok(())
    }
}

/// Track bytes for the cross-upload bridge: the provider's own file when
/// it served one, else a synthesized GPX from the decoded points.
fn upload_track(fetched: &FetchedActivity) -> Option<NewTrack> {
    let id = fetched.activity.id;
    if let Some((format, bytes)) = &fetched.raw_file {
        return Some(NewTrack {
            id,
            format: *format,
            bytes: bytes.clone(),
        });
    }
    let track = fetched.track.as_ref()?;
    let gpx = write_gpx(
        track,
        &fetched.activity.name,
        Some(fetched.activity.activity_type.as_str()),
        &fetched.activity.source,
    )
    .ok()?;
    Some(NewTrack {
        id,
        format: TrackFormat::Gpx,
        bytes: gpx.into_bytes(),
    })
}

fn progress_mark(mark: char) {
    print!("{mark}");
    std::io::stdout().flush().ok();
}

/// Size-checked read of a captured track file; partial leftovers from a
/// crashed run read as absent.
pub fn read_captured(dir: &Path, id: i64, ext: &str) -> Option<Vec<u8>> {
    let path = dir.join(format!("{id}.{ext}"));
    match std::fs::read(&path) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::models::{Activity, ActivityType, DecodedTrack, TrackPoint};
    use crate::providers::Detail;

    fn activity(id: i64, start: &str, activity_type: ActivityType) -> Activity {
        let start_date = crate::time_utils::parse_instant(start).unwrap();
        Activity {
            id,
            name: format!("Workout {id}"),
            activity_type,
            start_date,
            start_date_local: start_date.naive_utc(),
            end_date: start_date + chrono::Duration::seconds(1800),
            end_date_local: start_date.naive_utc() + chrono::Duration::seconds(1800),
            distance: 5000.0,
            moving_time: 1700,
            elapsed_time: 1800,
            average_speed: 5000.0 / 1700.0,
            source: "fake".to_string(),
            ..Default::default()
        }
    }

    struct FakeProvider {
        activities: HashMap<String, Activity>,
        fail_next_fetch: Mutex<Option<SyncError>>,
        always_fail_transient: bool,
        fetch_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(activities: Vec<Activity>) -> Self {
            Self {
                activities: activities
                    .into_iter()
                    .map(|a| (a.id.to_string(), a))
                    .collect(),
                fail_next_fetch: Mutex::new(None),
                always_fail_transient: false,
                fetch_calls: AtomicUsize::new(0),
            }
        }

        fn fail_next(self, err: SyncError) -> Self {
            *self.fail_next_fetch.lock().unwrap() = Some(err);
            self
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn authenticate(&mut self) -> Result<()> {
            Ok(())
        }

        async fn list_activity_ids(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ActivityRef>> {
            let mut refs: Vec<ActivityRef> = self
                .activities
                .values()
                .map(|a| ActivityRef {
                    provider_id: a.id.to_string(),
                    start_hint: Some(a.start_date),
                    type_hint: Some(a.activity_type),
                })
                .collect();
            // Newest first, like most provider APIs; the runner re-orders.
            refs.sort_by_key(|r| std::cmp::Reverse(r.start_hint));
            Ok(refs)
        }

        async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail_transient {
                return Err(SyncError::transient("flaky upstream"));
            }
            if let Some(err) = self.fail_next_fetch.lock().unwrap().take() {
                return Err(err);
            }
            let activity = self
                .activities
                .get(&aref.provider_id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(aref.provider_id.clone()))?;
            Ok(Detail::Record(Box::new(FetchedActivity {
                activity,
                track: None,
                raw_file: None,
            })))
        }
    }

    fn test_config(root: &Path) -> Config {
        Config {
            root: root.to_path_buf(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_sync_inserts_then_reruns_clean() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let runner =
            SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);

        let mut provider = FakeProvider::new(vec![
            activity(1001, "2024-01-15 06:30:00", ActivityType::Run),
            activity(1002, "2024-01-16 06:30:00", ActivityType::Run),
        ]);
        let report = runner.run(&mut provider).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.skipped, 0);
        // Oldest first.
        assert_eq!(report.new_ids, vec![1001, 1002]);
        assert!(config.json_path().exists());

        // Second run: both ids are known, nothing is fetched.
        let mut provider = FakeProvider::new(vec![
            activity(1001, "2024-01-15 06:30:00", ActivityType::Run),
            activity(1002, "2024-01-16 06:30:00", ActivityType::Run),
        ]);
        let report = runner.run(&mut provider).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_sleeps_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let runner =
            SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);

        let mut provider =
            FakeProvider::new(vec![activity(2001, "2024-02-01 07:00:00", ActivityType::Run)])
                .fail_next(SyncError::rate_limited(Duration::from_millis(50)));
        let started = std::time::Instant::now();
        let report = runner.run(&mut provider).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let runner = SyncRunner::new(&store, &config, SyncOptions::default())
            .with_geocoder(None)
            .with_backoff_base(Duration::from_millis(1));

        let mut provider =
            FakeProvider::new(vec![activity(3001, "2024-03-01 07:00:00", ActivityType::Run)]);
        provider.always_fail_transient = true;
        let err = runner.run(&mut provider).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        assert_eq!(provider.fetch_calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        // Nothing was upserted.
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_before_listing() {
        struct NoAuth;
        #[async_trait]
        impl Provider for NoAuth {
            fn name(&self) -> &'static str {
                "fake"
            }
            async fn authenticate(&mut self) -> Result<()> {
                Err(SyncError::auth("bad refresh token"))
            }
            async fn list_activity_ids(
                &self,
                _since: Option<DateTime<Utc>>,
            ) -> Result<Vec<ActivityRef>> {
                panic!("must not list after failed auth");
            }
            async fn fetch_detail(&self, _aref: &ActivityRef) -> Result<Detail> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let runner =
            SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);
        let err = runner.run(&mut NoAuth).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_only_run_filter() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let options = SyncOptions {
            only_run: true,
            ..SyncOptions::default()
        };
        let runner = SyncRunner::new(&store, &config, options).with_geocoder(None);

        let mut provider = FakeProvider::new(vec![
            activity(4001, "2024-04-01 07:00:00", ActivityType::Run),
            activity(4002, "2024-04-02 07:00:00", ActivityType::Ride),
        ]);
        let report = runner.run(&mut provider).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.skipped, 1);
        assert!(store.get(4001).unwrap().is_some());
        assert!(store.get(4002).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_error_skips_one_activity() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let runner =
            SyncRunner::new(&store, &config, SyncOptions::default()).with_geocoder(None);

        let mut provider = FakeProvider::new(vec![
            activity(5001, "2024-05-01 07:00:00", ActivityType::Run),
            activity(5002, "2024-05-02 07:00:00", ActivityType::Run),
        ])
        .fail_next(SyncError::Decode(crate::error::DecodeError::Empty));
        let report = runner.run(&mut provider).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_capture_synthesizes_gpx_for_point_stream_providers() {
        struct TrackProvider;
        #[async_trait]
        impl Provider for TrackProvider {
            fn name(&self) -> &'static str {
                "fake"
            }
            async fn authenticate(&mut self) -> Result<()> {
                Ok(())
            }
            async fn list_activity_ids(
                &self,
                _since: Option<DateTime<Utc>>,
            ) -> Result<Vec<ActivityRef>> {
                Ok(vec![ActivityRef::new("6001")])
            }
            async fn fetch_detail(&self, _aref: &ActivityRef) -> Result<Detail> {
                let base = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
                let points = vec![
                    TrackPoint::new(base, 37.0, -122.0),
                    TrackPoint::new(base + chrono::Duration::seconds(60), 37.001, -122.0),
                ];
                let track =
                    DecodedTrack::from_points(points, crate::coords::SourceCrs::Wgs84, &[])?;
                let mut a = activity(6001, "2024-06-01 08:00:00", ActivityType::Run);
                a.summary_polyline = track.summary_polyline.clone();
                Ok(Detail::Record(Box::new(FetchedActivity {
                    activity: a,
                    track: Some(track),
                    raw_file: None,
                })))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ActivityStore::in_memory().unwrap();
        let options = SyncOptions {
            with_gpx: true,
            collect_uploads: true,
            ..SyncOptions::default()
        };
        let runner = SyncRunner::new(&store, &config, options).with_geocoder(None);
        let report = runner.run(&mut TrackProvider).await.unwrap();

        let path = config.track_dir("gpx").join("6001.gpx");
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("<trkpt"));
        assert_eq!(report.uploads.len(), 1);
        assert_eq!(report.uploads[0].format, TrackFormat::Gpx);
        assert_eq!(read_captured(&config.track_dir("gpx"), 6001, "gpx").unwrap().len(), written.len());
        assert!(read_captured(&config.track_dir("gpx"), 9999, "gpx").is_none());
    }
}
