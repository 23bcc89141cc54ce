// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Provider adapters: one module per activity source.
//!
//! Every adapter implements [`Provider`] and produces canonical
//! [`Activity`] values. The sync loop drives the same four steps for all
//! of them: authenticate, list, fetch, normalize.

pub mod codoon;
pub mod coros;
pub mod endomondo;
pub mod garmin;
pub mod igpsport;
pub mod joyrun;
pub mod keep;
pub mod komoot;
pub mod nike;
pub mod onelap;
pub mod oppo;
pub mod strava;
pub mod tulipsport;
pub mod xingzhe;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::coords::SourceCrs;
use crate::decoders::{decode_fit, decode_gpx, decode_tcx, TrackFormat};
use crate::error::{Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack};
use crate::time_utils;

/// What an adapter can serve, and how hard the sync loop may push it.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub has_gpx: bool,
    pub has_tcx: bool,
    pub has_fit: bool,
    pub has_hr: bool,
    pub has_polyline: bool,
    /// Upstream can restrict listings to runs.
    pub is_only_run_supported: bool,
    /// Parallel detail downloads the upstream tolerates.
    pub fetch_concurrency: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            has_gpx: false,
            has_tcx: false,
            has_fit: false,
            has_hr: false,
            has_polyline: false,
            is_only_run_supported: false,
            fetch_concurrency: 1,
        }
    }
}

/// One listed activity, before its detail is fetched.
#[derive(Debug, Clone)]
pub struct ActivityRef {
    /// Provider-native id (not necessarily numeric).
    pub provider_id: String,
    /// Start time when the listing endpoint reports one; used for
    /// client-side `since` filtering and oldest-first ordering.
    pub start_hint: Option<DateTime<Utc>>,
    /// Activity type when the listing endpoint reports one.
    pub type_hint: Option<ActivityType>,
}

impl ActivityRef {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            start_hint: None,
            type_hint: None,
        }
    }
}

/// What a detail fetch produced.
pub enum Detail {
    /// Raw track file bytes as served by the provider.
    Track { format: TrackFormat, bytes: Vec<u8> },
    /// Already normalized by the adapter (JSON point-stream providers).
    Record(Box<FetchedActivity>),
}

/// A fully normalized activity plus whatever track material came with it.
pub struct FetchedActivity {
    pub activity: Activity,
    /// Decoded points, when the provider supplied any. Drives synthesized
    /// GPX capture and heart-rate alignment.
    pub track: Option<DecodedTrack>,
    /// Original file bytes, kept for file capture and cross-upload.
    pub raw_file: Option<(TrackFormat, Vec<u8>)>,
}

/// An activity source.
///
/// `authenticate` runs once per sync and may store session state;
/// listing and fetching take `&self` so detail downloads can run
/// concurrently up to [`Capabilities::fetch_concurrency`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Source tag recorded on every activity (e.g. `"keep"`).
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Coordinate system of this provider's raw tracks.
    fn source_crs(&self) -> SourceCrs {
        SourceCrs::Wgs84
    }

    /// Timezone used to derive local wall-clock times.
    fn timezone(&self) -> Tz {
        chrono_tz::UTC
    }

    /// Validate credentials and obtain session tokens.
    async fn authenticate(&mut self) -> Result<()>;

    /// List activities available upstream, newest or oldest first; the
    /// sync loop re-orders. `since` is a hint, adapters whose API cannot
    /// filter server-side return everything.
    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>>;

    /// Fetch one activity's detail.
    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail>;

    /// Turn a fetched detail into the canonical form. The default covers
    /// raw-file providers; JSON adapters return `Detail::Record` and fall
    /// through.
    fn normalize(&self, aref: &ActivityRef, detail: Detail) -> Result<FetchedActivity> {
        match detail {
            Detail::Record(fetched) => Ok(*fetched),
            Detail::Track { format, bytes } => normalize_track(
                self.name(),
                format,
                bytes,
                self.source_crs(),
                self.timezone(),
                aref,
            ),
        }
    }

    /// Drop duplicates within one batch, after normalization and before
    /// upsert. The default keeps everything; adapters whose upstream
    /// records the same session twice override this.
    fn dedup(&self, batch: Vec<FetchedActivity>) -> Vec<FetchedActivity> {
        batch
    }
}

/// Decode a raw track file and build the canonical record from it.
pub fn normalize_track(
    source: &str,
    format: TrackFormat,
    bytes: Vec<u8>,
    crs: SourceCrs,
    tz: Tz,
    aref: &ActivityRef,
) -> Result<FetchedActivity> {
    let (track, name, type_label, subtype) = match format {
        TrackFormat::Gpx => {
            let d = decode_gpx(&bytes, crs)?;
            (d.track, d.name, d.track_type, None)
        }
        TrackFormat::Tcx => {
            let d = decode_tcx(&bytes, crs)?;
            (d.track, None, d.sport, None)
        }
        TrackFormat::Fit => {
            let d = decode_fit(&bytes, crs)?;
            (d.track, None, d.sport, d.sub_sport)
        }
    };

    let activity_type = aref
        .type_hint
        .or_else(|| type_label.as_deref().map(ActivityType::from_label))
        .unwrap_or_default();
    let id = aref
        .provider_id
        .parse::<i64>()
        .unwrap_or_else(|_| Activity::id_from_start_time(track.start_time));
    let name = name.unwrap_or_else(|| default_name(activity_type, source));

    let activity = activity_from_track(id, &track, source, name, activity_type, subtype, tz);
    Ok(FetchedActivity {
        activity,
        track: Some(track),
        raw_file: Some((format, bytes)),
    })
}

/// Build a canonical record from a decoded track and the metadata the
/// track itself cannot carry.
pub fn activity_from_track(
    id: i64,
    track: &DecodedTrack,
    source: &str,
    name: String,
    activity_type: ActivityType,
    subtype: Option<String>,
    tz: Tz,
) -> Activity {
    Activity {
        id,
        name,
        activity_type,
        subtype,
        start_date: track.start_time,
        start_date_local: time_utils::to_local(track.start_time, tz),
        end_date: track.end_time,
        end_date_local: time_utils::to_local(track.end_time, tz),
        distance: track.distance,
        moving_time: track.moving_time,
        elapsed_time: track.elapsed_time,
        average_speed: track.average_speed,
        average_heartrate: track.average_heartrate,
        elevation_gain: track.elevation_gain,
        start_latlng: track.start_latlng,
        summary_polyline: track.summary_polyline.clone(),
        location_country: None,
        source: source.to_string(),
    }
}

/// "Run from keep", "Ride from codoon", ...
pub fn default_name(activity_type: ActivityType, source: &str) -> String {
    format!("{activity_type} from {source}")
}

/// HTTP client shape shared by adapters: generous timeouts so large
/// track downloads survive slow upstreams.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(240))
        .connect_timeout(Duration::from_secs(360))
        .user_agent("stride-sync")
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Several upstreams serialize numbers as strings depending on client
/// version; accept either shape.
pub(crate) fn value_as_i64(v: &serde_json::Value) -> Option<i64> {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn value_as_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Client-side `since` cutoff for APIs that cannot filter server-side.
pub(crate) fn filter_since(
    mut refs: Vec<ActivityRef>,
    since: Option<DateTime<Utc>>,
) -> Vec<ActivityRef> {
    if let Some(cutoff) = since {
        refs.retain(|r| r.start_hint.map_or(true, |t| t >= cutoff));
    }
    refs
}

/// Map a non-success response onto the error taxonomy: 401/403 → Auth,
/// 404 → NotFound, 429 → RateLimited (honoring Retry-After), 5xx →
/// Transient.
pub(crate) async fn check_response(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        tracing::warn!(what, retry_after, "Rate limit hit (429)");
        return Err(SyncError::rate_limited(Duration::from_secs(retry_after)));
    }

    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => Err(SyncError::auth(format!("{what}: HTTP {status}: {body}"))),
        404 => Err(SyncError::NotFound(format!("{what}: {body}"))),
        s if s >= 500 => Err(SyncError::transient(format!(
            "{what}: HTTP {status}: {body}"
        ))),
        _ => Err(SyncError::Internal(anyhow::anyhow!(
            "{what}: HTTP {status}: {body}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filter_since_keeps_unhinted_refs() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let refs = vec![
            ActivityRef {
                start_hint: Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()),
                ..ActivityRef::new("old")
            },
            ActivityRef {
                start_hint: Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()),
                ..ActivityRef::new("new")
            },
            ActivityRef::new("unknown"),
        ];
        let kept = filter_since(refs, Some(cutoff));
        let ids: Vec<_> = kept.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "unknown"]);
    }

    #[test]
    fn test_default_name() {
        assert_eq!(default_name(ActivityType::Run, "keep"), "Run from keep");
        assert_eq!(default_name(ActivityType::Ride, "codoon"), "Ride from codoon");
    }

    #[test]
    fn test_normalize_track_prefers_listing_type_hint() {
        let gpx = br#"<gpx><trk><name>Loop</name><type>cycling</type><trkseg>
            <trkpt lat="37.0" lon="-122.0"><time>2024-03-01T08:00:00Z</time></trkpt>
            <trkpt lat="37.001" lon="-122.0"><time>2024-03-01T08:01:00Z</time></trkpt>
        </trkseg></trk></gpx>"#;
        let mut aref = ActivityRef::new("12345");
        aref.type_hint = Some(ActivityType::Run);
        let fetched = normalize_track(
            "garmin",
            TrackFormat::Gpx,
            gpx.to_vec(),
            SourceCrs::Wgs84,
            chrono_tz::UTC,
            &aref,
        )
        .unwrap();
        assert_eq!(fetched.activity.id, 12345);
        assert_eq!(fetched.activity.activity_type, ActivityType::Run);
        assert_eq!(fetched.activity.name, "Loop");
        assert!(fetched.raw_file.is_some());
    }

    #[test]
    fn test_normalize_track_derives_id_from_start() {
        let gpx = br#"<gpx><trk><trkseg>
            <trkpt lat="37.0" lon="-122.0"><time>2024-03-01T08:00:00Z</time></trkpt>
            <trkpt lat="37.001" lon="-122.0"><time>2024-03-01T08:01:00Z</time></trkpt>
        </trkseg></trk></gpx>"#;
        let aref = ActivityRef::new("2024-03-01-morning");
        let fetched = normalize_track(
            "endomondo",
            TrackFormat::Gpx,
            gpx.to_vec(),
            SourceCrs::Wgs84,
            chrono_tz::UTC,
            &aref,
        )
        .unwrap();
        let start = fetched.activity.start_date;
        assert_eq!(fetched.activity.id, start.timestamp() * 1000);
        assert_eq!(fetched.activity.name, "Other from endomondo");
    }
}
