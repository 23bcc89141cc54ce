// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Garmin Connect adapter, for both the international and China
//! tenants.
//!
//! Auth is a ready-made OAuth2 bearer token (the secret string from the
//! account bootstrap). Listing pages through the search endpoint 100 at
//! a time and can restrict to runs server-side. GPX and TCX come from
//! the export endpoint as-is; the original FIT arrives wrapped in a ZIP
//! whose track member gets extracted.

use std::io::Read;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::decoders::TrackFormat;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::ActivityType;
use crate::providers::{check_response, http_client, ActivityRef, Capabilities, Detail, Provider};
use crate::time_utils;

const PAGE_SIZE: u32 = 100;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.88 Safari/537.36";

pub struct GarminProvider {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    only_run: bool,
    file_format: TrackFormat,
    tz: Tz,
}

#[derive(Debug, Deserialize)]
struct ListedActivity {
    #[serde(rename = "activityId")]
    activity_id: i64,
    #[serde(rename = "startTimeGMT", default)]
    start_time_gmt: Option<String>,
    #[serde(rename = "activityType", default)]
    activity_type: Option<TypeRef>,
}

#[derive(Debug, Deserialize)]
struct TypeRef {
    #[serde(rename = "typeKey", default)]
    type_key: Option<String>,
}

/// FIT downloads are ZIPs holding `{id}_ACTIVITY.fit`; manually created
/// activities sometimes only carry a GPX member.
fn extract_track_member(bytes: &[u8]) -> Result<(TrackFormat, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| DecodeError::malformed("garmin activity archive", e.to_string()))?;
    let mut fallback: Option<(TrackFormat, Vec<u8>)> = None;
    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .map_err(|e| DecodeError::malformed("garmin activity archive", e.to_string()))?;
        let name = member.name().to_ascii_lowercase();
        if !name.ends_with(".fit") && !name.ends_with(".gpx") {
            continue;
        }
        let mut buf = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut buf)
            .map_err(|e| DecodeError::malformed("garmin activity archive", e.to_string()))?;
        if name.ends_with(".fit") {
            return Ok((TrackFormat::Fit, buf));
        }
        fallback.get_or_insert((TrackFormat::Gpx, buf));
    }
    fallback.ok_or_else(|| {
        DecodeError::malformed("garmin activity archive", "no FIT or GPX member").into()
    })
}

impl GarminProvider {
    pub fn new(
        secret: String,
        is_cn: bool,
        only_run: bool,
        file_format: TrackFormat,
        tz: Tz,
    ) -> Self {
        let base_url = if is_cn {
            "https://connectapi.garmin.cn"
        } else {
            "https://connectapi.garmin.com"
        };
        Self {
            http: http_client(),
            base_url: base_url.to_string(),
            secret,
            only_run,
            file_format,
            tz,
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("origin", "https://sso.garmin.com")
            .header("nk", "NT")
            .bearer_auth(&self.secret)
    }

    fn list_url(&self, start: u32) -> String {
        let mut url = format!(
            "{}/activitylist-service/activities/search/activities?start={start}&limit={PAGE_SIZE}",
            self.base_url
        );
        if self.only_run {
            url.push_str("&activityType=running");
        }
        url
    }
}

#[async_trait]
impl Provider for GarminProvider {
    fn name(&self) -> &'static str {
        "garmin"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_tcx: true,
            has_fit: true,
            has_hr: true,
            is_only_run_supported: true,
            fetch_concurrency: 10,
            ..Capabilities::default()
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    /// The bearer token comes pre-issued; probe the listing endpoint so
    /// a stale token fails the sync before any work is queued.
    async fn authenticate(&mut self) -> Result<()> {
        if self.secret.trim().is_empty() {
            return Err(SyncError::auth("garmin: empty secret string"));
        }
        let url = format!(
            "{}/activitylist-service/activities/search/activities?start=0&limit=1",
            self.base_url
        );
        let response = self.get(url).send().await?;
        check_response(response, "garmin token probe").await?;
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let mut refs = Vec::new();
        let mut start = 0u32;
        loop {
            let response = self.get(self.list_url(start)).send().await?;
            let batch: Vec<ListedActivity> = check_response(response, "garmin activity list")
                .await?
                .json()
                .await?;
            if batch.is_empty() {
                break;
            }
            for listed in batch {
                let mut aref = ActivityRef::new(listed.activity_id.to_string());
                aref.start_hint = listed
                    .start_time_gmt
                    .as_deref()
                    .and_then(|s| time_utils::parse_instant(s).ok());
                aref.type_hint = listed
                    .activity_type
                    .and_then(|t| t.type_key)
                    .map(|k| ActivityType::from_label(&k));
                refs.push(aref);
            }
            start += PAGE_SIZE;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let url = match self.file_format {
            TrackFormat::Fit => format!(
                "{}/download-service/files/activity/{}",
                self.base_url, aref.provider_id
            ),
            format => format!(
                "{}/download-service/export/{}/activity/{}",
                self.base_url,
                format.extension(),
                aref.provider_id
            ),
        };
        let response = self.get(url).send().await?;
        let bytes = check_response(response, "garmin activity download")
            .await?
            .bytes()
            .await?
            .to_vec();

        if self.file_format == TrackFormat::Fit {
            let (format, bytes) = extract_track_member(&bytes)?;
            Ok(Detail::Track { format, bytes })
        } else {
            Ok(Detail::Track {
                format: self.file_format,
                bytes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in members {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_prefers_fit_member() {
        let bytes = zip_with(&[
            ("123_ACTIVITY.gpx", b"<gpx/>"),
            ("123_ACTIVITY.fit", b"fitdata"),
        ]);
        let (format, data) = extract_track_member(&bytes).unwrap();
        assert_eq!(format, TrackFormat::Fit);
        assert_eq!(data, b"fitdata");
    }

    #[test]
    fn test_extract_falls_back_to_gpx() {
        let bytes = zip_with(&[("manual.gpx", b"<gpx/>")]);
        let (format, data) = extract_track_member(&bytes).unwrap();
        assert_eq!(format, TrackFormat::Gpx);
        assert_eq!(data, b"<gpx/>");
    }

    #[test]
    fn test_extract_rejects_empty_archive() {
        let bytes = zip_with(&[("readme.txt", b"nope")]);
        assert!(extract_track_member(&bytes).is_err());
    }

    #[test]
    fn test_listing_ref_hints() {
        let listed: ListedActivity = serde_json::from_str(
            r#"{"activityId": 9876, "startTimeGMT": "2024-03-01 08:00:00",
                "activityType": {"typeKey": "treadmill_running"}}"#,
        )
        .unwrap();
        assert_eq!(listed.activity_id, 9876);
        let hint = time_utils::parse_instant(listed.start_time_gmt.as_deref().unwrap()).unwrap();
        assert_eq!(time_utils::format_instant(hint), "2024-03-01 08:00:00");
        assert_eq!(
            ActivityType::from_label(listed.activity_type.unwrap().type_key.as_deref().unwrap()),
            ActivityType::VirtualRun
        );
    }

    #[test]
    fn test_cn_tenant_and_run_filter_urls() {
        let provider = GarminProvider::new(
            "s".into(),
            true,
            true,
            TrackFormat::Fit,
            chrono_tz::Asia::Shanghai,
        );
        let url = provider.list_url(200);
        assert!(url.starts_with("https://connectapi.garmin.cn/"));
        assert!(url.contains("start=200"));
        assert!(url.ends_with("&activityType=running"));
    }
}
