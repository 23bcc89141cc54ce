// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Strava adapter.
//!
//! Auth is the standard OAuth refresh-token exchange. The listing
//! endpoint already returns everything the canonical record needs,
//! including the encoded polyline, so details are resolved from the
//! cached listing summaries; `GET /activities/{id}` is only a fallback
//! for ids the listing never covered.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::models::{Activity, ActivityType, LatLng};
use crate::providers::{
    check_response, http_client, ActivityRef, Capabilities, Detail, FetchedActivity, Provider,
};

const TOKEN_URL: &str = "https://www.strava.com/oauth/token";
const PER_PAGE: u32 = 100;

pub struct StravaProvider {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    access_token: Option<String>,
    /// Listing summaries keyed by id, reused by `fetch_detail`.
    summaries: Mutex<HashMap<String, StravaSummary>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct StravaSummary {
    id: i64,
    name: String,
    #[serde(default)]
    sport_type: Option<String>,
    #[serde(rename = "type", default)]
    type_label: Option<String>,
    start_date: String,
    start_date_local: String,
    distance: f64,
    moving_time: i64,
    elapsed_time: i64,
    #[serde(default)]
    average_speed: f64,
    #[serde(default)]
    average_heartrate: Option<f64>,
    #[serde(default)]
    total_elevation_gain: Option<f64>,
    #[serde(default)]
    start_latlng: Vec<f64>,
    #[serde(default)]
    location_country: Option<String>,
    #[serde(default)]
    map: Option<StravaMap>,
}

#[derive(Debug, Clone, Deserialize)]
struct StravaMap {
    #[serde(default)]
    polyline: Option<String>,
    #[serde(default)]
    summary_polyline: Option<String>,
}

impl StravaSummary {
    fn sport_label(&self) -> Option<&str> {
        self.sport_type.as_deref().or(self.type_label.as_deref())
    }

    /// Prefer the full-resolution polyline over the summary one.
    fn polyline(&self) -> String {
        self.map
            .as_ref()
            .and_then(|m| m.polyline.clone().or_else(|| m.summary_polyline.clone()))
            .unwrap_or_default()
    }

    fn into_activity(self) -> Result<Activity> {
        let start_date = parse_instant(&self.start_date)?;
        let start_date_local = parse_local(&self.start_date_local)?;
        let end_date = start_date + Duration::seconds(self.elapsed_time);
        let end_date_local = start_date_local + Duration::seconds(self.elapsed_time);
        let start_latlng = match self.start_latlng.as_slice() {
            [lat, lon, ..] => Some(LatLng::new(*lat, *lon)),
            _ => None,
        };
        let summary_polyline = self.polyline();
        let activity_type = self
            .sport_label()
            .map(ActivityType::from_label)
            .unwrap_or_default();

        Ok(Activity {
            id: self.id,
            name: self.name,
            activity_type,
            subtype: None,
            start_date,
            start_date_local,
            end_date,
            end_date_local,
            distance: self.distance,
            moving_time: self.moving_time,
            elapsed_time: self.elapsed_time,
            average_speed: self.average_speed,
            average_heartrate: self.average_heartrate,
            elevation_gain: self.total_elevation_gain,
            start_latlng,
            summary_polyline,
            location_country: self.location_country,
            source: "strava".to_string(),
        })
    }
}

/// `start_date` is RFC 3339 with a `Z` suffix.
fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(anyhow::anyhow!("bad Strava timestamp {s:?}: {e}")))
}

/// `start_date_local` carries the same `Z` suffix but means wall clock.
fn parse_local(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| SyncError::Internal(anyhow::anyhow!("bad Strava local time {s:?}: {e}")))
}

impl StravaProvider {
    pub fn new(client_id: String, client_secret: String, refresh_token: String) -> Self {
        Self {
            http: http_client(),
            base_url: "https://www.strava.com/api/v3".to_string(),
            client_id,
            client_secret,
            refresh_token,
            access_token: None,
            summaries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn access_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("strava: not authenticated"))
    }
}

#[async_trait]
impl Provider for StravaProvider {
    fn name(&self) -> &'static str {
        "strava"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_hr: true,
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let token: TokenRefreshResponse = check_response(response, "strava token refresh")
            .await?
            .json()
            .await?;
        tracing::debug!(expires_at = token.expires_at, "Refreshed Strava access token");
        self.access_token = Some(token.access_token);
        Ok(())
    }

    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let token = self.access_token()?.to_string();
        let after = since.map(|t| t.timestamp()).unwrap_or(0);
        let mut refs = Vec::new();
        let mut page = 1u32;
        loop {
            let response = self
                .http
                .get(format!("{}/athlete/activities", self.base_url))
                .bearer_auth(&token)
                .query(&[
                    ("after", after.to_string()),
                    ("page", page.to_string()),
                    ("per_page", PER_PAGE.to_string()),
                ])
                .send()
                .await?;
            let batch: Vec<StravaSummary> = check_response(response, "strava activity list")
                .await?
                .json()
                .await?;
            if batch.is_empty() {
                break;
            }
            let mut cache = self.summaries.lock().await;
            for summary in batch {
                let mut aref = ActivityRef::new(summary.id.to_string());
                aref.start_hint = parse_instant(&summary.start_date).ok();
                aref.type_hint = summary.sport_label().map(ActivityType::from_label);
                refs.push(aref);
                cache.insert(summary.id.to_string(), summary);
            }
            page += 1;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let cached = self.summaries.lock().await.get(&aref.provider_id).cloned();
        let summary = match cached {
            Some(s) => s,
            None => {
                let token = self.access_token()?.to_string();
                let response = self
                    .http
                    .get(format!("{}/activities/{}", self.base_url, aref.provider_id))
                    .bearer_auth(&token)
                    .send()
                    .await?;
                check_response(response, "strava activity detail")
                    .await?
                    .json()
                    .await?
            }
        };
        let activity = summary.into_activity()?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track: None,
            raw_file: None,
        })))
    }
}
