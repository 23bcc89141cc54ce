// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Komoot adapter.
//!
//! Login exchanges the e-mail address and password (HTTP basic) for a
//! per-user basic-auth pair: the account endpoint answers with the
//! numeric user id in `username` and a long-lived token in `password`.
//! Tour listing is HAL-paged; only `tour_recorded` entries count.
//! Coordinates come as a flat array whose `t` values are millisecond
//! offsets from the tour date when the first one is zero, and absolute
//! epoch milliseconds otherwise. Tour dates carry their own UTC offset,
//! which also supplies the local wall-clock times.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::coords::SourceCrs;
use crate::error::{DecodeError, Result, SyncError};
use crate::models::{Activity, ActivityType, DecodedTrack, TrackPoint};
use crate::providers::{
    check_response, filter_since, http_client, ActivityRef, Capabilities, Detail, FetchedActivity,
    Provider,
};

pub struct KomootProvider {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    user_id: Option<String>,
    token: Option<String>,
    /// Tour summaries from the listing pages, reused at fetch time.
    summaries: Mutex<HashMap<String, TourSummary>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TourSummary {
    id: i64,
    #[serde(rename = "type")]
    tour_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sport: String,
    date: String,
    #[serde(default)]
    distance: f64,
    /// Seconds in motion.
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    elevation_up: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ToursPage {
    #[serde(rename = "_embedded", default)]
    embedded: Option<ToursEmbedded>,
    #[serde(rename = "_links", default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct ToursEmbedded {
    #[serde(default)]
    tours: Vec<TourSummary>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: String,
}

#[derive(Debug, Deserialize)]
struct TourDetail {
    #[serde(rename = "_embedded", default)]
    embedded: Option<DetailEmbedded>,
}

#[derive(Debug, Deserialize)]
struct DetailEmbedded {
    #[serde(default)]
    coordinates: Option<CoordinateArray>,
}

#[derive(Debug, Deserialize)]
struct CoordinateArray {
    #[serde(default)]
    items: Vec<Coordinate>,
}

#[derive(Debug, Deserialize)]
struct Coordinate {
    lat: f64,
    lng: f64,
    #[serde(default)]
    alt: Option<f64>,
    #[serde(default)]
    t: Option<i64>,
}

fn sport_type(sport: &str) -> ActivityType {
    match sport {
        "jogging" => ActivityType::Run,
        "hike" | "hiking" => ActivityType::Hike,
        "climbing" => ActivityType::RockClimbing,
        s if s.contains("bicycle") || s.contains("bike") || s == "mtb" => ActivityType::Ride,
        other => ActivityType::from_label(other),
    }
}

/// Point times are offsets from the tour date when the first `t` is
/// zero, absolute epoch milliseconds otherwise.
fn coordinate_times_are_offsets(items: &[Coordinate]) -> bool {
    items.first().map_or(false, |c| c.t == Some(0))
}

fn build_track(items: &[Coordinate], start: DateTime<Utc>) -> Result<Option<DecodedTrack>> {
    let offsets = coordinate_times_are_offsets(items);
    let points: Vec<TrackPoint> = items
        .iter()
        .filter_map(|c| {
            let t = c.t?;
            let time = if offsets {
                start + Duration::milliseconds(t)
            } else {
                DateTime::from_timestamp_millis(t)?
            };
            let mut p = TrackPoint::new(time, c.lat, c.lng);
            p.elevation = c.alt;
            Some(p)
        })
        .collect();
    match DecodedTrack::from_points(points, SourceCrs::Wgs84, &[]) {
        Ok(track) => Ok(Some(track)),
        Err(DecodeError::Empty) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl KomootProvider {
    pub fn new(email: String, password: String) -> Self {
        Self {
            http: http_client(),
            base_url: "https://api.komoot.de".to_string(),
            email,
            password,
            user_id: None,
            token: None,
            summaries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn session(&self) -> Result<(&str, &str)> {
        match (self.user_id.as_deref(), self.token.as_deref()) {
            (Some(user_id), Some(token)) => Ok((user_id, token)),
            _ => Err(SyncError::auth("komoot: not authenticated")),
        }
    }

    fn to_activity(&self, summary: &TourSummary, track: Option<&DecodedTrack>) -> Result<Activity> {
        let date = DateTime::parse_from_rfc3339(&summary.date)
            .map_err(|_| DecodeError::malformed("komoot tour", "bad tour date"))?;
        let start_date = date.with_timezone(&Utc);
        let start_local = date.naive_local();
        let moving_time = summary.duration;
        if moving_time <= 0 {
            return Err(DecodeError::malformed("komoot tour", "no duration").into());
        }
        let elapsed_time = track
            .and_then(|t| {
                let first = t.points.first()?.time;
                let last = t.points.last()?.time;
                Some((last - first).num_seconds())
            })
            .unwrap_or(moving_time)
            .max(moving_time);

        Ok(Activity {
            id: summary.id,
            name: summary.name.clone(),
            activity_type: sport_type(&summary.sport),
            subtype: Some(summary.sport.clone()),
            start_date,
            start_date_local: start_local,
            end_date: start_date + Duration::seconds(elapsed_time),
            end_date_local: start_local + Duration::seconds(elapsed_time),
            distance: summary.distance,
            moving_time,
            elapsed_time,
            average_speed: summary.distance / moving_time as f64,
            average_heartrate: None,
            elevation_gain: summary
                .elevation_up
                .or_else(|| track.and_then(|t| t.elevation_gain)),
            start_latlng: track.and_then(|t| t.start_latlng),
            summary_polyline: track
                .map(|t| t.summary_polyline.clone())
                .unwrap_or_default(),
            location_country: None,
            source: "komoot".to_string(),
        })
    }
}

#[async_trait]
impl Provider for KomootProvider {
    fn name(&self) -> &'static str {
        "komoot"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    async fn authenticate(&mut self) -> Result<()> {
        let response = self
            .http
            .get(format!(
                "{}/v006/account/email/{}/",
                self.base_url, self.email
            ))
            .basic_auth(&self.email, Some(&self.password))
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "komoot login")
            .await?
            .json()
            .await?;
        self.user_id = Some(login.username);
        self.token = Some(login.password);
        Ok(())
    }

    async fn list_activity_ids(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let (user_id, token) = self.session()?;
        let mut url = format!("{}/v007/users/{}/tours/", self.base_url, user_id);

        let mut refs = Vec::new();
        let mut summaries = self.summaries.lock().await;
        loop {
            let response = self
                .http
                .get(&url)
                .basic_auth(user_id, Some(token))
                .send()
                .await?;
            let page: ToursPage = check_response(response, "komoot tour list")
                .await?
                .json()
                .await?;
            for tour in page.embedded.map(|e| e.tours).unwrap_or_default() {
                if tour.tour_type != "tour_recorded" {
                    continue;
                }
                let provider_id = tour.id.to_string();
                let mut aref = ActivityRef::new(provider_id.clone());
                aref.start_hint = DateTime::parse_from_rfc3339(&tour.date)
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
                aref.type_hint = Some(sport_type(&tour.sport));
                refs.push(aref);
                summaries.insert(provider_id, tour);
            }
            match page.links.and_then(|l| l.next) {
                Some(next) => url = next.href,
                None => break,
            }
        }
        Ok(filter_since(refs, since))
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let (user_id, token) = self.session()?;
        let summary = self
            .summaries
            .lock()
            .await
            .get(&aref.provider_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("komoot {}", aref.provider_id)))?;
        let response = self
            .http
            .get(format!(
                "{}/v007/tours/{}?_embedded=coordinates&format=coordinate_array",
                self.base_url, aref.provider_id
            ))
            .basic_auth(user_id, Some(token))
            .send()
            .await?;
        let detail: TourDetail = check_response(response, "komoot tour detail")
            .await?
            .json()
            .await?;

        let items = detail
            .embedded
            .and_then(|e| e.coordinates)
            .map(|c| c.items)
            .unwrap_or_default();
        let start = DateTime::parse_from_rfc3339(&summary.date)
            .map_err(|_| DecodeError::malformed("komoot tour", "bad tour date"))?
            .with_timezone(&Utc);
        let track = build_track(&items, start)?;
        let activity = self.to_activity(&summary, track.as_ref())?;
        Ok(Detail::Record(Box::new(FetchedActivity {
            activity,
            track,
            raw_file: None,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tour(json: serde_json::Value) -> TourSummary {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_sport_type_map() {
        assert_eq!(sport_type("jogging"), ActivityType::Run);
        assert_eq!(sport_type("hike"), ActivityType::Hike);
        assert_eq!(sport_type("touringbicycle"), ActivityType::Ride);
        assert_eq!(sport_type("e_racebike"), ActivityType::Ride);
        assert_eq!(sport_type("mtb"), ActivityType::Ride);
        assert_eq!(sport_type("climbing"), ActivityType::RockClimbing);
        assert_eq!(sport_type("skitour"), ActivityType::Other);
    }

    #[test]
    fn test_offset_coordinate_times_anchor_on_tour_date() {
        let items: Vec<Coordinate> = serde_json::from_value(serde_json::json!([
            {"lat": 52.5, "lng": 13.4, "alt": 30.0, "t": 0},
            {"lat": 52.501, "lng": 13.401, "alt": 31.0, "t": 10000}
        ]))
        .unwrap();
        assert!(coordinate_times_are_offsets(&items));
        let start = DateTime::parse_from_rfc3339("2022-01-02T12:26:41.795+01:00")
            .unwrap()
            .with_timezone(&Utc);
        let track = build_track(&items, start).unwrap().unwrap();
        assert_eq!((track.points[1].time - track.points[0].time).num_seconds(), 10);
        assert_eq!(track.points[0].elevation, Some(30.0));
    }

    #[test]
    fn test_absolute_coordinate_times() {
        let items: Vec<Coordinate> = serde_json::from_value(serde_json::json!([
            {"lat": 52.5, "lng": 13.4, "t": 1641122801000i64},
            {"lat": 52.501, "lng": 13.401, "t": 1641122811000i64}
        ]))
        .unwrap();
        assert!(!coordinate_times_are_offsets(&items));
        let track = build_track(&items, Utc::now()).unwrap().unwrap();
        assert_eq!(track.points[0].time.timestamp(), 1_641_122_801);
    }

    #[test]
    fn test_tour_summary_builds_activity_with_local_offset() {
        let provider =
            KomootProvider::new("a@b.c".into(), "pw".into()).with_base_url("http://unused");
        let summary = tour(serde_json::json!({
            "id": 654321,
            "type": "tour_recorded",
            "name": "Morning loop",
            "sport": "jogging",
            "date": "2022-01-02T12:26:41.795+01:00",
            "distance": 8000.0,
            "duration": 2400,
            "elevation_up": 120.0
        }));
        let activity = provider.to_activity(&summary, None).unwrap();
        assert_eq!(activity.id, 654321);
        assert_eq!(activity.activity_type, ActivityType::Run);
        assert_eq!(activity.start_date.to_rfc3339(), "2022-01-02T11:26:41.795+00:00");
        assert_eq!(
            activity.start_date_local.format("%H:%M:%S").to_string(),
            "12:26:41"
        );
        assert_eq!(activity.moving_time, 2400);
        assert_eq!(activity.elevation_gain, Some(120.0));
    }
}
