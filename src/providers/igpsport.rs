// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! IGPSport adapter.
//!
//! Plain username/password login against the web gateway (or a
//! pre-issued bearer token). Listing is paged and parameterized by the
//! requested file type; a second endpoint resolves each ride to a
//! short-lived download URL for the raw FIT or GPX bytes. Upstream ids
//! are numeric and become the canonical ids unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::decoders::TrackFormat;
use crate::error::{Result, SyncError};
use crate::providers::{
    check_response, http_client, ActivityRef, Capabilities, Detail, Provider,
};

const PAGE_SIZE: u32 = 20;

pub struct IGPSportProvider {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    file_format: TrackFormat,
    tz: Tz,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    rows: Vec<Ride>,
    #[serde(rename = "totalPage", default)]
    total_page: u32,
}

#[derive(Debug, Deserialize)]
struct Ride {
    #[serde(rename = "rideId")]
    ride_id: i64,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    #[serde(default)]
    data: String,
}

fn req_type(format: TrackFormat) -> &'static str {
    match format {
        TrackFormat::Fit => "0",
        TrackFormat::Gpx => "1",
        TrackFormat::Tcx => "2",
    }
}

impl IGPSportProvider {
    pub fn new(username: String, password: String, file_format: TrackFormat, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://prod.zh.igpsport.com/service".to_string(),
            username,
            password,
            file_format,
            tz,
            token: None,
        }
    }

    /// Skip the password login when a bearer token is already at hand.
    pub fn with_token(mut self, token: String) -> Self {
        if !token.trim().is_empty() {
            self.token = Some(token);
        }
        self
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| SyncError::auth("igpsport: not authenticated"))
    }

    async fn query_page(&self, page_no: u32) -> Result<QueryData> {
        let response = self
            .http
            .get(format!(
                "{}/web-gateway/web-analyze/activity/queryMyActivity",
                self.base_url
            ))
            .bearer_auth(self.token()?)
            .query(&[
                ("pageNo", page_no.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("sort", "1".to_string()),
                ("reqType", req_type(self.file_format).to_string()),
            ])
            .send()
            .await?;
        let query: QueryResponse = check_response(response, "igpsport activity query")
            .await?
            .json()
            .await?;
        Ok(query.data.unwrap_or(QueryData {
            rows: Vec::new(),
            total_page: 0,
        }))
    }
}

#[async_trait]
impl Provider for IGPSportProvider {
    fn name(&self) -> &'static str {
        "igpsport"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_gpx: true,
            has_fit: true,
            has_hr: true,
            has_polyline: true,
            ..Capabilities::default()
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    async fn authenticate(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(SyncError::auth("igpsport: username or password is empty"));
        }
        let response = self
            .http
            .post(format!("{}/auth/account/login", self.base_url))
            .json(&serde_json::json!({
                "appId": "igpsport-web",
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "igpsport login")
            .await?
            .json()
            .await?;
        let token = login.data.map(|d| d.access_token).unwrap_or_default();
        if token.is_empty() {
            return Err(SyncError::auth("igpsport: login returned no access token"));
        }
        self.token = Some(token);
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let mut refs = Vec::new();
        let mut page_no = 1;
        loop {
            let page = self.query_page(page_no).await?;
            for ride in &page.rows {
                refs.push(ActivityRef::new(ride.ride_id.to_string()));
            }
            if page_no >= page.total_page.max(1) {
                break;
            }
            page_no += 1;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let response = self
            .http
            .get(format!(
                "{}/web-gateway/web-analyze/activity/getDownloadUrl/{}",
                self.base_url, aref.provider_id
            ))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let download: DownloadResponse = check_response(response, "igpsport download url")
            .await?
            .json()
            .await?;
        if download.data.is_empty() {
            return Err(SyncError::NotFound(format!(
                "igpsport {}: no download url",
                aref.provider_id
            )));
        }
        // The resolved URL is pre-signed object storage; no auth header.
        let response = self.http.get(download.data).send().await?;
        let bytes = check_response(response, "igpsport file download")
            .await?
            .bytes()
            .await?;
        Ok(Detail::Track {
            format: self.file_format,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_type_codes() {
        assert_eq!(req_type(TrackFormat::Fit), "0");
        assert_eq!(req_type(TrackFormat::Gpx), "1");
        assert_eq!(req_type(TrackFormat::Tcx), "2");
    }

    #[test]
    fn test_query_payload_shape() {
        let query: QueryResponse = serde_json::from_str(
            r#"{"data": {"rows": [{"rideId": 991}, {"rideId": 992}], "totalPage": 3}}"#,
        )
        .unwrap();
        let data = query.data.unwrap();
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[0].ride_id, 991);
        assert_eq!(data.total_page, 3);
    }

    #[test]
    fn test_pre_issued_token_is_kept() {
        let provider = IGPSportProvider::new(
            String::new(),
            String::new(),
            TrackFormat::Fit,
            chrono_tz::Asia::Shanghai,
        )
        .with_token("tok".into())
        .with_base_url("http://unused");
        assert_eq!(provider.token().unwrap(), "tok");

        let blank = IGPSportProvider::new(
            "user".into(),
            "pass".into(),
            TrackFormat::Gpx,
            chrono_tz::Asia::Shanghai,
        )
        .with_token("   ".into());
        assert!(blank.token().is_err());
    }
}
