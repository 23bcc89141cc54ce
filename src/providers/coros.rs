// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Coros adapter.
//!
//! Password login (MD5-hashed client-side), paged run listing, then one
//! download-URL request per activity followed by the FIT fetch itself.
//! The listing is already restricted to the run modes (road 100, track
//! 102, trail 103).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use md5::{Digest, Md5};
use serde::Deserialize;

use crate::decoders::TrackFormat;
use crate::error::{Result, SyncError};
use crate::providers::{check_response, http_client, ActivityRef, Capabilities, Detail, Provider};

const RUN_MODES: &str = "100,102,103";
const PAGE_SIZE: u32 = 20;
/// 4 = FIT in the download endpoint's file-type enum.
const FILE_TYPE_FIT: u32 = 4;

pub struct CorosProvider {
    http: reqwest::Client,
    base_url: String,
    account: String,
    password: String,
    tz: Tz,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    data: LoginData,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Option<QueryPage>,
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(rename = "dataList", default)]
    data_list: Vec<QueryEntry>,
}

#[derive(Debug, Deserialize)]
struct QueryEntry {
    #[serde(rename = "labelId")]
    label_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    data: DownloadData,
}

#[derive(Debug, Deserialize)]
struct DownloadData {
    #[serde(rename = "fileUrl")]
    file_url: String,
}

/// Label ids arrive as either JSON numbers or strings.
fn id_string(v: &serde_json::Value) -> Option<String> {
    v.as_str()
        .map(str::to_string)
        .or_else(|| v.as_i64().map(|i| i.to_string()))
}

impl CorosProvider {
    pub fn new(account: String, password: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://teamcnapi.coros.com".to_string(),
            account,
            password,
            tz,
            access_token: None,
        }
    }

    fn token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("coros: not authenticated"))
    }

    fn authed(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder.header("accesstoken", token).header(
            "Cookie",
            format!("CPL-coros-region=2; CPL-coros-token={token}"),
        )
    }
}

#[async_trait]
impl Provider for CorosProvider {
    fn name(&self) -> &'static str {
        "coros"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_fit: true,
            has_hr: true,
            has_polyline: true,
            is_only_run_supported: true,
            fetch_concurrency: 10,
            ..Capabilities::default()
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }

    async fn authenticate(&mut self) -> Result<()> {
        let pwd = hex::encode(Md5::digest(self.password.as_bytes()));
        let response = self
            .http
            .post(format!("{}/account/login", self.base_url))
            .header("Origin", "https://t.coros.com")
            .header("Referer", "https://t.coros.com/")
            .json(&serde_json::json!({
                "account": self.account,
                "accountType": 2,
                "pwd": pwd,
            }))
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "coros login").await?.json().await?;
        self.access_token = Some(login.data.access_token);
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let token = self.token()?.to_string();
        let mut refs = Vec::new();
        let mut page = 1u32;
        loop {
            let builder = self
                .http
                .get(format!("{}/activity/query", self.base_url))
                .query(&[
                    ("modeList", RUN_MODES.to_string()),
                    ("pageNumber", page.to_string()),
                    ("size", PAGE_SIZE.to_string()),
                ]);
            let response = self.authed(builder, &token).send().await?;
            let query: QueryResponse = check_response(response, "coros activity list")
                .await?
                .json()
                .await?;
            let entries = query.data.map(|d| d.data_list).unwrap_or_default();
            if entries.is_empty() {
                break;
            }
            refs.extend(
                entries
                    .iter()
                    .filter_map(|e| id_string(&e.label_id))
                    .map(ActivityRef::new),
            );
            page += 1;
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let token = self.token()?.to_string();
        let builder = self
            .http
            .post(format!("{}/activity/detail/download", self.base_url))
            .query(&[
                ("labelId", aref.provider_id.clone()),
                ("sportType", "100".to_string()),
                ("fileType", FILE_TYPE_FIT.to_string()),
            ]);
        let response = self.authed(builder, &token).send().await?;
        let download: DownloadResponse = check_response(response, "coros download url")
            .await?
            .json()
            .await?;

        let response = self.http.get(&download.data.file_url).send().await?;
        let bytes = check_response(response, "coros fit file")
            .await?
            .bytes()
            .await?
            .to_vec();
        Ok(Detail::Track {
            format: TrackFormat::Fit,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_md5_hex() {
        assert_eq!(
            hex::encode(Md5::digest(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_label_id_accepts_number_or_string() {
        assert_eq!(
            id_string(&serde_json::json!(419430400123i64)),
            Some("419430400123".to_string())
        );
        assert_eq!(
            id_string(&serde_json::json!("abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(id_string(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_query_page_parses_mixed_ids() {
        let query: QueryResponse = serde_json::from_str(
            r#"{"data": {"dataList": [{"labelId": "462233"}, {"labelId": 462234}]}}"#,
        )
        .unwrap();
        let ids: Vec<String> = query
            .data
            .unwrap()
            .data_list
            .iter()
            .filter_map(|e| id_string(&e.label_id))
            .collect();
        assert_eq!(ids, vec!["462233", "462234"]);
    }
}
