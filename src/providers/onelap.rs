// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Onelap (indoor trainer platform) adapter.
//!
//! Login posts an MD5 of the password along with nonce/timestamp/sign
//! headers; the web client's signing salt is literally `***`. The
//! session is three cookies (`ouid`, `XSRF-TOKEN`, `OTOKEN`). A single
//! unpaged listing returns each ride's file key and a pre-signed FIT
//! download URL.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::decoders::TrackFormat;
use crate::error::{Result, SyncError};
use crate::providers::{
    check_response, http_client, ActivityRef, Capabilities, Detail, Provider,
};

const LOGIN_URL: &str = "https://www.onelap.cn/api/login";
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub struct OnelapProvider {
    http: reqwest::Client,
    base_url: String,
    account: String,
    password: String,
    tz: Tz,
    session_cookie: Option<String>,
    /// Download URLs keyed by file key, filled at list time.
    download_urls: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    data: Vec<LoginData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    userinfo: UserInfo,
}

#[derive(Debug, Default, Deserialize)]
struct UserInfo {
    #[serde(default)]
    uid: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<Ride>,
}

#[derive(Debug, Deserialize)]
struct Ride {
    #[serde(rename = "fileKey", default)]
    file_key: String,
    #[serde(default)]
    durl: String,
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn login_sign(account: &str, nonce: &str) -> String {
    md5_hex(&format!("account={account}&nonce={nonce}&***"))
}

fn make_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    md5_hex(&nanos.to_string())[..16].to_string()
}

impl OnelapProvider {
    pub fn new(account: String, password: String, tz: Tz) -> Self {
        Self {
            http: http_client(),
            base_url: "https://u.onelap.cn".to_string(),
            account,
            password,
            tz,
            session_cookie: None,
            download_urls: Mutex::new(HashMap::new()),
        }
    }

    fn cookie(&self) -> Result<&str> {
        self.session_cookie
            .as_deref()
            .ok_or_else(|| SyncError::auth("onelap: not authenticated"))
    }
}

#[async_trait]
impl Provider for OnelapProvider {
    fn name(&self) -> &'static str {
        "onelap"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
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
        let nonce = make_nonce();
        let timestamp = Utc::now().timestamp().to_string();
        let response = self
            .http
            .post(LOGIN_URL)
            .header("nonce", &nonce)
            .header("timestamp", timestamp)
            .header("sign", login_sign(&self.account, &nonce))
            .json(&serde_json::json!({
                "account": self.account,
                "password": md5_hex(&self.password),
            }))
            .send()
            .await?;
        let login: LoginResponse = check_response(response, "onelap login")
            .await?
            .json()
            .await?;
        let data = login.data.into_iter().next().ok_or_else(|| {
            SyncError::auth(format!(
                "onelap: login failed: {}",
                login.error.unwrap_or_else(|| "no data".to_string())
            ))
        })?;
        self.session_cookie = Some(format!(
            "ouid={}; XSRF-TOKEN={}; OTOKEN={}",
            data.userinfo.uid, data.token, data.refresh_token
        ));
        Ok(())
    }

    async fn list_activity_ids(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<ActivityRef>> {
        let response = self
            .http
            .get(format!("{}/analysis/list", self.base_url))
            .header(reqwest::header::COOKIE, self.cookie()?)
            .header(reqwest::header::USER_AGENT, BROWSER_UA)
            .send()
            .await?;
        let list: ListResponse = check_response(response, "onelap activity list")
            .await?
            .json()
            .await?;

        let mut refs = Vec::new();
        let mut urls = self.download_urls.lock().await;
        for ride in list.data {
            if ride.file_key.is_empty() || ride.durl.is_empty() {
                continue;
            }
            refs.push(ActivityRef::new(ride.file_key.clone()));
            urls.insert(ride.file_key, ride.durl);
        }
        Ok(refs)
    }

    async fn fetch_detail(&self, aref: &ActivityRef) -> Result<Detail> {
        let url = self
            .download_urls
            .lock()
            .await
            .get(&aref.provider_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("onelap {}", aref.provider_id)))?;
        let response = self.http.get(url).send().await?;
        let bytes = check_response(response, "onelap fit download")
            .await?
            .bytes()
            .await?;
        Ok(Detail::Track {
            format: TrackFormat::Fit,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_sign_matches_web_client() {
        // md5 of "account=user@example.com&nonce=0123456789abcdef&***"
        assert_eq!(
            login_sign("user@example.com", "0123456789abcdef"),
            md5_hex("account=user@example.com&nonce=0123456789abcdef&***")
        );
        assert_eq!(login_sign("a", "n").len(), 32);
    }

    #[test]
    fn test_nonce_is_16_hex_chars() {
        let nonce = make_nonce();
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_login_payload_shape() {
        let login: LoginResponse = serde_json::from_str(
            r#"{"data": [{"token": "t", "refresh_token": "rt", "userinfo": {"uid": 77}}]}"#,
        )
        .unwrap();
        let data = &login.data[0];
        assert_eq!(data.userinfo.uid, 77);
        assert_eq!(
            format!(
                "ouid={}; XSRF-TOKEN={}; OTOKEN={}",
                data.userinfo.uid, data.token, data.refresh_token
            ),
            "ouid=77; XSRF-TOKEN=t; OTOKEN=rt"
        );
    }

    #[test]
    fn test_list_skips_rows_without_url() {
        let list: ListResponse = serde_json::from_str(
            r#"{"data": [{"fileKey": "a.fit", "durl": "https://x/a.fit"}, {"fileKey": "b.fit", "durl": ""}]}"#,
        )
        .unwrap();
        let usable: Vec<_> = list
            .data
            .iter()
            .filter(|r| !r.file_key.is_empty() && !r.durl.is_empty())
            .collect();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].file_key, "a.fit");
    }
}
