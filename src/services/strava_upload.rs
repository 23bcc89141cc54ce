// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Strava as an upload sink.
//!
//! New tracks pulled from any provider can be pushed back out to Strava.
//! The upload endpoint takes the raw file as multipart form data and
//! processes it asynchronously, so the response only confirms the file
//! was queued. Duplicates are flagged immediately in the response error
//! and are counted, not treated as failures. A short pause between
//! uploads keeps us clear of the spider rules.

use std::time::Duration;

use reqwest::multipart;
use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::providers::{check_response, http_client};
use crate::services::sync::{NewTrack, UploadSummary};

const TOKEN_URL: &str = "https://www.strava.com/oauth/token";

pub struct StravaUploader {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    access_token: Option<String>,
    /// Courtesy pause between consecutive uploads.
    pause: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_at: i64,
}

/// Response of `POST /uploads`. `activity_id` stays null until Strava's
/// asynchronous processing finishes, so we never see it.
#[derive(Debug, Deserialize)]
struct UploadStatus {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug)]
enum UploadOutcome {
    Accepted { upload_id: Option<i64> },
    Duplicate { detail: String },
    Rejected { detail: String },
}

impl UploadStatus {
    fn outcome(self) -> UploadOutcome {
        match self.error {
            Some(e) if e.to_lowercase().contains("duplicate") => {
                UploadOutcome::Duplicate { detail: e }
            }
            Some(e) => UploadOutcome::Rejected { detail: e },
            None => UploadOutcome::Accepted { upload_id: self.id },
        }
    }
}

impl StravaUploader {
    pub fn new(client_id: String, client_secret: String, refresh_token: String) -> Self {
        Self {
            http: http_client(),
            base_url: "https://www.strava.com/api/v3".to_string(),
            client_id,
            client_secret,
            refresh_token,
            access_token: None,
            pause: Duration::from_secs(1),
        }
    }

    fn access_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| SyncError::auth("strava upload: not authenticated"))
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

    /// Queue one file. With `force_run` the upload is tagged
    /// `activity_type=run`, overriding whatever the file claims.
    async fn upload(&self, track: &NewTrack, force_run: bool) -> Result<UploadOutcome> {
        let token = self.access_token()?.to_string();
        let data_type = track.format.extension();
        let file = multipart::Part::bytes(track.bytes.clone())
            .file_name(format!("{}.{}", track.id, data_type));
        let mut form = multipart::Form::new()
            .part("file", file)
            .text("data_type", data_type);
        if force_run {
            form = form.text("activity_type", "run");
        }
        let response = self
            .http
            .post(format!("{}/uploads", self.base_url))
            .bearer_auth(&token)
            .multipart(form)
            .send()
            .await?;
        let status: UploadStatus = check_response(response, "strava upload")
            .await?
            .json()
            .await?;
        Ok(status.outcome())
    }

    /// Push a batch of tracks, one at a time. A rate-limit response is
    /// slept off and the file retried once; other per-file failures are
    /// logged and counted. Only an auth failure aborts the batch.
    pub async fn upload_all(&mut self, tracks: &[NewTrack], force_run: bool) -> Result<UploadSummary> {
        let mut summary = UploadSummary::default();
        if tracks.is_empty() {
            return Ok(summary);
        }
        self.authenticate().await?;
        tracing::info!(count = tracks.len(), "Uploading new tracks to Strava");

        for track in tracks {
            let outcome = match self.upload(track, force_run).await {
                Err(SyncError::RateLimited { retry_after }) => {
                    tracing::warn!(
                        seconds = retry_after.as_secs(),
                        "Strava upload rate limited; sleeping it off"
                    );
                    tokio::time::sleep(retry_after).await;
                    self.upload(track, force_run).await
                }
                other => other,
            };
            match outcome {
                Ok(UploadOutcome::Accepted { upload_id }) => {
                    tracing::info!(
                        id = track.id,
                        upload_id,
                        data_type = track.format.extension(),
                        "Queued track on Strava"
                    );
                    summary.uploaded += 1;
                }
                Ok(UploadOutcome::Duplicate { detail }) => {
                    tracing::info!(id = track.id, detail = %detail, "Strava already has this activity");
                    summary.duplicates += 1;
                }
                Ok(UploadOutcome::Rejected { detail }) => {
                    tracing::warn!(id = track.id, detail = %detail, "Strava rejected the upload");
                    summary.failed += 1;
                }
                Err(e @ SyncError::Auth(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(id = track.id, error = %e, "Strava upload failed");
                    summary.failed += 1;
                }
            }
            tokio::time::sleep(self.pause).await;
        }
        Ok(summary)
    }
}
