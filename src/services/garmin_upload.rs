// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Garmin Connect as an upload sink, for both tenants.
//!
//! Takes the same pre-issued bearer token as the adapter. Files go to
//! the upload service as multipart form data; Garmin answers with a
//! detailed import result whose failure messages distinguish re-uploads
//! of known files (code 202, or a flat HTTP 409) from real rejections.
//! Duplicates are counted, other per-file failures logged, and the batch
//! keeps going; only a rejected token aborts.

use reqwest::multipart;
use serde::Deserialize;

use crate::decoders::TrackFormat;
use crate::error::{Result, SyncError};
use crate::providers::{check_response, http_client};
use crate::services::fit_device;
use crate::services::sync::{NewTrack, UploadSummary};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.88 Safari/537.36";

/// Garmin's duplicate-activity failure code.
const DUPLICATE_CODE: i64 = 202;

pub struct GarminUploader {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    /// Rewrite FIT files to claim a real Garmin watch recorded them.
    fake_device: bool,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "detailedImportResult", default)]
    detailed_import_result: ImportResult,
}

#[derive(Debug, Default, Deserialize)]
struct ImportResult {
    /// A number on success, an empty string on failure.
    #[serde(rename = "uploadId", default)]
    upload_id: serde_json::Value,
    #[serde(default)]
    successes: Vec<serde_json::Value>,
    #[serde(default)]
    failures: Vec<ImportFailure>,
}

#[derive(Debug, Deserialize)]
struct ImportFailure {
    #[serde(default)]
    messages: Vec<FailureMessage>,
}

#[derive(Debug, Deserialize)]
struct FailureMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    content: String,
}

#[derive(Debug)]
enum UploadOutcome {
    Accepted { upload_id: serde_json::Value },
    Duplicate { detail: String },
    Rejected { detail: String },
}

impl ImportResult {
    fn outcome(self) -> UploadOutcome {
        let messages: Vec<FailureMessage> = self
            .failures
            .into_iter()
            .flat_map(|f| f.messages)
            .collect();
        if messages.is_empty() {
            return UploadOutcome::Accepted {
                upload_id: self.upload_id,
            };
        }
        let detail = messages
            .iter()
            .map(|m| format!("{}: {}", m.code, m.content))
            .collect::<Vec<_>>()
            .join("; ");
        if messages
            .iter()
            .any(|m| m.code == DUPLICATE_CODE || m.content.contains("Duplicate"))
        {
            UploadOutcome::Duplicate { detail }
        } else {
            UploadOutcome::Rejected { detail }
        }
    }
}

impl GarminUploader {
    pub fn new(secret: String, is_cn: bool, fake_device: bool) -> Self {
        let base_url = if is_cn {
            "https://connectapi.garmin.cn"
        } else {
            "https://connectapi.garmin.com"
        };
        Self {
            http: http_client(),
            base_url: base_url.to_string(),
            secret,
            fake_device,
        }
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("User-Agent", USER_AGENT)
            .header("origin", "https://sso.garmin.com")
            .header("nk", "NT")
            .bearer_auth(&self.secret)
    }

    fn prepare(&self, track: &NewTrack) -> Vec<u8> {
        if self.fake_device {
            // Non-FIT bytes pass through unchanged.
            fit_device::wrap_device_info(&track.bytes)
        } else {
            track.bytes.clone()
        }
    }

    /// Garmin sniffs the format from the filename extension.
    async fn upload(&self, id: i64, format: TrackFormat, bytes: Vec<u8>) -> Result<UploadOutcome> {
        let file = multipart::Part::bytes(bytes).file_name(format!("{id}.{}", format.extension()));
        let form = multipart::Form::new().part("file", file);
        let response = self
            .post(format!("{}/upload-service/upload/", self.base_url))
            .multipart(form)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(UploadOutcome::Duplicate {
                detail: "HTTP 409, activity already on Garmin".to_string(),
            });
        }
        let parsed: UploadResponse = check_response(response, "garmin upload")
            .await?
            .json()
            .await?;
        let result = parsed.detailed_import_result;
        tracing::debug!(
            successes = result.successes.len(),
            failures = result.failures.len(),
            "Parsed Garmin import result"
        );
        Ok(result.outcome())
    }

    pub async fn upload_all(&self, tracks: &[NewTrack]) -> Result<UploadSummary> {
        let mut summary = UploadSummary::default();
        if tracks.is_empty() {
            return Ok(summary);
        }
        if self.secret.trim().is_empty() {
            return Err(SyncError::auth("garmin upload: empty secret string"));
        }
        tracing::info!(
            count = tracks.len(),
            fake_device = self.fake_device,
            "Uploading new tracks to Garmin Connect"
        );

        for track in tracks {
            let bytes = self.prepare(track);
            match self.upload(track.id, track.format, bytes).await {
                Ok(UploadOutcome::Accepted { upload_id }) => {
                    tracing::info!(id = track.id, upload_id = %upload_id, "Garmin accepted the upload");
                    summary.uploaded += 1;
                }
                Ok(UploadOutcome::Duplicate { detail }) => {
                    tracing::info!(id = track.id, detail = %detail, "Garmin already has this activity");
                    summary.duplicates += 1;
                }
                Ok(UploadOutcome::Rejected { detail }) => {
                    tracing::warn!(id = track.id, detail = %detail, "Garmin rejected the upload");
                    summary.failed += 1;
                }
                Err(e @ SyncError::Auth(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(id = track.id, error = %e, "Garmin upload failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response_is_accepted() {
        let response: UploadResponse = serde_json::from_str(
            r#"{"detailedImportResult": {
                "uploadId": 343305965951,
                "successes": [{"internalId": 14412345678}],
                "failures": []
            }}"#,
        )
        .unwrap();
        match response.detailed_import_result.outcome() {
            UploadOutcome::Accepted { upload_id } => assert_eq!(upload_id, 343305965951i64),
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_failure_code() {
        let response: UploadResponse = serde_json::from_str(
            r#"{"detailedImportResult": {
                "uploadId": "",
                "failures": [{"messages": [{"code": 202, "content": "Duplicate Activity"}]}]
            }}"#,
        )
        .unwrap();
        assert!(matches!(
            response.detailed_import_result.outcome(),
            UploadOutcome::Duplicate { .. }
        ));
    }

    #[test]
    fn test_other_failure_is_rejected() {
        let response: UploadResponse = serde_json::from_str(
            r#"{"detailedImportResult": {
                "uploadId": "",
                "failures": [{"messages": [{"code": 407, "content": "The file is corrupt"}]}]
            }}"#,
        )
        .unwrap();
        match response.detailed_import_result.outcome() {
            UploadOutcome::Rejected { detail } => assert!(detail.contains("407")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_import_result_defaults_to_accepted() {
        // Some error paths answer with an empty object; treat that as
        // accepted rather than inventing a failure.
        let response: UploadResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            response.detailed_import_result.outcome(),
            UploadOutcome::Accepted { .. }
        ));
    }

    fn tiny_fit() -> Vec<u8> {
        let mut file = vec![14u8, 0x20];
        file.extend_from_slice(&2140u16.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // no records yet
        file.extend_from_slice(b".FIT");
        file.extend_from_slice(&[0, 0]); // header CRC
        file.extend_from_slice(&0u16.to_le_bytes()); // file CRC
        file
    }

    #[test]
    fn test_fake_device_rewrites_fit_only() {
        let uploader = GarminUploader::new("secret".into(), false, true);

        let fit = NewTrack {
            id: 1,
            format: TrackFormat::Fit,
            bytes: tiny_fit(),
        };
        let rewritten = uploader.prepare(&fit);
        assert_ne!(rewritten, fit.bytes);
        assert!(fit_device::is_fit(&rewritten));

        let gpx = NewTrack {
            id: 2,
            format: TrackFormat::Gpx,
            bytes: b"<gpx/>".to_vec(),
        };
        assert_eq!(uploader.prepare(&gpx), gpx.bytes);
    }

    #[test]
    fn test_plain_upload_leaves_bytes_alone() {
        let uploader = GarminUploader::new("secret".into(), true, false);
        assert!(uploader.base_url.starts_with("https://connectapi.garmin.cn"));
        let fit = NewTrack {
            id: 3,
            format: TrackFormat::Fit,
            bytes: tiny_fit(),
        };
        assert_eq!(uploader.prepare(&fit), fit.bytes);
    }
}
