// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Reverse geocoding of activity start points via Nominatim.
//!
//! Strictly best-effort: a failed lookup is logged and the activity is
//! stored without a country, never dropped.

use std::time::Duration;

use serde::Deserialize;

use crate::models::LatLng;

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Nominatim reverse-geocode client.
#[derive(Clone)]
pub struct Geocoder {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

impl Geocoder {
    pub fn new() -> Self {
        Self::with_base_url(NOMINATIM_URL)
    }

    /// Point the client somewhere else (tests, self-hosted Nominatim).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            // Nominatim's usage policy requires an identifying UA.
            http: reqwest::Client::builder()
                .user_agent("stride-sync")
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
        }
    }

    /// Resolve a point to a human-readable place name, retrying once
    /// after a second. Returns `None` on any failure.
    pub async fn reverse(&self, point: LatLng) -> Option<String> {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match self.try_reverse(point).await {
                Ok(name) => return name,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        lat = point.lat,
                        lon = point.lon,
                        attempt,
                        "Reverse geocode failed"
                    );
                }
            }
        }
        None
    }

    async fn try_reverse(&self, point: LatLng) -> Result<Option<String>, reqwest::Error> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", point.lat.to_string()),
                ("lon", point.lon.to_string()),
                ("accept-language", "zh-CN".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: ReverseResponse = response.json().await?;
        Ok(body.display_name)
    }
}

impl Default for Geocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_response_shape() {
        let body = r#"{"place_id":1,"display_name":"海淀区, 北京市, 中国","lat":"39.9","lon":"116.4"}"#;
        let parsed: ReverseResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.display_name.as_deref(), Some("海淀区, 北京市, 中国"));
    }

    #[test]
    fn test_missing_display_name_is_none() {
        let parsed: ReverseResponse = serde_json::from_str(r#"{"error":"Unable to geocode"}"#).unwrap();
        assert_eq!(parsed.display_name, None);
    }
}
