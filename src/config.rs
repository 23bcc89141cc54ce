// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Everything the pipeline needs at runtime is resolved once at startup and
//! threaded into the components explicitly; no module-level globals.

use std::env;
use std::path::PathBuf;

use crate::models::LatLng;

/// Default base timezone for providers that report wall-clock times
/// without a zone.
pub const DEFAULT_BASE_TIMEZONE: &str = "Asia/Shanghai";

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Layout ---
    /// Root directory; the store, JSON snapshot and track directories
    /// all live underneath it.
    pub root: PathBuf,

    // --- Normalization ---
    /// Timezone applied when a provider omits one (IANA name).
    pub base_timezone: String,

    // --- Privacy filter ---
    /// Anchor points (home/office) whose surroundings are elided.
    pub ignore_points: Vec<LatLng>,
    /// Radius around each anchor to elide, meters.
    pub ignore_range_m: f64,
    /// Distance trimmed from head and tail of every polyline, meters.
    pub ignore_start_end_range_m: f64,
    /// Apply the filter before upsert instead of at JSON export.
    pub ignore_before_saving: bool,

    // --- Cross-upload sinks (optional; validated when a sink is enabled) ---
    pub strava_client_id: Option<String>,
    pub strava_client_secret: Option<String>,
    pub strava_refresh_token: Option<String>,
    pub garmin_secret_string: Option<String>,
    pub garmin_is_cn: bool,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            base_timezone: DEFAULT_BASE_TIMEZONE.to_string(),
            ignore_points: Vec::new(),
            ignore_range_m: 0.0,
            ignore_start_end_range_m: 0.0,
            ignore_before_saving: false,
            strava_client_id: None,
            strava_client_secret: None,
            strava_refresh_token: None,
            garmin_secret_string: None,
            garmin_is_cn: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A malformed `IGNORE_POLYLINE` is a startup failure; missing sink
    /// credentials are not (they only matter once a sink is enabled).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let ignore_points = match env::var("IGNORE_POLYLINE") {
            Ok(encoded) if !encoded.is_empty() => crate::coords::decode_polyline(&encoded)
                .map_err(|e| ConfigError::Invalid {
                    var: "IGNORE_POLYLINE",
                    reason: e.to_string(),
                })?,
            _ => Vec::new(),
        };

        Ok(Self {
            root: env::var("DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            base_timezone: env::var("BASE_TIMEZONE")
                .unwrap_or_else(|_| DEFAULT_BASE_TIMEZONE.to_string()),
            ignore_points,
            ignore_range_m: parse_meters("IGNORE_RANGE")?,
            ignore_start_end_range_m: parse_meters("IGNORE_START_END_RANGE")?,
            ignore_before_saving: env::var("IGNORE_BEFORE_SAVING")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            strava_client_id: env::var("STRAVA_CLIENT_ID").ok(),
            strava_client_secret: env::var("STRAVA_CLIENT_SECRET").ok(),
            strava_refresh_token: env::var("STRAVA_REFRESH_TOKEN").ok(),
            garmin_secret_string: env::var("GARMIN_SECRET_STRING").ok(),
            garmin_is_cn: env::var("GARMIN_IS_CN")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
        })
    }

    // --- Persisted state layout ---

    pub fn db_path(&self) -> PathBuf {
        self.root.join("run_page").join("data.db")
    }

    pub fn json_path(&self) -> PathBuf {
        self.root.join("src").join("static").join("activities.json")
    }

    pub fn track_dir(&self, ext: &str) -> PathBuf {
        match ext {
            "gpx" => self.root.join("GPX_OUT"),
            "tcx" => self.root.join("TCX_OUT"),
            "fit" => self.root.join("FIT_OUT"),
            other => self.root.join(format!("{}_OUT", other.to_uppercase())),
        }
    }

    /// Required sink credential, by env var name.
    pub fn require<'a>(
        opt: &'a Option<String>,
        var: &'static str,
    ) -> Result<&'a str, ConfigError> {
        opt.as_deref().ok_or(ConfigError::Missing(var))
    }
}

fn parse_meters(var: &'static str) -> Result<f64, ConfigError> {
    match env::var(var) {
        Ok(v) if !v.is_empty() => v
            .trim()
            .parse::<f64>()
            .map_err(|_| ConfigError::Invalid {
                var,
                reason: format!("expected meters, got {v:?}"),
            }),
        _ => Ok(0.0),
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let config = Config {
            root: PathBuf::from("/tmp/workouts"),
            ..Config::default()
        };

        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/workouts/run_page/data.db")
        );
        assert_eq!(
            config.json_path(),
            PathBuf::from("/tmp/workouts/src/static/activities.json")
        );
        assert_eq!(config.track_dir("fit"), PathBuf::from("/tmp/workouts/FIT_OUT"));
    }

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("True"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("false"));
    }

    #[test]
    fn test_parse_meters_rejects_garbage() {
        env::set_var("IGNORE_RANGE", "not-a-number");
        let err = parse_meters("IGNORE_RANGE").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        env::remove_var("IGNORE_RANGE");
    }
}
