// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - sync orchestration and upload sinks.

pub mod fit_device;
pub mod garmin_upload;
pub mod geocode;
pub mod strava_upload;
pub mod sync;

pub use garmin_upload::GarminUploader;
pub use geocode::Geocoder;
pub use strava_upload::StravaUploader;
pub use sync::{SyncOptions, SyncReport, SyncRunner, UploadSummary};
