// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the pipeline.

pub mod activity;
pub mod track;

pub use activity::{Activity, ActivityRow, ActivityType, LatLng};
pub use track::{align_heart_rate, DecodedTrack, Pause, TrackPoint};
