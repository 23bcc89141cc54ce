// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Stride-Sync: one local store for workouts scattered across trackers
//!
//! This crate pulls activities from a dozen-odd tracker services,
//! normalizes them into a single record shape backed by SQLite, and can
//! push the new tracks back out to Strava or Garmin Connect.

pub mod cli;
pub mod config;
pub mod coords;
pub mod db;
pub mod decoders;
pub mod error;
pub mod models;
pub mod privacy;
pub mod providers;
pub mod services;
pub mod time_utils;
