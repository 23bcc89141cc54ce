// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Command-line surface.
//!
//! One subcommand per tracker service, each taking its credentials as
//! positionals, plus `export` to re-emit the JSON snapshot without
//! touching the network. Capture and sink flags are shared across the
//! sync subcommands; sink credentials come from the environment so they
//! never show up in shell history.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::decoders::TrackFormat;
use crate::providers::keep::KeepSport;
use crate::services::SyncOptions;

#[derive(Debug, Parser)]
#[command(
    name = "stride",
    version,
    about = "Pull workouts from tracker services into one local store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Capture and sink flags shared by every sync subcommand.
#[derive(Debug, Default, Args)]
pub struct SyncFlags {
    /// Save a GPX file for each new activity
    #[arg(long)]
    pub with_gpx: bool,

    /// Save a TCX file for each new activity (sources that serve TCX)
    #[arg(long)]
    pub with_tcx: bool,

    /// Save the original FIT file for each new activity
    #[arg(long)]
    pub with_fit: bool,

    /// Keep only runs, including treadmill runs
    #[arg(long)]
    pub only_run: bool,

    /// Push each new track to Strava; credentials from STRAVA_* env vars
    #[arg(long)]
    pub upload_to_strava: bool,

    /// Push each new track to Garmin Connect; token from GARMIN_SECRET_STRING
    #[arg(long)]
    pub upload_to_garmin: bool,

    /// Make uploaded FIT files claim a Garmin watch recorded them
    #[arg(long)]
    pub use_fake_garmin_device: bool,
}

impl SyncFlags {
    pub fn wants_uploads(&self) -> bool {
        self.upload_to_strava || self.upload_to_garmin
    }

    /// Download format for sources that export multiple formats.
    pub fn download_format(&self) -> TrackFormat {
        if self.with_fit {
            TrackFormat::Fit
        } else if self.with_tcx {
            TrackFormat::Tcx
        } else {
            TrackFormat::Gpx
        }
    }

    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            with_gpx: self.with_gpx,
            with_tcx: self.with_tcx,
            with_fit: self.with_fit,
            only_run: self.only_run,
            collect_uploads: self.wants_uploads(),
        }
    }
}

fn parse_sport(value: &str) -> Result<KeepSport, String> {
    match value.to_ascii_lowercase().as_str() {
        "running" => Ok(KeepSport::Running),
        "cycling" => Ok(KeepSport::Cycling),
        "hiking" => Ok(KeepSport::Hiking),
        other => Err(format!(
            "unknown sport {other:?} (expected running, cycling or hiking)"
        )),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync from Strava
    Strava {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Garmin Connect
    Garmin {
        /// OAuth token from the account bootstrap
        secret_string: String,
        /// Use the China tenant (garmin.cn)
        #[arg(long)]
        is_cn: bool,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Keep
    Keep {
        mobile: String,
        password: String,
        /// Sport to pull; repeat for several (default: running)
        #[arg(long = "sport", value_parser = parse_sport)]
        sports: Vec<KeepSport>,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Codoon
    Codoon {
        mobile: String,
        password: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Joyrun
    Joyrun {
        /// Phone number, or uid with --from-uid-sid
        phone_or_uid: String,
        /// SMS identifying code, or sid with --from-uid-sid
        code_or_sid: String,
        /// Treat the positionals as a captured uid and sid session
        #[arg(long)]
        from_uid_sid: bool,
        /// Seconds under which two recordings count as one session
        #[arg(long, default_value_t = 10)]
        threshold: i64,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from COROS
    Coros {
        account: String,
        password: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Nike Run Club
    Nike {
        refresh_token: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from OPPO Health (HeyTap)
    Oppo {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        /// Months of history to pull
        #[arg(long, default_value_t = 12)]
        sync_months: u32,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Tulipsport
    Tulipsport {
        token: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Xingzhe
    Xingzhe {
        /// Account, or a captured session token with --from-auth-token
        account_or_token: String,
        /// Password, or the numeric user id with --from-auth-token
        password_or_user_id: String,
        /// Treat the positionals as a pre-obtained auth token and user id
        #[arg(long)]
        from_auth_token: bool,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from iGPSPORT
    Igpsport {
        username: String,
        password: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Onelap
    Onelap {
        account: String,
        password: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Sync from Komoot
    Komoot {
        email: String,
        password: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Import a local Endomondo export
    Endomondo {
        /// Directory holding the export's JSON + GPX pairs
        export_dir: PathBuf,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Re-emit the activities JSON snapshot from the store
    Export,
}
