// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stride command-line entry point.
//!
//! Parses the subcommand, builds the matching provider adapter, runs the
//! sync pipeline against the local store and optionally pushes the new
//! tracks out to Strava or Garmin. Progress marks go to stdout;
//! diagnostics go to stderr via `tracing`.

use std::process::ExitCode;

use chrono_tz::Tz;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stride_sync::{
    cli::{Cli, Command, SyncFlags},
    config::{Config, ConfigError},
    db::ActivityStore,
    error::{Result, SyncError},
    privacy::PrivacyFilter,
    providers::{
        codoon::CodoonProvider, coros::CorosProvider, endomondo::EndomondoProvider,
        garmin::GarminProvider, igpsport::IGPSportProvider, joyrun::JoyrunProvider,
        keep::KeepProvider, komoot::KomootProvider, nike::NikeProvider, onelap::OnelapProvider,
        oppo::OppoProvider, strava::StravaProvider, tulipsport::TulipsportProvider,
        xingzhe::XingzheProvider, Provider,
    },
    services::{GarminUploader, StravaUploader, SyncRunner},
};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Auth and config problems land here too; only argument
            // parsing (handled by clap) exits 2.
            tracing::error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    let store = ActivityStore::open(&config.db_path())?;

    let tz: Tz = config.base_timezone.parse().map_err(|_| {
        SyncError::Config(ConfigError::Invalid {
            var: "BASE_TIMEZONE",
            reason: format!("unknown timezone {:?}", config.base_timezone),
        })
    })?;

    let (mut provider, flags): (Box<dyn Provider>, SyncFlags) = match cli.command {
        Command::Export => {
            let privacy = PrivacyFilter::from_config(&config);
            store.export_json(&config.json_path(), &privacy, !config.ignore_before_saving)?;
            println!(
                "Exported {} activities to {}",
                store.count()?,
                config.json_path().display()
            );
            return Ok(());
        }

        Command::Strava {
            client_id,
            client_secret,
            refresh_token,
            flags,
        } => (
            Box::new(StravaProvider::new(client_id, client_secret, refresh_token)),
            flags,
        ),

        Command::Garmin {
            secret_string,
            is_cn,
            flags,
        } => (
            Box::new(GarminProvider::new(
                secret_string,
                is_cn,
                flags.only_run,
                flags.download_format(),
                tz,
            )),
            flags,
        ),

        Command::Keep {
            mobile,
            password,
            sports,
            flags,
        } => (
            Box::new(KeepProvider::new(mobile, password, sports, tz)),
            flags,
        ),

        Command::Codoon {
            mobile,
            password,
            flags,
        } => (Box::new(CodoonProvider::new(mobile, password, tz)), flags),

        Command::Joyrun {
            phone_or_uid,
            code_or_sid,
            from_uid_sid,
            threshold,
            flags,
        } => {
            let provider = if from_uid_sid {
                let uid = phone_or_uid.parse::<i64>().map_err(|_| {
                    SyncError::auth(format!("joyrun: uid must be numeric, got {phone_or_uid:?}"))
                })?;
                JoyrunProvider::from_uid_sid(uid, code_or_sid, tz)
            } else {
                JoyrunProvider::with_phone_code(phone_or_uid, code_or_sid, tz)
            };
            (Box::new(provider.dedup_threshold(threshold)), flags)
        }

        Command::Coros {
            account,
            password,
            flags,
        } => (Box::new(CorosProvider::new(account, password, tz)), flags),

        Command::Nike {
            refresh_token,
            flags,
        } => (Box::new(NikeProvider::new(refresh_token, tz)), flags),

        Command::Oppo {
            client_id,
            client_secret,
            refresh_token,
            sync_months,
            flags,
        } => (
            Box::new(OppoProvider::new(
                client_id,
                client_secret,
                refresh_token,
                sync_months,
                tz,
            )),
            flags,
        ),

        Command::Tulipsport { token, flags } => (Box::new(TulipsportProvider::new(token)), flags),

        Command::Xingzhe {
            account_or_token,
            password_or_user_id,
            from_auth_token,
            flags,
        } => {
            if !from_auth_token {
                return Err(SyncError::auth(
                    "xingzhe: password login needs the app's RSA handshake; pass a \
                     session token and user id with --from-auth-token",
                ));
            }
            (
                Box::new(XingzheProvider::new(
                    account_or_token,
                    password_or_user_id,
                    tz,
                )),
                flags,
            )
        }

        Command::Igpsport {
            username,
            password,
            flags,
        } => (
            Box::new(IGPSportProvider::new(
                username,
                password,
                flags.download_format(),
                tz,
            )),
            flags,
        ),

        Command::Onelap {
            account,
            password,
            flags,
        } => (Box::new(OnelapProvider::new(account, password, tz)), flags),

        Command::Komoot {
            email,
            password,
            flags,
        } => (Box::new(KomootProvider::new(email, password)), flags),

        Command::Endomondo { export_dir, flags } => {
            (Box::new(EndomondoProvider::new(export_dir, tz)), flags)
        }
    };

    let runner = SyncRunner::new(&store, &config, flags.to_options());
    let report = runner.run(provider.as_mut()).await?;

    if flags.upload_to_strava {
        let client_id = Config::require(&config.strava_client_id, "STRAVA_CLIENT_ID")?;
        let client_secret = Config::require(&config.strava_client_secret, "STRAVA_CLIENT_SECRET")?;
        let refresh_token = Config::require(&config.strava_refresh_token, "STRAVA_REFRESH_TOKEN")?;
        let mut uploader = StravaUploader::new(
            client_id.to_string(),
            client_secret.to_string(),
            refresh_token.to_string(),
        );
        let summary = uploader.upload_all(&report.uploads, flags.only_run).await?;
        println!(
            "Strava upload: {} queued, {} duplicates, {} failed",
            summary.uploaded, summary.duplicates, summary.failed
        );
    }

    if flags.upload_to_garmin {
        let secret = Config::require(&config.garmin_secret_string, "GARMIN_SECRET_STRING")?;
        let uploader = GarminUploader::new(
            secret.to_string(),
            config.garmin_is_cn,
            flags.use_fake_garmin_device,
        );
        let summary = uploader.upload_all(&report.uploads).await?;
        println!(
            "Garmin upload: {} accepted, {} duplicates, {} failed",
            summary.uploaded, summary.duplicates, summary.failed
        );
    }

    Ok(())
}

/// Log to stderr so the progress marks on stdout stay clean.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stride_sync=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
