// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Track decoders: GPX, TCX and FIT bytes into a [`DecodedTrack`].

pub mod fit;
pub mod gpx;
pub mod tcx;

pub use fit::decode_fit;
pub use gpx::{decode_gpx, write_gpx};
pub use tcx::decode_tcx;

use crate::coords::SourceCrs;
use crate::error::DecodeError;
use crate::models::DecodedTrack;

/// Track file format on the wire and on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFormat {
    Gpx,
    Tcx,
    Fit,
}

impl TrackFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TrackFormat::Gpx => "gpx",
            TrackFormat::Tcx => "tcx",
            TrackFormat::Fit => "fit",
        }
    }
}

impl std::fmt::Display for TrackFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Decode track bytes in any supported format.
pub fn decode(
    format: TrackFormat,
    bytes: &[u8],
    crs: SourceCrs,
) -> Result<DecodedTrack, DecodeError> {
    match format {
        TrackFormat::Gpx => decode_gpx(bytes, crs).map(|d| d.track),
        TrackFormat::Tcx => decode_tcx(bytes, crs).map(|d| d.track),
        TrackFormat::Fit => decode_fit(bytes, crs).map(|d| d.track),
    }
}
