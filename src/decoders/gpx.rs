// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! GPX 1.1 reading and writing via quick-xml.
//!
//! Reading is lenient: points with an unparseable position or no
//! timestamp are dropped and the rest of the track survives. Heart rate
//! and cadence come from the Garmin TrackPointExtension under any of
//! the prefixes seen in the wild.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::coords::SourceCrs;
use crate::error::DecodeError;
use crate::models::{DecodedTrack, TrackPoint};

const GPX_NS: &str = "http://www.topografix.com/GPX/1/1";
const TPX_NS: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "gpx")]
struct GpxFile {
    #[serde(rename = "@version", skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(rename = "@creator", skip_serializing_if = "Option::is_none")]
    creator: Option<String>,
    #[serde(rename = "@xmlns", skip_serializing_if = "Option::is_none")]
    xmlns: Option<String>,
    #[serde(rename = "@xmlns:gpxtpx", skip_serializing_if = "Option::is_none")]
    xmlns_gpxtpx: Option<String>,
    #[serde(rename = "metadata", skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
    #[serde(rename = "trk", default)]
    tracks: Vec<Trk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    #[serde(rename = "time", skip_serializing_if = "Option::is_none")]
    time: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Trk {
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    track_type: Option<String>,
    #[serde(rename = "trkseg", default)]
    segments: Vec<TrkSeg>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrkSeg {
    #[serde(rename = "trkpt", default)]
    points: Vec<TrkPt>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrkPt {
    #[serde(rename = "@lat")]
    lat: String,
    #[serde(rename = "@lon")]
    lon: String,
    #[serde(rename = "ele", skip_serializing_if = "Option::is_none")]
    ele: Option<String>,
    #[serde(rename = "time", skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(rename = "extensions", skip_serializing_if = "Option::is_none")]
    extensions: Option<Extensions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Extensions {
    #[serde(
        rename(serialize = "gpxtpx:TrackPointExtension", deserialize = "TrackPointExtension"),
        alias = "gpxtpx:TrackPointExtension",
        alias = "ns3:TrackPointExtension",
        skip_serializing_if = "Option::is_none"
    )]
    track_point: Option<TrackPointExtension>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackPointExtension {
    #[serde(
        rename(serialize = "gpxtpx:hr", deserialize = "hr"),
        alias = "gpxtpx:hr",
        alias = "ns3:hr",
        skip_serializing_if = "Option::is_none"
    )]
    hr: Option<String>,
    #[serde(
        rename(serialize = "gpxtpx:cad", deserialize = "cad"),
        alias = "gpxtpx:cad",
        alias = "ns3:cad",
        skip_serializing_if = "Option::is_none"
    )]
    cad: Option<String>,
}

/// A decoded GPX document: the track plus its self-described metadata.
#[derive(Debug)]
pub struct DecodedGpx {
    pub track: DecodedTrack,
    pub name: Option<String>,
    pub track_type: Option<String>,
    pub creator: Option<String>,
}

pub fn decode_gpx(bytes: &[u8], crs: SourceCrs) -> Result<DecodedGpx, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::malformed("gpx", "not valid UTF-8"))?;
    let doc: GpxFile =
        quick_xml::de::from_str(text).map_err(|e| DecodeError::malformed("gpx", e.to_string()))?;

    let mut points = Vec::new();
    for trk in &doc.tracks {
        for seg in &trk.segments {
            for pt in &seg.points {
                let (Ok(lat), Ok(lon)) = (pt.lat.trim().parse::<f64>(), pt.lon.trim().parse::<f64>())
                else {
                    continue;
                };
                let Some(time) = pt.time.as_deref().and_then(parse_gpx_time) else {
                    continue;
                };
                let mut point = TrackPoint::new(time, lat, lon);
                point.elevation = pt.ele.as_deref().and_then(|e| e.trim().parse().ok());
                if let Some(tpx) = pt.extensions.as_ref().and_then(|e| e.track_point.as_ref()) {
                    point.heart_rate = tpx.hr.as_deref().and_then(|h| h.trim().parse().ok());
                    point.cadence = tpx.cad.as_deref().and_then(|c| c.trim().parse().ok());
                }
                points.push(point);
            }
        }
    }

    let track = DecodedTrack::from_points(points, crs, &[])?;
    let first = doc.tracks.into_iter().next();
    Ok(DecodedGpx {
        track,
        name: first.as_ref().and_then(|t| t.name.clone()),
        track_type: first.and_then(|t| t.track_type),
        creator: doc.creator,
    })
}

fn parse_gpx_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    // Some exporters drop the timezone suffix; those stamps are UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

/// Render a track back out as GPX 1.1, for file capture of providers
/// that only serve JSON point streams.
pub fn write_gpx(
    track: &DecodedTrack,
    name: &str,
    track_type: Option<&str>,
    creator: &str,
) -> anyhow::Result<String> {
    let has_hr = track.points.iter().any(|p| p.heart_rate.is_some());
    let points = track
        .points
        .iter()
        .map(|p| TrkPt {
            lat: format!("{:.6}", p.lat),
            lon: format!("{:.6}", p.lon),
            ele: p.elevation.map(|e| format!("{e:.1}")),
            time: Some(p.time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            extensions: p.heart_rate.map(|hr| Extensions {
                track_point: Some(TrackPointExtension {
                    hr: Some(format!("{}", hr.round() as i64)),
                    cad: p.cadence.map(|c| format!("{}", c.round() as i64)),
                }),
            }),
        })
        .collect();

    let file = GpxFile {
        version: Some("1.1".to_string()),
        creator: Some(creator.to_string()),
        xmlns: Some(GPX_NS.to_string()),
        xmlns_gpxtpx: has_hr.then(|| TPX_NS.to_string()),
        metadata: Some(Metadata {
            time: Some(track.start_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }),
        tracks: vec![Trk {
            name: Some(name.to_string()),
            track_type: track_type.map(str::to_string),
            segments: vec![TrkSeg { points }],
        }],
    };
    let body = quick_xml::se::to_string(&file)?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="Garmin Connect"
     xmlns="http://www.topografix.com/GPX/1/1"
     xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
  <metadata><time>2024-03-01T08:00:00Z</time></metadata>
  <trk>
    <name>Morning Run</name>
    <type>running</type>
    <trkseg>
      <trkpt lat="37.4219" lon="-122.0841">
        <ele>12.0</ele>
        <time>2024-03-01T08:00:00Z</time>
        <extensions>
          <gpxtpx:TrackPointExtension>
            <gpxtpx:hr>142</gpxtpx:hr>
            <gpxtpx:cad>85</gpxtpx:cad>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
      <trkpt lat="37.4229" lon="-122.0841">
        <ele>14.5</ele>
        <time>2024-03-01T08:01:00Z</time>
        <extensions>
          <gpxtpx:TrackPointExtension>
            <gpxtpx:hr>151</gpxtpx:hr>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
      <trkpt lat="bogus" lon="-122.0841">
        <time>2024-03-01T08:01:30Z</time>
      </trkpt>
      <trkpt lat="37.4239" lon="-122.0841">
        <time>2024-03-01T08:02:00Z</time>
      </trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_decode_sample() {
        let doc = decode_gpx(SAMPLE_GPX.as_bytes(), SourceCrs::Wgs84).unwrap();
        assert_eq!(doc.name.as_deref(), Some("Morning Run"));
        assert_eq!(doc.track_type.as_deref(), Some("running"));
        assert_eq!(doc.creator.as_deref(), Some("Garmin Connect"));
        // The bogus-latitude point is dropped, the rest survive.
        assert_eq!(doc.track.points.len(), 3);
        assert_eq!(doc.track.elapsed_time, 120);
        assert_eq!(doc.track.points[0].heart_rate, Some(142.0));
        assert_eq!(doc.track.points[0].cadence, Some(85.0));
        assert_eq!(doc.track.points[0].elevation, Some(12.0));
        assert_eq!(doc.track.points[2].heart_rate, None);
    }

    #[test]
    fn test_decode_ns3_prefix() {
        let gpx = SAMPLE_GPX.replace("gpxtpx:", "ns3:");
        let doc = decode_gpx(gpx.as_bytes(), SourceCrs::Wgs84).unwrap();
        assert_eq!(doc.track.points[0].heart_rate, Some(142.0));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = decode_gpx(b"not xml at all", SourceCrs::Wgs84).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_decode_no_timed_points_is_empty() {
        let gpx = r#"<gpx><trk><trkseg>
            <trkpt lat="37.0" lon="-122.0"/>
            <trkpt lat="37.1" lon="-122.0"/>
        </trkseg></trk></gpx>"#;
        let err = decode_gpx(gpx.as_bytes(), SourceCrs::Wgs84).unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }

    #[test]
    fn test_write_then_decode_round_trip() {
        let decoded = decode_gpx(SAMPLE_GPX.as_bytes(), SourceCrs::Wgs84).unwrap();
        let out = write_gpx(&decoded.track, "Morning Run", Some("Run"), "stride-sync").unwrap();
        assert!(out.starts_with("<?xml"));
        assert!(out.contains("gpxtpx:hr"));

        let again = decode_gpx(out.as_bytes(), SourceCrs::Wgs84).unwrap();
        assert_eq!(again.name.as_deref(), Some("Morning Run"));
        assert_eq!(again.track.points.len(), decoded.track.points.len());
        assert_eq!(again.track.elapsed_time, decoded.track.elapsed_time);
        assert_eq!(again.track.points[0].heart_rate, Some(142.0));
    }

    #[test]
    fn test_naive_timestamps_treated_as_utc() {
        let gpx = r#"<gpx><trk><trkseg>
            <trkpt lat="37.0" lon="-122.0"><time>2024-03-01T08:00:00</time></trkpt>
            <trkpt lat="37.001" lon="-122.0"><time>2024-03-01T08:01:00</time></trkpt>
        </trkseg></trk></gpx>"#;
        let doc = decode_gpx(gpx.as_bytes(), SourceCrs::Wgs84).unwrap();
        assert_eq!(doc.track.elapsed_time, 60);
    }
}
