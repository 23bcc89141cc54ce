// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! TCX (Training Center XML) decoding via quick-xml.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::coords::SourceCrs;
use crate::error::DecodeError;
use crate::models::{DecodedTrack, TrackPoint};

#[derive(Debug, Deserialize)]
#[serde(rename = "TrainingCenterDatabase")]
struct TrainingCenterDatabase {
    #[serde(rename = "Activities")]
    activities: Option<ActivityList>,
}

#[derive(Debug, Deserialize)]
struct ActivityList {
    #[serde(rename = "Activity", default)]
    activities: Vec<TcxActivity>,
}

#[derive(Debug, Deserialize)]
struct TcxActivity {
    #[serde(rename = "@Sport")]
    sport: Option<String>,
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "Lap", default)]
    laps: Vec<Lap>,
    #[serde(rename = "Notes")]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Lap {
    #[serde(rename = "Track", default)]
    tracks: Vec<Track>,
}

#[derive(Debug, Deserialize)]
struct Track {
    #[serde(rename = "Trackpoint", default)]
    trackpoints: Vec<Trackpoint>,
}

#[derive(Debug, Deserialize)]
struct Trackpoint {
    #[serde(rename = "Time")]
    time: Option<String>,
    #[serde(rename = "Position")]
    position: Option<Position>,
    #[serde(rename = "AltitudeMeters")]
    altitude_meters: Option<f64>,
    #[serde(rename = "HeartRateBpm")]
    heart_rate_bpm: Option<HeartRateBpm>,
    #[serde(rename = "Cadence")]
    cadence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Position {
    #[serde(rename = "LatitudeDegrees")]
    latitude_degrees: String,
    #[serde(rename = "LongitudeDegrees")]
    longitude_degrees: String,
}

#[derive(Debug, Deserialize)]
struct HeartRateBpm {
    #[serde(rename = "Value")]
    value: Option<f64>,
}

/// A decoded TCX document: the track plus the activity's own metadata.
#[derive(Debug)]
pub struct DecodedTcx {
    pub track: DecodedTrack,
    pub sport: Option<String>,
    pub activity_id: Option<String>,
    pub notes: Option<String>,
}

pub fn decode_tcx(bytes: &[u8], crs: SourceCrs) -> Result<DecodedTcx, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::malformed("tcx", "not valid UTF-8"))?
        .trim_start_matches('\u{feff}');
    let doc: TrainingCenterDatabase =
        quick_xml::de::from_str(text).map_err(|e| DecodeError::malformed("tcx", e.to_string()))?;

    let activity = doc
        .activities
        .and_then(|a| a.activities.into_iter().next())
        .ok_or_else(|| DecodeError::malformed("tcx", "no activity element"))?;

    let mut points = Vec::new();
    for lap in &activity.laps {
        for track in &lap.tracks {
            for tp in &track.trackpoints {
                // Trackpoints without a position (treadmill pace samples)
                // carry no track information.
                let Some(pos) = tp.position.as_ref() else {
                    continue;
                };
                let (Ok(lat), Ok(lon)) = (
                    pos.latitude_degrees.trim().parse::<f64>(),
                    pos.longitude_degrees.trim().parse::<f64>(),
                ) else {
                    continue;
                };
                let Some(time) = tp.time.as_deref().and_then(parse_tcx_time) else {
                    continue;
                };
                let mut point = TrackPoint::new(time, lat, lon);
                point.elevation = tp.altitude_meters;
                point.heart_rate = tp.heart_rate_bpm.as_ref().and_then(|h| h.value);
                point.cadence = tp.cadence;
                points.push(point);
            }
        }
    }

    let track = DecodedTrack::from_points(points, crs, &[])?;
    Ok(DecodedTcx {
        track,
        sport: activity.sport,
        activity_id: activity.id,
        notes: activity.notes,
    })
}

fn parse_tcx_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<TrainingCenterDatabase xmlns="http://www.garmin.com/xmlschemas/TrainingCenterDatabase/v2">
  <Activities>
    <Activity Sport="Running">
      <Id>2024-03-01T08:00:00Z</Id>
      <Lap StartTime="2024-03-01T08:00:00Z">
        <TotalTimeSeconds>120.0</TotalTimeSeconds>
        <DistanceMeters>420.0</DistanceMeters>
        <Track>
          <Trackpoint>
            <Time>2024-03-01T08:00:00Z</Time>
            <Position>
              <LatitudeDegrees>37.4219</LatitudeDegrees>
              <LongitudeDegrees>-122.0841</LongitudeDegrees>
            </Position>
            <AltitudeMeters>12.0</AltitudeMeters>
            <HeartRateBpm><Value>139</Value></HeartRateBpm>
            <Cadence>82</Cadence>
          </Trackpoint>
          <Trackpoint>
            <Time>2024-03-01T08:01:00Z</Time>
            <Position>
              <LatitudeDegrees>37.4229</LatitudeDegrees>
              <LongitudeDegrees>-122.0841</LongitudeDegrees>
            </Position>
            <AltitudeMeters>15.0</AltitudeMeters>
            <HeartRateBpm><Value>148</Value></HeartRateBpm>
          </Trackpoint>
          <Trackpoint>
            <Time>2024-03-01T08:02:00Z</Time>
            <Position>
              <LatitudeDegrees>37.4239</LatitudeDegrees>
              <LongitudeDegrees>-122.0841</LongitudeDegrees>
            </Position>
          </Trackpoint>
        </Track>
      </Lap>
      <Notes>easy pace</Notes>
    </Activity>
  </Activities>
</TrainingCenterDatabase>"#;

    #[test]
    fn test_decode_sample() {
        let doc = decode_tcx(SAMPLE_TCX.as_bytes(), SourceCrs::Wgs84).unwrap();
        assert_eq!(doc.sport.as_deref(), Some("Running"));
        assert_eq!(doc.activity_id.as_deref(), Some("2024-03-01T08:00:00Z"));
        assert_eq!(doc.notes.as_deref(), Some("easy pace"));
        assert_eq!(doc.track.points.len(), 3);
        assert_eq!(doc.track.elapsed_time, 120);
        assert_eq!(doc.track.points[0].heart_rate, Some(139.0));
        assert_eq!(doc.track.points[0].cadence, Some(82.0));
        assert_eq!(doc.track.elevation_gain, Some(3.0));
    }

    #[test]
    fn test_decode_positionless_trackpoints_skipped() {
        let tcx = r#"<TrainingCenterDatabase><Activities>
          <Activity Sport="Running">
            <Lap><Track>
              <Trackpoint><Time>2024-03-01T08:00:00Z</Time></Trackpoint>
              <Trackpoint><Time>2024-03-01T08:01:00Z</Time></Trackpoint>
            </Track></Lap>
          </Activity>
        </Activities></TrainingCenterDatabase>"#;
        let err = decode_tcx(tcx.as_bytes(), SourceCrs::Wgs84).unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }

    #[test]
    fn test_decode_no_activity_is_malformed() {
        let err = decode_tcx(b"<TrainingCenterDatabase/>", SourceCrs::Wgs84).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = decode_tcx(b"\x00\x01\x02", SourceCrs::Wgs84).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }
}
