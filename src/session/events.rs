//! Client-facing metadata events.
//!
//! Append-only per session, drained (not peeked) on each client poll and
//! shipped URI-encoded in the `X-Metadata` response header. Field names are
//! the client wire contract, hence camelCase.

use serde::Serialize;

use crate::scheduler::plan::{Segment, TrackPlan};

/// Client view of one playback segment.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentView {
    pub sample_offset: i64,
    pub sample_length: i64,
    pub tempo_adjustment: f64,
    pub real_time_start: i64,
    pub real_time_length: i64,
}

impl From<&Segment> for SegmentView {
    fn from(seg: &Segment) -> Self {
        Self {
            sample_offset: seg.sample_offset,
            sample_length: seg.sample_length,
            tempo_adjustment: seg.tempo_adjustment,
            real_time_start: seg.real_time_start,
            real_time_length: seg.real_time_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    SongStart {
        id: String,
        song_name: String,
        /// Adjusted-space sample at which the track starts.
        time: i64,
    },
    #[serde(rename_all = "camelCase")]
    SongDuration {
        id: String,
        /// Original-space samples.
        orig_duration: i64,
        tempo_adjustment: f64,
        playback_data: Vec<SegmentView>,
    },
    #[serde(rename_all = "camelCase")]
    TempoInfo {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        bpm_start: Option<f32>,
        bpm_end: f32,
        /// Beat timestamps in seconds, original-space.
        beats: Vec<f32>,
    },
    #[serde(rename_all = "camelCase")]
    ThumbnailReady { id: String },
    #[serde(rename_all = "camelCase")]
    NextSong { song_name: String },
}

impl Event {
    /// The `SONG_DURATION` event for a track's current playback plan.
    pub fn song_duration(track: &TrackPlan) -> Self {
        Event::SongDuration {
            id: track.id.clone(),
            orig_duration: track.total_length,
            tempo_adjustment: track.tempo_adjustment,
            playback_data: track.segments.iter().map(SegmentView::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_tags() {
        let ev = Event::SongStart {
            id: "abc".into(),
            song_name: "Track".into(),
            time: 0,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "SONG_START");
        assert_eq!(json["songName"], "Track");
        assert_eq!(json["time"], 0);
    }

    #[test]
    fn tempo_info_omits_absent_start_bpm() {
        let ev = Event::TempoInfo {
            id: "abc".into(),
            bpm_start: None,
            bpm_end: 128.0,
            beats: vec![0.5],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("bpmStart").is_none());
        assert_eq!(json["bpmEnd"], 128.0);
    }

    #[test]
    fn next_song_tag() {
        let ev = Event::NextSong {
            song_name: "B".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "NEXT_SONG");
    }
}
