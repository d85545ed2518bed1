//! Per-track playback plan.
//!
//! A `TrackPlan` is the scheduler's record of one track inside a session:
//! where it sits on the tempo-adjusted session timeline, which original-space
//! segments compose it, and what the analysis worker has reported so far.

use std::path::PathBuf;
use std::sync::Arc;

use crate::timing;
use crate::worker::AnalysisWorker;

/// One contiguous original-space run played at a single tempo ratio.
///
/// `sample_offset` is always a multiple of the transform block size so that
/// `duration_after_adjustment(sample_offset, tempo)` is exactly the
/// adjusted-space offset of the segment's content within the worker's
/// full-track rendition; the mixer relies on that when it turns a session
/// timeline range into a piece request.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Original-space start within the track.
    pub sample_offset: i64,
    /// Original-space length.
    pub sample_length: i64,
    /// Tempo ratio for this segment (may differ per segment).
    pub tempo_adjustment: f64,
    /// Adjusted-space start on the session timeline. Cache; owned by
    /// [`TrackPlan::fix_timing`].
    pub real_time_start: i64,
    /// Adjusted-space length. Cache; owned by [`TrackPlan::fix_timing`].
    pub real_time_length: i64,
}

impl Segment {
    pub fn new(sample_offset: i64, sample_length: i64, tempo_adjustment: f64) -> Self {
        Self {
            sample_offset,
            sample_length,
            tempo_adjustment,
            real_time_start: 0,
            real_time_length: 0,
        }
    }

    /// Adjusted-space end on the session timeline.
    pub fn real_time_end(&self) -> i64 {
        self.real_time_start + self.real_time_length
    }
}

/// Scheduler state of one track in a session.
#[derive(Clone)]
pub struct TrackPlan {
    /// 16-char `[0-9a-z]` id, unique within the session's current + finished
    /// sets.
    pub id: String,
    pub path: PathBuf,
    pub name: String,

    /// Adjusted-space start on the session timeline. Meaningful only once
    /// `committed`.
    pub start_time: i64,
    /// Adjusted-space end; maintained by [`fix_timing`](Self::fix_timing).
    pub end_time: i64,
    /// Original-space samples skipped at the track's start.
    pub offset: i64,
    /// Original-space duration. Provisional until the worker reports the real
    /// one.
    pub total_length: i64,
    pub tempo_adjustment: f64,

    /// Absent until detected; 0 when detection explicitly failed.
    pub bpm_start: Option<f32>,
    pub bpm_end: Option<f32>,
    /// Beat timestamps in seconds, original-space.
    pub beats: Vec<f32>,

    /// Ordered, contiguous, gapless cover of `[start_time, end_time)`.
    pub segments: Vec<Segment>,

    /// Fade envelope lengths, adjusted-space samples.
    pub fade_in: i64,
    pub fade_out: i64,

    /// Timeline position fixed (follow-ups only commit after tempo
    /// detection succeeds).
    pub committed: bool,
    /// Analysis finished, timing final.
    pub ready: bool,
    pub skippable: bool,

    pub worker: Arc<AnalysisWorker>,
}

impl TrackPlan {
    /// Recompute every segment's cached adjusted-space timing and this
    /// track's `end_time`. Must run after any segment mutation and after any
    /// `start_time` shift.
    pub fn fix_timing(&mut self) {
        let mut cursor = self.start_time;
        for seg in &mut self.segments {
            seg.real_time_start = cursor;
            seg.real_time_length =
                timing::duration_after_adjustment(seg.sample_length, seg.tempo_adjustment);
            cursor += seg.real_time_length;
        }
        self.end_time = cursor;
    }

    /// Whether this track is live anywhere inside `[from, to)`.
    pub fn overlaps(&self, from: i64, to: i64) -> bool {
        self.committed && self.start_time < to && self.end_time > from
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::timing::BLOCK_SIZE;
    use crate::worker::{AnalysisWorker, WorkerSpec};

    pub(crate) fn dead_worker() -> Arc<AnalysisWorker> {
        // Spawning `false` yields a process that exits immediately; the plan
        // tests only need a handle, never a live protocol.
        AnalysisWorker::spawn(&WorkerSpec {
            command: vec!["false".to_string()],
            track: PathBuf::from("/dev/null"),
            channels: 2,
            sample_rate: 48_000,
            want_start_bpm: false,
        })
        .expect("spawn /bin/false")
    }

    fn plan_with(segments: Vec<Segment>, start_time: i64) -> TrackPlan {
        TrackPlan {
            id: "t".into(),
            path: PathBuf::from("/x.mp3"),
            name: "x".into(),
            start_time,
            end_time: 0,
            offset: 0,
            total_length: segments.iter().map(|s| s.sample_length).sum(),
            tempo_adjustment: 1.0,
            bpm_start: None,
            bpm_end: None,
            beats: Vec::new(),
            segments,
            fade_in: 0,
            fade_out: 0,
            committed: true,
            ready: true,
            skippable: true,
            worker: dead_worker(),
        }
    }

    #[tokio::test]
    async fn fix_timing_is_contiguous_and_gapless() {
        let mut plan = plan_with(
            vec![
                Segment::new(0, BLOCK_SIZE * 4, 1.0),
                Segment::new(BLOCK_SIZE * 4, BLOCK_SIZE * 2, 2.0),
            ],
            1000,
        );
        plan.fix_timing();
        assert_eq!(plan.segments[0].real_time_start, 1000);
        assert_eq!(plan.segments[0].real_time_length, BLOCK_SIZE * 4);
        assert_eq!(plan.segments[1].real_time_start, 1000 + BLOCK_SIZE * 4);
        assert_eq!(plan.segments[1].real_time_length, BLOCK_SIZE);
        assert_eq!(plan.end_time, plan.segments[1].real_time_end());
    }

    #[tokio::test]
    async fn start_shift_moves_every_segment() {
        let mut plan = plan_with(vec![Segment::new(0, BLOCK_SIZE * 3, 1.1)], 0);
        plan.fix_timing();
        let end = plan.end_time;
        plan.start_time -= 500;
        plan.fix_timing();
        assert_eq!(plan.end_time, end - 500);
        assert_eq!(plan.segments[0].real_time_start, -500);
    }

    #[tokio::test]
    async fn overlap_requires_commit() {
        let mut plan = plan_with(vec![Segment::new(0, BLOCK_SIZE, 1.0)], 0);
        plan.fix_timing();
        assert!(plan.overlaps(0, 1));
        plan.committed = false;
        assert!(!plan.overlaps(0, 1));
    }
}
