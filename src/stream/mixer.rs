//! The buffer-fill loop: pull adjusted-space waveform slices for every live
//! track, blend them under crossfade envelopes and feed the encoder.
//!
//! Each pass runs with the session state lock held, so a skip or a commit
//! never mutates timing mid-pass. Passes are bounded: never more than two
//! seconds of audio, never across a track boundary, so finish/follow-up
//! bookkeeping happens at fine granularity.

use std::sync::Arc;

use futures_util::future::join_all;

use crate::config::SAMPLE_RATE;
use crate::error::Result;
use crate::scheduler::{self, plan::TrackPlan};
use crate::session::Session;
use crate::timing;
use crate::worker::AnalysisWorker;

/// Upper bound of one pass, in adjusted-space samples.
fn pass_limit() -> i64 {
    2 * SAMPLE_RATE as i64
}

pub fn spawn_mix_loop(session: Arc<Session>) {
    tokio::spawn(async move {
        loop {
            if session.is_killed() {
                return;
            }
            let has_demand = { session.state.lock().await.samples_to_add > 0 };
            if !has_demand {
                session.demand.notified().await;
                continue;
            }
            if let Err(e) = pass(&session).await {
                log::error!("[{}] Mix loop failed: {e}", session.sid);
                session.destroy().await;
                return;
            }
        }
    });
}

/// One slice request against one track's worker, with everything needed to
/// apply that track's fade envelope afterwards.
struct PieceJob {
    track_id: String,
    worker: Arc<AnalysisWorker>,
    /// Frame offset within the worker's full adjusted rendition.
    piece_offset: i64,
    /// Frames requested.
    frames: i64,
    tempo: f64,
    /// Frame offset of this slice within the pass buffer.
    dest: i64,
    track_start: i64,
    track_end: i64,
    fade_in: i64,
    fade_out: i64,
}

async fn pass(session: &Arc<Session>) -> Result<()> {
    let mut state = session.state.lock().await;
    let position = state.encoder_position;

    let mut frames = state.samples_to_add.min(pass_limit());
    for track in state.current.iter().filter(|t| t.committed) {
        // Never write across a track boundary in one pass.
        if track.end_time > position {
            frames = frames.min(track.end_time - position);
        }
        if track.start_time > position {
            frames = frames.min(track.start_time - position);
        }
    }
    if frames <= 0 {
        return Ok(());
    }
    let window_end = position + frames;

    let jobs: Vec<PieceJob> = state
        .current
        .iter()
        .filter(|t| t.overlaps(position, window_end))
        .flat_map(|track| piece_jobs(track, position, window_end))
        .collect();

    let results = join_all(jobs.iter().map(|job| {
        let worker = Arc::clone(&job.worker);
        async move { worker.get_piece(job.piece_offset, job.frames, job.tempo).await }
    }))
    .await;

    let channels = session.channels as usize;
    let mut buf = vec![0.0f32; frames as usize * channels];
    let mut faulted: Option<String> = None;
    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(samples) => mix_piece(&mut buf, channels, position, job, &samples),
            Err(e) => {
                log::warn!(
                    "[{}] Piece request failed on track '{}': {e}",
                    session.sid,
                    job.track_id
                );
                faulted = Some(job.track_id.clone());
            }
        }
    }

    if let Some(id) = faulted {
        // Playing track lost its worker. Drop it and restart the stream at
        // the current position; skip this pass's write.
        scheduler::replace_faulted_track(session, &mut state, &id);
        return Ok(());
    }

    session.encoder.write_pcm(&buf).await?;
    state.encoder_position = window_end;
    state.samples_to_add -= frames;

    let ended: Vec<String> = state
        .current
        .iter()
        .filter(|t| t.committed && t.end_time <= state.encoder_position)
        .map(|t| t.id.clone())
        .collect();
    for id in ended {
        scheduler::finish_track(session, &mut state, &id);
    }
    if scheduler::needs_follow_up(&state) {
        scheduler::begin_follow_up(session, &mut state);
    }
    Ok(())
}

/// Slice requests for the parts of `track` inside `[from, to)`, one per
/// overlapped segment.
fn piece_jobs(track: &TrackPlan, from: i64, to: i64) -> Vec<PieceJob> {
    let mut jobs = Vec::new();
    for seg in &track.segments {
        let start = seg.real_time_start.max(from);
        let end = seg.real_time_end().min(to);
        if start >= end {
            continue;
        }
        // Offset of this slice inside the worker's full-track rendition:
        // the segment's content starts at the adjusted length of everything
        // before its original-space offset.
        let content_start =
            timing::duration_after_adjustment(seg.sample_offset, seg.tempo_adjustment);
        jobs.push(PieceJob {
            track_id: track.id.clone(),
            worker: Arc::clone(&track.worker),
            piece_offset: content_start + (start - seg.real_time_start),
            frames: end - start,
            tempo: seg.tempo_adjustment,
            dest: start - from,
            track_start: track.start_time,
            track_end: track.end_time,
            fade_in: track.fade_in,
            fade_out: track.fade_out,
        });
    }
    jobs
}

/// Add one slice into the pass buffer under the track's fade envelope.
fn mix_piece(buf: &mut [f32], channels: usize, window_start: i64, job: &PieceJob, samples: &[f32]) {
    let frames = (samples.len() / channels).min(job.frames as usize);
    for i in 0..frames {
        let at = window_start + job.dest + i as i64;
        let vol = envelope(at, job.track_start, job.track_end, job.fade_in, job.fade_out);
        for ch in 0..channels {
            let dst = (job.dest as usize + i) * channels + ch;
            buf[dst] += samples[i * channels + ch] * vol;
        }
    }
}

/// Fade volume of a track at adjusted-space position `at`: linear ramps over
/// the fade-in/fade-out windows, shaped by [`smooth`].
fn envelope(at: i64, start: i64, end: i64, fade_in: i64, fade_out: i64) -> f32 {
    let mut lin = 1.0f64;
    if fade_in > 0 {
        let rel = at - start;
        if rel < fade_in {
            lin = lin.min(rel.max(0) as f64 / fade_in as f64);
        }
    }
    if fade_out > 0 {
        let till_end = end - at;
        if till_end < fade_out {
            lin = lin.min(till_end.max(0) as f64 / fade_out as f64);
        }
    }
    smooth(lin) as f32
}

/// Fifth-order crossfade shaping: `f(0)=0`, `f(1)=1`, `f(0.5)=0.5`, zero
/// first derivative at both ends.
pub fn smooth(x: f64) -> f64 {
    let x = x.clamp(0.0, 1.0);
    ((-24.0 * x + 60.0) * x - 50.0) * x * x * x + 15.0 * x * x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_endpoints_and_midpoint() {
        assert!(smooth(0.0).abs() < 1e-12);
        assert!((smooth(1.0) - 1.0).abs() < 1e-12);
        assert!((smooth(0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn smooth_has_flat_ends() {
        let eps = 1e-6;
        assert!(smooth(eps) / eps < 0.01);
        assert!((1.0 - smooth(1.0 - eps)) / eps < 0.01);
    }

    #[test]
    fn smooth_is_monotone() {
        let mut prev = 0.0;
        for i in 0..=1000 {
            let v = smooth(i as f64 / 1000.0);
            assert!(v >= prev - 1e-12);
            prev = v;
        }
    }

    #[test]
    fn envelope_full_volume_between_fades() {
        let fade = 10_000;
        assert_eq!(envelope(50_000, 0, 100_000, fade, fade), 1.0);
        assert_eq!(envelope(0, 0, 100_000, fade, fade), 0.0);
        assert_eq!(envelope(100_000, 0, 100_000, fade, fade), 0.0);
        // Ramp midpoints pass through 0.5 because smooth(0.5) == 0.5.
        assert!((envelope(5_000, 0, 100_000, fade, fade) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn complementary_crossfade_is_transparent_at_midpoint() {
        // At the midpoint of a crossfade window the outgoing and incoming
        // envelopes each sit at 0.5, so a constant signal passes unchanged.
        let fade = 15 * SAMPLE_RATE as i64;
        let a_end = 200 * SAMPLE_RATE as i64;
        let b_start = a_end - fade;
        let mid = b_start + fade / 2;
        let out = envelope(mid, 0, a_end, 0, fade);
        let inc = envelope(mid, b_start, b_start + 300 * SAMPLE_RATE as i64, fade, fade);
        assert!((out as f64 + inc as f64 - 1.0).abs() < 1e-4);
    }
}
