//! Playlist scheduling: which track plays next, where it sits on the session
//! timeline, and how skips reshape in-flight plans.
//!
//! Every mutation of session playback state happens under the session's state
//! lock, so scheduler transitions never interleave with a mixer pass of the
//! same session. The long waits (analysis reports, readiness of sibling
//! tracks) run in spawned tasks that re-take the lock only to apply results.

pub mod catalog;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use crate::config::SAMPLE_RATE;
use crate::session::events::Event;
use crate::session::{Session, SessionState};
use crate::timing::{self, BLOCK_SIZE};
use crate::worker::WorkerSpec;

use plan::{Segment, TrackPlan};

/// Crossfade window between consecutive tracks, in seconds.
pub const CROSSFADE_SECS: i64 = 15;
/// Fixed speed-up applied to every non-first track. A tunable, not derived
/// from the adjacent tracks' bpm figures.
pub const FOLLOW_UP_TEMPO: f64 = 1.1;
/// Skips landing closer than this to a track's natural end are ignored.
const SKIP_GUARD_SECS: i64 = 40;
/// Extra tail played after a skip, beyond the crossfade overlap.
const SKIP_PAD_SECS: i64 = 5;
/// Stand-in duration until the worker reports the real one.
const PROVISIONAL_LENGTH_SECS: i64 = 30;
/// Interval of the readiness/skip poll loops.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Crossfade window in adjusted-space samples.
pub fn crossfade_samples() -> i64 {
    CROSSFADE_SECS * SAMPLE_RATE as i64
}

/// Seed a fresh session with its first track at timeline position 0.
pub async fn add_first_track(session: &Arc<Session>) {
    let mut state = session.state.lock().await;
    start_anchor_track(session, &mut state, 0, 0);
}

/// Whether the session needs a follow-up scheduled: no unstarted track left
/// and no follow-up already in flight.
pub fn needs_follow_up(state: &SessionState) -> bool {
    !state
        .current
        .iter()
        .any(|t| !t.committed || t.start_time > state.encoder_position)
}

/// Move a track whose end the encoder just passed into the finished set and
/// release its worker.
pub fn finish_track(session: &Arc<Session>, state: &mut SessionState, id: &str) {
    let Some(idx) = state.current.iter().position(|t| t.id == id) else {
        return;
    };
    let track = state.current.remove(idx);
    session.workers.release(&(session.sid.clone(), track.id.clone()));
    log::info!("[{}] Finished track '{}'", session.sid, track.name);
    state.finished.push(track);
}

/// Drop a committed track whose worker faulted mid-play and restart the
/// stream at the current write position with a fresh pick.
pub fn replace_faulted_track(session: &Arc<Session>, state: &mut SessionState, id: &str) {
    drop_track(session, state, id);
    let at = state.encoder_position;
    start_anchor_track(session, state, at, 0);
}

/// Start a track that plays standalone at tempo 1.0: the session's first
/// track, or the silent replacement after a playing track's worker fault.
/// Committed immediately; never needs a start bpm.
fn start_anchor_track(
    session: &Arc<Session>,
    state: &mut SessionState,
    start_time: i64,
    attempt: u32,
) {
    if session.is_killed() || attempts_exhausted(session, attempt) {
        return;
    }
    let Some(track) = spawn_track(session, state, start_time, false) else {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(POLL_INTERVAL).await;
            let mut state = session.state.lock().await;
            start_anchor_track(&session, &mut state, start_time, attempt + 1);
        });
        return;
    };

    state.events.push_back(Event::SongStart {
        id: track.id.clone(),
        song_name: track.name.clone(),
        time: track.start_time,
    });
    let id = track.id.clone();
    state.current.push(track);

    let session = Arc::clone(session);
    tokio::spawn(async move {
        drive_anchor_track(session, id, attempt).await;
    });
}

/// Follow the analysis reports of an anchor track, emitting events as they
/// land: duration, tempo, thumbnail, in that order.
async fn drive_anchor_track(session: Arc<Session>, id: String, attempt: u32) {
    let Some(worker) = session.workers.acquire(&(session.sid.clone(), id.clone())) else {
        return;
    };
    let key = (session.sid.clone(), id.clone());

    let result = async {
        let duration = worker.duration.wait().await?;
        {
            let mut state = session.state.lock().await;
            if let Some(track) = state.track_mut(&id) {
                set_real_duration(track, duration);
                let ev = Event::song_duration(track);
                state.events.push_back(ev);
            }
        }

        let tempo = worker.tempo.wait().await?;
        {
            let mut state = session.state.lock().await;
            if let Some(track) = state.track_mut(&id) {
                track.bpm_start = tempo.bpm_start;
                track.bpm_end = Some(tempo.bpm_end);
                track.beats = tempo.beats.clone();
                track.ready = true;
                state.events.push_back(Event::TempoInfo {
                    id: id.clone(),
                    bpm_start: tempo.bpm_start,
                    bpm_end: tempo.bpm_end,
                    beats: tempo.beats,
                });
            }
        }
        Ok::<(), crate::worker::WorkerError>(())
    }
    .await;

    match result {
        Ok(()) => {
            if worker.thumbnail.wait().await.is_ok() {
                let mut state = session.state.lock().await;
                if state.track_mut(&id).is_some() {
                    state.events.push_back(Event::ThumbnailReady { id: id.clone() });
                }
            }
            session.workers.release(&key);
        }
        Err(err) => {
            session.workers.release(&key);
            log::warn!("[{}] Track '{id}' failed analysis: {err}", session.sid);
            let mut state = session.state.lock().await;
            drop_track(&session, &mut state, &id);
            // Replace at the current write position so the stream keeps
            // flowing with no client-visible event.
            let at = state.encoder_position;
            start_anchor_track(&session, &mut state, at, attempt + 1);
        }
    }
}

/// Announce and start committing a follow-up track. The `NEXT_SONG` event is
/// emitted immediately and tentatively; the track only gets a timeline slot
/// once tempo detection succeeds.
pub fn begin_follow_up(session: &Arc<Session>, state: &mut SessionState) {
    begin_follow_up_attempt(session, state, 0);
}

fn begin_follow_up_attempt(session: &Arc<Session>, state: &mut SessionState, attempt: u32) {
    if session.is_killed() || attempts_exhausted(session, attempt) {
        return;
    }
    let Some(track) = spawn_track(session, state, 0, true) else {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(POLL_INTERVAL).await;
            let mut state = session.state.lock().await;
            if needs_follow_up(&state) {
                begin_follow_up_attempt(&session, &mut state, attempt + 1);
            }
        });
        return;
    };

    state.events.push_back(Event::NextSong {
        song_name: track.name.clone(),
    });
    let id = track.id.clone();
    state.current.push(track);

    let session = Arc::clone(session);
    tokio::spawn(async move {
        commit_follow_up(session, id, attempt).await;
    });
}

/// Wait for the rest of the session to settle, then pin the follow-up to the
/// timeline: `start = latest ready end - crossfade`, tempo fixed at
/// [`FOLLOW_UP_TEMPO`]. Emits `SONG_START`, `SONG_DURATION` and `TEMPO_INFO`
/// only on success; a tempo failure discards the track and retries with a
/// new pick.
async fn commit_follow_up(session: Arc<Session>, id: String, attempt: u32) {
    let key = (session.sid.clone(), id.clone());
    let Some(worker) = session.workers.acquire(&key) else {
        return;
    };

    // Other tracks' timing must be final before this one can anchor to the
    // latest end.
    loop {
        if session.is_killed() {
            session.workers.release(&key);
            return;
        }
        let mut state = session.state.lock().await;
        if state.track(&id).is_none() {
            drop(state);
            session.workers.release(&key);
            return;
        }
        if state.current.len() == 1 {
            // The predecessor vanished before this track could anchor to
            // its end. Restart the stream at the write position instead.
            drop_track(&session, &mut state, &id);
            session.workers.release(&key);
            let at = state.encoder_position;
            start_anchor_track(&session, &mut state, at, 0);
            return;
        }
        let all_ready = state.current.iter().filter(|t| t.id != id).all(|t| t.ready);
        if all_ready {
            break;
        }
        drop(state);
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let analysis = async {
        let duration = worker.duration.wait().await?;
        let tempo = worker.tempo.wait().await?;
        Ok::<_, crate::worker::WorkerError>((duration, tempo))
    }
    .await;

    match analysis {
        Ok((duration, tempo)) => {
            let mut state = session.state.lock().await;
            let Some(anchor_end) = state
                .current
                .iter()
                .filter(|t| t.id != id && t.committed)
                .map(|t| t.end_time)
                .max()
            else {
                drop_track(&session, &mut state, &id);
                session.workers.release(&key);
                return;
            };
            let start_time = anchor_end - crossfade_samples();
            let Some(track) = state.track_mut(&id) else {
                session.workers.release(&key);
                return;
            };

            track.start_time = start_time;
            track.tempo_adjustment = FOLLOW_UP_TEMPO;
            track.fade_in = crossfade_samples();
            set_real_duration(track, duration);
            track.bpm_start = tempo.bpm_start;
            track.bpm_end = Some(tempo.bpm_end);
            track.beats = tempo.beats.clone();
            track.committed = true;
            track.ready = true;
            track.skippable = true;

            let start_ev = Event::SongStart {
                id: id.clone(),
                song_name: track.name.clone(),
                time: track.start_time,
            };
            let duration_ev = Event::song_duration(track);
            state.events.push_back(start_ev);
            state.events.push_back(duration_ev);
            state.events.push_back(Event::TempoInfo {
                id: id.clone(),
                bpm_start: tempo.bpm_start,
                bpm_end: tempo.bpm_end,
                beats: tempo.beats,
            });
            drop(state);

            if worker.thumbnail.wait().await.is_ok() {
                let mut state = session.state.lock().await;
                if state.track_mut(&id).is_some() {
                    state.events.push_back(Event::ThumbnailReady { id: id.clone() });
                }
            }
            session.workers.release(&key);
        }
        Err(err) => {
            session.workers.release(&key);
            log::warn!("[{}] Follow-up '{id}' failed analysis: {err}", session.sid);
            let mut state = session.state.lock().await;
            drop_track(&session, &mut state, &id);
            begin_follow_up_attempt(&session, &mut state, attempt + 1);
        }
    }
}

/// Cut a playing track short at the current write position, keeping its tail
/// alive long enough to crossfade into the follow-up. Ignored when the track
/// is unskippable, not yet playing, or too close to its natural end. Blocks
/// (with `premature_skip` raised) until a committed follow-up exists.
pub async fn skip_track(session: &Arc<Session>, id: &str) {
    loop {
        if session.is_killed() {
            return;
        }
        let mut state = session.state.lock().await;
        let Some(track) = state.track(id) else {
            state.premature_skip = false;
            return;
        };
        let guard = SKIP_GUARD_SECS * SAMPLE_RATE as i64;
        if !track.skippable
            || !track.committed
            || state.encoder_position < track.start_time
            || track.end_time - state.encoder_position <= guard
        {
            state.premature_skip = false;
            return;
        }

        let follow = state
            .current
            .iter()
            .filter(|t| t.id != id && t.committed && t.start_time > track.start_time)
            .min_by_key(|t| t.start_time)
            .map(|t| t.id.clone());
        let Some(follow_id) = follow else {
            state.premature_skip = true;
            drop(state);
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        let position = state.encoder_position;
        let ti = state.current.iter().position(|t| t.id == id);
        let fi = state.current.iter().position(|t| t.id == follow_id);
        if let (Some(ti), Some(fi)) = (ti, fi) {
            let (track, follow) = two_tracks_mut(&mut state.current, ti, fi);
            apply_skip(track, follow, position);
            let ev_a = Event::song_duration(&state.current[ti]);
            let ev_b = Event::song_duration(&state.current[fi]);
            state.events.push_back(ev_a);
            state.events.push_back(ev_b);
        }
        state.premature_skip = false;
        return;
    }
}

/// The skip mutation itself: truncate `track` at `position` (rounded up to a
/// transform block boundary), append a tail segment covering the crossfade
/// overlap plus a short pad, and pull `follow` earlier by exactly the amount
/// the track shrank.
fn apply_skip(track: &mut TrackPlan, follow: &mut TrackPlan, position: i64) {
    let old_end = track.end_time;
    let overlap = (old_end - follow.start_time).max(0);

    // Segment under the write position.
    let idx = track
        .segments
        .iter()
        .position(|s| s.real_time_start <= position && position < s.real_time_end())
        .unwrap_or(0);
    let seg = &track.segments[idx];
    let tempo = seg.tempo_adjustment;

    // Round the cut up to the next block boundary in original space so the
    // tail segment's offset stays block-aligned.
    let into_content =
        timing::duration_after_adjustment(seg.sample_offset, tempo) + (position - seg.real_time_start);
    let m = timing::map_adjusted_range_to_original(into_content, 0, tempo);
    let mut cut = m.starting_sample;
    if m.offset_after_adj > 0 {
        cut += BLOCK_SIZE;
    }
    cut = cut.min(seg.sample_offset + seg.sample_length);

    let new_len = cut - track.segments[idx].sample_offset;
    track.segments[idx].sample_length = new_len;
    track.segments.truncate(idx + 1);

    // Tail: the final stretch of the track, sized to the remaining overlap
    // with the follow-up plus the pad, starting on a block boundary.
    let tail_adj = overlap + SKIP_PAD_SECS * SAMPLE_RATE as i64;
    let full_adj = timing::duration_after_adjustment(track.total_length, tempo);
    let tail = timing::map_adjusted_range_to_original(
        (full_adj - tail_adj).max(0),
        tail_adj.min(full_adj),
        tempo,
    );
    track.segments.push(Segment::new(
        tail.starting_sample,
        track.total_length - tail.starting_sample,
        tempo,
    ));
    track.fix_timing();

    let shrink = old_end - track.end_time;
    follow.start_time -= shrink;
    follow.fix_timing();
}

// ── helpers ──

/// Pick a track, spawn its worker and build an uncommitted-by-default plan.
/// Anchor tracks (`!want_start_bpm`) come back committed at tempo 1.0.
fn spawn_track(
    session: &Arc<Session>,
    state: &mut SessionState,
    start_time: i64,
    want_start_bpm: bool,
) -> Option<TrackPlan> {
    let path = catalog::pick_random(&session.catalog)?.clone();
    let id = unique_track_id(state);
    let spec = WorkerSpec {
        command: session.settings.worker_command.clone(),
        track: path.clone(),
        channels: session.channels,
        sample_rate: SAMPLE_RATE,
        want_start_bpm,
    };
    let worker = match session.workers.spawn((session.sid.clone(), id.clone()), &spec) {
        Ok(w) => w,
        Err(e) => {
            log::warn!("[{}] Worker spawn failed for {}: {e}", session.sid, path.display());
            return None;
        }
    };

    let provisional = PROVISIONAL_LENGTH_SECS * SAMPLE_RATE as i64;
    let tempo = if want_start_bpm { FOLLOW_UP_TEMPO } else { 1.0 };
    let mut track = TrackPlan {
        id,
        name: catalog::track_name(&path),
        path,
        start_time,
        end_time: 0,
        offset: 0,
        total_length: provisional,
        tempo_adjustment: tempo,
        bpm_start: None,
        bpm_end: None,
        beats: Vec::new(),
        segments: vec![Segment::new(0, provisional, tempo)],
        fade_in: 0,
        fade_out: crossfade_samples(),
        committed: !want_start_bpm,
        ready: false,
        skippable: !want_start_bpm,
        worker,
    };
    track.fix_timing();
    log::info!("[{}] Picked track '{}'", session.sid, track.name);
    Some(track)
}

/// Replace the provisional duration with the worker-reported one and rebuild
/// the single full-length segment.
fn set_real_duration(track: &mut TrackPlan, duration_secs: f64) {
    track.total_length = (duration_secs * SAMPLE_RATE as f64) as i64;
    track.segments = vec![Segment::new(
        track.offset,
        track.total_length - track.offset,
        track.tempo_adjustment,
    )];
    track.fix_timing();
}

/// Remove a track from the session and release its worker. No events.
fn drop_track(session: &Arc<Session>, state: &mut SessionState, id: &str) {
    if let Some(idx) = state.current.iter().position(|t| t.id == id) {
        state.current.remove(idx);
        session.workers.release(&(session.sid.clone(), id.to_string()));
    }
}

fn attempts_exhausted(session: &Arc<Session>, attempt: u32) -> bool {
    match session.settings.follow_up_retry_cap {
        Some(cap) if attempt >= cap => {
            log::error!(
                "[{}] Giving up scheduling after {attempt} failed track picks",
                session.sid
            );
            true
        }
        _ => false,
    }
}

fn unique_track_id(state: &SessionState) -> String {
    loop {
        let id = crate::session::random_id16();
        let taken = state.current.iter().any(|t| t.id == id)
            || state.finished.iter().any(|t| t.id == id);
        if !taken {
            return id;
        }
    }
}

fn two_tracks_mut(tracks: &mut [TrackPlan], a: usize, b: usize) -> (&mut TrackPlan, &mut TrackPlan) {
    assert!(a != b);
    if a < b {
        let (left, right) = tracks.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = tracks.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}
