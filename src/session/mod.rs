//! Per-listener sessions and their registry.
//!
//! A session owns one encoder process, the plans of every track it is
//! playing, and a FIFO of metadata events drained on each client poll. The
//! playback state sits behind one async mutex, so scheduler transitions and
//! mixer passes of the same session never interleave. Sessions are evicted
//! after a quiet period and torn down idempotently.

pub mod events;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::config::{Settings, SAMPLE_RATE};
use crate::error::{Result, ServerError};
use crate::scheduler::{self, catalog, plan::TrackPlan};
use crate::stream::encoder::EncoderProcess;
use crate::worker::registry::WorkerRegistry;

use events::Event;

/// Client-reported playback position may run at most this far ahead of the
/// server-observed wall clock.
pub const POSITION_TOLERANCE_SECS: f64 = 3.0;

/// Everything the scheduler and mixer mutate, behind the session lock.
pub struct SessionState {
    pub current: Vec<TrackPlan>,
    pub finished: Vec<TrackPlan>,
    /// Adjusted-space samples written to the encoder so far.
    pub encoder_position: i64,
    /// Outstanding mixer demand, in samples.
    pub samples_to_add: i64,
    pub last_position_secs: f64,
    pub events: VecDeque<Event>,
    /// A skip is waiting for a committed follow-up.
    pub premature_skip: bool,
}

impl SessionState {
    pub fn track(&self, id: &str) -> Option<&TrackPlan> {
        self.current.iter().find(|t| t.id == id)
    }

    pub fn track_mut(&mut self, id: &str) -> Option<&mut TrackPlan> {
        self.current.iter_mut().find(|t| t.id == id)
    }
}

pub struct Session {
    pub sid: String,
    pub collection: String,
    pub channels: u16,
    pub catalog: Vec<PathBuf>,
    pub settings: Arc<Settings>,
    pub workers: Arc<WorkerRegistry>,
    pub state: tokio::sync::Mutex<SessionState>,
    /// Wakes the mixer loop when demand arrives.
    pub demand: Notify,
    pub encoder: EncoderProcess,
    killed: AtomicBool,
    last_seen: Mutex<Instant>,
    started: Instant,
}

impl Session {
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// One client poll: register demand from the reported playback position,
    /// optionally skip a track, and hand back encoded bytes plus the drained
    /// event queue.
    pub async fn life_sign(
        self: &Arc<Self>,
        position_secs: f64,
        skip: Option<&str>,
    ) -> Result<(Vec<u8>, Vec<Event>)> {
        if self.is_killed() {
            return Err(ServerError::SessionClosed);
        }
        self.touch();

        if let Some(id) = skip {
            scheduler::skip_track(self, id).await;
        }

        // Clamp against wall clock so a client cannot force unbounded mix
        // work by reporting large forward jumps.
        let allowed = self.started.elapsed().as_secs_f64() + POSITION_TOLERANCE_SECS;
        let position = position_secs.max(0.0).min(allowed);

        let events = {
            let mut state = self.state.lock().await;
            let target =
                ((position + self.settings.client_buffer_secs) * SAMPLE_RATE as f64) as i64;
            let pending = state.encoder_position + state.samples_to_add;
            if target > pending {
                state.samples_to_add += target - pending;
            }
            state.last_position_secs = position;
            if state.samples_to_add > 0 {
                self.demand.notify_one();
            }
            Vec::from(std::mem::take(&mut state.events))
        };

        Ok((self.encoder.take_output(), events))
    }

    /// Waveform-extremes thumbnail of one of this session's tracks, if its
    /// worker has produced it.
    pub async fn thumbnail(&self, track_id: &str) -> Result<Bytes> {
        let state = self.state.lock().await;
        let track = state
            .current
            .iter()
            .chain(state.finished.iter())
            .find(|t| t.id == track_id)
            .ok_or_else(|| ServerError::UnknownTrack(track_id.to_string()))?;
        match track.worker.thumbnail.try_get() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => Err(e.into()),
            None => Err(ServerError::BadRequest("thumbnail not ready".into())),
        }
    }

    /// Tear the session down: kill the encoder and every live worker. Safe
    /// against the eviction/explicit-kill race.
    pub async fn destroy(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[{}] Destroying session", self.sid);
        self.encoder.kill();
        let mut state = self.state.lock().await;
        for track in state.current.drain(..) {
            // An analysis task may still hold a registry reference, so
            // release-to-zero alone cannot be relied on here. Kill directly;
            // the rejection also wakes any task blocked on this worker so it
            // drops its reference.
            track.worker.kill();
            self.workers.release(&(self.sid.clone(), track.id.clone()));
        }
        // Wake the mixer loop so it observes the kill flag and exits.
        self.demand.notify_one();
    }
}

pub struct SessionRegistry {
    pub settings: Arc<Settings>,
    pub workers: Arc<WorkerRegistry>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            workers: Arc::new(WorkerRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session on a collection: scan its catalog, spawn the encoder,
    /// seed the first track and launch the mix loop.
    pub async fn create_session(
        self: &Arc<Self>,
        collection: &str,
        channels: u16,
    ) -> Result<Arc<Session>> {
        if !matches!(channels, 1 | 2) {
            return Err(ServerError::BadRequest(format!(
                "numChannels must be 1 or 2, got {channels}"
            )));
        }
        if collection.is_empty()
            || collection.contains(['/', '\\'])
            || collection.starts_with('.')
        {
            return Err(ServerError::UnknownCollection(collection.to_string()));
        }
        let dir = self.settings.collections_root.join(collection);
        if !dir.is_dir() {
            return Err(ServerError::UnknownCollection(collection.to_string()));
        }
        let tracks = catalog::scan(&dir)?;
        if tracks.is_empty() {
            return Err(ServerError::EmptyCatalog(collection.to_string()));
        }

        let encoder = EncoderProcess::spawn(&self.settings.encoder_command_for(channels))?;
        let sid = {
            let sessions = self.sessions.lock().unwrap();
            let mut sid = random_id16();
            while sessions.contains_key(&sid) {
                sid = random_id16();
            }
            sid
        };

        let session = Arc::new(Session {
            sid: sid.clone(),
            collection: collection.to_string(),
            channels,
            catalog: tracks,
            settings: Arc::clone(&self.settings),
            workers: Arc::clone(&self.workers),
            state: tokio::sync::Mutex::new(SessionState {
                current: Vec::new(),
                finished: Vec::new(),
                encoder_position: 0,
                samples_to_add: 0,
                last_position_secs: 0.0,
                events: VecDeque::new(),
                premature_skip: false,
            }),
            demand: Notify::new(),
            encoder,
            killed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
            started: Instant::now(),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(sid.clone(), Arc::clone(&session));
        log::info!("[{sid}] New session on collection '{collection}' ({channels} ch)");

        scheduler::add_first_track(&session).await;
        crate::stream::spawn_mix_loop(Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(sid).cloned()
    }

    pub async fn destroy(&self, sid: &str) {
        let session = self.sessions.lock().unwrap().remove(sid);
        if let Some(session) = session {
            session.destroy().await;
        }
    }

    /// Evict sessions with no client poll inside the timeout window.
    pub fn start_watchdog(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = Duration::from_secs(registry.settings.session_timeout_secs);
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let expired: Vec<String> = registry
                    .sessions
                    .lock()
                    .unwrap()
                    .values()
                    .filter(|s| s.idle_for() > timeout)
                    .map(|s| s.sid.clone())
                    .collect();
                for sid in expired {
                    log::info!("[{sid}] Evicting idle session");
                    registry.destroy(&sid).await;
                }
            }
        });
    }
}

/// 16 characters from `[0-9a-z]`.
pub fn random_id16() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut state = pseudo_random_u64() | 1;
    let mut id = String::with_capacity(16);
    for _ in 0..16 {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        id.push(ALPHABET[(state % ALPHABET.len() as u64) as usize] as char);
    }
    id
}

fn pseudo_random_u64() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    (nanos as u64) ^ ((nanos >> 64) as u64)
}
