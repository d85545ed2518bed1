//! Process-wide registry of analysis workers.
//!
//! Keyed by `(sid, track_id)` and reference counted: a track's waveform may
//! in principle be borrowed by more than one consumer, so ownership never
//! transfers. Release-to-zero kills the worker process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{AnalysisWorker, WorkerError, WorkerSpec};

/// Registry key: session id + track id.
pub type WorkerKey = (String, String);

struct Entry {
    worker: Arc<AnalysisWorker>,
    refs: usize,
}

#[derive(Default)]
pub struct WorkerRegistry {
    entries: Mutex<HashMap<WorkerKey, Entry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker under `key` and take the first reference.
    pub fn spawn(
        &self,
        key: WorkerKey,
        spec: &WorkerSpec,
    ) -> Result<Arc<AnalysisWorker>, WorkerError> {
        let worker = AnalysisWorker::spawn(spec)?;
        let mut entries = self.entries.lock().unwrap();
        if let Some(stale) = entries.insert(
            key,
            Entry {
                worker: Arc::clone(&worker),
                refs: 1,
            },
        ) {
            // A stale entry under the same key means its owner leaked it.
            stale.worker.kill();
        }
        Ok(worker)
    }

    /// Take an additional reference to an existing worker.
    pub fn acquire(&self, key: &WorkerKey) -> Option<Arc<AnalysisWorker>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        entry.refs += 1;
        Some(Arc::clone(&entry.worker))
    }

    /// Drop one reference; the last release kills the worker.
    pub fn release(&self, key: &WorkerKey) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = entries.remove(key).unwrap();
            entry.worker.kill();
        }
    }

    /// Number of live workers (diagnostics).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
