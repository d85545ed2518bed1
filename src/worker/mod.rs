//! Client side of the analysis-worker protocol.
//!
//! One external `tempocast-worker` process per track. The worker reports
//! duration (JSON id=1), tempo data (JSON id=2) and a thumbnail (binary id=0)
//! on its own, then serves tempo-adjusted waveform pieces on demand. Replies
//! are correlated purely by id; concurrent outstanding requests are legal and
//! may complete out of order.

pub mod registry;
pub mod slot;
pub mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use slot::Slot;
use wire::{FrameDecoder, KIND_BINARY, KIND_JSON, THUMBNAIL_ID};

/// Correlation id of the duration report.
pub const DURATION_ID: u32 = 1;
/// Correlation id of the tempo report.
pub const TEMPO_ID: u32 = 2;

/// Worker faults. `Clone` because one fault rejects every outstanding and
/// future promise on the worker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("failed to spawn analysis worker: {0}")]
    Spawn(String),
    #[error("analysis worker exited unexpectedly")]
    Exited,
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("worker pipe error: {0}")]
    Io(String),
}

/// JSON payload of the duration report (id=1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationReport {
    pub duration: f64,
}

/// JSON payload of the tempo report (id=2). `error` is set instead of the
/// tempo fields when detection failed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TempoReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm_start: Option<f32>,
    #[serde(default)]
    pub bpm_end: f32,
    #[serde(default)]
    pub beats: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// JSON payload of a piece request (server → worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceRequest {
    pub id: u32,
    pub offset: i64,
    pub length: i64,
    pub tempo_change: f64,
}

/// How to start a worker for one track.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Command line; element 0 is the program.
    pub command: Vec<String>,
    pub track: PathBuf,
    pub channels: u16,
    pub sample_rate: u32,
    /// Whether the worker should report a start bpm (follow-up tracks).
    pub want_start_bpm: bool,
}

type PendingMap = HashMap<u32, oneshot::Sender<Result<Vec<f32>, WorkerError>>>;

/// Handle to one running analysis-worker process.
pub struct AnalysisWorker {
    pub duration: Slot<f64>,
    pub tempo: Slot<TempoReport>,
    pub thumbnail: Slot<Bytes>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Mutex<PendingMap>,
    failed: Mutex<Option<WorkerError>>,
    killed: AtomicBool,
}

impl AnalysisWorker {
    /// Spawn the worker process and its stdout reader task.
    pub fn spawn(spec: &WorkerSpec) -> Result<Arc<Self>, WorkerError> {
        let program = spec
            .command
            .first()
            .ok_or_else(|| WorkerError::Spawn("empty worker command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(&spec.command[1..])
            .arg(&spec.track)
            .arg("--channels")
            .arg(spec.channels.to_string())
            .arg("--rate")
            .arg(spec.sample_rate.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if spec.want_start_bpm {
            cmd.arg("--start-bpm");
        }

        let mut child = cmd.spawn().map_err(|e| WorkerError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdout not piped".into()))?;

        let worker = Arc::new(Self {
            duration: Slot::new(),
            tempo: Slot::new(),
            thumbnail: Slot::new(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending: Mutex::new(HashMap::new()),
            failed: Mutex::new(None),
            killed: AtomicBool::new(false),
        });

        let reader = Arc::clone(&worker);
        tokio::spawn(async move {
            let err = reader.read_loop(stdout).await;
            reader.fail_all(err);
        });

        Ok(worker)
    }

    /// Drive the frame decoder over the worker's stdout until it closes or a
    /// framing error occurs. Reads are capped at the decoder's byte hint so
    /// coalesced pipe writes can never smear across message boundaries.
    async fn read_loop(&self, mut stdout: ChildStdout) -> WorkerError {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let want = decoder.needed().min(buf.len());
            let n = match stdout.read(&mut buf[..want]).await {
                Ok(0) => return WorkerError::Exited,
                Ok(n) => n,
                Err(e) => return WorkerError::Io(e.to_string()),
            };
            match decoder.push(&buf[..n]) {
                Ok(Some(frame)) => {
                    if let Err(e) = self.dispatch(frame) {
                        return e;
                    }
                }
                Ok(None) => {}
                Err(e) => return WorkerError::Protocol(e.to_string()),
            }
        }
    }

    fn dispatch(&self, frame: wire::Frame) -> Result<(), WorkerError> {
        match (frame.kind, frame.id) {
            (KIND_JSON, DURATION_ID) => {
                let report: DurationReport = serde_json::from_slice(&frame.payload)
                    .map_err(|e| WorkerError::Protocol(format!("bad duration report: {e}")))?;
                self.duration.resolve(Ok(report.duration));
                Ok(())
            }
            (KIND_JSON, TEMPO_ID) => {
                let report: TempoReport = serde_json::from_slice(&frame.payload)
                    .map_err(|e| WorkerError::Protocol(format!("bad tempo report: {e}")))?;
                match report.error {
                    Some(reason) => self.tempo.reject(WorkerError::Analysis(reason)),
                    None => self.tempo.resolve(Ok(report)),
                }
                Ok(())
            }
            (KIND_BINARY, THUMBNAIL_ID) => {
                self.thumbnail.resolve(Ok(Bytes::from(frame.payload)));
                Ok(())
            }
            (KIND_BINARY, id) => {
                let sender = self.pending.lock().unwrap().remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(decode_samples(&frame.payload)));
                        Ok(())
                    }
                    None => Err(WorkerError::Protocol(format!(
                        "binary reply for unknown request id {id}"
                    ))),
                }
            }
            (kind, id) => Err(WorkerError::Protocol(format!(
                "unexpected frame kind={kind} id={id}"
            ))),
        }
    }

    /// Request the adjusted-space waveform slice `[offset, offset + length)`.
    pub async fn get_piece(
        &self,
        offset: i64,
        length: i64,
        tempo_change: f64,
    ) -> Result<Vec<f32>, WorkerError> {
        if let Some(err) = self.failed.lock().unwrap().clone() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().unwrap();
            let mut id = random_request_id();
            while id == 0 || pending.contains_key(&id) || id == DURATION_ID || id == TEMPO_ID {
                id = id.wrapping_add(1);
            }
            pending.insert(id, tx);
            id
        };

        // fail_all drains the map and then never looks at it again. If it ran
        // between the check above and the insert, this entry would sit there
        // unfired, so re-check before sending the request.
        if let Some(err) = self.failed.lock().unwrap().clone() {
            self.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        let request = PieceRequest {
            id,
            offset,
            length,
            tempo_change,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| WorkerError::Protocol(e.to_string()))?;
        let frame = wire::encode_frame(KIND_JSON, id, &payload);

        {
            let mut stdin = self.stdin.lock().await;
            let pipe = match stdin.as_mut() {
                Some(p) => p,
                None => {
                    self.pending.lock().unwrap().remove(&id);
                    return Err(WorkerError::Exited);
                }
            };
            if let Err(e) = pipe.write_all(&frame).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(WorkerError::Io(e.to_string()));
            }
        }

        rx.await.map_err(|_| WorkerError::Exited)?
    }

    /// Reject every outstanding and future promise on this worker.
    fn fail_all(&self, err: WorkerError) {
        {
            let mut failed = self.failed.lock().unwrap();
            if failed.is_none() {
                *failed = Some(err.clone());
            }
        }
        self.duration.reject(err.clone());
        self.tempo.reject(err.clone());
        self.thumbnail.reject(err.clone());
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, tx) in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Terminate the worker process. Safe to call any number of times.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill analysis worker: {e}");
            }
        }
        self.fail_all(WorkerError::Exited);
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Interpret a binary piece payload as f32 LE samples.
fn decode_samples(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Encode samples for a binary piece payload.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

fn random_request_id() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    ((nanos as u64) ^ ((nanos >> 64) as u64)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_payload_round_trips() {
        let samples = vec![0.0_f32, -1.0, 0.5, 3.25];
        assert_eq!(decode_samples(&encode_samples(&samples)), samples);
    }

    #[test]
    fn tempo_report_json_shape() {
        let report = TempoReport {
            bpm_start: Some(120.0),
            bpm_end: 124.5,
            beats: vec![0.0, 0.5],
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["bpmStart"], 120.0);
        assert_eq!(json["bpmEnd"], 124.5);
        assert!(json.get("error").is_none());

        let failed: TempoReport =
            serde_json::from_str(r#"{"error":"not enough beats"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("not enough beats"));
    }

    fn echo_spec() -> WorkerSpec {
        WorkerSpec {
            command: vec!["sh".into(), "-c".into(), "exec cat".into()],
            track: PathBuf::from("/dev/null"),
            channels: 1,
            sample_rate: 48_000,
            want_start_bpm: false,
        }
    }

    #[tokio::test]
    async fn protocol_violation_rejects_outstanding_piece_request() {
        // cat echoes the request frame back, and a JSON frame with a request
        // id is a protocol violation. The request must resolve with an error
        // instead of waiting on a reply that never comes.
        let worker = AnalysisWorker::spawn(&echo_spec()).unwrap();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            worker.get_piece(0, 4096, 1.0),
        )
        .await;
        assert!(result.expect("request resolved").is_err());
        assert!(worker.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_piece_after_failure_errors_without_stranding_an_entry() {
        let worker = AnalysisWorker::spawn(&echo_spec()).unwrap();
        worker.kill();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            worker.get_piece(0, 4096, 1.0),
        )
        .await;
        assert!(result.expect("request resolved").is_err());
        assert!(worker.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn piece_request_uses_wire_field_names() {
        let req = PieceRequest {
            id: 9,
            offset: 100,
            length: 200,
            tempo_change: 1.1,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tempoChange"], 1.1);
        assert_eq!(json["offset"], 100);
    }
}
