//! External encoder process of one session.
//!
//! The mixer writes interleaved f32 LE PCM to the process's stdin; a pump
//! task drains its stdout into a byte buffer the transport layer takes from
//! on each client poll. The codec itself is opaque.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use crate::error::{Result, ServerError};

pub struct EncoderProcess {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    output: Arc<Mutex<Vec<u8>>>,
    killed: AtomicBool,
}

impl EncoderProcess {
    /// Spawn the encoder command and its stdout pump task.
    pub fn spawn(command: &[String]) -> Result<Self> {
        let program = command
            .first()
            .ok_or_else(|| ServerError::Encoder("empty encoder command".into()))?;
        let mut child = Command::new(program)
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServerError::Encoder(format!("spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::Encoder("encoder stdin not piped".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Encoder("encoder stdout not piped".into()))?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&output);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
        });

        Ok(Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            output,
            killed: AtomicBool::new(false),
        })
    }

    /// Feed one mixed PCM buffer (interleaved f32 samples) to the encoder.
    pub async fn write_pcm(&self, samples: &[f32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| ServerError::Encoder("encoder terminated".into()))?;
        pipe.write_all(&bytes)
            .await
            .map_err(|e| ServerError::Encoder(format!("stdin write: {e}")))?;
        Ok(())
    }

    /// Take everything the encoder has produced since the last call.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().unwrap())
    }

    /// Terminate the encoder. Safe to call any number of times.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill encoder: {e}");
            }
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cat_round_trips_pcm_bytes() {
        let enc = EncoderProcess::spawn(&["cat".to_string()]).unwrap();
        let samples = vec![0.0_f32, 1.0, -0.5];
        enc.write_pcm(&samples).await.unwrap();
        // Give the pump task a moment to drain the pipe.
        for _ in 0..50 {
            if !enc.take_output().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no encoder output observed");
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let enc = EncoderProcess::spawn(&["cat".to_string()]).unwrap();
        enc.kill();
        enc.kill();
    }
}
