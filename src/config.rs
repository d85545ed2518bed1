//! Runtime settings for the streaming server.
//!
//! Loaded from a JSON file when one is given on the command line; every field
//! has a default so an empty file (or none at all) yields a runnable server.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Output sample rate of every session, in Hz. Scheduling math (crossfade
/// windows, skip guards) is expressed in samples at this rate.
pub const SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// HTTP listen address.
    pub listen_addr: String,
    /// Directory whose subdirectories are the track collections.
    pub collections_root: PathBuf,
    /// Analysis-worker command line; the track path and protocol flags are
    /// appended per spawn.
    pub worker_command: Vec<String>,
    /// Encoder command line. `{rate}` and `{channels}` placeholders are
    /// substituted per session. Reads f32 LE PCM on stdin, writes the
    /// delivery codec on stdout.
    pub encoder_command: Vec<String>,
    /// Sessions with no client request for this long are evicted.
    pub session_timeout_secs: u64,
    /// How far ahead of the reported playback position the mixer renders.
    pub client_buffer_secs: f64,
    /// Upper bound on follow-up retries after repeated tempo-detection
    /// failures. `None` restores the unbounded retry loop.
    pub follow_up_retry_cap: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8700".to_string(),
            collections_root: PathBuf::from("./collections"),
            worker_command: vec!["tempocast-worker".to_string()],
            encoder_command: vec![
                "ffmpeg".to_string(),
                "-loglevel".to_string(),
                "error".to_string(),
                "-f".to_string(),
                "f32le".to_string(),
                "-ar".to_string(),
                "{rate}".to_string(),
                "-ac".to_string(),
                "{channels}".to_string(),
                "-i".to_string(),
                "pipe:0".to_string(),
                "-f".to_string(),
                "mp3".to_string(),
                "-b:a".to_string(),
                "192k".to_string(),
                "pipe:1".to_string(),
            ],
            session_timeout_secs: 60,
            client_buffer_secs: 10.0,
            follow_up_retry_cap: Some(25),
        }
    }
}

impl Settings {
    /// Load from a JSON file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| format!("Cannot read settings {}: {e}", p.display()))?;
                serde_json::from_str(&raw)
                    .map_err(|e| format!("Invalid settings {}: {e}", p.display()))
            }
        }
    }

    /// Encoder command with placeholders substituted for one session.
    pub fn encoder_command_for(&self, channels: u16) -> Vec<String> {
        self.encoder_command
            .iter()
            .map(|arg| {
                arg.replace("{rate}", &SAMPLE_RATE.to_string())
                    .replace("{channels}", &channels.to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let s = Settings::default();
        assert!(!s.worker_command.is_empty());
        assert!(s.session_timeout_secs > 0);
    }

    #[test]
    fn encoder_placeholders_substituted() {
        let s = Settings::default();
        let cmd = s.encoder_command_for(2);
        assert!(cmd.contains(&"48000".to_string()));
        assert!(cmd.contains(&"2".to_string()));
        assert!(!cmd.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: Settings = serde_json::from_str(r#"{"listen_addr":"127.0.0.1:9"}"#).unwrap();
        assert_eq!(s.listen_addr, "127.0.0.1:9");
        assert_eq!(s.session_timeout_secs, Settings::default().session_timeout_secs);
    }
}
