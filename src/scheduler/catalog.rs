//! Track catalog boundary.
//!
//! A collection is a directory of audio files. The scheduler only needs two
//! things from it: the full track list at session start and a random pick.

use std::path::{Path, PathBuf};

/// Extensions the analysis worker can decode.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "flac", "ogg", "wav"];

/// List the playable tracks of a collection directory, sorted by name.
pub fn scan(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut tracks = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some(e) if AUDIO_EXTENSIONS.contains(&e)) {
            tracks.push(path);
        }
    }
    tracks.sort();
    Ok(tracks)
}

/// Pick a random track.
pub fn pick_random(tracks: &[PathBuf]) -> Option<&PathBuf> {
    if tracks.is_empty() {
        return None;
    }
    Some(&tracks[(pseudo_random_u64() as usize) % tracks.len()])
}

/// Display name of a track: file stem without the extension.
pub fn track_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn pseudo_random_u64() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    (nanos as u64) ^ ((nanos >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_random_empty_is_none() {
        assert!(pick_random(&[]).is_none());
    }

    #[test]
    fn pick_random_single_always_that_track() {
        let tracks = vec![PathBuf::from("a.mp3")];
        for _ in 0..10 {
            assert_eq!(pick_random(&tracks), Some(&tracks[0]));
        }
    }

    #[test]
    fn track_name_strips_extension() {
        assert_eq!(track_name(Path::new("/music/Some Song.mp3")), "Some Song");
    }
}
