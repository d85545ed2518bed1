//! Track decoding for the analysis worker.
//!
//! Decodes any symphonia-supported container/codec to interleaved f32 at the
//! session's sample rate and channel count. The server never decodes audio
//! itself; this code runs only inside the worker process.

use std::{fs::File, path::Path};

use symphonia::core::{
    audio::{AudioBufferRef, Signal},
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

/// Decoded track: interleaved f32 frames at the requested rate and channels.
pub struct DecodedTrack {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DecodedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Decode `path` to `out_channels` interleaved channels at `out_rate`.
pub fn decode_file(path: &Path, out_channels: usize, out_rate: u32) -> Result<DecodedTrack, String> {
    let file = File::open(path).map_err(|e| format!("Cannot open {}: {e}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| format!("Probe failed: {e}"))?;

    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or("No audio track found")?
        .clone();
    let track_id = track.id;
    let src_channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(2)
        .max(1);
    let src_rate = track.codec_params.sample_rate.unwrap_or(44_100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| format!("Codec init failed: {e}"))?;

    let mut native = Vec::<f32>::new();

    loop {
        let packet = match probed.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(format!("Read packet failed: {e}")),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(format!("Decode failed: {e}")),
        };

        push_interleaved(decoded, src_channels, out_channels, &mut native);
    }

    let samples = if src_rate == out_rate {
        native
    } else {
        resample(&native, out_channels, src_rate, out_rate)
    };

    Ok(DecodedTrack {
        samples,
        channels: out_channels,
        sample_rate: out_rate,
    })
}

/// Map a decoded buffer onto `out_channels` interleaved output channels.
/// Mono output averages all source channels; stereo output duplicates mono
/// sources and takes the first two channels of wider layouts.
fn push_interleaved(
    buf: AudioBufferRef<'_>,
    src_channels: usize,
    out_channels: usize,
    out: &mut Vec<f32>,
) {
    let frames = buf.frames();
    let sample_at = |chan: usize, i: usize| -> f32 {
        let chan = chan.min(src_channels - 1);
        match &buf {
            AudioBufferRef::F32(b) => b.chan(chan)[i],
            AudioBufferRef::F64(b) => b.chan(chan)[i] as f32,
            AudioBufferRef::S32(b) => b.chan(chan)[i] as f32 / i32::MAX as f32,
            AudioBufferRef::S16(b) => b.chan(chan)[i] as f32 / i16::MAX as f32,
            AudioBufferRef::U8(b) => (b.chan(chan)[i] as f32 - 128.0) / 128.0,
            _ => 0.0,
        }
    };

    out.reserve(frames * out_channels);
    for i in 0..frames {
        if out_channels == 1 {
            let mut acc = 0.0_f32;
            for c in 0..src_channels {
                acc += sample_at(c, i);
            }
            out.push(acc / src_channels as f32);
        } else {
            for c in 0..out_channels {
                out.push(sample_at(c, i));
            }
        }
    }
}

/// Linear resampler over interleaved frames.
fn resample(samples: &[f32], channels: usize, src_rate: u32, dst_rate: u32) -> Vec<f32> {
    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }
    let out_frames =
        ((in_frames as u64 * dst_rate as u64) / src_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let src = i as f64 * src_rate as f64 / dst_rate as f64;
        let idx = src as usize;
        let frac = (src - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..channels {
            let a = samples[idx * channels + c];
            let b = samples[next * channels + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_preserves_duration_ratio() {
        let samples: Vec<f32> = (0..44_100).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample(&samples, 1, 44_100, 48_000);
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn resample_identity_rate_unchanged_length() {
        let samples = vec![0.5_f32; 2000];
        assert_eq!(resample(&samples, 2, 48_000, 48_000).len(), 2000);
    }
}
