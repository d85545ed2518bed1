//! Block-local tempo transform.
//!
//! Each 4096-frame block is stretched independently to exactly
//! `ceil(block_len / tempo)` frames, so output lengths agree with
//! [`crate::timing::duration_after_adjustment`] sample-for-sample and any
//! block-aligned range renders byte-identically to the same range of a
//! full-track render. The per-block resampler is deliberately behind one
//! function; a phase-vocoder library can replace it without touching timing.

use crate::timing::{self, BLOCK_SIZE};

/// Stretch one block of interleaved frames to `out_frames` frames.
pub fn stretch_block(block: &[f32], channels: usize, out_frames: usize) -> Vec<f32> {
    let in_frames = block.len() / channels;
    let mut out = Vec::with_capacity(out_frames * channels);
    if in_frames == 0 {
        out.resize(out_frames * channels, 0.0);
        return out;
    }
    for i in 0..out_frames {
        let src = i as f64 * in_frames as f64 / out_frames as f64;
        let idx = src as usize;
        let frac = (src - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..channels {
            let a = block[idx * channels + c];
            let b = block[next * channels + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

/// Tempo-adjust a run of interleaved frames block by block.
pub fn adjust(samples: &[f32], channels: usize, tempo: f64) -> Vec<f32> {
    let mut out = Vec::new();
    for block in samples.chunks(BLOCK_SIZE as usize * channels) {
        let frames = block.len() / channels;
        let out_frames = timing::duration_after_adjustment(frames as i64, tempo) as usize;
        out.extend(stretch_block(block, channels, out_frames));
    }
    out
}

/// Render the adjusted-space slice `[offset, offset + length)` of a track.
///
/// Maps the request back to original space, adjusts exactly that block run,
/// and slices out the requested frames. Requests past the end of the track
/// are zero-padded so the mixer always receives full-length pieces.
pub fn render_piece(
    samples: &[f32],
    channels: usize,
    offset: i64,
    length: i64,
    tempo: f64,
) -> Vec<f32> {
    let total_frames = (samples.len() / channels) as i64;
    let mapped = timing::map_adjusted_range_to_original(offset, length, tempo);

    let start = mapped.starting_sample.min(total_frames);
    let end = mapped.ending_sample.min(total_frames);
    let adjusted = adjust(
        &samples[(start * channels as i64) as usize..(end * channels as i64) as usize],
        channels,
        tempo,
    );

    let from = (mapped.offset_after_adj as usize * channels).min(adjusted.len());
    let want = length as usize * channels;
    let mut out = adjusted[from..(from + want).min(adjusted.len())].to_vec();
    out.resize(want, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels).map(|i| (i as f32 * 0.001).sin()).collect()
    }

    #[test]
    fn block_lengths_match_timing_math() {
        let track = ramp(BLOCK_SIZE as usize * 3 + 500, 2);
        for &tempo in &[1.0, 1.1, 2.0] {
            let adjusted = adjust(&track, 2, tempo);
            let frames = (track.len() / 2) as i64;
            assert_eq!(
                adjusted.len() as i64 / 2,
                timing::duration_after_adjustment(frames, tempo)
            );
        }
    }

    #[test]
    fn identity_tempo_is_bit_exact() {
        let track = ramp(BLOCK_SIZE as usize * 2, 1);
        assert_eq!(adjust(&track, 1, 1.0), track);
    }

    #[test]
    fn piece_equals_full_render_slice() {
        let track = ramp(BLOCK_SIZE as usize * 6, 2);
        for &tempo in &[1.0, 1.1, 2.0] {
            let whole = adjust(&track, 2, tempo);
            for &(offset, length) in &[(0i64, 512i64), (5000, 2048), (10_000, 1000)] {
                let piece = render_piece(&track, 2, offset, length, tempo);
                let want =
                    &whole[offset as usize * 2..(offset + length) as usize * 2];
                assert_eq!(piece, want, "offset={offset} length={length} tempo={tempo}");
            }
        }
    }

    #[test]
    fn past_end_requests_are_zero_padded() {
        let track = ramp(1000, 2);
        let piece = render_piece(&track, 2, 500, 1000, 1.0);
        assert_eq!(piece.len(), 2000);
        assert!(piece[1500..].iter().all(|&s| s == 0.0));
    }
}
