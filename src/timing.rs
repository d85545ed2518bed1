//! Conversions between original-sample-space and tempo-adjusted-sample-space.
//!
//! The tempo transform works on fixed blocks of 4096 original-space samples;
//! each block contributes `ceil(block_len / tempo)` adjusted-space samples.
//! Every consumer of adjusted timing (scheduler, mixer, worker) must walk the
//! same blocks, or stream audio and displayed metadata drift apart.

/// Block size of the tempo transform, in original-space samples.
pub const BLOCK_SIZE: i64 = 4096;

/// Adjusted-space length of one block of `len` original-space samples.
fn block_adjusted_len(len: i64, tempo: f64) -> i64 {
    (len as f64 / tempo).ceil() as i64
}

/// Adjusted-space duration of `orig_samples` original-space samples played at
/// `tempo` (1.0 = unchanged, 2.0 = double speed).
///
/// This is **not** `orig_samples / tempo` rounded once: the per-block
/// ceiling quantization is observable and load-bearing.
pub fn duration_after_adjustment(orig_samples: i64, tempo: f64) -> i64 {
    debug_assert!(tempo > 0.0);
    let mut remaining = orig_samples.max(0);
    let mut out = 0i64;
    while remaining > 0 {
        let block = remaining.min(BLOCK_SIZE);
        out += block_adjusted_len(block, tempo);
        remaining -= block;
    }
    out
}

/// Result of mapping an adjusted-space range back to original space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Original-space sample at which the block containing `offset` begins.
    /// Always a multiple of [`BLOCK_SIZE`].
    pub starting_sample: i64,
    /// Original-space position at which the accumulated adjusted length first
    /// reaches `offset + length`.
    pub ending_sample: i64,
    /// Leftover adjusted-space offset into the starting block.
    pub offset_after_adj: i64,
}

/// Inverse of [`duration_after_adjustment`]: find the original-space range
/// that, once tempo-adjusted, contains the adjusted-space slice
/// `[offset, offset + length)`.
///
/// The caller slices `[offset_after_adj, offset_after_adj + length)` out of
/// the adjusted rendition of `[starting_sample, ending_sample)`.
pub fn map_adjusted_range_to_original(offset: i64, length: i64, tempo: f64) -> MappedRange {
    debug_assert!(tempo > 0.0);
    debug_assert!(offset >= 0 && length >= 0);

    let mut orig_pos = 0i64;
    let mut adj_pos = 0i64;
    let mut starting_sample = 0i64;
    let mut offset_after_adj = 0i64;
    let mut started = false;

    loop {
        let block_adj = block_adjusted_len(BLOCK_SIZE, tempo);
        if !started && adj_pos + block_adj > offset {
            starting_sample = orig_pos;
            offset_after_adj = offset - adj_pos;
            started = true;
        }
        adj_pos += block_adj;
        orig_pos += BLOCK_SIZE;
        if started && adj_pos >= offset + length {
            return MappedRange {
                starting_sample,
                ending_sample: orig_pos,
                offset_after_adj,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tempo_is_lossless_on_block_multiples() {
        for blocks in 0..8 {
            let d = blocks * BLOCK_SIZE;
            assert_eq!(duration_after_adjustment(d, 1.0), d);
        }
        assert_eq!(duration_after_adjustment(4096, 1.0), 4096);
    }

    #[test]
    fn double_speed_halves_block_pairs() {
        assert_eq!(duration_after_adjustment(8192, 2.0), 4096);
    }

    #[test]
    fn partial_last_block_uses_ceiling() {
        // 4096 + 100 samples at tempo 3.0: ceil(4096/3) + ceil(100/3)
        assert_eq!(duration_after_adjustment(4196, 3.0), 1366 + 34);
    }

    #[test]
    fn monotone_in_duration() {
        for &tempo in &[0.5, 0.9, 1.0, 1.1, 2.0, 3.7] {
            let mut prev = 0;
            for d in (0..40_000).step_by(997) {
                let adj = duration_after_adjustment(d, tempo);
                assert!(adj >= prev, "not monotone at d={d} tempo={tempo}");
                prev = adj;
            }
        }
    }

    #[test]
    fn map_starts_on_block_boundary() {
        let m = map_adjusted_range_to_original(5000, 2000, 1.1);
        assert_eq!(m.starting_sample % BLOCK_SIZE, 0);
        assert!(m.ending_sample > m.starting_sample);
        assert!(m.offset_after_adj >= 0);
    }

    #[test]
    fn map_at_exact_block_boundary_has_zero_leftover() {
        // tempo 1.0: adjusted block length == BLOCK_SIZE
        let m = map_adjusted_range_to_original(BLOCK_SIZE, 10, 1.0);
        assert_eq!(m.starting_sample, BLOCK_SIZE);
        assert_eq!(m.offset_after_adj, 0);
        assert_eq!(m.ending_sample, 2 * BLOCK_SIZE);
    }

    // Reference per-block stretch used to check the round-trip property: each
    // 4096-sample block is resampled independently to its ceiling length.
    fn stretch(track: &[f32], tempo: f64) -> Vec<f32> {
        let mut out = Vec::new();
        for block in track.chunks(BLOCK_SIZE as usize) {
            let out_len = block_adjusted_len(block.len() as i64, tempo) as usize;
            for i in 0..out_len {
                let src = i as f64 * block.len() as f64 / out_len as f64;
                let idx = src as usize;
                let frac = (src - idx as f64) as f32;
                let a = block[idx];
                let b = block[(idx + 1).min(block.len() - 1)];
                out.push(a + (b - a) * frac);
            }
        }
        out
    }

    #[test]
    fn round_trip_matches_full_track_slice() {
        let track: Vec<f32> = (0..BLOCK_SIZE * 6).map(|i| (i as f32 * 0.01).sin()).collect();
        for &tempo in &[1.0, 1.1, 2.0] {
            let whole = stretch(&track, tempo);
            for &(offset, length) in &[(0i64, 500i64), (4000, 3000), (9000, 2000)] {
                let m = map_adjusted_range_to_original(offset, length, tempo);
                let range =
                    &track[m.starting_sample as usize..(m.ending_sample as usize).min(track.len())];
                let piece = stretch(range, tempo);
                let got =
                    &piece[m.offset_after_adj as usize..(m.offset_after_adj + length) as usize];
                let want = &whole[offset as usize..(offset + length) as usize];
                assert_eq!(got, want, "offset={offset} length={length} tempo={tempo}");
            }
        }
    }
}
