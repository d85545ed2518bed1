//! Fixed-width waveform-extremes summary for the scrubber UI.
//!
//! 600 columns; each column holds the min and max sample over its span of the
//! track. Wire layout: 600 f32 LE minima followed by 600 f32 LE maxima
//! (600 × 2 × 4 bytes).

/// Columns in a thumbnail.
pub const THUMBNAIL_WIDTH: usize = 600;

/// Serialized thumbnail size in bytes.
pub const THUMBNAIL_BYTES: usize = THUMBNAIL_WIDTH * 2 * 4;

/// Compute the min/max columns over interleaved PCM.
pub fn waveform_extremes(samples: &[f32], channels: usize) -> (Vec<f32>, Vec<f32>) {
    let mut mins = vec![0.0_f32; THUMBNAIL_WIDTH];
    let mut maxs = vec![0.0_f32; THUMBNAIL_WIDTH];
    let frames = if channels == 0 { 0 } else { samples.len() / channels };
    if frames == 0 {
        return (mins, maxs);
    }
    for col in 0..THUMBNAIL_WIDTH {
        let from = col * frames / THUMBNAIL_WIDTH;
        let to = ((col + 1) * frames / THUMBNAIL_WIDTH).max(from + 1).min(frames);
        let mut lo = f32::MAX;
        let mut hi = f32::MIN;
        for &s in &samples[from * channels..to * channels] {
            lo = lo.min(s);
            hi = hi.max(s);
        }
        mins[col] = lo;
        maxs[col] = hi;
    }
    (mins, maxs)
}

/// Serialize to the fixed wire layout.
pub fn encode(mins: &[f32], maxs: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(THUMBNAIL_BYTES);
    for &v in mins.iter().chain(maxs.iter()) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_fixed_width() {
        let samples: Vec<f32> = (0..48_000).map(|i| (i as f32 * 0.01).sin()).collect();
        let (mins, maxs) = waveform_extremes(&samples, 1);
        assert_eq!(mins.len(), THUMBNAIL_WIDTH);
        assert_eq!(maxs.len(), THUMBNAIL_WIDTH);
        assert_eq!(encode(&mins, &maxs).len(), THUMBNAIL_BYTES);
    }

    #[test]
    fn min_never_exceeds_max() {
        let samples: Vec<f32> = (0..100_000).map(|i| ((i * 7919) % 101) as f32 / 50.0 - 1.0).collect();
        let (mins, maxs) = waveform_extremes(&samples, 2);
        for (lo, hi) in mins.iter().zip(&maxs) {
            assert!(lo <= hi);
        }
    }

    #[test]
    fn empty_input_is_all_zero() {
        let (mins, maxs) = waveform_extremes(&[], 2);
        assert!(mins.iter().chain(maxs.iter()).all(|&v| v == 0.0));
    }
}
