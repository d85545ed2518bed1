//! Tempo figures from a detected beat list.
//!
//! A bpm value is computed over a window of 41 consecutive beat timestamps:
//! sort the 40 inter-beat distances, average the middle 20 (dropping the 10
//! shortest and 10 longest), return `60 / average`. The trimming makes the
//! figure robust against a few missed or doubled beats.

/// Beats per bpm window. 41 timestamps give 40 inter-beat distances.
pub const BPM_WINDOW_BEATS: usize = 41;

/// Tracks at least this long get start and end tempo measured separately.
pub const TWO_SIDED_MIN_SECS: f64 = 120.0;

/// Trimmed-median bpm from the 41 beats starting at `start_index`.
/// `None` when fewer than 41 beats are available there.
pub fn bpm_from_beats(beats: &[f32], start_index: usize) -> Option<f32> {
    let window = beats.get(start_index..start_index + BPM_WINDOW_BEATS)?;
    let mut gaps: Vec<f32> = window.windows(2).map(|w| w[1] - w[0]).collect();
    gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let keep = gaps.len() / 2; // 20
    let from = keep / 2; // 10
    let middle = &gaps[from..from + keep];
    let avg = middle.iter().sum::<f32>() / middle.len() as f32;
    if avg <= 0.0 {
        return None;
    }
    Some(60.0 / avg)
}

/// Result of running tempo detection over a whole track's beat list.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoFigures {
    pub bpm_start: Option<f32>,
    pub bpm_end: f32,
}

/// Start/end bpm per the two-sided rule: tracks of at least
/// [`TWO_SIDED_MIN_SECS`] measure the first and last 41 beats separately;
/// shorter tracks run one detection and reuse it for both ends.
/// `want_start` controls whether `bpm_start` is reported at all (the first
/// track of a session never needs one).
///
/// `None` means detection failed (insufficient beats) and the track must be
/// dropped by the scheduler.
pub fn tempo_figures(beats: &[f32], duration_secs: f64, want_start: bool) -> Option<TempoFigures> {
    if beats.len() < BPM_WINDOW_BEATS {
        return None;
    }
    let (start, end) = if duration_secs >= TWO_SIDED_MIN_SECS {
        let start = bpm_from_beats(beats, 0)?;
        let end = bpm_from_beats(beats, beats.len() - BPM_WINDOW_BEATS)?;
        (start, end)
    } else {
        let bpm = bpm_from_beats(beats, 0)?;
        (bpm, bpm)
    };
    Some(TempoFigures {
        bpm_start: want_start.then_some(start),
        bpm_end: end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular_beats(n: usize, spacing: f32) -> Vec<f32> {
        (0..n).map(|i| i as f32 * spacing).collect()
    }

    #[test]
    fn regular_half_second_spacing_is_120_bpm() {
        let beats = regular_beats(41, 0.5);
        let bpm = bpm_from_beats(&beats, 0).unwrap();
        assert!((bpm - 120.0).abs() < 1e-3, "got {bpm}");
    }

    #[test]
    fn trimming_rejects_outlier_distances() {
        // 0.5 s grid with two corrupted gaps: one near-zero (doubled beat)
        // and one huge (missed beats).
        let mut beats = regular_beats(41, 0.5);
        beats[10] = beats[9] + 0.01;
        beats[30] = beats[29] + 2.5;
        let bpm = bpm_from_beats(&beats, 0).unwrap();
        assert!(
            (bpm - 120.0).abs() < 5.0,
            "trimmed median should stay near 120, got {bpm}"
        );
    }

    #[test]
    fn too_few_beats_is_a_failure() {
        assert!(bpm_from_beats(&regular_beats(40, 0.5), 0).is_none());
        assert!(tempo_figures(&regular_beats(40, 0.5), 300.0, true).is_none());
    }

    #[test]
    fn short_track_reuses_one_figure_for_both_ends() {
        let beats = regular_beats(60, 0.5);
        let figures = tempo_figures(&beats, 30.0, true).unwrap();
        assert_eq!(figures.bpm_start, Some(figures.bpm_end));
    }

    #[test]
    fn long_track_measures_both_ends() {
        // First half at 120 bpm, second half at 100 bpm.
        let mut beats = regular_beats(60, 0.5);
        let mut t = *beats.last().unwrap();
        for _ in 0..60 {
            t += 0.6;
            beats.push(t);
        }
        let figures = tempo_figures(&beats, 200.0, true).unwrap();
        assert!((figures.bpm_start.unwrap() - 120.0).abs() < 1.0);
        assert!((figures.bpm_end - 100.0).abs() < 1.0);
    }

    #[test]
    fn start_bpm_omitted_unless_requested() {
        let beats = regular_beats(50, 0.5);
        let figures = tempo_figures(&beats, 30.0, false).unwrap();
        assert!(figures.bpm_start.is_none());
    }
}
