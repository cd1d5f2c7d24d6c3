//! Input loudness meter for UI feedback
//!
//! Cheap by construction: only every `METER_STRIDE`-th sample is read, so the
//! cost per frame is bounded regardless of chunk size. The value is advisory
//! and never feeds back into transmission or playback.

/// Read one sample out of every `METER_STRIDE`
const METER_STRIDE: usize = 100;

/// Display gain applied to the mean magnitude
const METER_GAIN: f32 = 100.0;

/// Estimate the loudness of a frame.
///
/// Returns 0 for empty frames. NaN samples are skipped.
pub fn estimate(frame: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0usize;

    for sample in frame.iter().step_by(METER_STRIDE) {
        if sample.is_nan() {
            continue;
        }
        sum += sample.abs();
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }

    let level = sum / count as f32 * METER_GAIN;
    if level.is_finite() && level > 0.0 {
        level
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(estimate(&[0.0; 4096]), 0.0);
        assert_eq!(estimate(&[]), 0.0);
    }

    #[test]
    fn test_constant_signal() {
        // Mean magnitude 0.5 → 50 after gain
        let level = estimate(&[-0.5; 4096]);
        assert!((level - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_only_strided_samples_are_read() {
        let mut frame = vec![0.0f32; 1000];
        // Index 50 is never visited with stride 100
        frame[50] = 1.0;
        assert_eq!(estimate(&frame), 0.0);

        frame[100] = 1.0;
        // 10 strided samples, one at magnitude 1.0
        assert!((estimate(&frame) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_nan_never_leaks() {
        let frame = vec![f32::NAN; 500];
        assert_eq!(estimate(&frame), 0.0);

        let mut frame = vec![0.2f32; 500];
        frame[0] = f32::NAN;
        let level = estimate(&frame);
        assert!(level.is_finite());
        assert!(level >= 0.0);
    }
}
