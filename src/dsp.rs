//! Sample-domain primitives used by the decode and capture pipelines
//!
//! Everything in here is a pure function over slices: no shared state, safe to
//! call from the worker thread, the blocking pool, or the capture tick loop.

use thiserror::Error;

/// Number of taps in the low-pass FIR kernel
pub const LOW_PASS_TAPS: usize = 101;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DspError {
    #[error("Unsupported PCM encoding: {bit_depth}-bit samples")]
    UnsupportedEncoding { bit_depth: u16 },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Convert an interleaved little-endian PCM block into one float per frame.
///
/// Channels are averaged. 16-bit samples are scaled by 1/32768, unsigned 8-bit
/// samples map through `(v - 128) / 128`, and 32-bit samples are IEEE floats
/// passed through as-is. A trailing partial frame is ignored.
pub fn to_float_samples(
    bytes: &[u8],
    bit_depth: u16,
    channel_count: u16,
) -> Result<Vec<f32>, DspError> {
    let bytes_per_sample = match bit_depth {
        8 => 1,
        16 => 2,
        32 => 4,
        other => return Err(DspError::UnsupportedEncoding { bit_depth: other }),
    };
    if channel_count == 0 {
        return Err(DspError::InvalidArgument(
            "channel count must be at least 1".to_string(),
        ));
    }

    let channels = channel_count as usize;
    let frame_bytes = bytes_per_sample * channels;

    let frames = bytes
        .chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(bytes_per_sample)
                .map(|s| match bit_depth {
                    8 => (s[0] as f32 - 128.0) / 128.0,
                    16 => i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0,
                    _ => f32::from_le_bytes([s[0], s[1], s[2], s[3]]),
                })
                .sum();
            sum / channels as f32
        })
        .collect();

    Ok(frames)
}

/// Hamming-windowed sinc kernel with unit DC gain.
///
/// Returns `None` when the cutoff is not a usable fraction of the sample rate.
fn low_pass_kernel(sample_rate: u32, cutoff_hz: f32) -> Option<[f32; LOW_PASS_TAPS]> {
    if sample_rate == 0 || !cutoff_hz.is_finite() || cutoff_hz <= 0.0 {
        return None;
    }

    let fc = (cutoff_hz as f64 / sample_rate as f64).min(0.5);
    let m = (LOW_PASS_TAPS - 1) as f64;
    let mut kernel = [0.0f64; LOW_PASS_TAPS];

    for (i, tap) in kernel.iter_mut().enumerate() {
        let x = i as f64 - m / 2.0;
        let sinc = if x == 0.0 {
            2.0 * std::f64::consts::PI * fc
        } else {
            (2.0 * std::f64::consts::PI * fc * x).sin() / x
        };
        let window = 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / m).cos();
        *tap = sinc * window;
    }

    let sum: f64 = kernel.iter().sum();
    if sum.abs() < f64::EPSILON {
        return None;
    }

    let mut out = [0.0f32; LOW_PASS_TAPS];
    for (o, k) in out.iter_mut().zip(kernel.iter()) {
        *o = (k / sum) as f32;
    }
    Some(out)
}

/// Windowed-sinc low-pass filter.
///
/// Output has the same length as the input; samples before the start of the
/// block are treated as zero. An unusable cutoff (non-positive, non-finite, or a
/// zero sample rate) returns the input unchanged.
pub fn low_pass_filter(samples: &[f32], sample_rate: u32, cutoff_hz: f32) -> Vec<f32> {
    let Some(kernel) = low_pass_kernel(sample_rate, cutoff_hz) else {
        return samples.to_vec();
    };

    (0..samples.len())
        .map(|n| {
            let taps = (n + 1).min(LOW_PASS_TAPS);
            (0..taps).map(|k| kernel[k] * samples[n - k]).sum::<f32>()
        })
        .collect()
}

/// Root mean square; 0.0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Remap onto [0, 1] using the slice's own min and max.
///
/// Empty and constant slices come back unchanged.
pub fn normalize(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let (min, max) = samples
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    normalize_with_range(samples, min, max)
}

/// Remap onto [0, 1] using an externally tracked range.
///
/// A degenerate range (`max <= min`) returns the input unchanged.
pub fn normalize_with_range(samples: &[f32], min: f32, max: f32) -> Vec<f32> {
    if max <= min {
        return samples.to_vec();
    }
    let span = max - min;
    samples.iter().map(|&s| (s - min) / span).collect()
}

/// Three-point weighted average: neighbors get `factor / 2`, the sample itself
/// `1 - factor`. Endpoints are left as they are.
pub fn smooth(samples: &[f32], factor: f32) -> Vec<f32> {
    if factor == 0.0 || samples.len() < 3 {
        return samples.to_vec();
    }

    let side = factor / 2.0;
    let center = 1.0 - factor;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(samples.len());
    out.push(samples[0]);
    for i in 1..last {
        out.push(samples[i - 1] * side + samples[i] * center + samples[i + 1] * side);
    }
    out.push(samples[last]);
    out
}

/// Reduce to `target_count` contiguous segments, each summarized by its RMS.
///
/// When `target_count` is at least the input length the input is copied as-is.
pub fn decimate(samples: &[f32], target_count: usize) -> Result<Vec<f32>, DspError> {
    if target_count == 0 {
        return Err(DspError::InvalidArgument(
            "decimation target must be positive".to_string(),
        ));
    }
    if target_count >= samples.len() {
        return Ok(samples.to_vec());
    }

    let len = samples.len();
    Ok((0..target_count)
        .map(|i| {
            let start = i * len / target_count;
            let end = (i + 1) * len / target_count;
            rms(&samples[start..end])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn pcm32(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn silent_blocks_convert_to_zero() {
        let silent16 = to_float_samples(&pcm16(&[0; 64]), 16, 2).unwrap();
        assert_eq!(silent16.len(), 32);
        assert!(silent16.iter().all(|&s| s == 0.0));

        let silent8 = to_float_samples(&[128u8; 48], 8, 1).unwrap();
        assert_eq!(silent8.len(), 48);
        assert!(silent8.iter().all(|&s| s == 0.0));

        let silent32 = to_float_samples(&pcm32(&[0.0; 12]), 32, 3).unwrap();
        assert_eq!(silent32.len(), 4);
        assert!(silent32.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn sixteen_bit_scaling_and_channel_average() {
        let samples = to_float_samples(&pcm16(&[16384, 0, -32768, -32768]), 16, 2).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-6);
        assert!((samples[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn eight_bit_is_offset_binary() {
        let samples = to_float_samples(&[0, 255, 192], 8, 1).unwrap();
        assert!((samples[0] + 1.0).abs() < 1e-6);
        assert!((samples[1] - 127.0 / 128.0).abs() < 1e-6);
        assert!((samples[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn thirty_two_bit_passes_floats_through() {
        let samples = to_float_samples(&pcm32(&[0.5, -0.25, 1.0, 0.0]), 32, 2).unwrap();
        assert_eq!(samples, vec![0.125, 0.5]);
    }

    #[test]
    fn conversion_is_linear() {
        let a = to_float_samples(&pcm16(&[1000, 3000]), 16, 1).unwrap();
        let b = to_float_samples(&pcm16(&[2000, 6000]), 16, 1).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((2.0 * x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn trailing_partial_frame_is_ignored() {
        let mut bytes = pcm16(&[100, 200]);
        bytes.push(7);
        let samples = to_float_samples(&bytes, 16, 2).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn unsupported_bit_depth_is_rejected() {
        let err = to_float_samples(&[0; 6], 24, 1).unwrap_err();
        assert_eq!(err, DspError::UnsupportedEncoding { bit_depth: 24 });
        assert!(matches!(
            to_float_samples(&[0; 4], 16, 0),
            Err(DspError::InvalidArgument(_))
        ));
    }

    #[test]
    fn low_pass_keeps_length_and_dc() {
        let input = vec![0.5f32; 400];
        let output = low_pass_filter(&input, 16_000, 100.0);
        assert_eq!(output.len(), input.len());
        // Left edge ramps up from the zero padding
        assert!(output[0] < 0.5);
        // Past the kernel length the DC level is preserved
        for &s in &output[LOW_PASS_TAPS..] {
            assert!((s - 0.5).abs() < 1e-3, "expected 0.5, got {}", s);
        }
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let rate = 16_000u32;
        let tone: Vec<f32> = (0..2000)
            .map(|i| (2.0 * std::f32::consts::PI * 4000.0 * i as f32 / rate as f32).sin())
            .collect();
        let filtered = low_pass_filter(&tone, rate, 200.0);
        let settled = &filtered[LOW_PASS_TAPS..];
        assert!(rms(settled) < 0.05 * rms(&tone));
    }

    #[test]
    fn low_pass_with_unusable_cutoff_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(low_pass_filter(&input, 16_000, 0.0), input);
        assert_eq!(low_pass_filter(&input, 0, 10.0), input);
        assert!(low_pass_filter(&[], 16_000, 10.0).is_empty());
    }

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 10]) - 0.5).abs() < 1e-6);
        assert!((rms(&[1.0, -1.0, 1.0, -1.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_spans_unit_interval() {
        let out = normalize(&[3.0, -1.0, 7.0, 2.0]);
        let min = out.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = out.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(min.abs() < 1e-6);
        assert!((max - 1.0).abs() < 1e-6);
        assert!((out[3] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn normalize_degenerate_inputs_unchanged() {
        assert_eq!(normalize(&[0.4, 0.4, 0.4]), vec![0.4, 0.4, 0.4]);
        assert!(normalize(&[]).is_empty());
        assert_eq!(normalize_with_range(&[2.0, 3.0], 5.0, 5.0), vec![2.0, 3.0]);
    }

    #[test]
    fn normalize_with_external_range() {
        let out = normalize_with_range(&[150.0, 200.0], 100.0, 300.0);
        assert!((out[0] - 0.25).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn smooth_weights_neighbors() {
        let out = smooth(&[0.0, 1.0, 0.0, 1.0], 0.3);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[3], 1.0);
        assert!((out[1] - 0.7).abs() < 1e-6);
        assert!((out[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn smooth_zero_factor_is_noop() {
        let input = vec![0.1, 0.9, 0.2, 0.8];
        assert_eq!(smooth(&input, 0.0), input);
        assert_eq!(smooth(&[0.5, 0.6], 0.3), vec![0.5, 0.6]);
    }

    #[test]
    fn decimate_returns_requested_count() {
        let input: Vec<f32> = (0..1000).map(|i| (i % 7) as f32 / 7.0).collect();
        for m in [1, 3, 24, 999] {
            assert_eq!(decimate(&input, m).unwrap().len(), m);
        }
    }

    #[test]
    fn decimate_segments_use_rms() {
        let out = decimate(&[1.0, -1.0, 0.5, 0.5], 2).unwrap();
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn decimate_short_input_is_copied() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(decimate(&input, 3).unwrap(), input);
        assert_eq!(decimate(&input, 50).unwrap(), input);
    }

    #[test]
    fn decimate_rejects_zero_target() {
        assert!(matches!(
            decimate(&[1.0, 2.0], 0),
            Err(DspError::InvalidArgument(_))
        ));
    }
}
