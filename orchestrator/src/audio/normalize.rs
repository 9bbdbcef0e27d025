//! PCM decode, downmix, and resample to mono 16 kHz int16.

use rubato::{Resampler, SincInterpolationParameters, SincInterpolationType, SincFixedIn, WindowFunction};

use crate::error::WireError;

use super::TARGET_SR;

fn decode_to_float32(data: &[u8], channels: u16, sample_width: u8) -> Result<Vec<f32>, WireError> {
    if channels == 0 {
        return Err(WireError::BadAudioFormat(format!("invalid channels: {channels}")));
    }

    let samples: Vec<f32> = match sample_width {
        1 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        2 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        4 => {
            let as_f32: Vec<f32> = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let max_abs = as_f32.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            if max_abs > 16.0 {
                data.chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2147483648.0)
                    .collect()
            } else {
                as_f32
            }
        }
        other => return Err(WireError::BadAudioFormat(format!("unsupported sample_width: {other}"))),
    };

    if channels == 1 {
        return Ok(samples);
    }

    let channels = channels as usize;
    let usable = samples.len() - (samples.len() % channels);
    let mono = samples[..usable]
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok(mono)
}

fn resample(x: Vec<f32>, src_sr: u32, dst_sr: u32) -> Result<Vec<f32>, WireError> {
    if src_sr == dst_sr {
        return Ok(x);
    }
    if src_sr == 0 {
        return Err(WireError::BadAudioFormat(format!("invalid sample rate: {src_sr}")));
    }
    if x.is_empty() {
        return Ok(x);
    }

    let g = gcd(src_sr, dst_sr);
    let up = dst_sr / g;
    let down = src_sr / g;
    let ratio = up as f64 / down as f64;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let chunk_size = x.len();
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| WireError::BadAudioFormat(format!("resampler construction failed: {e}")))?;
    let waves_in = vec![x];
    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| WireError::BadAudioFormat(format!("resampling failed: {e}")))?;
    Ok(waves_out.into_iter().next().unwrap_or_default())
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Decode raw PCM matching `(sr, channels, sample_width)` into mono 16 kHz
/// signed 16-bit little-endian bytes, or fail with [`WireError::BadAudioFormat`].
pub fn normalize_to_mono16k(data: &[u8], sr: u32, channels: u16, sample_width: u8) -> Result<Vec<u8>, WireError> {
    if sr == 0 {
        return Err(WireError::BadAudioFormat(format!("invalid sample rate: {sr}")));
    }
    let x = decode_to_float32(data, channels, sample_width)?;
    let x = resample(x, sr, TARGET_SR)?;
    let mut out = Vec::with_capacity(x.len() * 2);
    for sample in x {
        let clipped = sample.clamp(-1.0, 1.0);
        let i = (clipped * 32768.0) as i16;
        out.extend_from_slice(&i.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mono_16bit_16k_byte_identical() {
        let samples: Vec<i16> = vec![0, 1000, -1000, 32767, -32768, 42];
        let mut input = Vec::new();
        for s in &samples {
            input.extend_from_slice(&s.to_le_bytes());
        }
        let out = normalize_to_mono16k(&input, 16000, 1, 2).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn unsupported_sample_width_is_bad_audio_format() {
        let err = normalize_to_mono16k(&[0, 0, 0], 16000, 1, 3).unwrap_err();
        assert_eq!(err.code(), "bad_audio_format");
    }

    #[test]
    fn zero_sample_rate_is_bad_audio_format() {
        let err = normalize_to_mono16k(&[0, 0], 0, 1, 2).unwrap_err();
        assert_eq!(err.code(), "bad_audio_format");
    }

    #[test]
    fn stereo_downmixes_by_arithmetic_mean() {
        // two frames, channels=2: (100, -100) and (0, 0)
        let mut input = Vec::new();
        for s in [100i16, -100, 0, 0] {
            input.extend_from_slice(&s.to_le_bytes());
        }
        let out = normalize_to_mono16k(&input, 16000, 2, 2).unwrap();
        let decoded: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![0, 0]);
    }

    #[test]
    fn eight_bit_pcm_decodes_centered_at_128() {
        let input = vec![128u8, 255, 0];
        let out = normalize_to_mono16k(&input, 16000, 1, 1).unwrap();
        assert_eq!(out.len(), 6);
    }
}
