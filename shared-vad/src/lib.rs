//! Frame-wise speech-probability estimation over 32 ms windows at 16 kHz.
//!
//! Backed by `earshot`, a pure-Rust WebRTC-derived detector that yields a
//! per-frame speech probability — the same shape of primitive a pretrained
//! Silero-style model would hand back, just without the model weights.

use earshot::Detector;
use thiserror::Error;

pub const SAMPLE_RATE: u32 = 16_000;
pub const FRAME_MS: u32 = 32;
pub const FRAME_SAMPLES: usize = 512; // 32 ms @ 16 kHz

/// earshot's native analysis window; two of these make one [`FRAME_SAMPLES`] frame.
const SUBFRAME_SAMPLES: usize = 256;

#[derive(Debug, Error)]
pub enum VadError {
    #[error("window_s must be > 0")]
    InvalidWindow,
    #[error("insufficient samples for one 32ms frame in the tail window")]
    InsufficientSamples,
}

/// Stateless (per call) frame-wise speech detector.
///
/// Each [`Vad::analyze`] call scores its buffer from the start, since callers
/// (the per-user segmenter) re-score the entire accumulated buffer on every
/// feed rather than streaming incrementally.
#[derive(Default)]
pub struct Vad;

impl Vad {
    pub fn new() -> Self {
        Self
    }

    /// Score `pcm16` (mono, 16 kHz) frame-by-frame and return
    /// `(drop_samples, max_prob_over_tail_window)`.
    ///
    /// `drop_samples` is how many leading samples are safe to discard as
    /// silence, preserving `keep_context_ms` of context before the first
    /// frame that broke a leading silence run of at least `min_consecutive`
    /// frames. `max_prob` is the maximum per-frame probability within the
    /// trailing `window_s` seconds of `pcm16`.
    pub fn analyze(
        &self,
        pcm16: &[i16],
        window_s: f32,
        threshold: f32,
        keep_context_ms: u32,
        min_consecutive: usize,
    ) -> Result<(usize, f32), VadError> {
        if window_s <= 0.0 {
            return Err(VadError::InvalidWindow);
        }

        let n_frames_total = pcm16.len() / FRAME_SAMPLES;
        if n_frames_total == 0 {
            return Err(VadError::InsufficientSamples);
        }

        let window_frames =
            ((window_s * SAMPLE_RATE as f32) as usize / FRAME_SAMPLES).max(1);
        let tail_frames = window_frames.min(n_frames_total);
        let start_tail_idx = n_frames_total - tail_frames;
        if tail_frames == 0 {
            return Err(VadError::InsufficientSamples);
        }

        let keep_ctx_frames = (keep_context_ms / FRAME_MS).max(1) as usize;

        let mut detector = Detector::default();
        let mut leading_low = 0usize;
        let mut found_voice = false;
        let mut max_p_tail = 0.0f32;

        for i in 0..n_frames_total {
            let frame = &pcm16[i * FRAME_SAMPLES..(i + 1) * FRAME_SAMPLES];
            let p = frame_probability(&mut detector, frame);

            if !found_voice {
                if p < threshold {
                    leading_low += 1;
                } else {
                    found_voice = true;
                }
            }

            if i >= start_tail_idx && p > max_p_tail {
                max_p_tail = p;
            }
        }

        let drop_frames = if leading_low < min_consecutive {
            0
        } else {
            leading_low.saturating_sub(keep_ctx_frames)
        };

        Ok((drop_frames * FRAME_SAMPLES, max_p_tail))
    }
}

/// Score one 32 ms frame as the max of its two constituent 16 ms sub-frames.
fn frame_probability(detector: &mut Detector, frame: &[i16]) -> f32 {
    debug_assert_eq!(frame.len(), FRAME_SAMPLES);
    let (a, b) = frame.split_at(SUBFRAME_SAMPLES);
    let pa = detector.predict_i16(a);
    let pb = detector.predict_i16(b);
    pa.max(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(n_frames: usize) -> Vec<i16> {
        vec![0i16; n_frames * FRAME_SAMPLES]
    }

    fn tone(n_frames: usize) -> Vec<i16> {
        (0..n_frames * FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (8000.0 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn insufficient_samples_on_empty_buffer() {
        let vad = Vad::new();
        let err = vad.analyze(&[], 0.2, 0.5, 96, 3).unwrap_err();
        assert!(matches!(err, VadError::InsufficientSamples));
    }

    #[test]
    fn insufficient_samples_below_one_frame() {
        let vad = Vad::new();
        let buf = vec![0i16; FRAME_SAMPLES - 1];
        let err = vad.analyze(&buf, 0.2, 0.5, 96, 3).unwrap_err();
        assert!(matches!(err, VadError::InsufficientSamples));
    }

    #[test]
    fn exactly_one_frame_does_not_crash() {
        let vad = Vad::new();
        let buf = silence(1);
        let result = vad.analyze(&buf, 0.2, 0.5, 96, 3);
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_window_rejected() {
        let vad = Vad::new();
        let buf = silence(4);
        let err = vad.analyze(&buf, 0.0, 0.5, 96, 3).unwrap_err();
        assert!(matches!(err, VadError::InvalidWindow));
    }

    #[test]
    fn short_silence_run_does_not_trim() {
        // A leading silence run shorter than min_consecutive must not be trimmed,
        // since the start may still be speech onset.
        let vad = Vad::new();
        let mut buf = silence(2);
        buf.extend(tone(4));
        let (drop_samples, _) = vad.analyze(&buf, 0.2, 0.5, 96, 3).unwrap();
        assert_eq!(drop_samples, 0);
    }

    #[test]
    fn long_silence_run_trims_but_keeps_context() {
        let vad = Vad::new();
        let mut buf = silence(10);
        buf.extend(tone(4));
        let (drop_samples, _) = vad.analyze(&buf, 0.2, 0.5, 96, 3).unwrap();
        // keep_context_ms=96 -> 3 frames retained, so at most 7 frames dropped.
        assert!(drop_samples <= 7 * FRAME_SAMPLES);
    }
}
