//! Per-user speech segmentation: accumulate mono 16 kHz PCM16 chunks, trim
//! leading silence, and emit bounded [`SpeechSegment`]s on a silence gap or
//! max-length cutoff.

use shared_vad::{Vad, SAMPLE_RATE};

const KEEP_CONTEXT_MS: u32 = 96;
const MIN_CONSECUTIVE: usize = 3;

#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub pcm16: Vec<u8>,
    pub start_ts: f64,
    pub end_ts: f64,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub silence_gap_s: f32,
    pub max_segment_s: f32,
    pub vad_threshold: f32,
    pub min_segment_s: f32,
    pub vad_window_s: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_gap_s: 1.5,
            max_segment_s: 60.0,
            vad_threshold: 0.5,
            min_segment_s: 0.2,
            vad_window_s: 0.2,
        }
    }
}

#[derive(Default)]
struct BufferState {
    started_ts: Option<f64>,
    last_speech_ts: Option<f64>,
    last_capture_ts: Option<f64>,
    samples: Vec<i16>,
    prompt_override: Option<String>,
}

pub struct Segmenter {
    #[allow(dead_code)]
    user_id: String,
    cfg: SegmenterConfig,
    vad: Vad,
    buf: BufferState,
}

impl Segmenter {
    pub fn new(user_id: impl Into<String>, cfg: SegmenterConfig) -> Self {
        Self {
            user_id: user_id.into(),
            cfg,
            vad: Vad::new(),
            buf: BufferState::default(),
        }
    }

    /// Enqueue one mono 16 kHz PCM16LE chunk. Never blocks; may return
    /// segments finalized by a discontinuity flush or a VAD-driven cutoff.
    /// `prompt` carries the chunk's prompt override, if any; the most
    /// recent non-`None` value fed for the in-progress utterance is the one
    /// attached to the segment that utterance eventually emits.
    pub fn feed(&mut self, pcm16: &[u8], capture_ts: f64, prompt: Option<&str>) -> Vec<SpeechSegment> {
        let mut finalized = Vec::new();
        let arr: Vec<i16> = pcm16
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();

        if !self.buf.samples.is_empty() {
            if let Some(last_capture_ts) = self.buf.last_capture_ts {
                let incoming_dur = arr.len() as f64 / SAMPLE_RATE as f64;
                let incoming_start_ts = capture_ts - incoming_dur;
                let gap = incoming_start_ts - last_capture_ts;
                if gap >= self.cfg.silence_gap_s as f64 {
                    let end_ts = self.buf.last_speech_ts.unwrap_or(last_capture_ts);
                    finalized.extend(self.flush_internal(false, end_ts));
                }
            }
        }

        if arr.is_empty() {
            return finalized;
        }

        self.buf.samples.extend_from_slice(&arr);
        self.buf.last_capture_ts = Some(capture_ts);
        if let Some(p) = prompt {
            if !p.is_empty() {
                self.buf.prompt_override = Some(p.to_string());
            }
        }

        let vad_window_samples = (self.cfg.vad_window_s as f64 * SAMPLE_RATE as f64) as usize;
        if self.buf.samples.len() < vad_window_samples {
            return finalized;
        }

        let Ok((drop, max_p)) = self.vad.analyze(
            &self.buf.samples,
            self.cfg.vad_window_s,
            self.cfg.vad_threshold,
            KEEP_CONTEXT_MS,
            MIN_CONSECUTIVE,
        ) else {
            // Not enough audio for one full frame, or another validation
            // failure: keep buffering rather than guess.
            return finalized;
        };

        if self.buf.started_ts.is_none() && drop > 0 {
            let drop = drop.min(self.buf.samples.len());
            self.buf.samples.drain(0..drop);
        }

        let is_speech = max_p >= self.cfg.vad_threshold;
        if is_speech {
            if self.buf.started_ts.is_none() {
                self.buf.started_ts = Some(capture_ts);
            }
            self.buf.last_speech_ts = Some(capture_ts);
            if let Some(started) = self.buf.started_ts {
                if capture_ts - started >= self.cfg.max_segment_s as f64 {
                    finalized.extend(self.flush_internal(true, capture_ts));
                }
            }
        } else if let Some(last_speech) = self.buf.last_speech_ts {
            let gap = capture_ts - last_speech;
            if gap >= self.cfg.silence_gap_s as f64 {
                finalized.extend(self.flush_internal(false, last_speech));
            }
        }

        finalized
    }

    /// Time-based finalization, expected to be called periodically even
    /// without new audio (the orchestrator's flusher loop).
    pub fn collect_ready(&mut self, now_ts: f64) -> Vec<SpeechSegment> {
        let Some(started) = self.buf.started_ts else {
            return Vec::new();
        };
        if let Some(last_speech) = self.buf.last_speech_ts {
            if now_ts - last_speech >= self.cfg.silence_gap_s as f64 {
                return self.flush_internal(false, last_speech);
            }
        }
        if now_ts - started >= self.cfg.max_segment_s as f64 {
            let end_ts = self.buf.last_capture_ts.unwrap_or(started);
            return self.flush_internal(true, end_ts);
        }
        Vec::new()
    }

    fn flush_internal(&mut self, force: bool, end_ts: f64) -> Vec<SpeechSegment> {
        if self.buf.samples.is_empty() || self.buf.started_ts.is_none() {
            self.buf = BufferState::default();
            return Vec::new();
        }
        let duration_s = self.buf.samples.len() as f64 / SAMPLE_RATE as f64;
        if !force && duration_s < self.cfg.min_segment_s as f64 {
            self.buf = BufferState::default();
            return Vec::new();
        }
        let start_ts = self.buf.started_ts.expect("checked above");
        let mut pcm16 = Vec::with_capacity(self.buf.samples.len() * 2);
        for s in &self.buf.samples {
            pcm16.extend_from_slice(&s.to_le_bytes());
        }
        let prompt = self.buf.prompt_override.clone();
        let segment = SpeechSegment { pcm16, start_ts, end_ts, prompt };
        self.buf = BufferState::default();
        vec![segment]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence_bytes(n_samples: usize) -> Vec<u8> {
        vec![0u8; n_samples * 2]
    }

    fn tone_bytes(n_samples: usize, offset_samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n_samples * 2);
        for i in 0..n_samples {
            let t = (offset_samples + i) as f32 / SAMPLE_RATE as f32;
            let s = (8000.0 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()) as i16;
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn pure_silence_produces_no_segments() {
        let mut seg = Segmenter::new("u1", SegmenterConfig::default());
        let mut ts = 0.5;
        let mut out = Vec::new();
        for _ in 0..8 {
            out.extend(seg.feed(&silence_bytes(8000), ts, None));
            ts += 0.5;
        }
        out.extend(seg.collect_ready(ts));
        assert!(out.is_empty());
    }

    #[test]
    fn simple_utterance_emits_exactly_one_segment() {
        let mut cfg = SegmenterConfig::default();
        cfg.silence_gap_s = 1.5;
        let mut seg = Segmenter::new("u1", cfg);
        let mut out = Vec::new();
        let mut ts = 0.5;
        let mut offset = 0;
        // 2s of speech in 500ms chunks
        for _ in 0..4 {
            out.extend(seg.feed(&tone_bytes(8000, offset), ts, None));
            offset += 8000;
            ts += 0.5;
        }
        // 2s of trailing silence
        for _ in 0..4 {
            out.extend(seg.feed(&silence_bytes(8000), ts, None));
            ts += 0.5;
        }
        out.extend(seg.collect_ready(ts));
        assert_eq!(out.len(), 1);
        assert!(out[0].end_ts >= out[0].start_ts);
    }

    #[test]
    fn tiny_blip_below_min_segment_is_dropped() {
        let mut cfg = SegmenterConfig::default();
        cfg.min_segment_s = 0.2;
        cfg.vad_window_s = 0.05;
        let mut seg = Segmenter::new("u1", cfg);
        let mut out = Vec::new();
        out.extend(seg.feed(&tone_bytes(1280, 0), 0.08, None)); // 80ms blip
        out.extend(seg.feed(&silence_bytes(32000), 2.08, None)); // 2s silence
        out.extend(seg.collect_ready(2.08));
        assert!(out.is_empty());
    }

    #[test]
    fn discontinuity_gap_flushes_before_merging_with_next_utterance() {
        let mut cfg = SegmenterConfig::default();
        cfg.silence_gap_s = 1.5;
        let mut seg = Segmenter::new("u1", cfg);
        let mut out = Vec::new();
        // 1s speech at [0, 1]
        out.extend(seg.feed(&tone_bytes(8000, 0), 0.5, None));
        out.extend(seg.feed(&tone_bytes(8000, 8000), 1.0, None));
        // large network gap, then 1s speech arriving with capture_ts far ahead
        out.extend(seg.feed(&tone_bytes(8000, 0), 5.5, None));
        out.extend(seg.feed(&tone_bytes(8000, 8000), 6.0, None));
        out.extend(seg.feed(&silence_bytes(32000), 8.0, None));
        out.extend(seg.collect_ready(8.0));
        assert_eq!(out.len(), 2);
        assert!(out[0].end_ts <= out[1].start_ts);
    }

    #[test]
    fn max_segment_cutoff_emits_before_silence() {
        let mut cfg = SegmenterConfig::default();
        cfg.max_segment_s = 2.0;
        let mut seg = Segmenter::new("u1", cfg);
        let mut out = Vec::new();
        let mut ts = 0.5;
        let mut offset = 0;
        for _ in 0..7 {
            out.extend(seg.feed(&tone_bytes(8000, offset), ts, None));
            offset += 8000;
            ts += 0.5;
        }
        assert!(!out.is_empty());
        assert!(out[0].end_ts - out[0].start_ts <= 2.5);
    }

    #[test]
    fn exactly_one_vad_window_worth_does_not_crash() {
        let mut seg = Segmenter::new("u1", SegmenterConfig::default());
        let out = seg.feed(&silence_bytes(3200), 0.2, None);
        assert!(out.is_empty());
    }

    #[test]
    fn prompt_override_is_carried_onto_the_emitted_segment() {
        let mut cfg = SegmenterConfig::default();
        cfg.silence_gap_s = 1.5;
        let mut seg = Segmenter::new("u1", cfg);
        let mut out = Vec::new();
        let mut ts = 0.5;
        let mut offset = 0;
        for i in 0..4 {
            let prompt = if i == 0 { Some("names: Alice, Bob") } else { None };
            out.extend(seg.feed(&tone_bytes(8000, offset), ts, prompt));
            offset += 8000;
            ts += 0.5;
        }
        for _ in 0..4 {
            out.extend(seg.feed(&silence_bytes(8000), ts, None));
            ts += 0.5;
        }
        out.extend(seg.collect_ready(ts));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].prompt.as_deref(), Some("names: Alice, Bob"));
    }
}
