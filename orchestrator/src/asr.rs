//! Single-consumer ASR worker: bounded job queue, whisper.cpp driving code
//! in the teacher's style (`WhisperContext` loaded once, `WhisperState`
//! reused, `FullParams` configured per job), prompt caching, and repetition
//! suppression.

use std::collections::{HashMap, HashSet};
use std::ffi::c_int;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState};

pub const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct TranscribeJob {
    pub id: String,
    pub pcm16: Vec<u8>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub model_path: String,
    pub device: String,
    pub logprob_threshold: f32,
    pub no_speech_threshold: f32,
    pub max_single_word_repeats: usize,
    pub drop_repeated_only_segments: bool,
}

/// Handle used by the orchestrator to enqueue jobs without blocking.
#[derive(Clone)]
pub struct AsrHandle {
    job_tx: mpsc::Sender<TranscribeJob>,
}

impl AsrHandle {
    /// Submit a job; drops it (and logs) if the bounded queue is full.
    pub fn submit(&self, job: TranscribeJob) {
        if let Err(e) = self.job_tx.try_send(job) {
            match e {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(job_id = %job.id, "dropping transcribe job - queue full");
                }
                mpsc::error::TrySendError::Closed(job) => {
                    warn!(job_id = %job.id, "dropping transcribe job - worker gone");
                }
            }
        }
    }
}

pub struct AsrWorker {
    job_rx: mpsc::Receiver<TranscribeJob>,
    result_tx: mpsc::UnboundedSender<TranscriptionResult>,
    fatal_tx: Option<oneshot::Sender<anyhow::Error>>,
    ctx: Arc<WhisperContext>,
    whisper_state: WhisperState,
    cfg: AsrConfig,
    prompt_cache: HashMap<String, Vec<c_int>>,
}

pub type ResultReceiver = mpsc::UnboundedReceiver<TranscriptionResult>;
pub type FatalReceiver = oneshot::Receiver<anyhow::Error>;

impl AsrWorker {
    /// Loads the model; callers should do this on a background executor
    /// (matching the original's lazy-load-on-executor contract) before
    /// spawning [`AsrWorker::run`].
    pub fn load(cfg: AsrConfig) -> Result<(Self, AsrHandle, ResultReceiver, FatalReceiver)> {
        let mut params = WhisperContextParameters::default();
        match cfg.device.as_str() {
            "cpu" => info!("loading whisper model on CPU (explicit)"),
            "cuda" | "metal" | "mps" => {
                info!(device = %cfg.device, "loading whisper model with GPU acceleration");
                params.use_gpu(true);
            }
            other => {
                // "auto", or an explicit preference this build has no backend
                // for: fall back to auto, which prefers CUDA, then Metal,
                // then CPU. whisper.cpp's own device probe at context-load
                // time silently drops to CPU when no accelerator is present,
                // so requesting GPU unconditionally here implements that
                // same preference order without duplicating the probe.
                if other != "auto" {
                    info!(requested = %other, "unrecognized device preference, falling back to auto");
                }
                params.use_gpu(true);
            }
        }
        let ctx = Arc::new(
            WhisperContext::new_with_params(&cfg.model_path, params)
                .with_context(|| format!("loading whisper model {}", cfg.model_path))?,
        );
        let whisper_state = ctx
            .create_state()
            .context("creating initial whisper state")?;

        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();

        let worker = AsrWorker {
            job_rx,
            result_tx,
            fatal_tx: Some(fatal_tx),
            ctx,
            whisper_state,
            cfg,
            prompt_cache: HashMap::new(),
        };
        Ok((worker, AsrHandle { job_tx }, result_rx, fatal_rx))
    }

    /// Drive the queue until it is closed (graceful `stop()`) or a job
    /// fails (fatal - the registered `on_fatal` channel fires and this
    /// task ends without processing further jobs).
    pub async fn run(mut self) {
        while let Some(job) = self.job_rx.recv().await {
            let job_id = job.id.clone();
            match self.process(job) {
                Ok(Some(result)) => {
                    let _ = self.result_tx.send(result);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "transcribe job failed");
                    if let Some(tx) = self.fatal_tx.take() {
                        let _ = tx.send(e);
                    }
                    return;
                }
            }
        }
    }

    fn process(&mut self, job: TranscribeJob) -> Result<Option<TranscriptionResult>> {
        if job.pcm16.is_empty() {
            anyhow::bail!("TranscribeJob.pcm16 is empty");
        }
        let audio_f32: Vec<f32> = job
            .pcm16
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect();
        if audio_f32.is_empty() {
            anyhow::bail!("decoded audio array is empty");
        }

        let prompt_tokens = match &job.prompt {
            Some(prompt) if !prompt.is_empty() => Some(self.tokenize_cached(prompt)?),
            _ => None,
        };
        let is_english_only = self.cfg.model_path.to_lowercase().ends_with(".en");

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        params.set_token_timestamps(true);
        params.set_no_context(false); // condition_on_prev_tokens
        params.set_translate(false); // task = transcribe
        params.set_temperature(0.0);
        params.set_temperature_inc(0.25); // native analogue of (0.0, 0.25, 0.5, 0.75) fallback
        params.set_logprob_thold(self.cfg.logprob_threshold);
        params.set_no_speech_thold(self.cfg.no_speech_threshold);
        params.set_entropy_thold(2.4); // closest native analogue to compression_ratio_threshold
        if !is_english_only {
            params.set_language(Some("en"));
        }
        if let Some(tokens) = &prompt_tokens {
            params.set_tokens(tokens);
        }

        self.whisper_state
            .full(params, &audio_f32)
            .context("whisper full() failed")?;

        let n_segments = self.whisper_state.full_n_segments();
        let mut text_parts = Vec::with_capacity(n_segments as usize);
        for i in 0..n_segments {
            if let Some(segment) = self.whisper_state.get_segment(i) {
                if let Ok(t) = segment.to_str_lossy() {
                    let t = t.trim();
                    if !t.is_empty() {
                        text_parts.push(t.to_string());
                    }
                }
            }
        }

        let text = text_parts.join(" ").trim().to_string();
        if text.is_empty() {
            return Ok(None);
        }

        let text = suppress_repetition(
            &text,
            self.cfg.max_single_word_repeats,
            self.cfg.drop_repeated_only_segments,
        );
        if text.is_empty() {
            debug!(job_id = %job.id, "segment suppressed as pure repetition");
            return Ok(None);
        }

        Ok(Some(TranscriptionResult { id: job.id, text }))
    }

    fn tokenize_cached(&mut self, prompt: &str) -> Result<Vec<c_int>> {
        if let Some(cached) = self.prompt_cache.get(prompt) {
            return Ok(cached.clone());
        }
        let tokens = self
            .ctx
            .tokenize(prompt, 224)
            .map_err(|e| anyhow!("tokenizing prompt: {e}"))?;
        self.prompt_cache.insert(prompt.to_string(), tokens.clone());
        Ok(tokens)
    }
}

/// Collapse single-token runs longer than `max_repeats`; if the whole
/// segment is one token repeated past the limit, drop it entirely when
/// `drop_only` is set (otherwise collapse to the single token).
pub fn suppress_repetition(text: &str, max_repeats: usize, drop_only: bool) -> String {
    if max_repeats == 0 {
        return text.to_string();
    }
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.is_empty() {
        return text.to_string();
    }
    let unique: HashSet<&str> = parts.iter().copied().collect();
    if unique.len() == 1 && parts.len() > max_repeats {
        return if drop_only {
            String::new()
        } else {
            (*unique.iter().next().unwrap()).to_string()
        };
    }
    let mut out = Vec::new();
    let mut last: Option<&str> = None;
    let mut run = 0usize;
    for w in parts {
        if Some(w) == last {
            run += 1;
        } else {
            last = Some(w);
            run = 1;
        }
        if run <= max_repeats {
            out.push(w);
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_past_capacity_drops_newest_without_panicking() {
        let (job_tx, mut job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = AsrHandle { job_tx };
        for i in 0..100 {
            handle.submit(TranscribeJob { id: format!("job-{i}"), pcm16: vec![0, 0], prompt: None });
        }
        // The bounded channel holds at most QUEUE_CAPACITY; every submit()
        // past that is a no-op drop rather than a panic or a block.
        let mut drained = 0;
        while job_rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= QUEUE_CAPACITY);
        assert!(drained > 0);
    }

    #[test]
    fn no_repetition_is_unchanged() {
        assert_eq!(suppress_repetition("hello there friend", 4, true), "hello there friend");
    }

    #[test]
    fn run_longer_than_limit_collapses_to_limit() {
        let text = "you you you you you you you";
        assert_eq!(suppress_repetition(text, 4, false), "you you you you");
    }

    #[test]
    fn all_one_token_over_limit_drops_when_drop_only() {
        let text = (0..20).map(|_| "you").collect::<Vec<_>>().join(" ");
        assert_eq!(suppress_repetition(&text, 4, true), "");
    }

    #[test]
    fn all_one_token_over_limit_collapses_when_not_drop_only() {
        let text = (0..20).map(|_| "you").collect::<Vec<_>>().join(" ");
        assert_eq!(suppress_repetition(&text, 4, false), "you");
    }

    #[test]
    fn mixed_runs_each_capped_independently() {
        let text = "a a a a a a b b b b b b c";
        assert_eq!(suppress_repetition(text, 2, true), "a a b b c");
    }

    #[test]
    fn zero_max_repeats_is_a_no_op() {
        let text = "a a a a a";
        assert_eq!(suppress_repetition(text, 0, true), text);
    }
}
