//! Functional knobs from an optional `config.toml`, secrets from environment.
//!
//! Mirrors the split the original Python config module draws: every
//! threshold and model name below has a default and can be overridden by a
//! config file; only the wrap-up API key ever comes from the environment.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_whisper_model() -> String {
    "openai/whisper-small.en".to_string()
}
fn default_logprob_threshold() -> f32 {
    -1.0
}
fn default_no_speech_threshold() -> f32 {
    0.2
}
fn default_max_single_word_repeats() -> usize {
    4
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperCfg {
    pub model: String,
    pub logprob_threshold: f32,
    pub no_speech_threshold: f32,
    pub prompt: String,
    pub max_single_word_repeats: usize,
    pub drop_repeated_only_segments: bool,
}

impl Default for WhisperCfg {
    fn default() -> Self {
        Self {
            model: default_whisper_model(),
            logprob_threshold: default_logprob_threshold(),
            no_speech_threshold: default_no_speech_threshold(),
            prompt: String::new(),
            max_single_word_repeats: default_max_single_word_repeats(),
            drop_repeated_only_segments: true,
        }
    }
}

fn default_silence_threshold_seconds() -> f32 {
    1.25
}
fn default_vad_threshold() -> f32 {
    0.75
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceCfg {
    pub silence_threshold_seconds: f32,
    pub vad_threshold: f32,
    /// 0 means "use the default" (60 s), matching the original's sentinel.
    pub max_speech_buf_seconds: u32,
}

impl Default for VoiceCfg {
    fn default() -> Self {
        Self {
            silence_threshold_seconds: default_silence_threshold_seconds(),
            vad_threshold: default_vad_threshold(),
            max_speech_buf_seconds: 0,
        }
    }
}

impl VoiceCfg {
    pub fn max_segment_s(&self) -> f32 {
        if self.max_speech_buf_seconds == 0 {
            60.0
        } else {
            self.max_speech_buf_seconds as f32
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8771
}
fn default_chunk_ms() -> u32 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetCfg {
    pub host: String,
    pub port: u16,
    pub ai_service_url: String,
    pub chunk_ms: u32,
}

impl Default for NetCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ai_service_url: format!("ws://{}:{}", default_host(), default_port()),
            chunk_ms: default_chunk_ms(),
        }
    }
}

fn default_wrapup_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_wrapup_temperature() -> f32 {
    0.05
}
fn default_wrapup_max_tokens() -> u32 {
    10240
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WrapupCfg {
    pub model: String,
    pub tips: Vec<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for WrapupCfg {
    fn default() -> Self {
        Self {
            model: default_wrapup_model(),
            tips: Vec::new(),
            prompt: String::new(),
            temperature: default_wrapup_temperature(),
            max_output_tokens: default_wrapup_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConfigFile {
    net: NetCfg,
    whisper: WhisperCfg,
    voice: VoiceCfg,
    wrapup: WrapupCfg,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub net: NetCfg,
    pub whisper: WhisperCfg,
    pub voice: VoiceCfg,
    pub wrapup: WrapupCfg,
    pub device: String,
    pub wrapup_api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            net: NetCfg::default(),
            whisper: WhisperCfg::default(),
            voice: VoiceCfg::default(),
            wrapup: WrapupCfg::default(),
            device: "auto".to_string(),
            wrapup_api_key: None,
        }
    }
}

/// Load `config.toml` from `path` if present, falling back to every default;
/// fill in the wrap-up secret and device preference from the environment.
pub fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    let raw: RawConfigFile = match path {
        Some(p) if p.exists() => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading config file {}", p.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", p.display()))?
        }
        _ => RawConfigFile::default(),
    };

    Ok(AppConfig {
        net: raw.net,
        whisper: raw.whisper,
        voice: raw.voice,
        wrapup: raw.wrapup,
        device: std::env::var("DEVICE").unwrap_or_else(|_| "auto".to_string()),
        wrapup_api_key: std::env::var("WRAPUP_API_KEY").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_enumerated_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.whisper.model, "openai/whisper-small.en");
        assert_eq!(cfg.whisper.logprob_threshold, -1.0);
        assert_eq!(cfg.whisper.no_speech_threshold, 0.2);
        assert_eq!(cfg.whisper.max_single_word_repeats, 4);
        assert!(cfg.whisper.drop_repeated_only_segments);
        assert_eq!(cfg.voice.silence_threshold_seconds, 1.25);
        assert_eq!(cfg.voice.vad_threshold, 0.75);
        assert_eq!(cfg.voice.max_segment_s(), 60.0);
        assert_eq!(cfg.net.chunk_ms, 1000);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = load_app_config(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(cfg.net.port, 8771);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("speechd-test-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[voice]\nvad_threshold = 0.5\n").unwrap();
        let cfg = load_app_config(Some(&path)).unwrap();
        assert_eq!(cfg.voice.vad_threshold, 0.5);
        assert_eq!(cfg.voice.silence_threshold_seconds, 1.25);
        std::fs::remove_file(&path).ok();
    }
}
