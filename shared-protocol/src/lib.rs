//! Wire schemas for the voice-capture and segmentation core.
//!
//! Every message carries a protocol version `v` (currently always 1).
//! Inbound: `audio.chunk`, `wrapup.request`. Outbound: `transcription`,
//! `wrapup.response`, `error`.
//!
//! Inbound messages are deserialized per-variant (not as one tagged enum)
//! so the orchestrator can distinguish an unrecognized `type` field
//! (`unknown_type`) from a recognized type with an invalid body
//! (`bad_request`) — a tagged enum would collapse both into one serde error.

use serde::{Deserialize, Serialize};

pub const PROTO_VERSION: u32 = 1;

/// Immutable PCM format descriptor carried on every `audio.chunk` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcmFormat {
    pub sr: u32,
    pub channels: u16,
    pub sample_width: u8,
}

impl PcmFormat {
    /// `rate > 0`, `channels >= 1`, `sample_width` in `{1, 2, 4}`.
    pub fn is_valid(&self) -> bool {
        self.sr > 0 && self.channels >= 1 && matches!(self.sample_width, 1 | 2 | 4)
    }
}

/// One entry of a wrap-up request's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_name: String,
    pub start_ts: f64,
    pub end_ts: f64,
    pub text: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioChunkMessage {
    pub v: u32,
    pub user_id: String,
    pub index: i64,
    pub pcm_format: PcmFormat,
    pub started_ts: f64,
    pub capture_ts: f64,
    pub data_b64: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WrapupRequestMessage {
    pub v: u32,
    pub session_name: String,
    pub log_entries: Vec<LogEntry>,
    pub request_id: String,
}

/// Known inbound `type` field values.
pub const TYPE_AUDIO_CHUNK: &str = "audio.chunk";
pub const TYPE_WRAPUP_REQUEST: &str = "wrapup.request";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "transcription")]
    Transcription {
        v: u32,
        user_id: String,
        text: String,
        capture_ts: f64,
        end_ts: f64,
    },
    #[serde(rename = "wrapup.response")]
    WrapupResponse {
        v: u32,
        outline: String,
        request_id: String,
    },
    #[serde(rename = "error")]
    Error {
        v: u32,
        code: String,
        message: String,
        details: Option<String>,
    },
}

impl ServerMessage {
    pub fn transcription(
        user_id: impl Into<String>,
        text: impl Into<String>,
        capture_ts: f64,
        end_ts: f64,
    ) -> Self {
        ServerMessage::Transcription {
            v: PROTO_VERSION,
            user_id: user_id.into(),
            text: text.into(),
            capture_ts,
            end_ts,
        }
    }

    pub fn wrapup_response(outline: impl Into<String>, request_id: impl Into<String>) -> Self {
        ServerMessage::WrapupResponse {
            v: PROTO_VERSION,
            outline: outline.into(),
            request_id: request_id.into(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, details: Option<String>) -> Self {
        ServerMessage::Error {
            v: PROTO_VERSION,
            code: code.into(),
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_format_validation() {
        assert!(PcmFormat { sr: 16000, channels: 1, sample_width: 2 }.is_valid());
        assert!(!PcmFormat { sr: 0, channels: 1, sample_width: 2 }.is_valid());
        assert!(!PcmFormat { sr: 16000, channels: 0, sample_width: 2 }.is_valid());
        assert!(!PcmFormat { sr: 16000, channels: 1, sample_width: 3 }.is_valid());
    }

    #[test]
    fn audio_chunk_parses_from_json() {
        let json = r#"{
            "v": 1, "type": "audio.chunk", "user_id": "u1", "index": 0,
            "pcm_format": {"sr": 48000, "channels": 2, "sample_width": 2},
            "started_ts": 0.0, "capture_ts": 0.5, "data_b64": "AAA=", "prompt": null
        }"#;
        let msg: AudioChunkMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.pcm_format.sr, 48000);
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let json = r#"{"v":1,"type":"audio.chunk","user_id":"u1"}"#;
        assert!(serde_json::from_str::<AudioChunkMessage>(json).is_err());
    }

    #[test]
    fn outbound_transcription_serializes_with_type_tag() {
        let msg = ServerMessage::transcription("u1", "hello", 1.0, 2.5);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "transcription");
        assert_eq!(v["user_id"], "u1");
        assert_eq!(v["v"], 1);
    }
}
