//! Typed errors that map onto the wire protocol's `error` frame `code` field.

use thiserror::Error;

/// Error returned by request-handling paths; always recoverable at the
/// connection level (the caller emits an `error` frame and keeps serving).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload not valid JSON: {0}")]
    BadJson(String),
    #[error("invalid {kind}: {reason}")]
    BadRequest { kind: &'static str, reason: String },
    #[error("unsupported audio format: {0}")]
    BadAudioFormat(String),
    #[error("binary frames are not supported")]
    UnsupportedFrame,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("wrap-up API key is not configured")]
    MissingApiKey,
    #[error("wrap-up is not configured: {0}")]
    ServerConfig(String),
    #[error("wrap-up request failed: {0}")]
    LlmError(String),
}

impl WireError {
    pub fn code(&self) -> &'static str {
        match self {
            WireError::BadJson(_) => "bad_json",
            WireError::BadRequest { .. } => "bad_request",
            WireError::BadAudioFormat(_) => "bad_audio_format",
            WireError::UnsupportedFrame => "unsupported_frame",
            WireError::UnknownType(_) => "unknown_type",
            WireError::MissingApiKey => "missing_api_key",
            WireError::ServerConfig(_) => "server_config",
            WireError::LlmError(_) => "llm_error",
        }
    }
}

impl From<&WireError> for shared_protocol::ServerMessage {
    fn from(err: &WireError) -> Self {
        shared_protocol::ServerMessage::error(err.code(), err.to_string(), None)
    }
}
