//! Wrap-up delegation: format a session's log entries into a transcript and
//! hand it to an external summary generator.

use async_trait::async_trait;
use shared_protocol::LogEntry;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WrapupError {
    #[error("wrap-up API key is not configured")]
    MissingApiKey,
    #[error("wrap-up is not configured: {0}")]
    ServerConfig(String),
    #[error("wrap-up request failed: {0}")]
    LlmError(String),
}

/// Plain-text transcript, one line per log entry, `HH:MM:SS speaker: text`.
pub fn format_transcript(log_entries: &[LogEntry], session_name: &str) -> String {
    let mut lines = vec![format!("# Transcript for session: {session_name}\n")];
    for entry in log_entries {
        let ts = format_hms(entry.start_ts);
        lines.push(format!("[{ts}] {}: {}", entry.user_name, entry.text));
    }
    lines.join("\n")
}

fn format_hms(unix_ts: f64) -> String {
    let total_secs = unix_ts.rem_euclid(86400.0) as u64;
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// The actual LLM vendor is an external collaborator; only this interface
/// is specified.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn summarize(&self, transcript: &str, tips: &[String]) -> Result<String, WrapupError>;
}

pub struct HttpSummaryGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    prompt: String,
}

impl HttpSummaryGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            max_output_tokens,
            prompt: prompt.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct SummaryRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    transcript: &'a str,
    tips: &'a [String],
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(serde::Deserialize)]
struct SummaryResponse {
    outline: String,
}

#[async_trait]
impl SummaryGenerator for HttpSummaryGenerator {
    async fn summarize(&self, transcript: &str, tips: &[String]) -> Result<String, WrapupError> {
        let body = SummaryRequest {
            model: &self.model,
            prompt: &self.prompt,
            transcript,
            tips,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WrapupError::LlmError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WrapupError::LlmError(format!(
                "upstream returned {}",
                resp.status()
            )));
        }

        let parsed: SummaryResponse = resp
            .json()
            .await
            .map_err(|e| WrapupError::LlmError(format!("decoding response: {e}")))?;
        Ok(parsed.outline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, ts: f64, text: &str) -> LogEntry {
        LogEntry {
            user_name: user.to_string(),
            start_ts: ts,
            end_ts: ts + 1.0,
            text: text.to_string(),
            user_id: format!("id-{user}"),
        }
    }

    #[test]
    fn transcript_includes_session_name_and_entries_in_order() {
        let entries = vec![entry("alice", 3661.0, "hello"), entry("bob", 3662.0, "hi back")];
        let out = format_transcript(&entries, "standup");
        assert!(out.contains("Transcript for session: standup"));
        let alice_pos = out.find("alice").unwrap();
        let bob_pos = out.find("bob").unwrap();
        assert!(alice_pos < bob_pos);
        assert!(out.contains("hello"));
    }

    #[test]
    fn empty_log_produces_only_the_header() {
        let out = format_transcript(&[], "empty-session");
        assert_eq!(out, "# Transcript for session: empty-session\n");
    }
}
