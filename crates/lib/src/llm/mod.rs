//! LLM abstraction and the Gemini client.
//!
//! The consultant talks to one hosted model per turn through [`LlmBackend`];
//! the production implementation is [`GeminiClient`].

mod gemini;

pub use gemini::{GeminiClient, DEFAULT_MODEL};

use async_trait::async_trait;

/// One message of chat context sent to the backend.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model api error: {0}")]
    Api(String),
}

/// Whether a failure is the quota/rate-limit kind worth retrying. The Gemini
/// error body carries the HTTP 429 status and/or a RESOURCE_EXHAUSTED status
/// string; anything else is terminal.
pub fn is_quota_error(err: &LlmError) -> bool {
    let s = err.to_string();
    s.contains("429") || s.contains("RESOURCE_EXHAUSTED")
}

/// A chat backend the consultant can drive (implemented by [`GeminiClient`]
/// and by test fakes).
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send one user turn with a bounded trailing history; returns the raw
    /// assistant text, envelope block included.
    async fn send_turn(
        &self,
        api_key: &str,
        system_instruction: &str,
        history: &[ChatMessage],
        text: &str,
    ) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_recognized_by_marker() {
        assert!(is_quota_error(&LlmError::Api(
            "429 Too Many Requests {\"error\":{\"status\":\"RESOURCE_EXHAUSTED\"}}".to_string()
        )));
        assert!(is_quota_error(&LlmError::Api(
            "RESOURCE_EXHAUSTED: quota exceeded".to_string()
        )));
        assert!(!is_quota_error(&LlmError::Api(
            "400 Bad Request invalid argument".to_string()
        )));
        assert!(!is_quota_error(&LlmError::Api(
            "403 Forbidden API key not valid".to_string()
        )));
    }
}
