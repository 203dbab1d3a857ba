//! Gemini API client (generativelanguage.googleapis.com).
//! Non-streaming generateContent only; the envelope parser needs the full reply.

use crate::llm::{ChatMessage, LlmBackend, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

const TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.8;

/// Client for the Gemini generateContent API.
#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// POST /v1beta/models/{model}:generateContent — one completion.
    async fn generate(
        &self,
        api_key: &str,
        system_instruction: &str,
        contents: Vec<Content>,
    ) -> Result<String, LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = GenerateContentRequest {
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_instruction.to_string(),
                }],
            },
            contents,
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                top_p: TOP_P,
            },
        };
        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        let data: GenerateContentResponse = res.json().await?;
        data.first_text()
            .ok_or_else(|| LlmError::Api("empty response (no candidates)".to_string()))
    }
}

#[async_trait]
impl LlmBackend for GeminiClient {
    async fn send_turn(
        &self,
        api_key: &str,
        system_instruction: &str,
        history: &[ChatMessage],
        text: &str,
    ) -> Result<String, LlmError> {
        let mut contents: Vec<Content> = history.iter().map(Content::from_message).collect();
        contents.push(Content {
            role: "user".to_string(),
            parts: vec![Part {
                text: text.to_string(),
            }],
        });
        self.generate(api_key, system_instruction, contents).await
    }
}

// Wire types for v1beta generateContent.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: SystemInstruction,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    /// Gemini names the assistant role "model" on the wire.
    fn from_message(m: &ChatMessage) -> Self {
        let role = if m.role == "assistant" {
            "model".to_string()
        } else {
            m.role.clone()
        };
        Self {
            role,
            parts: vec![Part {
                text: m.content.clone(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate, when non-empty.
    fn first_text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content.parts.iter().map(|p| p.text.as_str()).collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_role_maps_to_model() {
        let content = Content::from_message(&ChatMessage::assistant("olá"));
        assert_eq!(content.role, "model");
        let content = Content::from_message(&ChatMessage::user("oi"));
        assert_eq!(content.role, "user");
    }

    #[test]
    fn response_text_is_joined_from_parts() {
        let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Olá"},{"text":", tudo bem?"}]}}]}"#;
        let res: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(res.first_text().as_deref(), Some("Olá, tudo bem?"));
    }

    #[test]
    fn empty_candidates_yield_none() {
        let res: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(res.first_text().is_none());
    }
}
