//! LLM Provider layer
//!
//! Abstracts chat-completion backends to `generate` / `stream` plus model
//! discovery. The engine only ever talks to [`LlmProvider`]; concrete
//! providers live alongside (OpenAI-compatible covers OpenAI, LM Studio,
//! and Ollama's compat endpoint).

mod openai;
pub mod prompt;

pub use openai::OpenAiCompatProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// LLM error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-2xx API response
    #[error("API error ({status}): {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
    /// Unparsable response payload
    #[error("Parse error: {0}")]
    Parse(String),
    /// Call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// LLM result type
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// MESSAGE & RESPONSE TYPES
// ============================================================================

/// A message in provider wire shape.
///
/// `content` is either a plain string or a multimodal content-part array;
/// `images` is the sibling base64 array Ollama expects instead of content
/// parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    /// user / assistant / system
    pub role: String,
    /// String or content-part array
    pub content: serde_json::Value,
    /// Ollama-style raw base64 image array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ProviderMessage {
    /// Plain-text message.
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: serde_json::Value::String(content.into()),
            images: None,
        }
    }

    /// The textual content, when `content` is a plain string.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Complete (non-streaming) response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Provider name
    pub provider: String,
    /// Token usage, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// stop / length / ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token accounting from the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

/// One chunk of a streamed response.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Text delta (may be empty on the final chunk)
    pub content: String,
    /// True on the last chunk
    pub is_done: bool,
    /// Provider-specific extras
    pub metadata: serde_json::Value,
}

/// An available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Context window, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    /// Whether the model accepts images
    #[serde(default)]
    pub supports_vision: bool,
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (openai, lmstudio, ollama, anthropic, ...)
    fn name(&self) -> &str;

    /// Model used when the caller has no preference.
    fn default_model(&self) -> &str;

    /// List available models.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Generate a complete response.
    async fn generate(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse>;

    /// Stream a response. The receiver yields chunks until one with
    /// `is_done = true`; the sender side is bounded so a slow consumer
    /// backpressures the HTTP read.
    async fn stream(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<StreamChunk>>;

    /// True when the backend is reachable with the configured credentials.
    async fn test_connection(&self) -> bool;

    /// One-shot prompt helper with a hard deadline. Every internal LLM use
    /// (enrichment, evaluation, reflection, extraction) goes through this so
    /// a slow model can never stall a turn.
    async fn complete(&self, prompt: &str, max_tokens: u32, deadline: Duration) -> Result<String> {
        let messages = [ProviderMessage::text("user", prompt)];
        let fut = self.generate(&messages, self.default_model(), 0.2, Some(max_tokens));
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result.map(|r| r.content),
            Err(_) => Err(LlmError::Timeout(deadline)),
        }
    }
}

// ============================================================================
// JSON EXTRACTION
// ============================================================================

/// Extract the first balanced JSON object from free text.
///
/// Models wrap JSON in prose and code fences; a non-greedy regex breaks on
/// nested objects. This walks from the first `{` with a bracket counter that
/// respects strings and escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the first balanced JSON object in free text into a value.
pub fn parse_json_from_text(text: &str) -> Option<serde_json::Value> {
    serde_json::from_str(extract_json_object(text)?).ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"Sure! Here you go:
```json
{"score": 4, "details": {"nested": "value with } brace"}}
```
Hope that helps."#;
        let json = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["score"], 4);
        assert_eq!(value["details"]["nested"], "value with } brace");
    }

    #[test]
    fn test_extract_json_object_escapes() {
        let text = r#"{"text": "quote \" and brace { inside"}"#;
        let json = extract_json_object(text).unwrap();
        assert_eq!(json, text);
    }

    #[test]
    fn test_extract_json_object_missing() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{unterminated").is_none());
    }

    #[test]
    fn test_parse_json_from_text() {
        let value = parse_json_from_text("prefix {\"a\": 1} suffix").unwrap();
        assert_eq!(value["a"], 1);
        assert!(parse_json_from_text("{broken").is_none());
    }

    #[test]
    fn test_provider_message_text() {
        let msg = ProviderMessage::text("user", "hello");
        assert_eq!(msg.content_text(), Some("hello"));
        assert_eq!(msg.role, "user");
    }
}
