//! OpenAI-compatible chat provider
//!
//! Covers the OpenAI API plus local servers speaking the same protocol
//! (LM Studio, Ollama's /v1 endpoint). Auth header is optional so local
//! servers work without credentials.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::{LlmError, LlmProvider, LlmResponse, ModelInfo, ProviderMessage, Result, StreamChunk, TokenUsage};

/// Channel capacity between the HTTP reader and the consumer. Small on
/// purpose: a stalled consumer backpressures the network read instead of
/// buffering the whole response.
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<UsagePayload>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: Option<u32>,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Models whose names advertise vision support. Matching is substring-based
/// so dated releases ("gpt-4o-2024-05-13") still register.
const VISION_MODEL_HINTS: &[&str] = &["gpt-4o", "gpt-4.1", "vision", "llava", "gemma-3", "qwen2-vl"];

/// OpenAI-compatible provider.
pub struct OpenAiCompatProvider {
    client: Client,
    name: String,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl OpenAiCompatProvider {
    /// Create a provider instance.
    ///
    /// `name` distinguishes cloud and local deployments of the same protocol
    /// (openai / lmstudio / ollama) for image formatting and preflight rules.
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            name: name.into(),
            api_key,
            base_url: base_url.into(),
            default_model: default_model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, url: &str, payload: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).json(payload);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    fn chat_payload(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> serde_json::Value {
        let mut payload = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if let Some(max) = max_tokens {
            payload["max_tokens"] = json!(max);
        }
        payload
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut builder = self.client.get(self.url("models"));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: clip(&body),
            });
        }
        let parsed: ModelsResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| {
                let supports_vision = VISION_MODEL_HINTS
                    .iter()
                    .any(|hint| entry.id.to_lowercase().contains(hint));
                ModelInfo {
                    name: entry.id.clone(),
                    id: entry.id,
                    context_length: None,
                    supports_vision,
                }
            })
            .collect())
    }

    async fn generate(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse> {
        let payload = self.chat_payload(messages, model, temperature, max_tokens, false);
        let response = self
            .request(&self.url("chat/completions"), &payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: clip(&body),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("no choices in response".into()))?;
        let content = choice
            .message
            .content
            .ok_or_else(|| LlmError::Parse("no content in response".into()))?;

        Ok(LlmResponse {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            provider: self.name.clone(),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens.unwrap_or(0),
                total_tokens: u.total_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let payload = self.chat_payload(messages, model, temperature, max_tokens, true);
        let response = self
            .request(&self.url("chat/completions"), &payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: clip(&body),
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("Stream transport error: {e}");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited `data: {...}` lines
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'read;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamPayload>(data) else {
                        continue;
                    };
                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && tx
                                    .send(StreamChunk {
                                        content,
                                        is_done: false,
                                        metadata: serde_json::Value::Null,
                                    })
                                    .await
                                    .is_err()
                            {
                                // Consumer dropped; stop reading
                                break 'read;
                            }
                        }
                        if choice.finish_reason.is_some() {
                            break 'read;
                        }
                    }
                }
            }
            let _ = tx
                .send(StreamChunk {
                    content: String::new(),
                    is_done: true,
                    metadata: serde_json::Value::Null,
                })
                .await;
        });

        Ok(rx)
    }

    async fn test_connection(&self) -> bool {
        match tokio::time::timeout(Duration::from_secs(5), self.list_models()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Connection test failed for {}: {}", self.name, e);
                false
            }
            Err(_) => false,
        }
    }
}

fn clip(body: &str) -> String {
    let mut cut = body.len().min(300);
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let provider = OpenAiCompatProvider::new(
            "lmstudio",
            None,
            "http://localhost:1234/v1",
            "local-model",
        );
        let messages = [ProviderMessage::text("user", "hi")];
        let payload = provider.chat_payload(&messages, "local-model", 0.7, Some(100), true);
        assert_eq!(payload["model"], "local-model");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["max_tokens"], 100);
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_url_join() {
        let provider =
            OpenAiCompatProvider::new("openai", None, "https://api.openai.com/v1/", "gpt-4o-mini");
        assert_eq!(
            provider.url("chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_vision_hint_detection() {
        let parsed: ModelsResponse = serde_json::from_str(
            r#"{"data": [{"id": "gpt-4o-2024-05-13"}, {"id": "text-embedding-3-small"}]}"#,
        )
        .unwrap();
        let hints: Vec<bool> = parsed
            .data
            .iter()
            .map(|m| VISION_MODEL_HINTS.iter().any(|h| m.id.contains(h)))
            .collect();
        assert_eq!(hints, vec![true, false]);
    }
}
