//! Scripted LLM provider
//!
//! Returns queued responses in order (falling back to a canned line), so
//! turns run without any network. Streaming splits the response into small
//! chunks through the same bounded-channel contract real providers use.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use noesis_core::{LlmProvider, LlmResponse, ModelInfo, ProviderMessage, StreamChunk};

/// Scripted provider for offline turns.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    /// Every prompt the provider saw, for assertions
    pub seen_prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Queue up responses, served in order.
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .expect("scripted responses lock")
            .pop_front()
            .unwrap_or_else(|| "Understood.".to_string())
    }

    fn record(&self, messages: &[ProviderMessage]) {
        let rendered = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content_text().unwrap_or("<blocks>")))
            .collect::<Vec<_>>()
            .join("\n");
        self.seen_prompts
            .lock()
            .expect("seen prompts lock")
            .push(rendered);
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn list_models(&self) -> noesis_core::llm::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "scripted-model".to_string(),
            name: "scripted-model".to_string(),
            context_length: Some(8192),
            supports_vision: false,
        }])
    }

    async fn generate(
        &self,
        messages: &[ProviderMessage],
        model: &str,
        _temperature: f32,
        _max_tokens: Option<u32>,
    ) -> noesis_core::llm::Result<LlmResponse> {
        self.record(messages);
        Ok(LlmResponse {
            content: self.next_response(),
            model: model.to_string(),
            provider: "scripted".to_string(),
            usage: None,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn stream(
        &self,
        messages: &[ProviderMessage],
        _model: &str,
        _temperature: f32,
        _max_tokens: Option<u32>,
    ) -> noesis_core::llm::Result<mpsc::Receiver<StreamChunk>> {
        self.record(messages);
        let response = self.next_response();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for piece in response.as_bytes().chunks(24) {
                let _ = tx
                    .send(StreamChunk {
                        content: String::from_utf8_lossy(piece).to_string(),
                        is_done: false,
                        metadata: serde_json::Value::Null,
                    })
                    .await;
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
        true
    }
}
