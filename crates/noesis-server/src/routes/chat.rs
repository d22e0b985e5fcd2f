//! Chat endpoint
//!
//! `POST /api/chat` streams the assistant's response as SSE (`data: {json}`
//! lines, terminated by `data: [DONE]`).
//!
//! Delivery is decoupled from generation: a background consumer drains the
//! provider stream into a bounded queue and always finishes persistence and
//! learning, even when the client disconnects mid-stream and the SSE
//! generator is dropped.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use noesis_core::{
    ChatMessage, ImageAttachment, LlmProvider, RequestContext, Role,
    inject_images_into_messages,
};

use crate::state::AppContext;

/// Queue capacity between the LLM consumer and the SSE generator. Small so
/// a slow client backpressures generation without unbounded buffering.
const STREAM_QUEUE_CAPACITY: usize = 64;

/// Extracted attachment text stored as a memory is capped here
const ATTACHMENT_MEMORY_CAP: usize = 8000;

/// Chat request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Requesting user
    pub user_id: String,
    /// Conversation to append to
    pub conversation_id: String,
    /// The user's message
    pub content: String,
    /// Image and document attachments
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

/// `POST /api/chat`
pub async fn send_message(
    State(app): State<AppContext>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<serde_json::Value>(STREAM_QUEUE_CAPACITY);

    let consumer = run_turn(app.clone(), request, tx.clone());
    app.runner.spawn("turn", consumer).await;

    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(payload) = rx.recv().await {
            if payload.is_null() {
                yield Ok(Event::default().data("[DONE]"));
                break;
            }
            yield Ok(Event::default().data(payload.to_string()));
        }
    };
    Sse::new(stream)
}

/// The whole turn, run as a tracked background task so client disconnects
/// never interrupt persistence or learning. Sends SSE payloads through the
/// bounded queue; a `Null` value terminates the stream.
async fn run_turn(app: AppContext, request: ChatRequest, tx: mpsc::Sender<serde_json::Value>) {
    let ctx = RequestContext::new(request.user_id.clone(), request.conversation_id.clone());

    let settings = app.settings.get(&ctx.user_id).unwrap_or_default();
    let Some(provider) = app.provider_for(&settings) else {
        let _ = tx
            .send(serde_json::json!({
                "content": "⚠️ **No LLM provider is configured.** Open Settings and enable a \
                            provider with a model before chatting."
            }))
            .await;
        let _ = tx.send(serde_json::Value::Null).await;
        return;
    };

    // Split attachments: images ride along to vision models, documents
    // become inline text + a persisted memory
    let (image_attachments, doc_attachments): (Vec<_>, Vec<_>) =
        request.images.iter().cloned().partition(|a| a.is_image());
    let mut content = request.content.clone();
    for doc in &doc_attachments {
        if let Some(text) = extract_attachment_text(doc) {
            content.push_str(&format!("\n\n📎 **Attached file: {}**\n\n{}", doc.filename, text));
            let memory_content = clip(
                &format!("User uploaded file: {}\n\n{}", doc.filename, text),
                ATTACHMENT_MEMORY_CAP,
            );
            if let Err(e) = app
                .memory
                .add_memory(&memory_content, &ctx.user_id, &ctx.conversation_id)
                .await
            {
                tracing::warn!("Failed to store attachment as memory: {e}");
            }
        }
    }

    // Persist the user message before anything can fail
    let mut user_msg = ChatMessage::new(&ctx, Role::User, content.clone());
    if !doc_attachments.is_empty() {
        user_msg.extracted_file_text = Some(clip(&content, ATTACHMENT_MEMORY_CAP));
    }
    if let Err(e) = app.messages.save(&user_msg) {
        tracing::error!("Failed to save user message: {e}");
    }

    // Assemble retrieval context
    let assembled = app
        .assembler
        .assemble(&ctx, &content, None, &settings, Some(provider.as_ref()))
        .await;

    // Provider misconfiguration surfaces before streaming begins
    if let Some(error) = assembled.preflight_error {
        let _ = tx.send(serde_json::json!({ "content": error })).await;
        let _ = tx.send(serde_json::Value::Null).await;
        return;
    }

    // Skill injection
    let mut messages = assembled.messages;
    let learning_state = app.voyager.before_llm(&mut messages);

    // Image attachments go into the last user message
    if !image_attachments.is_empty() {
        let supports_vision = model_supports_vision(provider.as_ref()).await;
        messages =
            inject_images_into_messages(messages, &image_attachments, supports_vision, provider.name());
    }

    // Transparency events ahead of the content stream
    if let Some(banner) = &assembled.continuity_banner {
        let _ = tx.send(serde_json::json!({ "content": banner })).await;
    }
    if assembled.context_metadata.as_object().is_some_and(|m| !m.is_empty()) {
        let _ = tx
            .send(serde_json::json!({ "context_metadata": assembled.context_metadata }))
            .await;
    }
    if !assembled.web_sources.is_empty() {
        let _ = tx
            .send(serde_json::json!({ "web_sources": assembled.web_sources }))
            .await;
    }

    // ── Stream the response ───────────────────────────────────
    let mut full_response = String::new();
    match provider
        .stream(&messages, provider.default_model(), 0.7, None)
        .await
    {
        Ok(mut chunks) => {
            while let Some(chunk) = chunks.recv().await {
                if !chunk.content.is_empty() {
                    full_response.push_str(&chunk.content);
                    let _ = tx.send(serde_json::json!({ "content": chunk.content })).await;
                }
                if chunk.is_done {
                    break;
                }
            }
        }
        Err(e) => {
            tracing::error!("Stream error: {e}");
            let _ = tx.send(serde_json::json!({ "error": e.to_string() })).await;
            let _ = tx.send(serde_json::Value::Null).await;
            return;
        }
    }

    // ── Post-stream: validation, markers, persistence ─────────
    if settings.optimization.response_validation {
        let combined = assembled.context_metadata.to_string();
        if let Some(note) = app
            .outlet
            .validate_response(&content, &full_response, &combined)
            .await
        {
            full_response.push_str(&note);
            let _ = tx.send(serde_json::json!({ "content": note })).await;
        }
    }

    let outcome = app
        .outlet
        .process_markers(&ctx, &full_response, assembled.web_search_active)
        .await;
    if !outcome.notifications.is_empty() {
        let _ = tx
            .send(serde_json::json!({ "notifications": outcome.notifications }))
            .await;
    }

    let message_id = app
        .outlet
        .save_assistant_message(&ctx, &outcome.cleaned_response)
        .unwrap_or_default();

    // ── Background learning ───────────────────────────────────
    app.outlet
        .spawn_learning(ctx.clone(), content.clone(), full_response.clone())
        .await;
    app.voyager
        .after_llm(
            full_response,
            learning_state,
            message_id,
            ctx.conversation_id.clone(),
            assembled.activity,
        )
        .await;

    let _ = tx.send(serde_json::json!({ "done": true })).await;
    let _ = tx.send(serde_json::Value::Null).await;
}

async fn model_supports_vision(provider: &dyn LlmProvider) -> bool {
    let model = provider.default_model().to_string();
    match tokio::time::timeout(Duration::from_secs(3), provider.list_models()).await {
        Ok(Ok(models)) => models
            .iter()
            .find(|m| m.id == model)
            .map(|m| m.supports_vision)
            .unwrap_or(false),
        _ => false,
    }
}

/// Decode a document attachment as UTF-8 text. Binary formats (PDF, DOCX)
/// need the external parsing service; plain text is handled inline.
fn extract_attachment_text(attachment: &ImageAttachment) -> Option<String> {
    use base64::Engine as _;
    if !attachment.content_type.starts_with("text/")
        && attachment.content_type != "application/json"
    {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&attachment.data_base64)
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let mut clipped = text;
    if clipped.len() > 4000 {
        let mut cut = 4000;
        while !clipped.is_char_boundary(cut) {
            cut -= 1;
        }
        clipped.truncate(cut);
        clipped.push_str("\n\n[Content truncated — file too long]");
    }
    Some(clipped)
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}
