//! System-prompt assembly
//!
//! Builds the final message list from categorized retrieval context under a
//! token budget, split into a stable prefix and dynamic suffix around the
//! cache-break sentinel so providers with prefix caching can mark the stable
//! half.
//!
//! Section ordering follows "Lost in the Middle" placement: highest-signal
//! context first, lower-signal toward the middle.

use base64::Engine as _;
use chrono::{DateTime, Utc};

use super::ProviderMessage;
use crate::context::ImageAttachment;

/// Sentinel splitting the cached prefix from the dynamic suffix.
///
/// Providers that support prefix caching split on it and mark the prefix;
/// everyone else passes it through as an invisible HTML comment.
pub const CACHE_BREAK: &str = "\n<!-- CACHE_BREAK -->\n";

/// Default budget for all injected dynamic context (tokens).
pub const DEFAULT_CONTEXT_BUDGET: usize = 8000;

/// Dedicated web-search budget, separate from the general budget so web
/// results never starve memories or graph context.
pub const WEB_SEARCH_MAX_BUDGET: usize = 4000;

/// ~4 chars/token is a safe heuristic across models and avoids a tokenizer
/// dependency while staying close enough for budget decisions.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Truncate text to a token budget, cutting at the last newline before the
/// limit to avoid mid-sentence breaks.
pub fn truncate_to_budget(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut boundary = max_chars;
    while !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let mut truncated = &text[..boundary];
    if let Some(last_nl) = truncated.rfind('\n') {
        if last_nl > max_chars / 2 {
            truncated = &truncated[..last_nl];
        }
    }
    format!("{}\n[...truncated to fit context budget]", truncated)
}

/// A past-conversation hit rendered into the history section.
#[derive(Debug, Clone)]
pub struct HistorySnippet {
    /// Message text
    pub content: String,
    /// RFC3339 timestamp
    pub timestamp: String,
    /// user / assistant
    pub role: String,
    /// Title of the source conversation
    pub conversation_title: String,
}

/// Categorized retrieval context for one turn.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Persona / base system prompt (never truncated)
    pub system_prompt: Option<String>,
    /// Hybrid search hits from past conversations
    pub search_results: Vec<HistorySnippet>,
    /// Manual memories
    pub memories: Vec<String>,
    /// Autonomous memories
    pub auto_memories: Vec<String>,
    /// Formatted web search results
    pub web_search_context: Option<String>,
    /// Pre-formatted notes block
    pub notes_context: Option<String>,
    /// Pre-formatted document (RAG) chunks
    pub rag_context: Option<String>,
    /// Pre-formatted knowledge graph context
    pub graph_context: Option<String>,
    /// Intent-based live data (email, schedule, budget)
    pub live_data_context: Option<String>,
    /// Token budget for dynamic context (0 = default)
    pub context_budget: usize,
    /// Whether a web search backend is configured at all
    pub has_web_search: bool,
}

impl PromptContext {
    fn budget(&self) -> usize {
        if self.context_budget == 0 {
            DEFAULT_CONTEXT_BUDGET
        } else {
            self.context_budget
        }
    }
}

/// Format conversation messages with budget-aware, structurally separated
/// context. Returns a fresh message list with one system message followed by
/// the non-system conversation history.
pub fn format_messages_with_context(
    messages: &[ProviderMessage],
    ctx: &PromptContext,
) -> Vec<ProviderMessage> {
    // ── 1. Stable prefix: persona + always-on capability instructions ──
    let mut stable_parts: Vec<String> = Vec::new();
    if let Some(persona) = &ctx.system_prompt {
        stable_parts.push(persona.clone());
    }
    stable_parts.push(capability_instructions(ctx.has_web_search));

    // ── 2. Dynamic suffix: date/time + retrieval context ──
    let mut dynamic_parts: Vec<String> = Vec::new();
    dynamic_parts.push(current_time_block(Utc::now()));

    // ── 3. Context sections in priority order ──
    let mut sections: Vec<(&'static str, String, u8)> = Vec::new();

    if let Some(live) = &ctx.live_data_context {
        sections.push(("live_data", live.clone(), 2));
    }
    if let Some(notes) = &ctx.notes_context {
        sections.push((
            "notes",
            format!("## Reference: User's Notes\n{}", notes),
            2,
        ));
    }
    if let Some(rag) = &ctx.rag_context {
        sections.push((
            "documents",
            format!("## Reference: Uploaded Documents\n{}", rag),
            3,
        ));
    }
    if !ctx.search_results.is_empty() {
        sections.push(("history_search", history_section(&ctx.search_results), 3));
    }
    let memory_lines: Vec<String> = ctx
        .memories
        .iter()
        .chain(ctx.auto_memories.iter())
        .map(|m| format!("- {}", m))
        .collect();
    if !memory_lines.is_empty() {
        sections.push((
            "memories",
            format!(
                "## User Profile & Knowledge\n\
                 These are facts learned from past conversations. Use them to personalize \
                 your responses, but NEVER tell the user 'you mentioned this before' unless \
                 the current conversation history explicitly shows it. Memories are \
                 background context, not conversation history.\n{}",
                memory_lines.join("\n")
            ),
            4,
        ));
    }
    if let Some(graph) = &ctx.graph_context {
        sections.push(("graph", graph.clone(), 5));
    }
    sections.sort_by_key(|(_, _, priority)| *priority);

    // ── 4. Budget-aware assembly ──
    // Web search first, against its own dedicated budget.
    let mut injected_web = false;
    if let Some(web) = &ctx.web_search_context {
        let tokens = estimate_tokens(web);
        if tokens <= WEB_SEARCH_MAX_BUDGET {
            dynamic_parts.push(web.clone());
        } else {
            dynamic_parts.push(truncate_to_budget(web, WEB_SEARCH_MAX_BUDGET));
        }
        injected_web = true;
    }

    let mut remaining = ctx.budget();
    for (_label, content, _priority) in &sections {
        let tokens = estimate_tokens(content);
        if tokens <= remaining {
            dynamic_parts.push(content.clone());
            remaining -= tokens;
        } else if remaining > 200 {
            dynamic_parts.push(truncate_to_budget(content, remaining));
            break;
        } else {
            break;
        }
    }

    // ── 4b. Citation instructions, only when web results are present ──
    if injected_web {
        dynamic_parts.push(WEB_CITATION_INSTRUCTIONS.to_string());
    }

    // ── 5. Final system prompt: [stable] CACHE_BREAK [dynamic] ──
    let stable_text = stable_parts.join("\n\n");
    let dynamic_text = dynamic_parts.join("\n\n");
    let final_system = if !stable_text.is_empty() && !dynamic_text.is_empty() {
        format!("{}{}{}", stable_text, CACHE_BREAK, dynamic_text)
    } else if !stable_text.is_empty() {
        stable_text
    } else {
        dynamic_text
    };

    let mut formatted = Vec::with_capacity(messages.len() + 1);
    if !final_system.is_empty() {
        formatted.push(ProviderMessage::text("system", final_system));
    }
    for msg in messages {
        if msg.role != "system" {
            formatted.push(msg.clone());
        }
    }
    formatted
}

fn capability_instructions(has_web_search: bool) -> String {
    let mut parts = vec![
        "## Your Capabilities\n\
         You are Noesis — the user's personal AI assistant with a persistent \
         knowledge base."
            .to_string(),
    ];

    if has_web_search {
        parts.push(
            "### Web Search\n\
             You have web search capability. It is triggered automatically when the \
             system detects the user wants current information. Never tell the user \
             you cannot search the web — you can."
                .to_string(),
        );
    }

    parts.push(
        "### Notes System\n\
         You can create notes by including this marker in your response (it will be \
         hidden from the user):\n\
         ```\n\
         [SAVE_NOTE: Title]\n\
         Content in markdown.\n\
         [/SAVE_NOTE]\n\
         ```\n\
         Confirm saves naturally (e.g. \"Done, saved.\")."
            .to_string(),
    );

    parts.push(
        "### Shared Schedule / Calendar\n\
         You can add events to the calendar:\n\
         ```\n\
         [ADD_SCHEDULE: Event Title | 2026-02-15 14:00]\n\
         Optional description.\n\
         [/ADD_SCHEDULE]\n\
         ```\n\
         Use the current date/time from the system prompt to resolve relative times \
         ('tomorrow at 3pm' becomes the actual date). These markers are hidden from \
         the user."
            .to_string(),
    );

    parts.push(
        "### Email\n\
         You can READ and SEND email. When the user asks about their inbox, results \
         are injected into your context below — never claim you cannot access email.\n\
         Send immediately:\n\
         ```\n\
         [SEND_EMAIL: Subject Line | recipient@example.com]\n\
         Email body in plain text.\n\
         [/SEND_EMAIL]\n\
         ```\n\
         (omit the recipient to send to the user themselves). Schedule for later:\n\
         ```\n\
         [SCHEDULE_EMAIL: Subject Line | 2026-02-08 15:00]\n\
         Email body in plain text.\n\
         [/SCHEDULE_EMAIL]\n\
         ```\n\
         The datetime can be ISO, relative ('in 2 hours'), or natural ('tomorrow at \
         3pm'). Search the inbox with [SEARCH_EMAIL: query]\\n[/SEARCH_EMAIL]."
            .to_string(),
    );

    parts.push(
        "### Budget Tracking\n\
         When the user mentions spending money, log it:\n\
         ```\n\
         [ADD_EXPENSE: 5.00 | food]\n\
         Lunch at cafe\n\
         [/ADD_EXPENSE]\n\
         ```\n\
         Categories are lowercase freeform. The marker is hidden from the user; \
         confirm naturally."
            .to_string(),
    );

    parts.join("\n\n")
}

fn current_time_block(now: DateTime<Utc>) -> String {
    format!(
        "## Current Date & Time\n\
         **Now:** {}, {} at {} (UTC)\n\
         **ISO date:** {} | **Week:** {}\n\n\
         Messages in this conversation have timestamps. Ground every relative time \
         reference ('yesterday', 'in 2 minutes') against the current date and time \
         above.",
        now.format("%A"),
        now.format("%B %d, %Y"),
        now.format("%I:%M %p"),
        now.format("%Y-%m-%d"),
        now.format("%V"),
    )
}

fn history_section(hits: &[HistorySnippet]) -> String {
    let mut lines = vec![
        "## Relevant Past Conversations".to_string(),
        "These are messages from OTHER conversations that may provide useful context. \
         Do NOT tell the user 'you asked this before' — use this context silently and \
         respond as if this is a new question."
            .to_string(),
    ];
    let mut current_title: Option<&str> = None;
    for hit in hits.iter().take(10) {
        let mut content = hit.content.clone();
        if content.len() > 500 {
            let mut cut = 500;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("...");
        }
        if !hit.conversation_title.is_empty() && current_title != Some(hit.conversation_title.as_str())
        {
            lines.push(format!("\n**Conversation: {}**", hit.conversation_title));
            current_title = Some(hit.conversation_title.as_str());
        }
        let role_label = if hit.role == "user" { "User" } else { "Assistant" };
        lines.push(format!("  [{}] {}: {}", hit.timestamp, role_label, content));
    }
    lines.join("\n")
}

const WEB_CITATION_INSTRUCTIONS: &str = "## Web Search Citation Instructions\n\
The section above contains LIVE web search results. Each source is numbered [1], [2], etc.\n\
- Lead with the answer, then support with evidence.\n\
- Cite with numbers like [1] or [1][3] after claims.\n\
- Synthesize across sources; extract specific numbers, names, and dates.\n\
- Note conflicts between sources and say which seems more reliable.\n\
- List the most useful source URLs at the end of your response.";

// ============================================================================
// IMAGE INJECTION
// ============================================================================

/// Inject image attachments into the last user message.
///
/// Three provider formats: OpenAI-style `image_url` data URIs (also LM
/// Studio), Anthropic `source` blocks with base64 + media_type, and Ollama's
/// sibling `images` array of raw base64 strings. Models without vision get a
/// plain-text note appended instead.
pub fn inject_images_into_messages(
    mut messages: Vec<ProviderMessage>,
    images: &[ImageAttachment],
    supports_vision: bool,
    provider_name: &str,
) -> Vec<ProviderMessage> {
    if images.is_empty() {
        return messages;
    }

    let Some(last_user_idx) = messages.iter().rposition(|m| m.role == "user") else {
        return messages;
    };

    let text_content = messages[last_user_idx]
        .content_text()
        .unwrap_or_default()
        .to_string();

    if !supports_vision {
        let names: Vec<&str> = images.iter().map(|img| img.filename.as_str()).collect();
        messages[last_user_idx] = ProviderMessage::text(
            "user",
            format!(
                "{}\n\n[User attached image(s): {}. This model does not support image input.]",
                text_content,
                names.join(", ")
            ),
        );
        return messages;
    }

    // Validate payloads up front; skip anything that isn't real base64
    let valid: Vec<&ImageAttachment> = images
        .iter()
        .filter(|img| {
            base64::engine::general_purpose::STANDARD
                .decode(&img.data_base64)
                .is_ok()
        })
        .collect();

    if provider_name == "ollama" {
        let b64: Vec<String> = valid.iter().map(|img| img.data_base64.clone()).collect();
        messages[last_user_idx] = ProviderMessage {
            role: "user".to_string(),
            content: serde_json::Value::String(text_content),
            images: Some(b64),
        };
        return messages;
    }

    let mut parts = vec![serde_json::json!({"type": "text", "text": text_content})];
    for img in valid {
        if provider_name == "anthropic" {
            parts.push(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": img.content_type,
                    "data": img.data_base64,
                },
            }));
        } else {
            parts.push(serde_json::json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", img.content_type, img.data_base64),
                },
            }));
        }
    }
    messages[last_user_idx] = ProviderMessage {
        role: "user".to_string(),
        content: serde_json::Value::Array(parts),
        images: None,
    };
    messages
}

// ============================================================================
// TESTS
// ============================================================================
