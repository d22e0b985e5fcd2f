//! Parallel Context Assembler
//!
//! One turn's retrieval: the planner decides which stores to consult, every
//! independent source fires in a single parallel bundle, and the results
//! compose into a budget-capped prompt with a cache-break split. A second,
//! sequential phase runs web search (it needs the fetched history for
//! reformulation) and conversation-continuity detection (it reuses the
//! Phase-1 search hits).
//!
//! Every source catches internally and returns empty on error — assembly
//! never fails a turn. Store-bound work runs on the blocking pool so the
//! event loop stays clear.

mod preflight;

pub use preflight::PreflightCache;

use std::sync::Arc;

use crate::config::LlmSettings;
use crate::context::RequestContext;
use crate::graph::GraphStore;
use crate::llm::prompt::{HistorySnippet, PromptContext, format_messages_with_context};
use crate::llm::{LlmProvider, ProviderMessage};
use crate::memory::MemoryStore;
use crate::outlet::{EmailGateway, ExpenseStore, ScheduleStore};
use crate::planner::{RetrievalPlanner, RetrievalSources};
use crate::skills::voyager::RetrievalActivity;
use crate::storage::{HistoryHit, MessageStore};
use crate::websearch::{
    BraveSearchClient, WebResult, format_results_for_context, reformulate_query_with_context,
    scrub_pii, should_web_search,
};

/// Default conversation tail length
const DEFAULT_HISTORY_LIMIT: usize = 25;

/// Uploaded-document retrieval. The chunking/upload pipeline lives outside
/// the core; the default source has nothing.
pub trait DocumentSource: Send + Sync {
    /// Whether any documents exist for retrieval.
    fn is_available(&self) -> bool {
        false
    }

    /// Relevant chunks as `(filename, content)` pairs.
    fn relevant_chunks(&self, _user_id: &str, _query: &str, _limit: usize) -> Vec<(String, String)> {
        vec![]
    }
}

/// The default, empty document source.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDocumentSource;

impl DocumentSource for NullDocumentSource {}

/// Everything a turn needs after assembly.
#[derive(Debug, Default)]
pub struct AssembledContext {
    /// Final message list for the provider
    pub messages: Vec<ProviderMessage>,
    /// UI transparency side-channel
    pub context_metadata: serde_json::Value,
    /// Raw web results for the `web_sources` SSE event
    pub web_sources: Vec<WebResult>,
    /// "Discussed before" banner, first turn only
    pub continuity_banner: Option<String>,
    /// Which sources ran and whether they returned results
    pub activity: RetrievalActivity,
    /// Whether web-search context is in the prompt (drives the outlet
    /// security gate)
    pub web_search_active: bool,
    /// Preflight failure message; when set the turn short-circuits
    pub preflight_error: Option<String>,
}

/// Assembles retrieval context for each turn.
pub struct ContextAssembler {
    planner: Arc<RetrievalPlanner>,
    messages: MessageStore,
    memory: MemoryStore,
    graph: GraphStore,
    schedule: ScheduleStore,
    expenses: ExpenseStore,
    email: Arc<dyn EmailGateway>,
    documents: Arc<dyn DocumentSource>,
    preflight: PreflightCache,
}

impl ContextAssembler {
    /// Wire the assembler together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Arc<RetrievalPlanner>,
        messages: MessageStore,
        memory: MemoryStore,
        graph: GraphStore,
        schedule: ScheduleStore,
        expenses: ExpenseStore,
        email: Arc<dyn EmailGateway>,
        documents: Arc<dyn DocumentSource>,
    ) -> Self {
        Self {
            planner,
            messages,
            memory,
            graph,
            schedule,
            expenses,
            email,
            documents,
            preflight: PreflightCache::new(),
        }
    }

    /// The shared planner.
    pub fn planner(&self) -> &RetrievalPlanner {
        &self.planner
    }

    /// Assemble the full prompt for one turn.
    pub async fn assemble(
        &self,
        ctx: &RequestContext,
        user_message: &str,
        persona: Option<&str>,
        settings: &LlmSettings,
        llm: Option<&dyn LlmProvider>,
    ) -> AssembledContext {
        let plan = self.planner.analyze(user_message, &[]);
        let sources = self.planner.retrieval_sources(&plan);
        tracing::debug!(
            "Retrieval plan: {:?} ({:?}, confidence {:.2}) — {}",
            plan.decision,
            plan.complexity,
            plan.confidence,
            plan.reasoning,
        );

        let history_limit = settings
            .optimization
            .history_limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT);
        let max_results = plan.max_results.max(1);

        // ── Phase 1: fire every independent source at once ────
        let (history, search_hits, auto_memories, notes, rag_chunks, graph_context, live_data, preflight_error) = tokio::join!(
            self.fetch_tail(ctx, history_limit),
            self.fetch_history_search(ctx, user_message, &sources, max_results),
            self.fetch_memories(ctx, user_message, &sources, max_results),
            self.fetch_notes(ctx, user_message),
            self.fetch_documents(ctx, user_message),
            self.fetch_graph(ctx, user_message, &sources, max_results),
            self.fetch_live_data(ctx, user_message),
            self.fetch_preflight(settings),
        );

        let mut assembled = AssembledContext {
            preflight_error,
            ..Default::default()
        };
        if assembled.preflight_error.is_some() {
            return assembled;
        }

        // ── Phase 2a: web search (needs history for reformulation) ──
        let mut web_context: Option<String> = None;
        if sources.web || settings.web_search_configured() {
            if let Some(api_key) = settings
                .brave_search
                .enabled
                .then_some(settings.brave_search.api_key.as_deref())
                .flatten()
            {
                let gate = should_web_search(user_message);
                if gate.should_search || sources.web {
                    let recent: Vec<String> = history
                        .iter()
                        .rev()
                        .take(6)
                        .rev()
                        .map(|m| format!("{}: {}", m.role, m.content))
                        .collect();
                    let query =
                        reformulate_query_with_context(user_message, &recent, llm).await;
                    let query = scrub_pii(&query, &[]);
                    let results = BraveSearchClient::new(api_key).search(&query, 8).await;
                    if !results.is_empty() {
                        tracing::info!(
                            "Web search: gate score {:.2}, query {:?}, {} results",
                            gate.score,
                            query,
                            results.len(),
                        );
                        web_context = Some(format_results_for_context(&results));
                        assembled.web_sources = results;
                    }
                } else {
                    tracing::debug!(
                        "Web search gate: NO (score {:.2}, {})",
                        gate.score,
                        gate.reason
                    );
                }
            }
        }
        assembled.web_search_active = web_context.is_some();

        // ── Phase 2b: continuity detection (reuses Phase-1 hits) ──
        assembled.continuity_banner = self
            .detect_continuity(ctx, &search_hits)
            .await
            .unwrap_or_default();

        // ── Record activity for the retrieval learner ─────────
        assembled
            .activity
            .record("hybrid_search", sources.search, !search_hits.is_empty());
        assembled
            .activity
            .record("memory", sources.memory, !auto_memories.is_empty());
        assembled
            .activity
            .record("graph", sources.graph, graph_context.is_some());
        assembled
            .activity
            .record("notes", true, notes.is_some());
        assembled
            .activity
            .record("rag", self.documents.is_available(), rag_chunks.is_some());
        assembled.activity.record(
            "web_search",
            assembled.web_search_active,
            assembled.web_search_active,
        );

        // ── Context metadata for UI transparency ──────────────
        let mut metadata = serde_json::Map::new();
        if !auto_memories.is_empty() {
            metadata.insert(
                "memories".into(),
                serde_json::json!(auto_memories.iter().take(5).collect::<Vec<_>>()),
            );
        }
        if let Some(graph) = &graph_context {
            metadata.insert("graph".into(), serde_json::json!(clip(graph, 500)));
        }
        if assembled.web_search_active {
            metadata.insert("web_search".into(), serde_json::json!(true));
        }
        if assembled.continuity_banner.is_some() {
            metadata.insert("continuity".into(), serde_json::json!(true));
        }
        if !search_hits.is_empty() {
            metadata.insert("search_results".into(), serde_json::json!(search_hits.len()));
        }
        if let Some(live) = &live_data {
            metadata.insert("live_data".into(), serde_json::json!(clip(live, 200)));
        }
        assembled.context_metadata = serde_json::Value::Object(metadata);

        // ── Compose the final message list ────────────────────
        let prompt_context = PromptContext {
            system_prompt: persona.map(String::from),
            search_results: search_hits
                .iter()
                .map(|hit| HistorySnippet {
                    content: hit.content.clone(),
                    timestamp: hit.timestamp.to_rfc3339(),
                    role: hit.role.as_str().to_string(),
                    conversation_title: hit.conversation_title.clone(),
                })
                .collect(),
            memories: vec![],
            auto_memories,
            web_search_context: web_context,
            notes_context: notes,
            rag_context: rag_chunks,
            graph_context,
            live_data_context: live_data,
            context_budget: 0,
            has_web_search: settings.web_search_configured(),
        };

        let mut conversation: Vec<ProviderMessage> = history
            .iter()
            .map(|m| ProviderMessage::text(m.role.as_str(), m.content.clone()))
            .collect();
        let already_in_tail = history
            .last()
            .is_some_and(|m| m.role == crate::context::Role::User && m.content == user_message);
        if !already_in_tail {
            conversation.push(ProviderMessage::text("user", user_message));
        }

        assembled.messages = format_messages_with_context(&conversation, &prompt_context);
        assembled
    }

    // ── Phase-1 sources ───────────────────────────────────────

    async fn fetch_tail(&self, ctx: &RequestContext, limit: usize) -> Vec<crate::context::ChatMessage> {
        let store = self.messages.clone();
        let conversation_id = ctx.conversation_id.clone();
        let user_id = ctx.user_id.clone();
        run_blocking(move || store.conversation_tail(&conversation_id, &user_id, limit))
            .await
            .unwrap_or_default()
    }

    async fn fetch_history_search(
        &self,
        ctx: &RequestContext,
        query: &str,
        sources: &RetrievalSources,
        limit: usize,
    ) -> Vec<HistoryHit> {
        if !sources.search {
            return vec![];
        }
        let store = self.messages.clone();
        let user_id = ctx.user_id.clone();
        let query = query.to_string();
        run_blocking(move || store.search_history(&user_id, &query, limit))
            .await
            .unwrap_or_default()
    }

    async fn fetch_memories(
        &self,
        ctx: &RequestContext,
        query: &str,
        sources: &RetrievalSources,
        limit: usize,
    ) -> Vec<String> {
        if !sources.memory {
            return vec![];
        }
        let store = self.memory.clone();
        let user_id = ctx.user_id.clone();
        let query = query.to_string();
        run_blocking(move || store.search(&user_id, &query, limit))
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|note| !note.tags.contains(&"note".to_string()))
            .map(|note| note.content)
            .collect()
    }

    /// Saved notes matching the query, with a pinned-recent fallback.
    async fn fetch_notes(&self, ctx: &RequestContext, query: &str) -> Option<String> {
        let store = self.memory.clone();
        let user_id = ctx.user_id.clone();
        let query = query.to_string();
        let notes = run_blocking(move || {
            let mut notes: Vec<_> = store
                .search(&user_id, &query, 5)?
                .into_iter()
                .filter(|n| n.tags.contains(&"note".to_string()))
                .collect();
            if notes.is_empty() {
                notes = store
                    .recent(&user_id, 3)?
                    .into_iter()
                    .filter(|n| n.tags.contains(&"note".to_string()))
                    .collect();
            }
            Ok::<Vec<crate::memory::MemoryNote>, crate::memory::MemoryError>(notes)
        })
        .await
        .unwrap_or_default();

        if notes.is_empty() {
            return None;
        }
        let parts: Vec<String> = notes
            .iter()
            .map(|n| {
                format!(
                    "### (Updated: {}) {}",
                    n.updated_at.format("%Y-%m-%d"),
                    clip(&n.content, 500)
                )
            })
            .collect();
        Some(parts.join("\n"))
    }

    async fn fetch_documents(&self, ctx: &RequestContext, query: &str) -> Option<String> {
        if !self.documents.is_available() {
            return None;
        }
        let chunks = self.documents.relevant_chunks(&ctx.user_id, query, 5);
        if chunks.is_empty() {
            return None;
        }
        Some(
            chunks
                .iter()
                .map(|(filename, content)| format!("[From: {filename}]\n{content}"))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    async fn fetch_graph(
        &self,
        ctx: &RequestContext,
        query: &str,
        sources: &RetrievalSources,
        limit: usize,
    ) -> Option<String> {
        if !sources.graph {
            return None;
        }
        let store = self.graph.clone();
        let user_id = ctx.user_id.clone();
        let query = query.to_string();
        let formatted = run_blocking(move || {
            let results = store.search_by_query(&query, &user_id, limit)?;
            Ok::<String, crate::graph::GraphError>(store.format_context_for_prompt(&results))
        })
        .await
        .unwrap_or_default();
        (!formatted.is_empty()).then_some(formatted)
    }

    /// Intent-gated live data: email, schedule, and budget sections only
    /// fetch when the query actually asks about them.
    async fn fetch_live_data(&self, ctx: &RequestContext, query: &str) -> Option<String> {
        let lower = query.to_lowercase();
        let mut parts: Vec<String> = Vec::new();

        const EMAIL_WORDS: &[&str] = &["email", "inbox", "mail"];
        const SCHEDULE_WORDS: &[&str] = &["schedule", "calendar", "appointment", "meeting", "event"];
        const BUDGET_WORDS: &[&str] = &["budget", "spent", "spending", "expense", "expenses"];

        if EMAIL_WORDS.iter().any(|w| lower.contains(w)) && self.email.is_available() {
            match self.email.search(&ctx.user_id, query).await {
                Ok(results) if !results.is_empty() => {
                    parts.push(format!("## Relevant Emails\n{results}"));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Email retrieval skipped: {e}"),
            }
        }

        if SCHEDULE_WORDS.iter().any(|w| lower.contains(w)) {
            let store = self.schedule.clone();
            let user_id = ctx.user_id.clone();
            let events = run_blocking(move || store.upcoming(&user_id, 10))
                .await
                .unwrap_or_default();
            if !events.is_empty() {
                let lines: Vec<String> = events
                    .iter()
                    .map(|e| {
                        format!("- {} — {}", e.starts_at.format("%Y-%m-%d %H:%M"), e.title)
                    })
                    .collect();
                parts.push(format!("## Upcoming Schedule\n{}", lines.join("\n")));
            }
        }

        if BUDGET_WORDS.iter().any(|w| lower.contains(w)) {
            let store = self.expenses.clone();
            let user_id = ctx.user_id.clone();
            let expenses = run_blocking(move || store.recent(&user_id, 10))
                .await
                .unwrap_or_default();
            if !expenses.is_empty() {
                let total: f64 = expenses.iter().map(|e| e.amount).sum();
                let lines: Vec<String> = expenses
                    .iter()
                    .map(|e| format!("- ${:.2} {} — {}", e.amount, e.category, e.description))
                    .collect();
                parts.push(format!(
                    "## Recent Expenses (total ${total:.2})\n{}",
                    lines.join("\n")
                ));
            }
        }

        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    async fn fetch_preflight(&self, settings: &LlmSettings) -> Option<String> {
        if !settings.uses_local_provider() {
            return None;
        }
        let (name, provider) = settings.active_provider()?;
        let base_url = provider.base_url.as_deref().unwrap_or(match name {
            "ollama" => "http://localhost:11434",
            _ => "http://localhost:1234/v1",
        });
        self.preflight.check(name, base_url).await
    }

    // ── Phase-2 continuity ────────────────────────────────────

    /// First message of a conversation: if the Phase-1 search surfaced the
    /// same topic in another conversation, emit a banner.
    async fn detect_continuity(
        &self,
        ctx: &RequestContext,
        hits: &[HistoryHit],
    ) -> Option<Option<String>> {
        let store = self.messages.clone();
        let conversation_id = ctx.conversation_id.clone();
        let user_id = ctx.user_id.clone();
        let count = run_blocking(move || store.count(&conversation_id, &user_id))
            .await
            .unwrap_or(0);
        if count > 1 {
            return Some(None);
        }

        let related: Vec<&HistoryHit> = hits
            .iter()
            .filter(|hit| hit.conversation_id != ctx.conversation_id)
            .collect();
        let top = related.first()?;
        let title = if top.conversation_title.is_empty() {
            "an earlier conversation".to_string()
        } else {
            top.conversation_title.clone()
        };
        let snippets: Vec<String> = related
            .iter()
            .filter(|hit| hit.conversation_id == top.conversation_id)
            .take(3)
            .map(|hit| clip(&hit.content, 150))
            .collect();
        if snippets.is_empty() {
            return Some(None);
        }
        Some(Some(format!(
            "💡 **Looks like you've discussed this before** in *\"{}\"*:\n> {}\n\n---\n\n",
            title,
            clip(&snippets.join("; "), 300),
        )))
    }
}

/// Run a store call on the blocking pool; errors degrade to `Err` → default
/// at the call site, with a debug log.
async fn run_blocking<T, E, F>(f: F) -> Option<T>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::debug!("Retrieval source error (degrading to empty): {e}");
            None
        }
        Err(e) => {
            tracing::warn!("Retrieval task join error: {e}");
            None
        }
    }
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

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ChatMessage, Role};
    use crate::graph::HeuristicEntityExtractor;
    use crate::outlet::NullEmailGateway;
    use crate::storage::test_support::scratch_db;

    fn assembler() -> (ContextAssembler, Arc<crate::storage::Database>, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        let memory = MemoryStore::new(db.clone(), None).unwrap();
        let graph = GraphStore::new(db.clone(), Arc::new(HeuristicEntityExtractor::new()));
        let assembler = ContextAssembler::new(
            Arc::new(RetrievalPlanner::new(db.clone())),
            MessageStore::new(db.clone()),
            memory,
            graph,
            ScheduleStore::new(db.clone()),
            ExpenseStore::new(db.clone()),
            Arc::new(NullEmailGateway),
            Arc::new(NullDocumentSource),
        );
        (assembler, db, dir)
    }

    #[tokio::test]
    async fn test_simple_greeting_skips_all_retrieval() {
        let (assembler, _db, _dir) = assembler();
        let ctx = RequestContext::new("u1", "c1");
        let assembled = assembler
            .assemble(&ctx, "hi", Some("You are helpful."), &LlmSettings::default(), None)
            .await;

        assert!(assembled.preflight_error.is_none());
        // No retrieval sections: persona + capabilities only in the system
        // prompt, plus the user message
        let system = assembled.messages[0].content_text().unwrap();
        assert!(system.contains("You are helpful."));
        assert!(!system.contains("User Profile & Knowledge"));
        assert!(!system.contains("Knowledge Graph Context"));
        assert!(!assembled.web_search_active);

        // Activity shows nothing was used
        let used: Vec<_> = assembled
            .activity
            .sources
            .iter()
            .filter(|(name, used, _)| *used && name != "notes" && name != "rag")
            .collect();
        assert!(used.is_empty());

        assert_eq!(
            assembled.messages.last().unwrap().content_text(),
            Some("hi")
        );
    }

    #[tokio::test]
    async fn test_memory_query_injects_memories() {
        let (assembler, db, _dir) = assembler();
        let ctx = RequestContext::new("u1", "c1");
        let memory = MemoryStore::new(db, None).unwrap();
        memory
            .add_memory("User's project uses FastAPI", "u1", "c0")
            .await
            .unwrap();

        let assembled = assembler
            .assemble(
                &ctx,
                "like I said, our project uses FastAPI",
                None,
                &LlmSettings::default(),
                None,
            )
            .await;

        let system = assembled.messages[0].content_text().unwrap();
        assert!(system.contains("User's project uses FastAPI"));
        // Memory source ran with results; graph did not run
        let memory_activity = assembled
            .activity
            .sources
            .iter()
            .find(|(n, _, _)| n == "memory")
            .unwrap();
        assert!(memory_activity.1 && memory_activity.2);
        let graph_activity = assembled
            .activity
            .sources
            .iter()
            .find(|(n, _, _)| n == "graph")
            .unwrap();
        assert!(!graph_activity.1);
        assert!(assembled.context_metadata.get("memories").is_some());
    }

    #[tokio::test]
    async fn test_conversation_tail_included() {
        let (assembler, db, _dir) = assembler();
        let ctx = RequestContext::new("u1", "c1");
        let messages = MessageStore::new(db);
        for (role, text) in [
            (Role::User, "what is Rust?"),
            (Role::Assistant, "A systems language."),
        ] {
            messages.save(&ChatMessage::new(&ctx, role, text)).unwrap();
        }

        let assembled = assembler
            .assemble(&ctx, "and what about Go?", None, &LlmSettings::default(), None)
            .await;
        let roles: Vec<&str> = assembled.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(
            assembled.messages.last().unwrap().content_text(),
            Some("and what about Go?")
        );
    }

    #[tokio::test]
    async fn test_preflight_failure_short_circuits() {
        let (assembler, _db, _dir) = assembler();
        let ctx = RequestContext::new("u1", "c1");

        let mut settings = LlmSettings::default();
        settings.providers.insert(
            "lmstudio".to_string(),
            crate::config::ProviderSettings {
                enabled: true,
                base_url: Some("http://localhost:1234/v1".to_string()),
                ..Default::default()
            },
        );
        settings.default_provider = Some("lmstudio".to_string());
        assembler
            .preflight
            .seed("lmstudio", "http://localhost:1234/v1", Some("unreachable".into()));

        let assembled = assembler
            .assemble(&ctx, "hello there friend", None, &settings, None)
            .await;
        assert_eq!(assembled.preflight_error.as_deref(), Some("unreachable"));
        assert!(assembled.messages.is_empty());
    }

    #[tokio::test]
    async fn test_live_data_budget_intent() {
        let (assembler, db, _dir) = assembler();
        let ctx = RequestContext::new("u1", "c1");
        ExpenseStore::new(db)
            .add("u1", "42.00", "food", "groceries")
            .unwrap();

        let assembled = assembler
            .assemble(
                &ctx,
                "how much have I spent on my budget this week",
                None,
                &LlmSettings::default(),
                None,
            )
            .await;
        let system = assembled.messages[0].content_text().unwrap();
        assert!(system.contains("Recent Expenses"));
        assert!(system.contains("$42.00"));
    }

    #[tokio::test]
    async fn test_continuity_banner_on_first_turn() {
        let (assembler, db, _dir) = assembler();
        let messages = MessageStore::new(db);

        // An older conversation about the same topic
        let old_ctx = RequestContext::new("u1", "c-old");
        messages
            .save(&ChatMessage::new(
                &old_ctx,
                Role::User,
                "how do I tune postgres connection pooling",
            ))
            .unwrap();
        messages.set_conversation_title("c-old", "Postgres tuning").unwrap();

        // Fresh conversation, first message, same topic
        let ctx = RequestContext::new("u1", "c-new");
        let assembled = assembler
            .assemble(
                &ctx,
                "postgres connection pooling keeps timing out, help me debug it",
                None,
                &LlmSettings::default(),
                None,
            )
            .await;
        let banner = assembled.continuity_banner.expect("banner present");
        assert!(banner.contains("Postgres tuning"));
        assert_eq!(assembled.context_metadata["continuity"], true);
    }
}
