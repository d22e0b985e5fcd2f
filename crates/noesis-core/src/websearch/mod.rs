//! Web Search
//!
//! Brave Search client plus the gate that decides whether a turn needs live
//! web results at all. The gate is heuristic; query reformulation can use
//! the LLM (with conversation context) and falls back to keyword cleanup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::LlmProvider;

/// Gate score at or above which a search runs
const GATE_THRESHOLD: f64 = 0.5;

/// Brave API request deadline
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One web result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResult {
    /// Page title
    pub title: String,
    /// Page URL
    pub url: String,
    /// Snippet/description
    pub description: String,
}

/// Why (or why not) the gate fired.
#[derive(Debug, Clone)]
pub struct GateDecision {
    /// Run the search?
    pub should_search: bool,
    /// Blended signal score
    pub score: f64,
    /// Which signal dominated
    pub reason: &'static str,
}

/// Decide whether a query needs live web results.
///
/// Strong signals: explicit search requests, recency vocabulary, questions
/// about prices/releases/news. Negative signals: personal-memory phrasing
/// and code pasted into the message.
pub fn should_web_search(query: &str) -> GateDecision {
    let lower = query.to_lowercase();
    let mut score = 0.0f64;
    let mut reason = "no_signal";

    const EXPLICIT: &[&str] = &["search for", "search the web", "look up", "google", "find online"];
    const RECENCY: &[&str] = &[
        "latest", "newest", "current", "today", "this week", "this year", "recent", "news",
        "price", "release date", "2025", "2026",
    ];
    const PERSONAL: &[&str] = &[
        "my ", "our ", "we discussed", "i said", "remember", "last time", "you told me",
    ];

    if EXPLICIT.iter().any(|s| lower.contains(s)) {
        score += 0.8;
        reason = "explicit_request";
    }
    if RECENCY.iter().any(|s| lower.contains(s)) {
        score += 0.5;
        if reason == "no_signal" {
            reason = "recency_vocabulary";
        }
    }
    if lower.ends_with('?') && lower.split_whitespace().count() >= 5 {
        score += 0.1;
    }
    if PERSONAL.iter().any(|s| lower.contains(s)) {
        score -= 0.4;
        reason = "personal_context";
    }
    if lower.contains("```") || lower.contains("fn ") || lower.contains("def ") {
        score -= 0.3;
        reason = "code_content";
    }

    GateDecision {
        should_search: score >= GATE_THRESHOLD,
        score,
        reason,
    }
}

/// Strip filler and first-person framing from a query to make a better
/// search string.
pub fn reformulate_search_query(query: &str) -> String {
    const FILLERS: &[&str] = &[
        "can you", "could you", "please", "search for", "search the web for", "look up",
        "find out", "tell me", "i want to know", "what is", "what are",
    ];
    let mut cleaned = query.to_lowercase();
    for filler in FILLERS {
        cleaned = cleaned.replace(filler, " ");
    }
    let cleaned: String = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '?' || c == '!' || c == '.')
        .to_string();
    if cleaned.len() < 3 {
        query.trim().to_string()
    } else {
        cleaned
    }
}

/// Reformulate with conversation context via the LLM; heuristic fallback.
pub async fn reformulate_query_with_context(
    message: &str,
    recent_history: &[String],
    llm: Option<&dyn LlmProvider>,
) -> String {
    if let Some(llm) = llm {
        let history = recent_history.join("\n");
        let prompt = format!(
            "Rewrite this chat message as a concise web search query. Use the conversation \
             context to resolve pronouns. Respond with ONLY the query text.\n\n\
             CONVERSATION:\n{history}\n\nMESSAGE: {message}"
        );
        if let Ok(text) = llm.complete(&prompt, 50, Duration::from_secs(10)).await {
            let candidate = text.trim().trim_matches('"').to_string();
            if (3..200).contains(&candidate.len()) && !candidate.contains('\n') {
                return candidate;
            }
        }
    }
    reformulate_search_query(message)
}

/// Scrub obvious personal identifiers from an outgoing search query.
pub fn scrub_pii(query: &str, context_names: &[String]) -> String {
    let mut scrubbed = query.to_string();
    for name in context_names {
        if name.len() > 2 {
            // Case-insensitive removal without regex escapes
            let lower = scrubbed.to_lowercase();
            if let Some(pos) = lower.find(&name.to_lowercase()) {
                scrubbed.replace_range(pos..pos + name.len(), "");
            }
        }
    }
    scrubbed.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// BRAVE CLIENT
// ============================================================================

#[derive(Debug, Deserialize)]
struct BraveResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

/// Brave Search API client.
pub struct BraveSearchClient {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearchClient {
    /// Create a client.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    /// Run a search. Errors degrade to an empty result list — web search is
    /// never allowed to fail a turn.
    pub async fn search(&self, query: &str, count: usize) -> Vec<WebResult> {
        let request = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json");

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Brave search transport error: {e}");
                return vec![];
            }
        };
        if !response.status().is_success() {
            tracing::warn!("Brave search returned {}", response.status());
            return vec![];
        }
        match response.json::<BraveResponse>().await {
            Ok(parsed) => parsed
                .web
                .map(|w| {
                    w.results
                        .into_iter()
                        .map(|r| WebResult {
                            title: r.title,
                            url: r.url,
                            description: r.description,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Brave search parse error: {e}");
                vec![]
            }
        }
    }
}

/// Format results for prompt injection with numbered citations.
pub fn format_results_for_context(results: &[WebResult]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Live Web Search Results".to_string()];
    for (i, result) in results.iter().enumerate() {
        lines.push(format!(
            "[{}] **{}**\n{}\nURL: {}",
            i + 1,
            result.title,
            result.description,
            result.url,
        ));
    }
    lines.join("\n\n")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_fires_on_explicit_request() {
        let decision = should_web_search("search the web for rust 1.85 release notes");
        assert!(decision.should_search);
        assert_eq!(decision.reason, "explicit_request");
    }

    #[test]
    fn test_gate_fires_on_recency() {
        let decision = should_web_search("what is the latest stable kernel version?");
        assert!(decision.should_search);
    }

    #[test]
    fn test_gate_blocks_personal_queries() {
        let decision = should_web_search("remember my project setup we discussed recently?");
        assert!(!decision.should_search);
    }

    #[test]
    fn test_gate_blocks_plain_chat() {
        assert!(!should_web_search("write me a haiku about rain").should_search);
    }

    #[test]
    fn test_reformulation_strips_filler() {
        let query = reformulate_search_query("Can you please look up the weather in Lisbon?");
        assert!(!query.contains("please"));
        assert!(query.contains("weather"));
        assert!(query.contains("lisbon"));
    }

    #[test]
    fn test_reformulation_keeps_short_queries() {
        assert_eq!(reformulate_search_query("ok"), "ok");
    }

    #[tokio::test]
    async fn test_context_reformulation_falls_back_without_llm() {
        let query = reformulate_query_with_context("tell me the latest on it", &[], None).await;
        assert!(!query.is_empty());
    }

    #[test]
    fn test_pii_scrubbing() {
        let scrubbed = scrub_pii(
            "Jane Doe salary software engineer",
            &["Jane Doe".to_string(), "Jane".to_string()],
        );
        assert!(!scrubbed.contains("Jane"));
        assert!(scrubbed.contains("salary"));
    }

    #[test]
    fn test_format_results_numbered() {
        let results = vec![
            WebResult {
                title: "First".into(),
                url: "https://a.example".into(),
                description: "first hit".into(),
            },
            WebResult {
                title: "Second".into(),
                url: "https://b.example".into(),
                description: "second hit".into(),
            },
        ];
        let formatted = format_results_for_context(&results);
        assert!(formatted.contains("[1] **First**"));
        assert!(formatted.contains("[2] **Second**"));
        assert!(format_results_for_context(&[]).is_empty());
    }
}
