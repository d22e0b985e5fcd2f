//! Query Classifier
//!
//! Categorizes user messages into a two-level taxonomy so the skill library
//! can match the right strategy. Multi-signal and LLM-free: regex patterns,
//! keyword taxonomy overlap, structural features, and follow-up detection
//! from conversation history.
//!
//! ```text
//! factual        definition | lookup | comparison
//! research       deep_dive | multi_source | current_events
//! creative       writing | brainstorm | roleplay
//! technical      code_debug | code_generate | system_admin
//! conversational follow_up | clarification | meta
//! ```

use std::collections::HashMap;

use regex::RegexBuilder;

/// Result of classifying a user query.
#[derive(Debug, Clone)]
pub struct QueryClassification {
    /// Top-level type
    pub primary_type: String,
    /// Specific sub-category
    pub sub_type: String,
    /// Classification confidence in [0, 1]
    pub confidence: f64,
    /// Which signals fired (pattern:, keywords:, structure:, context:)
    pub signals: Vec<String>,
    /// Stopword-stripped keywords from the query
    pub keywords: Vec<String>,
}

impl QueryClassification {
    /// `primary/sub` form used as a bucket key by the learners.
    pub fn type_key(&self) -> String {
        format!("{}/{}", self.primary_type, self.sub_type)
    }
}

// (pattern, primary, sub, confidence)
const PATTERNS: &[(&str, &str, &str, f64)] = &[
    // Factual
    (r"\b(?:what is|what are|define|definition of|meaning of)\b", "factual", "definition", 0.8),
    (r"\b(?:who is|who was|who are)\b", "factual", "lookup", 0.8),
    (r"\b(?:when did|when was|when is|what year)\b", "factual", "lookup", 0.8),
    (r"\b(?:where is|where was|where are)\b", "factual", "lookup", 0.7),
    (
        r"\b(?:compare|versus|vs\.?|difference between|better than|pros and cons)\b",
        "factual",
        "comparison",
        0.85,
    ),
    // Research
    (
        r"\b(?:explain|in detail|deep dive|comprehensive|thorough|elaborate)\b",
        "research",
        "deep_dive",
        0.7,
    ),
    (
        r"\b(?:find everything|research|investigate|all about|tell me everything)\b",
        "research",
        "multi_source",
        0.75,
    ),
    (
        r"\b(?:latest|recent|news|current|today|this week|2025|2026)\b",
        "research",
        "current_events",
        0.7,
    ),
    // Creative
    (
        r"\b(?:write|compose|draft|create|generate)\s+(?:a |an |the )?(?:poem|story|essay|article|blog|email|letter)\b",
        "creative",
        "writing",
        0.85,
    ),
    (r"\b(?:ideas? for|brainstorm|suggest|come up with|think of)\b", "creative", "brainstorm", 0.7),
    (r"\b(?:pretend|roleplay|act as|you are a|imagine you)\b", "creative", "roleplay", 0.8),
    // Technical
    (
        r"\b(?:fix|debug|error|bug|exception|traceback|stack trace)\b",
        "technical",
        "code_debug",
        0.8,
    ),
    (
        r"\b(?:write|create|implement|build|code)\s+(?:a |an |the )?(?:function|class|script|program|api|endpoint)\b",
        "technical",
        "code_generate",
        0.85,
    ),
    (r"\b(?:how to (?:install|configure|setup|deploy|run))\b", "technical", "system_admin", 0.7),
    // Conversational
    (r"\b(?:what about|and also|how about|what if)\b", "conversational", "follow_up", 0.5),
    (
        r"\b(?:explain that|rephrase|say that again|differently|simpler|eli5)\b",
        "conversational",
        "clarification",
        0.7,
    ),
    (
        r"\b(?:how do you work|what can you do|your capabilities|help me understand you)\b",
        "conversational",
        "meta",
        0.8,
    ),
];

// Keyword taxonomy for secondary signal boosting
const KEYWORD_TAXONOMY: &[(&str, &str, &[&str])] = &[
    ("factual", "definition", &["meaning", "define", "what", "explain briefly"]),
    ("factual", "lookup", &["who", "when", "where", "how many", "how much", "how old"]),
    ("factual", "comparison", &["compare", "versus", "better", "worse", "difference", "similar"]),
    ("research", "deep_dive", &["detail", "thorough", "comprehensive", "explain", "how does"]),
    ("research", "multi_source", &["everything", "research", "investigate", "all sources"]),
    ("research", "current_events", &["latest", "news", "recent", "today", "update"]),
    ("creative", "writing", &["write", "compose", "draft", "poem", "story", "essay"]),
    ("creative", "brainstorm", &["ideas", "brainstorm", "suggest", "options", "alternatives"]),
    ("creative", "roleplay", &["pretend", "roleplay", "character", "persona", "act as"]),
    ("technical", "code_debug", &["error", "fix", "bug", "debug", "traceback", "exception"]),
    ("technical", "code_generate", &["implement", "function", "class", "code", "script", "api"]),
    ("technical", "system_admin", &["install", "configure", "deploy", "setup", "docker", "server"]),
    ("conversational", "follow_up", &["also", "what about", "and", "too", "as well"]),
    ("conversational", "clarification", &["rephrase", "simpler", "again", "clarify", "eli5"]),
    ("conversational", "meta", &["capabilities", "how do you", "what can you"]),
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall",
    "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "through", "about",
    "it", "its", "i", "me", "my", "you", "your", "we", "our", "they", "them", "their", "this",
    "that", "these", "those", "and", "or", "but", "if", "then", "so", "not", "no", "what", "how",
    "when", "where", "who", "which", "why", "please", "just", "also", "very", "really",
];

const FOLLOW_UP_MARKERS: &[&str] = &["it", "that", "this", "those", "them", "they", "its"];

const IMPERATIVE_STARTS: &[&str] = &["do", "make", "create", "build", "show", "list", "get", "find"];

/// Multi-signal query classifier. Patterns compile once at construction.
pub struct QueryClassifier {
    patterns: Vec<(regex::Regex, &'static str, &'static str, f64)>,
    url_pattern: regex::Regex,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClassifier {
    /// Build the classifier.
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(pattern, primary, sub, confidence)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|re| (re, *primary, *sub, *confidence))
            })
            .collect();
        let url_pattern = regex::Regex::new(r"https?://|/[\w/]+\.\w+")
            .expect("url pattern is valid");
        Self {
            patterns,
            url_pattern,
        }
    }

    /// Classify a query; `history_len` is the number of prior conversation
    /// turns (used for follow-up detection).
    pub fn classify(&self, query: &str, history_len: usize) -> QueryClassification {
        let query_lower = query.to_lowercase().trim().to_string();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        let mut signals: Vec<String> = Vec::new();
        let mut scores: HashMap<(&'static str, &'static str), f64> = HashMap::new();

        // Signal 1: regex pattern matching
        for (re, primary, sub, confidence) in &self.patterns {
            if re.is_match(&query_lower) {
                bump(&mut scores, (*primary, *sub), *confidence);
                signals.push(format!("pattern:{}/{}", primary, sub));
            }
        }

        // Signal 2: keyword taxonomy overlap
        for (primary, sub, keywords) in KEYWORD_TAXONOMY {
            let overlap = keywords.iter().filter(|kw| query_lower.contains(**kw)).count();
            if overlap > 0 {
                let kw_score = (overlap as f64 * 0.2).min(0.6);
                bump(&mut scores, (*primary, *sub), kw_score);
                if kw_score >= 0.2 {
                    signals.push(format!("keywords:{}/{}", primary, sub));
                }
            }
        }

        // Signal 3: structural features
        if query_lower.contains('?') {
            bump(&mut scores, ("factual", "definition"), 0.3);
            signals.push("structure:has_question_mark".into());
        }
        if query_words.len() > 20 {
            bump(&mut scores, ("research", "deep_dive"), 0.3);
            signals.push("structure:long_query".into());
        }
        if query_lower.contains('`') {
            bump(&mut scores, ("technical", "code_debug"), 0.5);
            signals.push("structure:has_code".into());
        }
        if self.url_pattern.is_match(&query_lower) {
            bump(&mut scores, ("research", "multi_source"), 0.3);
            signals.push("structure:has_url".into());
        }
        if query_words.len() <= 5
            && query_words
                .first()
                .is_some_and(|w| IMPERATIVE_STARTS.contains(w))
        {
            bump(&mut scores, ("technical", "code_generate"), 0.3);
            signals.push("structure:short_imperative".into());
        }

        // Signal 4: follow-up detection from conversation history
        if history_len >= 2 && is_follow_up(&query_words) {
            bump(&mut scores, ("conversational", "follow_up"), 0.6);
            signals.push("context:follow_up".into());
        }

        // Pick the best classification
        let mut best: Option<((&str, &str), f64)> = None;
        for (key, score) in &scores {
            if best.as_ref().is_none_or(|(_, s)| score > s) {
                best = Some((*key, *score));
            }
        }

        let ((primary, sub), score) = best.unwrap_or_else(|| {
            signals.push("fallback:default".into());
            (("conversational", "follow_up"), 0.3)
        });

        QueryClassification {
            primary_type: primary.to_string(),
            sub_type: sub.to_string(),
            confidence: (score * 1000.0).round() / 1000.0,
            signals,
            keywords: extract_keywords(&query_lower),
        }
    }
}

fn bump(
    scores: &mut HashMap<(&'static str, &'static str), f64>,
    key: (&'static str, &'static str),
    value: f64,
) {
    let entry = scores.entry(key).or_insert(0.0);
    if value > *entry {
        *entry = value;
    }
}

/// Short messages after prior turns, or pronoun-initial messages, read as
/// follow-ups.
fn is_follow_up(query_words: &[&str]) -> bool {
    if query_words.len() <= 4 {
        return true;
    }
    query_words
        .iter()
        .take(3)
        .any(|w| FOLLOW_UP_MARKERS.contains(w))
}

fn extract_keywords(query_lower: &str) -> Vec<String> {
    query_lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| w.len() >= 2 && !STOPWORDS.contains(w))
        .take(10)
        .map(String::from)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_query() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("What is a monad?", 0);
        assert_eq!(result.primary_type, "factual");
        assert_eq!(result.sub_type, "definition");
        assert!(result.confidence >= 0.8);
        assert!(result.signals.iter().any(|s| s.starts_with("pattern:")));
    }

    #[test]
    fn test_comparison_query() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("compare Rust vs Go for backend services", 0);
        assert_eq!(result.type_key(), "factual/comparison");
    }

    #[test]
    fn test_debug_query() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("fix this error: `IndexError` in my loop", 0);
        assert_eq!(result.primary_type, "technical");
        assert_eq!(result.sub_type, "code_debug");
    }

    #[test]
    fn test_creative_writing_query() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("write a poem about autumn leaves", 0);
        assert_eq!(result.type_key(), "creative/writing");
    }

    #[test]
    fn test_follow_up_needs_history() {
        let classifier = QueryClassifier::new();
        // Pronoun-initial with history
        let with = classifier.classify("that looks wrong somehow to me honestly", 4);
        assert!(with.signals.iter().any(|s| s == "context:follow_up"));
        // Same text without history: no follow-up signal
        let without = classifier.classify("that looks wrong somehow to me honestly", 0);
        assert!(!without.signals.iter().any(|s| s == "context:follow_up"));
    }

    #[test]
    fn test_short_message_after_history_is_follow_up() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("and the other one", 6);
        assert_eq!(result.type_key(), "conversational/follow_up");
    }

    #[test]
    fn test_fallback_classification() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("sounds good friend mmm okay", 0);
        assert_eq!(result.primary_type, "conversational");
        assert!((result.confidence - 0.3).abs() < 1e-9);
        assert!(result.signals.iter().any(|s| s == "fallback:default"));
    }

    #[test]
    fn test_keywords_strip_stopwords() {
        let classifier = QueryClassifier::new();
        let result = classifier.classify("how do I configure the nginx reverse proxy", 0);
        assert!(result.keywords.contains(&"nginx".to_string()));
        assert!(result.keywords.contains(&"configure".to_string()));
        assert!(!result.keywords.contains(&"how".to_string()));
    }
}
