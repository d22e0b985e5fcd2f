//! Temporal Knowledge Graph
//!
//! Typed entities and dynamically-labeled relationships with temporal
//! properties, stored in SQLite. Contradicted relationships are invalidated
//! (`is_active = false`), never deleted, so the graph keeps history.

mod community;
pub mod extract;
mod store;

pub use community::detect_communities;
pub use extract::{EntityExtractor, ExtractedEntity, HeuristicEntityExtractor};
pub use store::{EntityContext, GraphPath, GraphStore, PruneStats, RelatedEntity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Graph error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Storage failure
    #[error("Graph storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    /// Entity rejected by the validity filter
    #[error("Invalid entity name: {0}")]
    InvalidEntity(String),
}

/// Graph result type
pub type Result<T> = std::result::Result<T, GraphError>;

// ============================================================================
// CORE TYPES
// ============================================================================

/// A node in the knowledge graph, keyed on `(name, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Entity name (must pass [`is_valid_entity`])
    pub name: String,
    /// Owner
    pub user_id: String,
    /// Semantic type (technology, person, project, ...)
    pub node_type: String,
    /// Free-form properties
    #[serde(default)]
    pub properties: serde_json::Value,
    /// First time the entity was seen
    pub created_at: DateTime<Utc>,
    /// Most recent mention
    pub last_seen: DateTime<Utc>,
}

impl GraphNode {
    /// Build a node stamped now.
    pub fn new(
        name: impl Into<String>,
        user_id: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            user_id: user_id.into(),
            node_type: node_type.into(),
            properties: serde_json::Value::Object(Default::default()),
            created_at: now,
            last_seen: now,
        }
    }
}

/// A directed, labeled relationship between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRelationship {
    /// Source entity name
    pub from: String,
    /// Target entity name
    pub to: String,
    /// UPPER_SNAKE label (sanitized on write)
    pub label: String,
    /// Extraction confidence
    pub confidence: f64,
    /// When the relationship was learned
    pub created_at: DateTime<Utc>,
    /// Conversation the fact came from
    pub source_conversation_id: Option<String>,
    /// False once contradicted by newer information
    pub is_active: bool,
    /// When the relationship was invalidated
    pub invalidated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// LABEL SANITIZATION
// ============================================================================

/// Fallback label when sanitization leaves nothing usable
pub const FALLBACK_LABEL: &str = "RELATES_TO";

/// Sanitize a relationship label to `[A-Z0-9_]+`.
///
/// Labels are interpolated into queries and prompt text, so anything outside
/// alphanumerics/underscore becomes `_`. Empty results and labels starting
/// with a digit fall back to [`FALLBACK_LABEL`].
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() || trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        FALLBACK_LABEL.to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// ENTITY VALIDITY
// ============================================================================

/// Noisy tokens that pollute the graph: pronouns, function words, generic
/// programming vocabulary.
const NOISE_ENTITIES: &[&str] = &[
    // Pronouns
    "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those",
    // Common words
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "what", "which",
    "who", "whom", "where", "when", "why", "how", "is", "are", "was", "were", "be", "been",
    "being", "have", "has", "had", "do", "does", "did", "will", "would", "could", "should", "may",
    "might", "not", "no", "yes", "so", "if", "then", "than", "also", "just", "only",
    // Generic terms
    "thing", "stuff", "something", "anything", "nothing", "everything", "user", "app", "args",
    "none", "true", "false", "null", "data", "result", "value", "key", "name", "type", "list",
    "dict", "str", "int",
];

const CODE_SIGNALS: &[&str] = &[
    "()", "=>", "->", "==", "!=", "+=", "def ", "class ", "import ", "return ", "async ", "{}",
    "[]", "//", "/*", ".append(", ".get(", ".split(", "print(", "logger.",
];

const CODE_SUFFIXES: &[&str] = &[
    "Request", "Response", "Config", "Router", "Handler", "Service", "Store", "Manager",
    "Factory", "Provider", "Middleware", "Schema", "Model", "Type", "Error", "Exception",
    "Registry", "Controller",
];

/// Check whether an entity name is worth storing.
///
/// Rejects pronouns and noise words, numeric tokens, code fragments, strings
/// over 80 chars or containing newlines, mostly-symbolic strings, markdown
/// headers, decorators/mentions, multi-capital CamelCase identifiers, and
/// bare identifiers ending in a code suffix.
pub fn is_valid_entity(name: &str) -> bool {
    let stripped = name.trim();
    if stripped.len() < 2 {
        return false;
    }
    let lower = stripped.to_lowercase();
    if NOISE_ENTITIES.contains(&lower.as_str()) {
        return false;
    }
    // Pure numbers or numeric patterns like "1.", "2.", "1-2"
    let digits_only: String = stripped
        .chars()
        .filter(|c| *c != '.' && *c != '-' && *c != ',')
        .collect();
    if !digits_only.is_empty() && digits_only.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    // Two-char noise like "##" or "e}"
    if stripped.chars().count() <= 2 && !stripped.chars().all(|c| c.is_alphabetic()) {
        return false;
    }
    // Code or sentence fragments
    if stripped.len() > 80 {
        return false;
    }
    if stripped.contains('\n') {
        return false;
    }
    if CODE_SIGNALS.iter().any(|sig| stripped.contains(sig)) {
        return false;
    }
    // Mostly symbols/punctuation
    let char_count = stripped.chars().count();
    if char_count > 3 {
        let alnum = stripped
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ')
            .count();
        if (alnum as f64) / (char_count as f64) < 0.7 {
            return false;
        }
    }
    // Markdown headers and decorators/mentions
    if stripped.starts_with('#') || stripped.starts_with('@') {
        return false;
    }
    // Multi-capital CamelCase identifiers (AddinConfig, APIRouter) while
    // allowing single-capital proper nouns (Python, Neo4j)
    if stripped.len() > 3
        && !stripped.contains(' ')
        && stripped.chars().next().is_some_and(|c| c.is_uppercase())
        && stripped.chars().all(|c| c.is_alphanumeric() || c == '_')
    {
        let upper_after_first = stripped.chars().skip(1).filter(|c| c.is_uppercase()).count();
        if upper_after_first >= 2 {
            return false;
        }
    }
    // Bare identifiers ending in a code suffix
    if !stripped.contains(' ') && CODE_SUFFIXES.iter().any(|s| stripped.ends_with(s)) {
        return false;
    }
    true
}

// ============================================================================
// TESTS
// ============================================================================
