//! Evolving Memory Store
//!
//! Zettelkasten-style atomic notes: each memory carries LLM-generated
//! keywords, tags, and a context description, links bidirectionally to
//! related notes, and can be evolved in place when newer related information
//! arrives.

mod store;

pub use store::{AddMemoryOutcome, MemoryStore};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Storage failure
    #[error("Memory storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Memory result type
pub type Result<T> = std::result::Result<T, MemoryError>;

/// A Zettelkasten-style memory note.
///
/// Linkage is symmetric by construction: whenever A links B, B links A in
/// the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryNote {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Raw memory content
    pub content: String,
    /// Specific technical terms, names, concepts
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Broad categories (code, preference, decision, ...)
    #[serde(default)]
    pub tags: Vec<String>,
    /// One-sentence description of why this memory matters
    #[serde(default)]
    pub context_description: String,
    /// Ids of bidirectionally linked notes
    #[serde(default)]
    pub linked_memories: HashSet<String>,
    /// How many times this note has been evolved in place
    #[serde(default)]
    pub evolution_count: u32,
    /// Conversation the memory came from
    #[serde(default)]
    pub source_conversation_id: String,
    /// Extraction confidence
    pub confidence: f64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last update (bumped on evolution)
    pub updated_at: DateTime<Utc>,
}

impl MemoryNote {
    /// Build an unenriched note stamped now.
    pub fn new(content: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            content: content.into(),
            keywords: vec![],
            tags: vec![],
            context_description: String::new(),
            linked_memories: HashSet::new(),
            evolution_count: 0,
            source_conversation_id: String::new(),
            confidence: 0.8,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_defaults() {
        let note = MemoryNote::new("User prefers Rust", "u1");
        assert_eq!(note.evolution_count, 0);
        assert!(note.linked_memories.is_empty());
        assert!((note.confidence - 0.8).abs() < f64::EPSILON);
    }
}
