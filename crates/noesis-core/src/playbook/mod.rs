//! Playbook & Outcome Subsystem
//!
//! Smart→weak knowledge transfer: high-capability models record outcomes
//! and generate step-by-step playbooks that lower-capability models follow
//! later. Outcome recording also clusters recurring patterns into
//! auto-generated skills.

mod advisor;
mod store;

pub use advisor::{DifficultyAssessment, PlaybookAdvisor, SmartContext, detect_model_tier};
pub use store::{Outcome, OutcomeType, Playbook, PlaybookStep, PlaybookStore, Solution};

use serde::{Deserialize, Serialize};

/// Playbook error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    /// Storage failure
    #[error("Playbook storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    /// Skill layer failure during auto-generation
    #[error("Skill error: {0}")]
    Skill(#[from] crate::skills::SkillError),
}

/// Playbook result type
pub type Result<T> = std::result::Result<T, PlaybookError>;

/// Task difficulty tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// A weak model can handle it unaided
    Easy,
    /// A weak model can handle it with playbook/skill support
    Medium,
    /// Needs a smart model
    Hard,
}

impl Difficulty {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "easy" => Self::Easy,
            "hard" => Self::Hard,
            _ => Self::Medium,
        }
    }
}

/// Shared keyword extraction for matching tasks against playbooks.
pub(crate) fn extract_keywords(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has",
        "had", "do", "does", "did", "will", "would", "could", "should", "may", "might", "must",
        "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "through",
        "and", "but", "or", "not", "this", "that", "it", "its", "i", "you", "we", "they", "how",
        "what", "when", "where", "why", "which", "who",
    ];
    let mut seen = std::collections::HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .take(20)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_roundtrip() {
        for d in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            assert_eq!(Difficulty::parse_name(d.as_str()), d);
        }
        assert_eq!(Difficulty::parse_name("weird"), Difficulty::Medium);
    }

    #[test]
    fn test_keyword_extraction() {
        let keywords = extract_keywords("How do I add a REST endpoint to the FastAPI backend?");
        assert!(keywords.contains(&"rest".to_string()));
        assert!(keywords.contains(&"fastapi".to_string()));
        assert!(!keywords.contains(&"how".to_string()));
        assert!(keywords.len() <= 20);
    }
}
