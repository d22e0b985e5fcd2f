//! Skill Voyager
//!
//! A persistent, evaluated, self-reflective skill library. Each skill is a
//! response strategy with trigger patterns and a confidence score that
//! evolves with feedback. Five cooperating subsystems: the store, the query
//! classifier, the evaluator, reflection/evolution, and the curriculum
//! engine — plus the correction and retrieval learners feeding them.

pub mod classifier;
pub mod correction;
pub mod curriculum;
pub mod evaluator;
pub mod extractor;
pub mod reflection;
pub mod retrieval_learner;
mod store;
pub mod voyager;

pub use classifier::{QueryClassification, QueryClassifier};
pub use correction::{CorrectionEvent, CorrectionLearner, CorrectionType};
pub use curriculum::{CurriculumEngine, CurriculumProposal};
pub use evaluator::ResponseEvaluator;
pub use extractor::SkillExtractor;
pub use reflection::{Reflection, ReflectionEngine, RootCause};
pub use retrieval_learner::{RetrievalLearner, RetrievalOutcome};
pub use store::{SkillStats, SkillStore};
pub use voyager::SkillVoyager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Skill error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    /// Storage failure
    #[error("Skill storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Skill result type
pub type Result<T> = std::result::Result<T, SkillError>;

/// Confidence floor/ceiling for every skill
pub const CONFIDENCE_FLOOR: f64 = 0.05;
/// Confidence ceiling
pub const CONFIDENCE_CEILING: f64 = 0.99;

// ============================================================================
// ENUMS
// ============================================================================

/// What a skill is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillType {
    /// How to search for supporting information
    SearchStrategy,
    /// How to shape the response
    ResponseFormat,
    /// Which retrieval sources to combine
    RetrievalCombo,
    /// Conversational behaviors
    ConversationPattern,
    /// Recovering from errors gracefully
    ErrorRecovery,
}

impl SkillType {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchStrategy => "search_strategy",
            Self::ResponseFormat => "response_format",
            Self::RetrievalCombo => "retrieval_combo",
            Self::ConversationPattern => "conversation_pattern",
            Self::ErrorRecovery => "error_recovery",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "response_format" => Self::ResponseFormat,
            "retrieval_combo" => Self::RetrievalCombo,
            "conversation_pattern" => Self::ConversationPattern,
            "error_recovery" => Self::ErrorRecovery,
            _ => Self::SearchStrategy,
        }
    }
}

/// Lifecycle state.
///
/// ```text
/// candidate ──(conf≥0.6 ∧ succ≥2)──▶ verified
/// verified  ──(conf≥0.85 ∧ succ≥5)─▶ mastered
/// any       ──(conf<0.2)──────────▶ deprecated
/// mastered  ──(evolution)─────────▶ verified   (must re-prove)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    /// Newly created, unproven
    Candidate,
    /// Demonstrated repeated success
    Verified,
    /// High confidence, consistently successful
    Mastered,
    /// Confidence collapsed; kept for history
    Deprecated,
}

impl SkillState {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Verified => "verified",
            Self::Mastered => "mastered",
            Self::Deprecated => "deprecated",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            "mastered" => Self::Mastered,
            "deprecated" => Self::Deprecated,
            _ => Self::Candidate,
        }
    }
}

/// How a skill came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    /// Extracted from a successful conversation
    Observed,
    /// Composed from verified parents
    Composed,
    /// Seeded by the curriculum engine
    Curriculum,
    /// Hand-written
    Manual,
}

impl SkillSource {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Composed => "composed",
            Self::Curriculum => "curriculum",
            Self::Manual => "manual",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "composed" => Self::Composed,
            "curriculum" => Self::Curriculum,
            "manual" => Self::Manual,
            _ => Self::Observed,
        }
    }
}

// ============================================================================
// CORE TYPES
// ============================================================================

/// A single learned skill in the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Short snake_case name, unique in practice
    pub name: String,
    /// What the skill is for
    pub skill_type: SkillType,
    /// One-line description
    pub description: String,
    /// The strategy text injected into the system prompt when applied
    pub strategy: String,
    /// Query fragments that trigger this skill
    pub trigger_patterns: Vec<String>,
    /// Confidence in [0.05, 0.99]; starts at 0.5
    pub confidence: f64,
    /// Total applications
    pub times_used: u32,
    /// Successful applications (score ≥ 3.5)
    pub times_succeeded: u32,
    /// Failed applications
    pub times_failed: u32,
    /// Parents this skill was composed from
    pub parent_skill_ids: Vec<String>,
    /// Skills derived from this one
    pub child_skill_ids: Vec<String>,
    /// Lifecycle state
    pub state: SkillState,
    /// Provenance
    pub source: SkillSource,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last application
    pub last_used_at: Option<DateTime<Utc>>,
    /// Last evaluation
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

impl Skill {
    /// Build a fresh candidate skill.
    pub fn new(
        name: impl Into<String>,
        skill_type: SkillType,
        strategy: impl Into<String>,
        trigger_patterns: Vec<String>,
        source: SkillSource,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            skill_type,
            description: String::new(),
            strategy: strategy.into(),
            trigger_patterns,
            confidence: 0.5,
            times_used: 0,
            times_succeeded: 0,
            times_failed: 0,
            parent_skill_ids: vec![],
            child_skill_ids: vec![],
            state: SkillState::Candidate,
            source,
            created_at: Utc::now(),
            last_used_at: None,
            last_evaluated_at: None,
        }
    }
}

/// Result of evaluating a response where a skill was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillEvaluation {
    /// Unique identifier
    pub id: String,
    /// Evaluated skill
    pub skill_id: String,
    /// Message the evaluation belongs to
    pub message_id: String,
    /// Conversation the evaluation belongs to
    pub conversation_id: String,
    /// Score on a 1-5 scale
    pub score: f64,
    /// One-sentence justification
    pub reasoning: String,
    /// Query snippet
    pub query_text: String,
    /// Response snippet
    pub response_snippet: String,
    /// When the evaluation ran
    pub evaluated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_roundtrips() {
        for t in [
            SkillType::SearchStrategy,
            SkillType::ResponseFormat,
            SkillType::RetrievalCombo,
            SkillType::ConversationPattern,
            SkillType::ErrorRecovery,
        ] {
            assert_eq!(SkillType::parse_name(t.as_str()), t);
        }
        for s in [
            SkillState::Candidate,
            SkillState::Verified,
            SkillState::Mastered,
            SkillState::Deprecated,
        ] {
            assert_eq!(SkillState::parse_name(s.as_str()), s);
        }
    }

    #[test]
    fn test_new_skill_defaults() {
        let skill = Skill::new(
            "concise_definition",
            SkillType::SearchStrategy,
            "Define first, elaborate second.",
            vec!["what is".to_string()],
            SkillSource::Curriculum,
        );
        assert_eq!(skill.state, SkillState::Candidate);
        assert!((skill.confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(skill.times_used, 0);
    }
}
