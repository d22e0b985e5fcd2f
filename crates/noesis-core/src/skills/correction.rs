//! Correction Learner
//!
//! User corrections are negative feedback on whatever skill produced the
//! rejected response. Each event lands in the corrections log, updates the
//! per-skill correction stats, and deducts a severity-scaled penalty from
//! the skill's confidence via an atomic UPDATE (no lost updates against the
//! concurrent evaluation path).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Result, SkillStore};
use crate::storage::Database;

/// Kinds of negative user signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    /// User tweaked the response
    Edit,
    /// User rejected the whole response
    Regenerate,
    /// Explicit negative rating
    ThumbsDown,
    /// User specifically flagged the response
    Explicit,
}

impl CorrectionType {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Regenerate => "regenerate",
            Self::ThumbsDown => "thumbs_down",
            Self::Explicit => "explicit",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "edit" => Some(Self::Edit),
            "regenerate" => Some(Self::Regenerate),
            "thumbs_down" => Some(Self::ThumbsDown),
            "explicit" => Some(Self::Explicit),
            _ => None,
        }
    }

    /// Confidence penalty, scaled by severity.
    pub fn penalty(&self) -> f64 {
        match self {
            Self::Edit => 0.05,
            Self::Regenerate => 0.08,
            Self::ThumbsDown => 0.10,
            Self::Explicit => 0.12,
        }
    }
}

/// A user correction implying negative feedback on a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionEvent {
    /// Correction kind
    pub correction_type: CorrectionType,
    /// Conversation the correction happened in
    pub conversation_id: String,
    /// Corrected message
    pub message_id: String,
    /// What the AI said (snippet)
    pub original_snippet: String,
    /// What the user changed it to, for edits
    pub corrected_snippet: String,
    /// Skill applied when the response was generated
    pub skill_id: String,
    /// Skill name (denormalized for the stats table)
    pub skill_name: String,
    /// Classification of the original query
    pub query_type: String,
    /// When the correction happened
    pub timestamp: DateTime<Utc>,
}

/// Per-skill correction statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionStats {
    /// Skill id
    pub skill_id: String,
    /// Skill name
    pub skill_name: String,
    /// All corrections
    pub times_corrected: u32,
    /// Edits
    pub times_edited: u32,
    /// Regenerations
    pub times_regenerated: u32,
    /// Thumbs-down events
    pub times_thumbs_down: u32,
    /// Most recent correction
    pub last_correction: Option<DateTime<Utc>>,
}

/// Outcome of recording a correction.
#[derive(Debug, Clone, Default)]
pub struct CorrectionResult {
    /// Confidence delta applied to the skill (negative)
    pub confidence_change: f64,
    /// Skill confidence after the penalty
    pub new_confidence: Option<f64>,
}

/// Learns from user corrections to decay skill confidence.
#[derive(Clone)]
pub struct CorrectionLearner {
    db: Arc<Database>,
    skill_store: SkillStore,
}

impl CorrectionLearner {
    /// Create the learner.
    pub fn new(db: Arc<Database>, skill_store: SkillStore) -> Self {
        Self { db, skill_store }
    }

    /// Record a correction event and apply the confidence penalty.
    pub fn record_correction(&self, event: &CorrectionEvent) -> Result<CorrectionResult> {
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO corrections
                   (correction_type, conversation_id, message_id, original_snippet,
                    corrected_snippet, skill_name, skill_id, query_type, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.correction_type.as_str(),
                    event.conversation_id,
                    event.message_id,
                    clip(&event.original_snippet, 500),
                    clip(&event.corrected_snippet, 500),
                    event.skill_name,
                    event.skill_id,
                    event.query_type,
                    event.timestamp,
                ],
            )?;

            let edit = (event.correction_type == CorrectionType::Edit) as i64;
            let regen = (event.correction_type == CorrectionType::Regenerate) as i64;
            let thumbs = (event.correction_type == CorrectionType::ThumbsDown) as i64;
            tx.execute(
                "INSERT INTO correction_stats
                   (skill_id, skill_name, times_corrected, times_edited,
                    times_regenerated, times_thumbs_down, last_correction)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)
                 ON CONFLICT(skill_id) DO UPDATE SET
                   times_corrected = times_corrected + 1,
                   times_edited = times_edited + excluded.times_edited,
                   times_regenerated = times_regenerated + excluded.times_regenerated,
                   times_thumbs_down = times_thumbs_down + excluded.times_thumbs_down,
                   last_correction = excluded.last_correction",
                params![
                    event.skill_id,
                    event.skill_name,
                    edit,
                    regen,
                    thumbs,
                    event.timestamp,
                ],
            )?;
            Ok(())
        })?;

        let mut result = CorrectionResult::default();
        if !event.skill_id.is_empty() {
            let penalty = event.correction_type.penalty();
            result.confidence_change = -penalty;
            result.new_confidence = self
                .skill_store
                .apply_confidence_penalty(&event.skill_id, penalty)?;
            if let Some(confidence) = result.new_confidence {
                tracing::info!(
                    "Correction penalty: skill '{}' confidence -> {:.2} (type={})",
                    event.skill_name,
                    confidence,
                    event.correction_type.as_str(),
                );
            }
        }
        Ok(result)
    }

    /// Correction stats for all skills, most corrected first.
    pub fn correction_stats(&self) -> Result<Vec<CorrectionStats>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT skill_id, skill_name, times_corrected, times_edited,
                        times_regenerated, times_thumbs_down, last_correction
                 FROM correction_stats ORDER BY times_corrected DESC",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok(CorrectionStats {
                    skill_id: row.get(0)?,
                    skill_name: row.get(1)?,
                    times_corrected: row.get(2)?,
                    times_edited: row.get(3)?,
                    times_regenerated: row.get(4)?,
                    times_thumbs_down: row.get(5)?,
                    last_correction: row.get(6)?,
                })
            })?;
            mapped.collect()
        })?)
    }

    /// Total corrections recorded.
    pub fn total_corrections(&self) -> Result<u64> {
        let n: i64 = self.db.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM corrections", [], |row| row.get(0))
        })?;
        Ok(n as u64)
    }

    /// The skill applied for a given message, if any was recorded.
    pub fn skill_for_message(&self, message_id: &str) -> Result<Option<String>> {
        self.db
            .read(|conn| {
                conn.query_row(
                    "SELECT skill_id FROM evaluations WHERE message_id = ?1
                     ORDER BY evaluated_at DESC LIMIT 1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .map_err(Into::into)
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
    use crate::skills::{Skill, SkillSource, SkillState, SkillType};
    use crate::storage::test_support::scratch_db;

    fn setup() -> (CorrectionLearner, SkillStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        let store = SkillStore::new(db.clone());
        (CorrectionLearner::new(db, store.clone()), store, dir)
    }

    fn event(skill: &Skill, correction_type: CorrectionType) -> CorrectionEvent {
        CorrectionEvent {
            correction_type,
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            original_snippet: "the old response".into(),
            corrected_snippet: String::new(),
            skill_id: skill.id.clone(),
            skill_name: skill.name.clone(),
            query_type: "factual/comparison".into(),
            timestamp: Utc::now(),
        }
    }

    fn verified_comparison_skill() -> Skill {
        let mut skill = Skill::new(
            "structured_comparison",
            SkillType::ResponseFormat,
            "Compare in a table.",
            vec!["compare".into()],
            SkillSource::Curriculum,
        );
        skill.confidence = 0.7;
        skill.state = SkillState::Verified;
        skill
    }

    #[test]
    fn test_regenerate_penalty() {
        let (learner, store, _dir) = setup();
        let skill = verified_comparison_skill();
        store.add_skill(&skill);

        let result = learner
            .record_correction(&event(&skill, CorrectionType::Regenerate))
            .unwrap();
        assert!((result.confidence_change + 0.08).abs() < 1e-9);
        let confidence = result.new_confidence.unwrap();
        assert!((confidence - 0.62).abs() < 1e-9);

        // Penalty does not change lifecycle state
        let updated = store.get_skill(&skill.id).unwrap().unwrap();
        assert_eq!(updated.state, SkillState::Verified);
    }

    #[test]
    fn test_penalty_scale_by_severity() {
        assert!(CorrectionType::Edit.penalty() < CorrectionType::Regenerate.penalty());
        assert!(CorrectionType::Regenerate.penalty() < CorrectionType::ThumbsDown.penalty());
        assert!(CorrectionType::ThumbsDown.penalty() < CorrectionType::Explicit.penalty());
    }

    #[test]
    fn test_stats_accumulate() {
        let (learner, store, _dir) = setup();
        let skill = verified_comparison_skill();
        store.add_skill(&skill);

        learner.record_correction(&event(&skill, CorrectionType::Edit)).unwrap();
        learner.record_correction(&event(&skill, CorrectionType::Edit)).unwrap();
        learner
            .record_correction(&event(&skill, CorrectionType::ThumbsDown))
            .unwrap();

        let stats = learner.correction_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].times_corrected, 3);
        assert_eq!(stats[0].times_edited, 2);
        assert_eq!(stats[0].times_thumbs_down, 1);
        assert_eq!(stats[0].times_regenerated, 0);
        assert_eq!(learner.total_corrections().unwrap(), 3);
    }

    #[test]
    fn test_confidence_floor() {
        let (learner, store, _dir) = setup();
        let mut skill = verified_comparison_skill();
        skill.confidence = 0.12;
        store.add_skill(&skill);

        let result = learner
            .record_correction(&event(&skill, CorrectionType::Explicit))
            .unwrap();
        assert!((result.new_confidence.unwrap() - 0.1).abs() < 1e-9);
    }
}
