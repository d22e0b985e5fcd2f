//! Skill Store
//!
//! SQLite-backed CRUD, trigger matching, confidence evolution, and
//! composition tracking for the skill library. Confidence updates use an
//! asymmetric EMA: trust is earned slowly and lost quickly.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::{
    CONFIDENCE_CEILING, CONFIDENCE_FLOOR, Result, Skill, SkillEvaluation, SkillSource, SkillState,
    SkillType,
};
use crate::storage::Database;

/// Learning rate on success (~10 successes: 0.5 → 0.85)
const ALPHA_SUCCESS: f64 = 0.1;
/// Learning rate on failure (~5 failures: 0.85 → 0.5)
const ALPHA_FAILURE: f64 = 0.2;

/// Aggregate library statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SkillStats {
    /// Total skills
    pub total_skills: u64,
    /// state -> count
    pub by_state: std::collections::HashMap<String, u64>,
    /// type -> count
    pub by_type: std::collections::HashMap<String, u64>,
    /// Mean confidence of non-deprecated skills
    pub avg_confidence: f64,
    /// Total evaluations recorded
    pub total_evaluations: u64,
    /// Mean evaluation score
    pub avg_evaluation_score: f64,
}

/// SQLite-backed skill library.
#[derive(Clone)]
pub struct SkillStore {
    db: Arc<Database>,
}

impl SkillStore {
    /// Create a store over the shared database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── CRUD ──────────────────────────────────────────────────

    /// Add a skill. Returns false on a duplicate id (constraint violations
    /// never bubble past this boundary).
    pub fn add_skill(&self, skill: &Skill) -> bool {
        let result = self.db.write(|conn| {
            conn.execute(
                "INSERT INTO skills
                   (id, name, skill_type, description, strategy, trigger_patterns,
                    confidence, times_used, times_succeeded, times_failed,
                    parent_skill_ids, child_skill_ids, state, source,
                    created_at, last_used_at, last_evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    skill.id,
                    skill.name,
                    skill.skill_type.as_str(),
                    skill.description,
                    skill.strategy,
                    serde_json::to_string(&skill.trigger_patterns).unwrap_or_else(|_| "[]".into()),
                    skill.confidence,
                    skill.times_used,
                    skill.times_succeeded,
                    skill.times_failed,
                    serde_json::to_string(&skill.parent_skill_ids).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&skill.child_skill_ids).unwrap_or_else(|_| "[]".into()),
                    skill.state.as_str(),
                    skill.source.as_str(),
                    skill.created_at,
                    skill.last_used_at,
                    skill.last_evaluated_at,
                ],
            )
        });
        match result {
            Ok(_) => {
                tracing::info!("Added skill: {} ({})", skill.name, skill.id);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to add skill {}: {e}", skill.id);
                false
            }
        }
    }

    /// Load a skill by id.
    pub fn get_skill(&self, skill_id: &str) -> Result<Option<Skill>> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?1"),
                [skill_id],
                row_to_skill,
            )
            .optional()
        })?)
    }

    /// Load a skill by name.
    pub fn get_skill_by_name(&self, name: &str) -> Result<Option<Skill>> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE name = ?1"),
                [name],
                row_to_skill,
            )
            .optional()
        })?)
    }

    /// Update an existing skill in place.
    pub fn update_skill(&self, skill: &Skill) -> bool {
        let result = self.db.write(|conn| {
            conn.execute(
                "UPDATE skills SET name=?2, skill_type=?3, description=?4, strategy=?5,
                   trigger_patterns=?6, confidence=?7, times_used=?8, times_succeeded=?9,
                   times_failed=?10, parent_skill_ids=?11, child_skill_ids=?12, state=?13,
                   source=?14, last_used_at=?15, last_evaluated_at=?16
                 WHERE id=?1",
                params![
                    skill.id,
                    skill.name,
                    skill.skill_type.as_str(),
                    skill.description,
                    skill.strategy,
                    serde_json::to_string(&skill.trigger_patterns).unwrap_or_else(|_| "[]".into()),
                    skill.confidence,
                    skill.times_used,
                    skill.times_succeeded,
                    skill.times_failed,
                    serde_json::to_string(&skill.parent_skill_ids).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&skill.child_skill_ids).unwrap_or_else(|_| "[]".into()),
                    skill.state.as_str(),
                    skill.source.as_str(),
                    skill.last_used_at,
                    skill.last_evaluated_at,
                ],
            )
        });
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to update skill {}: {e}", skill.id);
                false
            }
        }
    }

    /// Delete a skill and its evaluations.
    pub fn delete_skill(&self, skill_id: &str) -> bool {
        self.db
            .transaction(|tx| {
                tx.execute("DELETE FROM evaluations WHERE skill_id = ?1", [skill_id])?;
                tx.execute("DELETE FROM skills WHERE id = ?1", [skill_id])?;
                Ok(())
            })
            .is_ok()
    }

    /// All skills, optionally filtered by state or type, highest confidence
    /// first.
    pub fn get_all_skills(
        &self,
        state: Option<SkillState>,
        skill_type: Option<SkillType>,
        limit: usize,
    ) -> Result<Vec<Skill>> {
        let mut clauses: Vec<String> = Vec::new();
        if let Some(s) = state {
            clauses.push(format!("state = '{}'", s.as_str()));
        }
        if let Some(t) = skill_type {
            clauses.push(format!("skill_type = '{}'", t.as_str()));
        }
        let where_clause = if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        };
        Ok(self.db.read(|conn| {
            let sql = format!(
                "SELECT {SKILL_COLUMNS} FROM skills WHERE {where_clause}
                 ORDER BY confidence DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map([limit as i64], row_to_skill)?;
            mapped.collect()
        })?)
    }

    // ── Matching ──────────────────────────────────────────────

    /// Skills whose trigger patterns match the query, ranked by
    /// `match_score x confidence`, best first. Deprecated skills never match.
    pub fn find_matching_skills(
        &self,
        query: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<Skill>> {
        let query_lower = query.to_lowercase();
        let query_words: std::collections::HashSet<&str> =
            query_lower.split_whitespace().collect();

        let candidates: Vec<Skill> = self.db.read(|conn| {
            let sql = format!(
                "SELECT {SKILL_COLUMNS} FROM skills
                 WHERE confidence >= ?1 AND state IN ('candidate', 'verified', 'mastered')
                 ORDER BY confidence DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map([min_confidence], row_to_skill)?;
            mapped.collect()
        })?;

        let mut scored: Vec<(Skill, f64)> = candidates
            .into_iter()
            .filter_map(|skill| {
                let match_score = compute_match_score(&query_lower, &query_words, &skill);
                (match_score > 0.1).then(|| {
                    let rank = match_score * skill.confidence;
                    (skill, rank)
                })
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    // ── Evaluation tracking ───────────────────────────────────

    /// Persist an evaluation record.
    pub fn record_evaluation(&self, evaluation: &SkillEvaluation) -> bool {
        self.db
            .write(|conn| {
                conn.execute(
                    "INSERT INTO evaluations
                       (id, skill_id, message_id, conversation_id, score,
                        reasoning, query_text, response_snippet, evaluated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        evaluation.id,
                        evaluation.skill_id,
                        evaluation.message_id,
                        evaluation.conversation_id,
                        evaluation.score,
                        evaluation.reasoning,
                        evaluation.query_text,
                        evaluation.response_snippet,
                        evaluation.evaluated_at,
                    ],
                )
                .map(|_| ())
            })
            .is_ok()
    }

    /// Evaluations for one skill, newest first.
    pub fn evaluations_for(&self, skill_id: &str, limit: usize) -> Result<Vec<SkillEvaluation>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, skill_id, message_id, conversation_id, score, reasoning,
                        query_text, response_snippet, evaluated_at
                 FROM evaluations WHERE skill_id = ?1
                 ORDER BY evaluated_at DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![skill_id, limit as i64], |row| {
                Ok(SkillEvaluation {
                    id: row.get(0)?,
                    skill_id: row.get(1)?,
                    message_id: row.get(2)?,
                    conversation_id: row.get(3)?,
                    score: row.get(4)?,
                    reasoning: row.get(5)?,
                    query_text: row.get(6)?,
                    response_snippet: row.get(7)?,
                    evaluated_at: row.get(8)?,
                })
            })?;
            mapped.collect()
        })?)
    }

    // ── Confidence evolution ──────────────────────────────────

    /// Update skill confidence after an outcome.
    ///
    /// Asymmetric EMA toward 1.0 (success, α=0.1) or 0.0 (failure, α=0.2),
    /// clamped to [0.05, 0.99], then the lifecycle state machine runs.
    /// Returns the new confidence.
    pub fn update_confidence(&self, skill_id: &str, success: bool) -> Result<Option<f64>> {
        let Some(mut skill) = self.get_skill(skill_id)? else {
            return Ok(None);
        };

        let (alpha, target) = if success {
            (ALPHA_SUCCESS, 1.0)
        } else {
            (ALPHA_FAILURE, 0.0)
        };
        skill.confidence = skill.confidence * (1.0 - alpha) + target * alpha;
        skill.confidence = skill.confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING);

        if success {
            skill.times_succeeded += 1;
        } else {
            skill.times_failed += 1;
        }
        skill.times_used += 1;
        let now = Utc::now();
        skill.last_used_at = Some(now);
        skill.last_evaluated_at = Some(now);

        if skill.confidence >= 0.85 && skill.times_succeeded >= 5 {
            skill.state = SkillState::Mastered;
        } else if skill.confidence >= 0.6 && skill.times_succeeded >= 2 {
            skill.state = SkillState::Verified;
        } else if skill.confidence < 0.2 {
            skill.state = SkillState::Deprecated;
        }

        self.update_skill(&skill);
        Ok(Some(skill.confidence))
    }

    /// Apply a correction penalty atomically (no read-modify-write race with
    /// concurrent evaluation updates). Returns the new confidence.
    pub fn apply_confidence_penalty(&self, skill_id: &str, penalty: f64) -> Result<Option<f64>> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE skills SET confidence = MAX(0.1, confidence - ?2) WHERE id = ?1",
                params![skill_id, penalty],
            )
            .map(|_| ())
        })?;
        Ok(self
            .get_skill(skill_id)?
            .map(|s| s.confidence))
    }

    // ── Composition ───────────────────────────────────────────

    /// Log a composition event.
    pub fn log_composition(&self, parent_ids: &[String], child_id: &str, method: &str, reasoning: &str) {
        let result = self.db.write(|conn| {
            conn.execute(
                "INSERT INTO composition_log (parent_ids, child_id, method, reasoning, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    serde_json::to_string(parent_ids).unwrap_or_else(|_| "[]".into()),
                    child_id,
                    method,
                    reasoning,
                    Utc::now(),
                ],
            )
            .map(|_| ())
        });
        if let Err(e) = result {
            tracing::warn!("Failed to log composition: {e}");
        }
    }

    /// The composition tree around a skill: the skill, its parents, and its
    /// children.
    pub fn get_composition_tree(
        &self,
        skill_id: &str,
    ) -> Result<Option<(Skill, Vec<Skill>, Vec<Skill>)>> {
        let Some(skill) = self.get_skill(skill_id)? else {
            return Ok(None);
        };
        let mut parents = Vec::new();
        for pid in &skill.parent_skill_ids {
            if let Some(parent) = self.get_skill(pid)? {
                parents.push(parent);
            }
        }
        let mut children = Vec::new();
        for cid in &skill.child_skill_ids {
            if let Some(child) = self.get_skill(cid)? {
                children.push(child);
            }
        }
        Ok(Some((skill, parents, children)))
    }

    // ── Stats ─────────────────────────────────────────────────

    /// Aggregate statistics for the library.
    pub fn get_skill_stats(&self) -> Result<SkillStats> {
        Ok(self.db.read(|conn| {
            let total_skills: u64 =
                conn.query_row("SELECT COUNT(*) FROM skills", [], |r| r.get::<_, i64>(0))?
                    as u64;
            let mut by_state = std::collections::HashMap::new();
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM skills GROUP BY state")?;
            for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
                let (state, count) = row?;
                by_state.insert(state, count as u64);
            }
            let mut by_type = std::collections::HashMap::new();
            let mut stmt =
                conn.prepare("SELECT skill_type, COUNT(*) FROM skills GROUP BY skill_type")?;
            for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
                let (t, count) = row?;
                by_type.insert(t, count as u64);
            }
            let avg_confidence: f64 = conn.query_row(
                "SELECT COALESCE(AVG(confidence), 0.0) FROM skills WHERE state != 'deprecated'",
                [],
                |r| r.get(0),
            )?;
            let total_evaluations: u64 = conn
                .query_row("SELECT COUNT(*) FROM evaluations", [], |r| {
                    r.get::<_, i64>(0)
                })?
                as u64;
            let avg_evaluation_score: f64 = conn.query_row(
                "SELECT COALESCE(AVG(score), 0.0) FROM evaluations",
                [],
                |r| r.get(0),
            )?;
            Ok(SkillStats {
                total_skills,
                by_state,
                by_type,
                avg_confidence,
                total_evaluations,
                avg_evaluation_score,
            })
        })?)
    }
}

const SKILL_COLUMNS: &str = "id, name, skill_type, description, strategy, trigger_patterns, \
     confidence, times_used, times_succeeded, times_failed, parent_skill_ids, \
     child_skill_ids, state, source, created_at, last_used_at, last_evaluated_at";

fn row_to_skill(row: &rusqlite::Row<'_>) -> rusqlite::Result<Skill> {
    Ok(Skill {
        id: row.get(0)?,
        name: row.get(1)?,
        skill_type: SkillType::parse_name(&row.get::<_, String>(2)?),
        description: row.get(3)?,
        strategy: row.get(4)?,
        trigger_patterns: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        confidence: row.get(6)?,
        times_used: row.get(7)?,
        times_succeeded: row.get(8)?,
        times_failed: row.get(9)?,
        parent_skill_ids: serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default(),
        child_skill_ids: serde_json::from_str(&row.get::<_, String>(11)?).unwrap_or_default(),
        state: SkillState::parse_name(&row.get::<_, String>(12)?),
        source: SkillSource::parse_name(&row.get::<_, String>(13)?),
        created_at: row.get(14)?,
        last_used_at: row.get(15)?,
        last_evaluated_at: row.get(16)?,
    })
}

/// Best trigger-pattern match: keyword overlap (Jaccard-ish against the
/// pattern's word set) plus a 0.3 substring-containment bonus, capped at 1.0.
fn compute_match_score(
    query_lower: &str,
    query_words: &std::collections::HashSet<&str>,
    skill: &Skill,
) -> f64 {
    let mut best: f64 = 0.0;
    for pattern in &skill.trigger_patterns {
        let pattern_lower = pattern.to_lowercase();
        let pattern_words: Vec<&str> = pattern_lower.split_whitespace().collect();
        let kw_score = if pattern_words.is_empty() {
            0.0
        } else {
            let overlap = pattern_words
                .iter()
                .filter(|w| query_words.contains(**w))
                .count();
            overlap as f64 / pattern_words.len() as f64
        };
        let substr_bonus = if query_lower.contains(&pattern_lower) {
            0.3
        } else {
            0.0
        };
        best = best.max(kw_score + substr_bonus);
    }
    best.min(1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::scratch_db;

    fn store() -> (SkillStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        (SkillStore::new(db), dir)
    }

    fn comparison_skill() -> Skill {
        let mut skill = Skill::new(
            "structured_comparison",
            SkillType::ResponseFormat,
            "Format the comparison as a structured table.",
            vec!["compare".into(), "versus".into(), "vs".into()],
            SkillSource::Curriculum,
        );
        skill.description = "Side-by-side comparisons".into();
        skill
    }

    #[test]
    fn test_add_and_duplicate_rejected() {
        let (store, _dir) = store();
        let skill = comparison_skill();
        assert!(store.add_skill(&skill));
        assert!(!store.add_skill(&skill));
        assert_eq!(store.get_skill_stats().unwrap().total_skills, 1);
    }

    #[test]
    fn test_find_matching_ranks_by_match_and_confidence() {
        let (store, _dir) = store();
        let comparison = comparison_skill();
        store.add_skill(&comparison);
        let mut other = Skill::new(
            "fact_lookup",
            SkillType::SearchStrategy,
            "Answer directly first.",
            vec!["who is".into(), "when did".into()],
            SkillSource::Curriculum,
        );
        other.confidence = 0.9;
        store.add_skill(&other);

        let matches = store
            .find_matching_skills("compare Rust vs Go", 0.4, 3)
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "structured_comparison");
    }

    #[test]
    fn test_deprecated_skills_never_match() {
        let (store, _dir) = store();
        let mut skill = comparison_skill();
        skill.state = SkillState::Deprecated;
        skill.confidence = 0.9;
        store.add_skill(&skill);
        let matches = store
            .find_matching_skills("compare Rust vs Go", 0.1, 3)
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_ema_success_growth() {
        let (store, _dir) = store();
        let skill = comparison_skill();
        store.add_skill(&skill);

        let mut confidence = 0.5;
        for _ in 0..10 {
            confidence = store.update_confidence(&skill.id, true).unwrap().unwrap();
        }
        // 10 consecutive successes from 0.5 lifts confidence past 0.82
        assert!(confidence >= 0.82, "confidence was {confidence}");
    }

    #[test]
    fn test_ema_failure_decay() {
        let (store, _dir) = store();
        let mut skill = comparison_skill();
        skill.confidence = 0.85;
        store.add_skill(&skill);

        let mut confidence = 0.85;
        for _ in 0..5 {
            confidence = store.update_confidence(&skill.id, false).unwrap().unwrap();
        }
        // 5 consecutive failures from 0.85 drops confidence to 0.5 or below
        assert!(confidence <= 0.5, "confidence was {confidence}");
    }

    #[test]
    fn test_state_machine_promotion_and_deprecation() {
        let (store, _dir) = store();
        let skill = comparison_skill();
        store.add_skill(&skill);

        for _ in 0..3 {
            store.update_confidence(&skill.id, true).unwrap();
        }
        assert_eq!(
            store.get_skill(&skill.id).unwrap().unwrap().state,
            SkillState::Verified
        );

        for _ in 0..9 {
            store.update_confidence(&skill.id, true).unwrap();
        }
        assert_eq!(
            store.get_skill(&skill.id).unwrap().unwrap().state,
            SkillState::Mastered
        );

        for _ in 0..20 {
            store.update_confidence(&skill.id, false).unwrap();
        }
        let sunk = store.get_skill(&skill.id).unwrap().unwrap();
        assert_eq!(sunk.state, SkillState::Deprecated);
        assert!(sunk.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_confidence_clamped_to_ceiling() {
        let (store, _dir) = store();
        let mut skill = comparison_skill();
        skill.confidence = 0.98;
        store.add_skill(&skill);
        for _ in 0..50 {
            store.update_confidence(&skill.id, true).unwrap();
        }
        let updated = store.get_skill(&skill.id).unwrap().unwrap();
        assert!(updated.confidence <= CONFIDENCE_CEILING);
    }

    #[test]
    fn test_penalty_is_atomic_and_floored() {
        let (store, _dir) = store();
        let mut skill = comparison_skill();
        skill.confidence = 0.15;
        store.add_skill(&skill);
        let after = store
            .apply_confidence_penalty(&skill.id, 0.12)
            .unwrap()
            .unwrap();
        assert!((after - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_composition_tree() {
        let (store, _dir) = store();
        let parent_a = comparison_skill();
        let mut parent_b = Skill::new(
            "multi_source_synthesis",
            SkillType::RetrievalCombo,
            "Search multiple sources.",
            vec!["research".into()],
            SkillSource::Curriculum,
        );
        parent_b.confidence = 0.7;
        store.add_skill(&parent_a);
        store.add_skill(&parent_b);

        let mut child = Skill::new(
            "search_then_compare",
            SkillType::RetrievalCombo,
            "Search, then compare.",
            vec!["research and compare".into()],
            SkillSource::Composed,
        );
        child.parent_skill_ids = vec![parent_a.id.clone(), parent_b.id.clone()];
        store.add_skill(&child);
        store.log_composition(&child.parent_skill_ids, &child.id, "auto", "parents verified");

        let (skill, parents, children) = store.get_composition_tree(&child.id).unwrap().unwrap();
        assert_eq!(skill.name, "search_then_compare");
        assert_eq!(parents.len(), 2);
        assert!(children.is_empty());
    }

    #[test]
    fn test_record_and_read_evaluations() {
        let (store, _dir) = store();
        let skill = comparison_skill();
        store.add_skill(&skill);
        let eval = SkillEvaluation {
            id: uuid::Uuid::new_v4().to_string(),
            skill_id: skill.id.clone(),
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            score: 4.0,
            reasoning: "good structure".into(),
            query_text: "compare a vs b".into(),
            response_snippet: "| a | b |".into(),
            evaluated_at: Utc::now(),
        };
        assert!(store.record_evaluation(&eval));
        let evals = store.evaluations_for(&skill.id, 10).unwrap();
        assert_eq!(evals.len(), 1);
        assert!((evals[0].score - 4.0).abs() < f64::EPSILON);
    }
}
