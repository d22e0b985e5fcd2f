//! Playbook, outcome, pattern, and solution persistence

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Difficulty, Result, extract_keywords};
use crate::storage::Database;

/// Match threshold below which a playbook is not returned
const MATCH_FLOOR: f64 = 0.1;

/// How an outcome ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    /// Worked
    Success,
    /// Worked with caveats
    PartialSuccess,
    /// Did not work
    Failure,
    /// Unclear
    Unknown,
}

impl OutcomeType {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial_success" => Self::PartialSuccess,
            "failure" => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

/// A recorded task outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    /// Unique identifier
    pub id: String,
    /// What was attempted
    pub task_description: String,
    /// The solution that was applied
    pub solution_applied: String,
    /// How it ended
    pub outcome_type: OutcomeType,
    /// Who judged it (user, model, test suite)
    pub feedback_source: String,
    /// Skills that were applied
    pub skills_used: Vec<String>,
    /// Technologies involved
    pub technologies: Vec<String>,
    /// Error text for failures
    pub error_if_failed: Option<String>,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// One step in a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    /// 1-based step number
    pub step: u32,
    /// What to do
    pub action: String,
    /// Optional code/text template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// How to verify the step worked
    #[serde(default)]
    pub verify: String,
}

/// An ordered procedure generated by a capable model for later consumption
/// by weaker ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playbook {
    /// Unique identifier
    pub id: String,
    /// Short name
    pub name: String,
    /// What it accomplishes
    pub description: String,
    /// Task category
    pub task_type: String,
    /// Difficulty tier
    pub difficulty: Difficulty,
    /// Ordered steps
    pub steps: Vec<PlaybookStep>,
    /// Conditional logic (freeform JSON)
    pub decision_tree: serde_json::Value,
    /// Named code templates
    pub code_templates: serde_json::Value,
    /// Do-this-not-that rules
    pub guardrails: Vec<String>,
    /// Input/output examples
    pub examples: Vec<String>,
    /// Technologies involved
    pub technologies: Vec<String>,
    /// Search keywords
    pub keywords: Vec<String>,
    /// smart_model / manual / auto_from_outcome
    pub generated_by: String,
    /// Total uses
    pub times_used: u32,
    /// Successful uses
    pub success_count: u32,
    /// Failed uses
    pub failure_count: u32,
    /// Confidence in [0.1, 0.99]
    pub confidence: f64,
    /// Match score against the query (set by `find_playbooks`)
    #[serde(default)]
    pub match_score: f64,
}

impl Playbook {
    /// Build a new playbook shell.
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, steps: Vec<PlaybookStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            task_type: task_type.into(),
            difficulty: Difficulty::Medium,
            steps,
            decision_tree: serde_json::Value::Object(Default::default()),
            code_templates: serde_json::Value::Object(Default::default()),
            guardrails: vec![],
            examples: vec![],
            technologies: vec![],
            keywords: vec![],
            generated_by: "smart_model".to_string(),
            times_used: 0,
            success_count: 0,
            failure_count: 0,
            confidence: 0.7,
            match_score: 0.0,
        }
    }
}

/// A problem → solution mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    /// Unique identifier
    pub id: String,
    /// The problem statement
    pub problem: String,
    /// What solved it
    pub solution: String,
    /// Final code, if any
    pub code_after: String,
    /// Technologies involved
    pub technologies: Vec<String>,
    /// Times this solution worked
    pub success_count: u32,
}

/// SQLite-backed store for playbooks, outcomes, patterns, and solutions.
#[derive(Clone)]
pub struct PlaybookStore {
    db: Arc<Database>,
}

impl PlaybookStore {
    /// Create the store.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── Playbooks ─────────────────────────────────────────────

    /// Insert or replace a playbook. Keywords derive from the name,
    /// description, and task type when not provided.
    pub fn add_playbook(&self, playbook: &Playbook) -> Result<String> {
        let keywords = if playbook.keywords.is_empty() {
            extract_keywords(&format!(
                "{} {} {}",
                playbook.name, playbook.description, playbook.task_type
            ))
        } else {
            playbook.keywords.clone()
        };
        let now = Utc::now();
        self.db.write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO playbooks
                   (id, name, description, task_type, difficulty, steps, decision_tree,
                    code_templates, prerequisites, examples, guardrails, technologies,
                    keywords, generated_by, times_used, success_count, failure_count,
                    confidence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '[]', ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18, ?18)",
                params![
                    playbook.id,
                    playbook.name,
                    playbook.description,
                    playbook.task_type,
                    playbook.difficulty.as_str(),
                    serde_json::to_string(&playbook.steps).unwrap_or_else(|_| "[]".into()),
                    playbook.decision_tree.to_string(),
                    playbook.code_templates.to_string(),
                    serde_json::to_string(&playbook.examples).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&playbook.guardrails).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&playbook.technologies).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&keywords).unwrap_or_else(|_| "[]".into()),
                    playbook.generated_by,
                    playbook.times_used,
                    playbook.success_count,
                    playbook.failure_count,
                    playbook.confidence,
                    now,
                ],
            )
            .map(|_| ())
        })?;
        Ok(playbook.id.clone())
    }

    /// Load one playbook.
    pub fn get_playbook(&self, playbook_id: &str) -> Result<Option<Playbook>> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {PLAYBOOK_COLUMNS} FROM playbooks WHERE id = ?1"),
                [playbook_id],
                row_to_playbook,
            )
            .optional()
        })?)
    }

    /// Playbooks matching a task description, best match first.
    ///
    /// Score: `0.4·keyword_overlap + 0.3·task_type_hit + min(0.2·tech_hits,
    /// 0.3) + 0.1·confidence`, floor 0.1.
    pub fn find_playbooks(&self, query: &str, limit: usize) -> Result<Vec<Playbook>> {
        let query_keywords = extract_keywords(query);
        let query_lower = query.to_lowercase();

        let all: Vec<Playbook> = self.db.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {PLAYBOOK_COLUMNS} FROM playbooks"))?;
            let mapped = stmt.query_map([], row_to_playbook)?;
            mapped.collect()
        })?;

        let mut scored: Vec<Playbook> = all
            .into_iter()
            .filter_map(|mut playbook| {
                let overlap = playbook
                    .keywords
                    .iter()
                    .filter(|k| query_keywords.contains(k))
                    .count();
                let kw_score = overlap as f64 / query_keywords.len().max(1) as f64;
                let type_score = if !playbook.task_type.is_empty()
                    && query_lower.contains(&playbook.task_type.to_lowercase())
                {
                    0.5
                } else {
                    0.0
                };
                let tech_score: f64 = playbook
                    .technologies
                    .iter()
                    .filter(|t| query_lower.contains(&t.to_lowercase()))
                    .count() as f64
                    * 0.2;
                let score = kw_score * 0.4
                    + type_score * 0.3
                    + tech_score.min(0.3)
                    + playbook.confidence * 0.1;
                (score > MATCH_FLOOR).then(|| {
                    playbook.match_score = score.min(1.0);
                    playbook
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Update usage counters and confidence after a playbook run.
    pub fn update_playbook_usage(&self, playbook_id: &str, successful: bool) -> Result<()> {
        self.db.write(|conn| {
            if successful {
                conn.execute(
                    "UPDATE playbooks SET times_used = times_used + 1,
                            success_count = success_count + 1,
                            confidence = MIN(0.99, confidence + 0.03),
                            updated_at = ?2
                     WHERE id = ?1",
                    params![playbook_id, Utc::now()],
                )
            } else {
                conn.execute(
                    "UPDATE playbooks SET times_used = times_used + 1,
                            failure_count = failure_count + 1,
                            confidence = MAX(0.1, confidence - 0.08),
                            updated_at = ?2
                     WHERE id = ?1",
                    params![playbook_id, Utc::now()],
                )
            }
            .map(|_| ())
        })?;
        Ok(())
    }

    // ── Outcomes ──────────────────────────────────────────────

    /// Persist an outcome record.
    pub fn add_outcome(&self, outcome: &Outcome) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO outcomes
                   (id, user_id, task_description, solution_applied, outcome_type,
                    feedback_source, skills_used, technologies, error_if_failed, timestamp)
                 VALUES (?1, 'system', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    outcome.id,
                    outcome.task_description,
                    outcome.solution_applied,
                    outcome.outcome_type.as_str(),
                    outcome.feedback_source,
                    serde_json::to_string(&outcome.skills_used).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&outcome.technologies).unwrap_or_else(|_| "[]".into()),
                    outcome.error_if_failed,
                    outcome.timestamp,
                ],
            )
            .map(|_| ())
        })?;
        Ok(())
    }

    /// Outcome counts by type.
    pub fn outcome_stats(&self) -> Result<std::collections::HashMap<String, u64>> {
        Ok(self.db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT outcome_type, COUNT(*) FROM outcomes GROUP BY outcome_type")?;
            let mut map = std::collections::HashMap::new();
            for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
                let (t, n) = row?;
                map.insert(t, n as u64);
            }
            Ok(map)
        })?)
    }

    // ── Patterns ──────────────────────────────────────────────

    /// Record a (keywords, technologies, success) pattern observation.
    /// Returns the pattern id.
    pub fn record_pattern(
        &self,
        keywords: &[String],
        technologies: &[String],
        success: bool,
    ) -> Result<String> {
        let hash = pattern_hash(keywords, technologies);
        let now = Utc::now();
        self.db.transaction(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM patterns WHERE pattern_hash = ?1",
                    [&hash],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    let column = if success { "success_count" } else { "failure_count" };
                    tx.execute(
                        &format!(
                            "UPDATE patterns SET {column} = {column} + 1, last_seen = ?2
                             WHERE pattern_hash = ?1"
                        ),
                        params![hash, now],
                    )?;
                    Ok(id)
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO patterns
                           (id, pattern_hash, keywords, technologies, success_count,
                            failure_count, first_seen, last_seen)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        params![
                            id,
                            hash,
                            serde_json::to_string(keywords).unwrap_or_else(|_| "[]".into()),
                            serde_json::to_string(technologies).unwrap_or_else(|_| "[]".into()),
                            success as i64,
                            (!success) as i64,
                            now,
                        ],
                    )?;
                    Ok(id)
                }
            }
        })
        .map_err(Into::into)
    }

    /// Patterns that have earned a skill: ≥ `min_successes` at
    /// ≥ `min_success_rate`, not yet converted.
    pub fn patterns_ready_for_skill(
        &self,
        min_successes: u32,
        min_success_rate: f64,
    ) -> Result<Vec<(String, Vec<String>, Vec<String>, u32)>> {
        let rows: Vec<(String, String, String, u32, u32)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, keywords, technologies, success_count, failure_count
                 FROM patterns WHERE skill_generated = 0 AND success_count >= ?1",
            )?;
            let mapped = stmt.query_map([min_successes], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect()
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, keywords, technologies, successes, failures)| {
                let total = successes + failures;
                let rate = f64::from(successes) / f64::from(total.max(1));
                (rate >= min_success_rate).then(|| {
                    (
                        id,
                        serde_json::from_str(&keywords).unwrap_or_default(),
                        serde_json::from_str(&technologies).unwrap_or_default(),
                        successes,
                    )
                })
            })
            .collect())
    }

    /// Mark a pattern as converted to a skill.
    pub fn mark_pattern_converted(&self, pattern_id: &str, skill_id: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE patterns SET skill_generated = 1, skill_id = ?2 WHERE id = ?1",
                params![pattern_id, skill_id],
            )
            .map(|_| ())
        })?;
        Ok(())
    }

    // ── Solutions ─────────────────────────────────────────────

    /// Store a problem → solution mapping.
    pub fn store_solution(&self, problem: &str, solution: &str, code_after: &str, technologies: &[String]) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let keywords = extract_keywords(&format!("{problem} {solution}"));
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO solutions
                   (id, problem, solution, code_after, technologies, keywords,
                    success_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    id,
                    problem,
                    solution,
                    code_after,
                    serde_json::to_string(technologies).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&keywords).unwrap_or_else(|_| "[]".into()),
                    Utc::now(),
                ],
            )
            .map(|_| ())
        })?;
        Ok(id)
    }

    /// Solutions whose keywords overlap the query.
    pub fn search_solutions(&self, query: &str, limit: usize) -> Result<Vec<Solution>> {
        let query_keywords = extract_keywords(query);
        let rows: Vec<(Solution, Vec<String>)> = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, problem, solution, code_after, technologies, keywords, success_count
                 FROM solutions",
            )?;
            let mapped = stmt.query_map([], |row| {
                let keywords: Vec<String> =
                    serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
                Ok((
                    Solution {
                        id: row.get(0)?,
                        problem: row.get(1)?,
                        solution: row.get(2)?,
                        code_after: row.get(3)?,
                        technologies: serde_json::from_str(&row.get::<_, String>(4)?)
                            .unwrap_or_default(),
                        success_count: row.get(6)?,
                    },
                    keywords,
                ))
            })?;
            mapped.collect()
        })?;

        let mut scored: Vec<(Solution, usize)> = rows
            .into_iter()
            .filter_map(|(solution, keywords)| {
                let overlap = keywords
                    .iter()
                    .filter(|k| query_keywords.contains(k))
                    .count();
                (overlap > 0).then_some((solution, overlap))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(scored.into_iter().take(limit).map(|(s, _)| s).collect())
    }
}

fn pattern_hash(keywords: &[String], technologies: &[String]) -> String {
    let mut parts: Vec<String> = keywords.iter().take(10).map(|k| k.to_lowercase()).collect();
    parts.sort();
    let mut techs: Vec<String> = technologies.iter().map(|t| t.to_lowercase()).collect();
    techs.sort();
    parts.extend(techs);
    // Stable content hash; collisions only merge near-identical patterns
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in parts.join("|").bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

const PLAYBOOK_COLUMNS: &str = "id, name, description, task_type, difficulty, steps, \
    decision_tree, code_templates, examples, guardrails, technologies, keywords, \
    generated_by, times_used, success_count, failure_count, confidence";

fn row_to_playbook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Playbook> {
    Ok(Playbook {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        task_type: row.get(3)?,
        difficulty: Difficulty::parse_name(&row.get::<_, String>(4)?),
        steps: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        decision_tree: serde_json::from_str(&row.get::<_, String>(6)?)
            .unwrap_or(serde_json::Value::Null),
        code_templates: serde_json::from_str(&row.get::<_, String>(7)?)
            .unwrap_or(serde_json::Value::Null),
        examples: serde_json::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        guardrails: serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
        technologies: serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default(),
        keywords: serde_json::from_str(&row.get::<_, String>(11)?).unwrap_or_default(),
        generated_by: row.get(12)?,
        times_used: row.get(13)?,
        success_count: row.get(14)?,
        failure_count: row.get(15)?,
        confidence: row.get(16)?,
        match_score: 0.0,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::scratch_db;

    fn store() -> (PlaybookStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        (PlaybookStore::new(db), dir)
    }

    fn endpoint_playbook() -> Playbook {
        let mut playbook = Playbook::new(
            "add-rest-endpoint",
            "add-api-endpoint",
            vec![
                PlaybookStep {
                    step: 1,
                    action: "Define the route handler".into(),
                    template: None,
                    verify: "curl returns 200".into(),
                },
                PlaybookStep {
                    step: 2,
                    action: "Register it on the router".into(),
                    template: None,
                    verify: String::new(),
                },
            ],
        );
        playbook.description = "Add a REST endpoint to the backend".into();
        playbook.technologies = vec!["fastapi".into()];
        playbook.guardrails = vec!["Do not skip steps".into()];
        playbook
    }

    #[test]
    fn test_playbook_roundtrip() {
        let (store, _dir) = store();
        let playbook = endpoint_playbook();
        store.add_playbook(&playbook).unwrap();

        let loaded = store.get_playbook(&playbook.id).unwrap().unwrap();
        assert_eq!(loaded.name, "add-rest-endpoint");
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].verify, "curl returns 200");
        // Keywords derived from name/description/type
        assert!(loaded.keywords.contains(&"endpoint".to_string()));
    }

    #[test]
    fn test_find_playbooks_scores_and_ranks() {
        let (store, _dir) = store();
        store.add_playbook(&endpoint_playbook()).unwrap();
        let mut other = Playbook::new("fix-import-error", "fix-import-error", vec![]);
        other.description = "Resolve broken module imports".into();
        store.add_playbook(&other).unwrap();

        let found = store
            .find_playbooks("add a rest endpoint to the fastapi backend", 3)
            .unwrap();
        assert!(!found.is_empty());
        assert_eq!(found[0].name, "add-rest-endpoint");
        assert!(found[0].match_score > 0.3);
    }

    #[test]
    fn test_usage_updates_confidence() {
        let (store, _dir) = store();
        let playbook = endpoint_playbook();
        store.add_playbook(&playbook).unwrap();

        store.update_playbook_usage(&playbook.id, true).unwrap();
        let after_success = store.get_playbook(&playbook.id).unwrap().unwrap();
        assert!((after_success.confidence - 0.73).abs() < 1e-9);
        assert_eq!(after_success.success_count, 1);

        for _ in 0..20 {
            store.update_playbook_usage(&playbook.id, false).unwrap();
        }
        let floored = store.get_playbook(&playbook.id).unwrap().unwrap();
        assert!((floored.confidence - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_clustering() {
        let (store, _dir) = store();
        let keywords = vec!["deploy".to_string(), "docker".to_string()];
        let techs = vec!["docker".to_string()];

        for _ in 0..3 {
            store.record_pattern(&keywords, &techs, true).unwrap();
        }
        store.record_pattern(&keywords, &techs, false).unwrap();

        let ready = store.patterns_ready_for_skill(3, 0.7).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].3, 3);

        store.mark_pattern_converted(&ready[0].0, "skill-1").unwrap();
        assert!(store.patterns_ready_for_skill(3, 0.7).unwrap().is_empty());
    }

    #[test]
    fn test_pattern_below_rate_not_ready() {
        let (store, _dir) = store();
        let keywords = vec!["flaky".to_string()];
        for _ in 0..3 {
            store.record_pattern(&keywords, &[], true).unwrap();
        }
        for _ in 0..3 {
            store.record_pattern(&keywords, &[], false).unwrap();
        }
        // 3/6 = 50% success rate, below the 70% bar
        assert!(store.patterns_ready_for_skill(3, 0.7).unwrap().is_empty());
    }

    #[test]
    fn test_solutions_search() {
        let (store, _dir) = store();
        store
            .store_solution(
                "Connection pool exhausted under load",
                "Raise max_connections and add a semaphore at the API layer",
                "",
                &["postgres".to_string()],
            )
            .unwrap();
        let found = store
            .search_solutions("postgres connection pool exhausted", 3)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].solution.contains("semaphore"));
    }
}
