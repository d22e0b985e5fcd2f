//! Self-Reflection Engine
//!
//! Diagnoses WHY a skill application scored poorly and evolves the strategy
//! text in place, keeping a revision history. Also tracks query-type
//! exploration coverage with a UCB1-style bonus so the curriculum can steer
//! toward under-explored territory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{Result, Skill, SkillEvaluation, SkillState, SkillStore, SkillType};
use crate::llm::{LlmProvider, parse_json_from_text};
use crate::storage::Database;

/// Reflection only fires below this score
const REFLECTION_THRESHOLD: f64 = 3.0;
/// Never rewrite the same skill more than this many times
const MAX_REVISIONS_PER_SKILL: usize = 5;
/// Evolution requires at least this much confidence in the fix
const MIN_CONFIDENCE_IN_FIX: f64 = 0.3;
/// LLM reflection deadline
const REFLECT_DEADLINE: Duration = Duration::from_secs(20);

const REFLECTION_PROMPT: &str = "You are a strategy improvement analyst. A response strategy was applied but scored poorly.

ORIGINAL QUERY: {query}
STRATEGY APPLIED: {strategy}
AI RESPONSE (first 600 chars): {response_snippet}
EVALUATION SCORE: {score}/5
EVALUATION REASONING: {reasoning}

Analyze what went wrong and propose an improved strategy.

Respond with ONLY this JSON:
{
  \"failure_diagnosis\": \"<1-2 sentences>\",
  \"root_cause\": \"<one of: wrong_format, missing_info, too_verbose, off_topic, wrong_approach, incomplete>\",
  \"improved_strategy\": \"<the full revised strategy text, 2-4 sentences>\",
  \"confidence_in_fix\": 0.5
}";

/// Why a skill application failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    /// Response shape didn't fit the query
    WrongFormat,
    /// Required information was absent
    MissingInfo,
    /// Overlong for the ask
    TooVerbose,
    /// Drifted from the question
    OffTopic,
    /// Strategy itself was wrong
    WrongApproach,
    /// Stopped short
    Incomplete,
}

impl RootCause {
    /// Stable storage string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrongFormat => "wrong_format",
            Self::MissingInfo => "missing_info",
            Self::TooVerbose => "too_verbose",
            Self::OffTopic => "off_topic",
            Self::WrongApproach => "wrong_approach",
            Self::Incomplete => "incomplete",
        }
    }

    /// Parse from the storage string
    pub fn parse_name(s: &str) -> Self {
        match s {
            "wrong_format" => Self::WrongFormat,
            "missing_info" => Self::MissingInfo,
            "too_verbose" => Self::TooVerbose,
            "off_topic" => Self::OffTopic,
            "incomplete" => Self::Incomplete,
            _ => Self::WrongApproach,
        }
    }
}

/// A reflection on why a skill failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    /// Unique identifier
    pub id: String,
    /// Skill that failed
    pub skill_id: String,
    /// Evaluation that triggered this
    pub evaluation_id: String,
    /// What went wrong
    pub failure_diagnosis: String,
    /// Root cause category
    pub root_cause: RootCause,
    /// Proposed replacement strategy
    pub improved_strategy: String,
    /// Confidence the fix will work
    pub confidence_in_fix: f64,
    /// Whether the improvement was applied
    pub applied: bool,
    /// Creation time
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ExplorationState {
    type_counts: HashMap<String, u32>,
    type_successes: HashMap<String, u32>,
    type_last_seen: HashMap<String, chrono::DateTime<Utc>>,
    total_messages: u64,
}

/// Coverage entry for one query type.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationEntry {
    /// Observations
    pub count: u32,
    /// Successful skill applications
    pub successes: u32,
    /// successes / count
    pub success_rate: f64,
    /// UCB1-style exploration bonus
    pub exploration_bonus: f64,
}

/// Reflects on skill failures, evolves strategies, and tracks exploration.
pub struct ReflectionEngine {
    db: Arc<Database>,
    skill_store: SkillStore,
    llm: Option<Arc<dyn LlmProvider>>,
    exploration: Mutex<ExplorationState>,
}

impl ReflectionEngine {
    /// Create the engine.
    pub fn new(db: Arc<Database>, skill_store: SkillStore, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            db,
            skill_store,
            llm,
            exploration: Mutex::new(ExplorationState::default()),
        }
    }

    // ── Reflection ────────────────────────────────────────────

    /// Analyze a failed skill application. Returns `None` when the guards
    /// say not to reflect: score ≥ 3.0, brand-new skill, or revision cap hit.
    pub async fn reflect_on_failure(
        &self,
        skill: &Skill,
        evaluation: &SkillEvaluation,
        query: &str,
        response: &str,
    ) -> Result<Option<Reflection>> {
        if evaluation.score >= REFLECTION_THRESHOLD {
            return Ok(None);
        }
        if skill.times_used < 1 {
            return Ok(None);
        }
        let revision_count = self.revision_count(&skill.id)?;
        if revision_count >= MAX_REVISIONS_PER_SKILL {
            tracing::info!(
                "Skill '{}' hit max revisions ({MAX_REVISIONS_PER_SKILL}), skipping reflection",
                skill.name
            );
            return Ok(None);
        }

        let mut reflection = None;
        if let Some(llm) = &self.llm {
            reflection = self.llm_reflect(llm.as_ref(), skill, evaluation, query, response).await;
        }
        let reflection =
            reflection.unwrap_or_else(|| heuristic_reflect(skill, evaluation, query, response));

        self.persist_reflection(&reflection)?;
        tracing::info!(
            "Reflected on skill '{}' failure: root_cause={}, confidence_in_fix={:.2}",
            skill.name,
            reflection.root_cause.as_str(),
            reflection.confidence_in_fix,
        );
        Ok(Some(reflection))
    }

    async fn llm_reflect(
        &self,
        llm: &dyn LlmProvider,
        skill: &Skill,
        evaluation: &SkillEvaluation,
        query: &str,
        response: &str,
    ) -> Option<Reflection> {
        let prompt = REFLECTION_PROMPT
            .replace("{query}", &clip(query, 300))
            .replace("{strategy}", &clip(&skill.strategy, 400))
            .replace("{response_snippet}", &clip(response, 600))
            .replace("{score}", &format!("{:.1}", evaluation.score))
            .replace("{reasoning}", &clip(&evaluation.reasoning, 200));

        let text = match llm.complete(&prompt, 300, REFLECT_DEADLINE).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("LLM reflection failed: {e}");
                return None;
            }
        };
        let value = parse_json_from_text(&text)?;

        Some(Reflection {
            id: uuid::Uuid::new_v4().to_string(),
            skill_id: skill.id.clone(),
            evaluation_id: evaluation.id.clone(),
            failure_diagnosis: value["failure_diagnosis"]
                .as_str()
                .unwrap_or("Unknown failure")
                .to_string(),
            root_cause: RootCause::parse_name(value["root_cause"].as_str().unwrap_or("")),
            improved_strategy: value["improved_strategy"].as_str().unwrap_or("").to_string(),
            confidence_in_fix: value["confidence_in_fix"]
                .as_f64()
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            applied: false,
            created_at: Utc::now(),
        })
    }

    // ── Evolution ─────────────────────────────────────────────

    /// Apply a reflection to evolve a skill's strategy in place.
    ///
    /// Applies only when the improved strategy is non-empty, actually
    /// different, and the fix confidence clears [`MIN_CONFIDENCE_IN_FIX`].
    /// Records the revision, bumps confidence by 0.05 (cap 0.7), and demotes
    /// mastered skills to verified so they re-prove themselves.
    pub fn evolve_skill(&self, skill: &Skill, reflection: &Reflection) -> Result<bool> {
        if reflection.improved_strategy.is_empty() {
            return Ok(false);
        }
        if reflection.confidence_in_fix < MIN_CONFIDENCE_IN_FIX {
            tracing::debug!(
                "Skipping evolution for '{}': confidence_in_fix={:.2} too low",
                skill.name,
                reflection.confidence_in_fix,
            );
            return Ok(false);
        }
        if reflection.improved_strategy.trim() == skill.strategy.trim() {
            return Ok(false);
        }

        let Some(mut current) = self.skill_store.get_skill(&skill.id)? else {
            return Ok(false);
        };

        let revision_number = self.revision_count(&skill.id)? + 1;
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO skill_revisions
                   (skill_id, revision_number, strategy_before, strategy_after,
                    reflection_id, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    skill.id,
                    revision_number as i64,
                    current.strategy,
                    reflection.improved_strategy,
                    reflection.id,
                    reflection.failure_diagnosis,
                    Utc::now(),
                ],
            )
            .map(|_| ())
        })?;

        current.strategy = reflection.improved_strategy.clone();
        current.last_evaluated_at = Some(Utc::now());
        current.confidence = (current.confidence + 0.05).min(0.7);
        if current.state == SkillState::Mastered {
            current.state = SkillState::Verified;
        }

        let updated = self.skill_store.update_skill(&current);
        if updated {
            self.db.write(|conn| {
                conn.execute(
                    "UPDATE reflections SET applied = 1 WHERE id = ?1",
                    [&reflection.id],
                )
                .map(|_| ())
            })?;
            tracing::info!(
                "Evolved skill '{}' (revision {}): root_cause={}",
                skill.name,
                revision_number,
                reflection.root_cause.as_str(),
            );
        }
        Ok(updated)
    }

    /// Revision history for a skill, oldest first.
    pub fn revision_history(&self, skill_id: &str) -> Result<Vec<(u32, String, String, String)>> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT revision_number, strategy_before, strategy_after, reason
                 FROM skill_revisions WHERE skill_id = ?1 ORDER BY revision_number",
            )?;
            let mapped = stmt.query_map([skill_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect()
        })?)
    }

    fn revision_count(&self, skill_id: &str) -> Result<usize> {
        let n: i64 = self.db.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM skill_revisions WHERE skill_id = ?1",
                [skill_id],
                |row| row.get(0),
            )
        })?;
        Ok(n as usize)
    }

    fn persist_reflection(&self, reflection: &Reflection) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO reflections
                   (id, skill_id, evaluation_id, failure_diagnosis, root_cause,
                    improved_strategy, confidence_in_fix, applied, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    reflection.id,
                    reflection.skill_id,
                    reflection.evaluation_id,
                    reflection.failure_diagnosis,
                    reflection.root_cause.as_str(),
                    reflection.improved_strategy,
                    reflection.confidence_in_fix,
                    reflection.applied,
                    reflection.created_at,
                ],
            )
            .map(|_| ())
        })?;
        Ok(())
    }

    // ── Exploration tracking ──────────────────────────────────

    /// Track a query-type observation.
    pub fn record_query_type(&self, type_key: &str, success: bool) {
        let Ok(mut state) = self.exploration.lock() else {
            return;
        };
        *state.type_counts.entry(type_key.to_string()).or_default() += 1;
        if success {
            *state.type_successes.entry(type_key.to_string()).or_default() += 1;
        }
        state.type_last_seen.insert(type_key.to_string(), Utc::now());
        state.total_messages += 1;
    }

    /// Exploration bonus in [0, 1]; higher means the type needs attention.
    ///
    /// UCB1-style term `sqrt(2 ln(total) / count)` plus a recency bonus (up
    /// to 0.3 after 24h unseen) and a low-success-rate bonus (up to 0.2).
    pub fn exploration_bonus(&self, type_key: &str) -> f64 {
        let Ok(state) = self.exploration.lock() else {
            return 0.5;
        };
        let total = state.total_messages.max(1) as f64;
        let count = state.type_counts.get(type_key).copied().unwrap_or(0);
        let successes = state.type_successes.get(type_key).copied().unwrap_or(0);

        let ucb = if count == 0 {
            1.0
        } else {
            ((2.0 * (total + 1.0).ln()) / f64::from(count)).sqrt().min(1.0)
        };

        let recency = match state.type_last_seen.get(type_key) {
            Some(last) => {
                let seconds = (Utc::now() - *last).num_seconds().max(0) as f64;
                (seconds / 86_400.0 * 0.3).min(0.3)
            }
            None => 0.3,
        };

        let success_penalty = if count > 0 {
            (1.0 - f64::from(successes) / f64::from(count)) * 0.2
        } else {
            0.2
        };

        let bonus = (ucb * 0.5 + recency + success_penalty).min(1.0);
        (bonus * 1000.0).round() / 1000.0
    }

    /// Full coverage map over observed query types.
    pub fn exploration_map(&self) -> HashMap<String, ExplorationEntry> {
        let keys: Vec<String> = {
            let Ok(state) = self.exploration.lock() else {
                return HashMap::new();
            };
            state.type_counts.keys().cloned().collect()
        };
        let mut map = HashMap::new();
        for key in keys {
            let (count, successes) = {
                let state = self.exploration.lock().expect("exploration lock");
                (
                    state.type_counts.get(&key).copied().unwrap_or(0),
                    state.type_successes.get(&key).copied().unwrap_or(0),
                )
            };
            map.insert(
                key.clone(),
                ExplorationEntry {
                    count,
                    successes,
                    success_rate: f64::from(successes) / f64::from(count.max(1)),
                    exploration_bonus: self.exploration_bonus(&key),
                },
            );
        }
        map
    }
}

/// Rule-based reflection: diagnose by structural mismatch.
fn heuristic_reflect(
    skill: &Skill,
    evaluation: &SkillEvaluation,
    query: &str,
    response: &str,
) -> Reflection {
    let response_words = response.split_whitespace().count();
    let query_words = query.split_whitespace().count();

    let has_citations = response.contains("[1]") || response.to_lowercase().contains("source:");
    let has_structure = response.lines().any(|l| {
        let t = l.trim_start();
        t.starts_with('-') || t.starts_with('*') || t.starts_with('#')
    });

    let (diagnosis, root_cause, improved) = if response_words < 30 {
        (
            "Response was too brief for the query complexity".to_string(),
            RootCause::Incomplete,
            format!(
                "{} Provide detailed, comprehensive responses. Aim for at least 100 words.",
                skill.strategy
            ),
        )
    } else if matches!(
        skill.skill_type,
        SkillType::SearchStrategy | SkillType::RetrievalCombo
    ) && !has_citations
    {
        (
            "Response lacked source citations for a research-type query".to_string(),
            RootCause::MissingInfo,
            format!(
                "{} Always cite sources with numbered references [1], [2], etc.",
                skill.strategy
            ),
        )
    } else if matches!(
        skill.skill_type,
        SkillType::SearchStrategy | SkillType::RetrievalCombo
    ) && !has_structure
    {
        (
            "Response lacked structural organization".to_string(),
            RootCause::WrongFormat,
            format!(
                "{} Use headers and bullet points for better readability.",
                skill.strategy
            ),
        )
    } else if response_words > 500 && query_words < 10 {
        (
            "Response was excessively long for a simple query".to_string(),
            RootCause::TooVerbose,
            format!(
                "{} Match response length to query complexity. Be concise for simple questions.",
                skill.strategy
            ),
        )
    } else if skill.skill_type == SkillType::ErrorRecovery && !response.contains("```") {
        (
            "Technical response missing code examples".to_string(),
            RootCause::MissingInfo,
            format!(
                "{} Always include code examples with before/after comparison.",
                skill.strategy
            ),
        )
    } else {
        (
            "Response did not adequately address the query".to_string(),
            RootCause::WrongApproach,
            skill.strategy.clone(),
        )
    };

    Reflection {
        id: uuid::Uuid::new_v4().to_string(),
        skill_id: skill.id.clone(),
        evaluation_id: evaluation.id.clone(),
        failure_diagnosis: diagnosis,
        root_cause,
        improved_strategy: improved,
        confidence_in_fix: 0.5,
        applied: false,
        created_at: Utc::now(),
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
