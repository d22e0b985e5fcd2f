//! Response Evaluator
//!
//! Scores (query, response, skill) triples on a 1-5 scale and feeds the
//! result back into the skill store's confidence evolution. LLM-based when a
//! provider is wired in; structural heuristics otherwise. A timeout or
//! unparsable reply falls through to the heuristic path — evaluation can
//! never fail a turn.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::RegexBuilder;

use super::{Result, Skill, SkillEvaluation, SkillStore, SkillType};
use crate::llm::{LlmProvider, parse_json_from_text};

/// Score at or above which an application counts as a success
pub const SUCCESS_THRESHOLD: f64 = 3.5;

/// LLM evaluation deadline
const EVAL_DEADLINE: Duration = Duration::from_secs(15);

const EVAL_PROMPT: &str = "You are a response quality evaluator. Score this AI response.

USER QUERY: {query}
SKILL APPLIED: {skill_name} — {skill_description}
AI RESPONSE (first 800 chars): {response_snippet}

Score 1-5:
1 = Wrong/harmful/irrelevant
2 = Partially relevant but incomplete or inaccurate
3 = Adequate but could be better
4 = Good, addresses the query well
5 = Excellent, comprehensive and well-structured

Respond with ONLY this JSON:
{\"score\": 3, \"reasoning\": \"<one sentence>\"}";

/// Evaluates response quality to provide feedback for skill evolution.
pub struct ResponseEvaluator {
    skill_store: SkillStore,
    llm: Option<Arc<dyn LlmProvider>>,
    citation_re: regex::Regex,
    structure_re: regex::Regex,
    acknowledgment_re: regex::Regex,
}

impl ResponseEvaluator {
    /// Create an evaluator. With `llm = None` only the heuristic path runs.
    pub fn new(skill_store: SkillStore, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            skill_store,
            llm,
            citation_re: RegexBuilder::new(r"\[\d+\]|https?://|source:|according to")
                .case_insensitive(true)
                .build()
                .expect("citation pattern is valid"),
            structure_re: RegexBuilder::new(r"(?m)^\s*[-*•]\s|^\s*\d+[.)]\s")
                .build()
                .expect("structure pattern is valid"),
            acknowledgment_re: RegexBuilder::new(r"sorry|unfortunately|instead|alternative|however")
                .case_insensitive(true)
                .build()
                .expect("acknowledgment pattern is valid"),
        }
    }

    /// Evaluate a response where a skill was applied, persist the
    /// evaluation, and update the skill's confidence.
    pub async fn evaluate(
        &self,
        query: &str,
        response: &str,
        skill: &Skill,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<SkillEvaluation> {
        let (score, reasoning) = match &self.llm {
            Some(llm) => match self.llm_evaluate(llm.as_ref(), query, response, skill).await {
                Some(result) => result,
                None => self.heuristic_evaluate(query, response, skill),
            },
            None => self.heuristic_evaluate(query, response, skill),
        };

        let evaluation = SkillEvaluation {
            id: uuid::Uuid::new_v4().to_string(),
            skill_id: skill.id.clone(),
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            score,
            reasoning,
            query_text: clip(query, 200),
            response_snippet: clip(response, 500),
            evaluated_at: Utc::now(),
        };

        self.skill_store.record_evaluation(&evaluation);

        let success = score >= SUCCESS_THRESHOLD;
        let new_confidence = self.skill_store.update_confidence(&skill.id, success)?;
        tracing::info!(
            "Skill '{}' evaluated: score={:.1} success={} new_confidence={:?}",
            skill.name,
            score,
            success,
            new_confidence,
        );

        Ok(evaluation)
    }

    async fn llm_evaluate(
        &self,
        llm: &dyn LlmProvider,
        query: &str,
        response: &str,
        skill: &Skill,
    ) -> Option<(f64, String)> {
        let prompt = EVAL_PROMPT
            .replace("{query}", &clip(query, 300))
            .replace("{skill_name}", &skill.name)
            .replace("{skill_description}", &clip(&skill.description, 200))
            .replace("{response_snippet}", &clip(response, 800));

        let text = match llm.complete(&prompt, 100, EVAL_DEADLINE).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("LLM evaluation failed, falling back to heuristics: {e}");
                return None;
            }
        };

        let value = parse_json_from_text(&text)?;
        let score = value["score"].as_f64()?.clamp(1.0, 5.0);
        let reasoning = value["reasoning"]
            .as_str()
            .unwrap_or("LLM evaluation")
            .to_string();
        Some((score, reasoning))
    }

    /// Structural quality signals when no LLM is available.
    fn heuristic_evaluate(&self, query: &str, response: &str, skill: &Skill) -> (f64, String) {
        let mut signals: Vec<&str> = Vec::new();
        let mut score = 3.0f64;

        let query_words = query.split_whitespace().count();
        let response_words = response.split_whitespace().count();

        // Length proportional to query complexity
        if query_words > 10 && response_words > 100 {
            score += 0.3;
            signals.push("good_length");
        } else if response_words < 20 {
            score -= 0.5;
            signals.push("too_short");
        } else if response_words > 50 {
            score += 0.1;
            signals.push("adequate_length");
        }

        // Research/retrieval skills should cite and structure
        if matches!(
            skill.skill_type,
            SkillType::SearchStrategy | SkillType::RetrievalCombo
        ) {
            if self.citation_re.is_match(response) {
                score += 0.5;
                signals.push("has_citations");
            }
            if self.structure_re.is_match(response) {
                score += 0.2;
                signals.push("has_structure");
            }
        }

        // Code-formatting skills should actually emit code
        if skill.skill_type == SkillType::ResponseFormat && skill.name.to_lowercase().contains("code")
        {
            if response.contains("```") {
                score += 0.5;
                signals.push("has_code_block");
            }
        }

        // Error-recovery skills should acknowledge the issue
        if skill.skill_type == SkillType::ErrorRecovery && self.acknowledgment_re.is_match(response)
        {
            score += 0.3;
            signals.push("acknowledges_issue");
        }

        // Parroting the query back is not an answer
        if response_words > 5 {
            let query_set: std::collections::HashSet<String> = query
                .to_lowercase()
                .split_whitespace()
                .map(String::from)
                .collect();
            let response_set: std::collections::HashSet<String> = response
                .to_lowercase()
                .split_whitespace()
                .take(50)
                .map(String::from)
                .collect();
            let overlap = query_set.intersection(&response_set).count() as f64
                / query_set.len().max(1) as f64;
            if overlap > 0.8 {
                score -= 0.5;
                signals.push("mostly_repeats_query");
            }
        }

        let score = (score.clamp(1.0, 5.0) * 10.0).round() / 10.0;
        let reasoning = if signals.is_empty() {
            "Heuristic eval: neutral".to_string()
        } else {
            format!("Heuristic eval: {}", signals.join(", "))
        };
        (score, reasoning)
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
    use crate::skills::SkillSource;
    use crate::storage::test_support::scratch_db;

    fn setup() -> (ResponseEvaluator, SkillStore, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        let store = SkillStore::new(db);
        (ResponseEvaluator::new(store.clone(), None), store, dir)
    }

    fn research_skill() -> Skill {
        Skill::new(
            "multi_source_synthesis",
            SkillType::RetrievalCombo,
            "Search multiple sources and cite.",
            vec!["research".into()],
            SkillSource::Curriculum,
        )
    }

    #[tokio::test]
    async fn test_cited_structured_research_scores_high() {
        let (evaluator, store, _dir) = setup();
        let skill = research_skill();
        store.add_skill(&skill);

        let response = "Here is what the sources say about async runtimes in Rust today.\n\
            - Tokio dominates production deployments [1]\n\
            - smol targets minimalism [2]\n\
            - async-std is in maintenance mode [3]\n\
            According to the ecosystem survey, most crates target tokio first. \
            The scheduler designs differ mainly in work-stealing strategy, which \
            matters under uneven load patterns across cores and tasks.";
        let evaluation = evaluator
            .evaluate(
                "research the state of async runtimes in rust and cite your sources please",
                response,
                &skill,
                "m1",
                "c1",
            )
            .await
            .unwrap();

        assert!(evaluation.score >= 3.5, "score was {}", evaluation.score);
        assert!(evaluation.reasoning.contains("has_citations"));

        // Success path updated the skill
        let updated = store.get_skill(&skill.id).unwrap().unwrap();
        assert_eq!(updated.times_succeeded, 1);
        assert!(updated.confidence > 0.5);
    }

    #[tokio::test]
    async fn test_short_response_penalized() {
        let (evaluator, store, _dir) = setup();
        let skill = research_skill();
        store.add_skill(&skill);

        let evaluation = evaluator
            .evaluate("research async runtimes", "tokio.", &skill, "m1", "c1")
            .await
            .unwrap();
        assert!(evaluation.score < 3.5);
        let updated = store.get_skill(&skill.id).unwrap().unwrap();
        assert_eq!(updated.times_failed, 1);
        assert!(updated.confidence < 0.5);
    }

    #[tokio::test]
    async fn test_parroting_penalized() {
        let (evaluator, store, _dir) = setup();
        let skill = Skill::new(
            "context_aware_followup",
            SkillType::ConversationPattern,
            "Reference prior context.",
            vec!["what about".into()],
            SkillSource::Curriculum,
        );
        store.add_skill(&skill);

        let query = "tell me about the memory model of the borrow checker system";
        // Response is the query words shuffled — high overlap, low value
        let response = "the borrow checker system memory model about me tell of the";
        let evaluation = evaluator
            .evaluate(query, response, &skill, "m1", "c1")
            .await
            .unwrap();
        assert!(evaluation.reasoning.contains("mostly_repeats_query"));
        assert!(evaluation.score <= 3.0);
    }

    #[tokio::test]
    async fn test_error_recovery_acknowledgment() {
        let (evaluator, store, _dir) = setup();
        let skill = Skill::new(
            "debug_assistant",
            SkillType::ErrorRecovery,
            "Identify, explain, fix.",
            vec!["fix this error".into()],
            SkillSource::Curriculum,
        );
        store.add_skill(&skill);

        let response = "Unfortunately that endpoint was removed in v2. Instead, use the \
            batch API: it accepts the same payload shape and returns per-item status \
            codes so you can retry partial failures without replaying the whole batch.";
        let evaluation = evaluator
            .evaluate("fix this error from the old endpoint", response, &skill, "m1", "c1")
            .await
            .unwrap();
        assert!(evaluation.reasoning.contains("acknowledges_issue"));
    }

    #[tokio::test]
    async fn test_evaluation_is_persisted() {
        let (evaluator, store, _dir) = setup();
        let skill = research_skill();
        store.add_skill(&skill);
        evaluator
            .evaluate("research topic", "a perfectly adequate middle-length response about the topic at hand with enough words to avoid the short penalty in scoring", &skill, "m9", "c9")
            .await
            .unwrap();
        let evals = store.evaluations_for(&skill.id, 5).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].message_id, "m9");
        // State machine ran exactly once
        assert_eq!(store.get_skill(&skill.id).unwrap().unwrap().times_used, 1);
    }
}
