//! Voyager interceptors
//!
//! Wires the skill subsystems into the turn pipeline. `before_llm` classifies
//! the query and injects the best matching strategy as a system message;
//! `after_llm` hands evaluation, reflection, extraction, and retrieval
//! learning to the background runner so the response path never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    CurriculumEngine, QueryClassification, QueryClassifier, ReflectionEngine, ResponseEvaluator,
    RetrievalLearner, RetrievalOutcome, Result, Skill, SkillExtractor, SkillStore,
};
use crate::llm::ProviderMessage;
use crate::runtime::TaskRunner;

/// Default minimum confidence for a skill to be applied
const DEFAULT_MIN_CONFIDENCE: f64 = 0.4;

/// What one turn's before-pass decided; the caller threads it through to the
/// after-pass (no ambient state between interceptors).
#[derive(Debug, Clone, Default)]
pub struct TurnLearningState {
    /// The user query that was classified
    pub query: String,
    /// Classification result
    pub classification: Option<QueryClassification>,
    /// The skill injected this turn, if any
    pub applied_skill: Option<Skill>,
}

/// Which retrieval sources ran this turn and whether they produced results.
#[derive(Debug, Clone, Default)]
pub struct RetrievalActivity {
    /// (source, was_used, had_results)
    pub sources: Vec<(String, bool, bool)>,
}

impl RetrievalActivity {
    /// Record one source's activity.
    pub fn record(&mut self, source: &str, was_used: bool, had_results: bool) {
        self.sources.push((source.to_string(), was_used, had_results));
    }
}

/// The Voyager core: observe, score, evolve, propose.
#[derive(Clone)]
pub struct SkillVoyager {
    classifier: Arc<QueryClassifier>,
    store: SkillStore,
    evaluator: Arc<ResponseEvaluator>,
    reflection: Arc<ReflectionEngine>,
    extractor: Arc<SkillExtractor>,
    curriculum: Arc<CurriculumEngine>,
    retrieval_learner: RetrievalLearner,
    runner: TaskRunner,
    min_confidence: f64,
    message_count: Arc<AtomicU64>,
}

impl SkillVoyager {
    /// Wire the voyager together.
    pub fn new(
        classifier: QueryClassifier,
        store: SkillStore,
        evaluator: ResponseEvaluator,
        reflection: ReflectionEngine,
        extractor: SkillExtractor,
        curriculum: CurriculumEngine,
        retrieval_learner: RetrievalLearner,
        runner: TaskRunner,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            store,
            evaluator: Arc::new(evaluator),
            reflection: Arc::new(reflection),
            extractor: Arc::new(extractor),
            curriculum: Arc::new(curriculum),
            retrieval_learner,
            runner,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            message_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bootstrap: seed the library from templates when it's empty.
    pub fn initialize(&self) -> Result<usize> {
        let stats = self.store.get_skill_stats()?;
        if stats.total_skills == 0 {
            return self.curriculum.auto_seed_default();
        }
        Ok(0)
    }

    /// The underlying skill store.
    pub fn store(&self) -> &SkillStore {
        &self.store
    }

    /// The reflection engine (exploration map access).
    pub fn reflection(&self) -> &ReflectionEngine {
        &self.reflection
    }

    /// The retrieval learner.
    pub fn retrieval_learner(&self) -> &RetrievalLearner {
        &self.retrieval_learner
    }

    // ── Before-LLM interceptor ────────────────────────────────

    /// Classify the latest user message and, when a skill matches above the
    /// confidence floor, inject its strategy as a system message immediately
    /// before the last user message. Returns the state the after-pass needs.
    pub fn before_llm(&self, messages: &mut Vec<ProviderMessage>) -> TurnLearningState {
        let mut state = TurnLearningState::default();

        let Some(user_msg) = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content_text())
            .map(String::from)
        else {
            return state;
        };
        state.query = user_msg.clone();

        let history_len = messages
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .count()
            .saturating_sub(1);
        let classification = self.classifier.classify(&user_msg, history_len);
        tracing::debug!(
            "Query classified: {} (confidence={})",
            classification.type_key(),
            classification.confidence,
        );

        let matching = self
            .store
            .find_matching_skills(&user_msg, self.min_confidence, 2)
            .unwrap_or_default();

        if let Some(best) = matching.into_iter().next() {
            let injection = ProviderMessage::text(
                "system",
                format!(
                    "[SKILL: {}] Apply this response strategy: {}",
                    best.name, best.strategy
                ),
            );
            // Immediately before the last user message, so it sits in the
            // model's most recent context
            let insert_idx = messages
                .iter()
                .rposition(|m| m.role == "user")
                .unwrap_or(messages.len());
            messages.insert(insert_idx, injection);

            tracing::info!(
                "Applied skill '{}' (confidence={:.2}) to {} query",
                best.name,
                best.confidence,
                classification.type_key(),
            );
            state.applied_skill = Some(best);
        }

        state.classification = Some(classification);
        state
    }

    // ── After-LLM interceptor ─────────────────────────────────

    /// Kick off background learning for the finished turn: evaluation and
    /// confidence updates when a skill was applied, extraction when none
    /// was, retrieval-outcome recording either way, and a curriculum tick
    /// when due. Returns immediately.
    pub async fn after_llm(
        &self,
        response: String,
        state: TurnLearningState,
        message_id: String,
        conversation_id: String,
        activity: RetrievalActivity,
    ) {
        self.message_count.fetch_add(1, Ordering::Relaxed);

        let voyager = self.clone();
        self.runner
            .spawn("learning", async move {
                if let Err(e) = voyager
                    .background_learn(&response, &state, &message_id, &conversation_id, &activity)
                    .await
                {
                    tracing::error!("Background learning failed: {e}");
                }
            })
            .await;

        if self.curriculum.should_run() {
            let curriculum = self.curriculum.clone();
            self.runner
                .spawn("curriculum", async move {
                    match curriculum.background_tick() {
                        Ok(added) if added > 0 => {
                            tracing::info!("Curriculum tick added {added} skills");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Curriculum engine failed: {e}"),
                    }
                })
                .await;
        }
    }

    /// Await all pending learning work (tests and shutdown).
    pub async fn drain_learning(&self) -> usize {
        self.runner.drain_pending("learning").await
    }

    async fn background_learn(
        &self,
        response: &str,
        state: &TurnLearningState,
        message_id: &str,
        conversation_id: &str,
        activity: &RetrievalActivity,
    ) -> Result<()> {
        let Some(classification) = &state.classification else {
            return Ok(());
        };

        self.reflection
            .record_query_type(&classification.type_key(), state.applied_skill.is_some());

        // Retrieval score defaults to neutral until an evaluation completes
        // in this same task; the learner never reaches across task
        // boundaries for a score
        let mut response_score = 3.0;

        if let Some(skill) = &state.applied_skill {
            let evaluation = self
                .evaluator
                .evaluate(&state.query, response, skill, message_id, conversation_id)
                .await?;
            response_score = evaluation.score;

            if evaluation.score < 3.0 {
                if let Some(reflection) = self
                    .reflection
                    .reflect_on_failure(skill, &evaluation, &state.query, response)
                    .await?
                {
                    if reflection.confidence_in_fix >= 0.4 {
                        self.reflection.evolve_skill(skill, &reflection)?;
                    }
                }
            }
        } else {
            self.extractor
                .maybe_extract(&state.query, response, classification, false)
                .await?;
        }

        for (source, was_used, had_results) in &activity.sources {
            let outcome = RetrievalOutcome {
                query_type: classification.type_key(),
                source: source.clone(),
                was_used: *was_used,
                had_results: *had_results,
                response_score,
                query_text: clip(&state.query, 100),
                timestamp: chrono::Utc::now(),
            };
            self.retrieval_learner.record_outcome(&outcome)?;
        }
        Ok(())
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
    use crate::skills::{SkillSource, SkillState, SkillType};
    use crate::storage::test_support::scratch_db;

    fn build_voyager() -> (SkillVoyager, tempfile::TempDir) {
        let (db, dir) = scratch_db();
        let store = SkillStore::new(db.clone());
        let voyager = SkillVoyager::new(
            QueryClassifier::new(),
            store.clone(),
            ResponseEvaluator::new(store.clone(), None),
            ReflectionEngine::new(db.clone(), store.clone(), None),
            SkillExtractor::new(store.clone(), None),
            CurriculumEngine::new(store),
            RetrievalLearner::new(db),
            TaskRunner::new(),
        );
        (voyager, dir)
    }

    fn seeded_comparison_skill(voyager: &SkillVoyager) -> Skill {
        let mut skill = Skill::new(
            "structured_comparison",
            SkillType::ResponseFormat,
            "Format the comparison as a structured table.",
            vec!["compare".into(), "vs".into()],
            SkillSource::Curriculum,
        );
        skill.confidence = 0.7;
        skill.state = SkillState::Verified;
        voyager.store().add_skill(&skill);
        skill
    }

    #[test]
    fn test_initialize_seeds_empty_library() {
        let (voyager, _dir) = build_voyager();
        let added = voyager.initialize().unwrap();
        assert!((1..=5).contains(&added));
        // Second call is a no-op
        assert_eq!(voyager.initialize().unwrap(), 0);
    }

    #[test]
    fn test_before_llm_injects_skill_before_last_user_message() {
        let (voyager, _dir) = build_voyager();
        seeded_comparison_skill(&voyager);

        let mut messages = vec![
            ProviderMessage::text("system", "persona"),
            ProviderMessage::text("user", "earlier question"),
            ProviderMessage::text("assistant", "earlier answer"),
            ProviderMessage::text("user", "compare Rust vs Go"),
        ];
        let state = voyager.before_llm(&mut messages);

        assert_eq!(state.applied_skill.as_ref().unwrap().name, "structured_comparison");
        assert_eq!(messages.len(), 5);
        // Injection sits immediately before the last user message
        assert_eq!(messages[3].role, "system");
        let injected = messages[3].content_text().unwrap();
        assert!(injected.starts_with("[SKILL: structured_comparison]"));
        assert!(injected.contains("Apply this response strategy:"));
        assert_eq!(messages[4].content_text(), Some("compare Rust vs Go"));
    }

    #[test]
    fn test_before_llm_no_match_leaves_messages_untouched() {
        let (voyager, _dir) = build_voyager();
        seeded_comparison_skill(&voyager);

        let mut messages = vec![ProviderMessage::text("user", "tell me about gardening")];
        let state = voyager.before_llm(&mut messages);
        assert!(state.applied_skill.is_none());
        assert_eq!(messages.len(), 1);
        assert!(state.classification.is_some());
    }

    #[tokio::test]
    async fn test_after_llm_evaluates_and_records_retrieval() {
        let (voyager, _dir) = build_voyager();
        let skill = seeded_comparison_skill(&voyager);

        let mut messages = vec![ProviderMessage::text("user", "compare Rust vs Go")];
        let state = voyager.before_llm(&mut messages);
        assert!(state.applied_skill.is_some());

        let mut activity = RetrievalActivity::default();
        activity.record("memory", true, true);
        activity.record("graph", true, false);

        voyager
            .after_llm(
                "| Rust | Go |\n|---|---|\n| borrow checker | garbage collector |\n\
                 Rust favors zero-cost abstractions while Go favors simplicity. \
                 Both compile fast enough for day-to-day iteration, and each has a \
                 mature ecosystem for network services in production today."
                    .to_string(),
                state,
                "m1".to_string(),
                "c1".to_string(),
                activity,
            )
            .await;
        voyager.drain_learning().await;

        // Evaluation persisted and confidence moved
        let evals = voyager.store().evaluations_for(&skill.id, 5).unwrap();
        assert_eq!(evals.len(), 1);
        let updated = voyager.store().get_skill(&skill.id).unwrap().unwrap();
        assert_eq!(updated.times_used, 1);

        // Retrieval outcomes recorded for both sources
        assert_eq!(voyager.retrieval_learner().total_observations().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_after_llm_extracts_when_no_skill_applied() {
        let (voyager, _dir) = build_voyager();

        let mut messages = vec![ProviderMessage::text(
            "user",
            "implement a script for database migration",
        )];
        let state = voyager.before_llm(&mut messages);
        assert!(state.applied_skill.is_none());

        let response = "Here is the procedure to follow for the migration.\n\
            1. Snapshot the schema first so the change is reversible later.\n\
            2. Apply migrations inside a transaction with a timeout configured.\n\
            3. Re-run the integration tests against the migrated database copy.\n\
            ```sql\nALTER TABLE users ADD COLUMN tier TEXT;\n```\n\
            The code block above is the only destructive statement involved.";

        voyager
            .after_llm(
                response.to_string(),
                state,
                "m1".to_string(),
                "c1".to_string(),
                RetrievalActivity::default(),
            )
            .await;
        voyager.drain_learning().await;

        let stats = voyager.store().get_skill_stats().unwrap();
        assert_eq!(stats.total_skills, 1);
        let skills = voyager.store().get_all_skills(None, None, 10).unwrap();
        assert_eq!(skills[0].source, SkillSource::Observed);
    }
}
