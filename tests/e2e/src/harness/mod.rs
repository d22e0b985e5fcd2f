//! Fully wired engine over a scratch database

use std::sync::Arc;

use noesis_core::prelude::*;
use noesis_core::{
    CorrectionLearner, CurriculumEngine, ExpenseStore, HeuristicEntityExtractor,
    NullDocumentSource, NullEmailGateway, PlaybookStore, QueryClassifier, ReflectionEngine,
    ResponseEvaluator, RetrievalLearner, ScheduleStore, SkillExtractor,
};

use crate::mocks::ScriptedProvider;

/// One assembled engine instance plus its scratch directory.
pub struct TestEngine {
    /// Shared database handle
    pub db: Arc<Database>,
    /// Message persistence
    pub messages: MessageStore,
    /// Memory notes
    pub memory: MemoryStore,
    /// Knowledge graph
    pub graph: GraphStore,
    /// Prompt assembly
    pub assembler: ContextAssembler,
    /// Post-response processing
    pub outlet: OutletPipeline,
    /// Skill learning
    pub voyager: SkillVoyager,
    /// Correction feedback
    pub corrections: CorrectionLearner,
    /// Outcome recording
    pub advisor: PlaybookAdvisor,
    /// Holds the scratch directory alive for the test's duration
    _dir: tempfile::TempDir,
}

/// What a simulated turn produced.
#[derive(Debug, Default)]
pub struct TurnResult {
    /// Full streamed response (pre-outlet)
    pub raw_response: String,
    /// Response after marker processing
    pub cleaned_response: String,
    /// Marker counts from the outlet
    pub notes_saved: usize,
    /// Security-gate strip count
    pub markers_stripped: usize,
    /// Whether a skill was injected
    pub skill_applied: Option<String>,
    /// The final prompt that went to the provider
    pub prompt: Vec<noesis_core::ProviderMessage>,
    /// Assembler transparency metadata
    pub context_metadata: serde_json::Value,
    /// Whether web context was active
    pub web_search_active: bool,
}

impl TestEngine {
    /// Build the engine over a scratch database.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::open(Some(dir.path().join("e2e.db"))).expect("open db"));

        let messages = MessageStore::new(db.clone());
        let memory = MemoryStore::new(db.clone(), None).expect("memory store");
        let entity_extractor = Arc::new(HeuristicEntityExtractor::new());
        let graph = GraphStore::new(db.clone(), entity_extractor.clone());
        let schedule = ScheduleStore::new(db.clone());
        let expenses = ExpenseStore::new(db.clone());
        let email = Arc::new(NullEmailGateway);
        let runner = TaskRunner::new();

        let assembler = ContextAssembler::new(
            Arc::new(RetrievalPlanner::new(db.clone())),
            messages.clone(),
            memory.clone(),
            graph.clone(),
            schedule.clone(),
            expenses.clone(),
            email.clone(),
            Arc::new(NullDocumentSource),
        );

        let skill_store = SkillStore::new(db.clone());
        let voyager = SkillVoyager::new(
            QueryClassifier::new(),
            skill_store.clone(),
            ResponseEvaluator::new(skill_store.clone(), None),
            ReflectionEngine::new(db.clone(), skill_store.clone(), None),
            SkillExtractor::new(skill_store.clone(), None),
            CurriculumEngine::new(skill_store.clone()),
            RetrievalLearner::new(db.clone()),
            runner.clone(),
        );

        let outlet = OutletPipeline::new(
            memory.clone(),
            graph.clone(),
            messages.clone(),
            schedule,
            expenses,
            email,
            entity_extractor,
            None,
            runner,
        );

        let corrections = CorrectionLearner::new(db.clone(), skill_store.clone());
        let advisor = PlaybookAdvisor::new(PlaybookStore::new(db.clone()), skill_store);

        Self {
            db,
            messages,
            memory,
            graph,
            assembler,
            outlet,
            voyager,
            corrections,
            advisor,
            _dir: dir,
        }
    }

    /// Run one full turn the way the chat route does: persist the user
    /// message, assemble, inject skills, stream the scripted response,
    /// process the outlet, persist, and run the learning passes to
    /// completion.
    pub async fn run_turn(
        &self,
        ctx: &RequestContext,
        user_message: &str,
        provider: &ScriptedProvider,
    ) -> TurnResult {
        let mut result = TurnResult::default();

        let user_msg = noesis_core::ChatMessage::new(ctx, Role::User, user_message);
        self.messages.save(&user_msg).expect("save user message");

        let settings = LlmSettings::default();
        let assembled = self
            .assembler
            .assemble(ctx, user_message, Some("You are Noesis."), &settings, Some(provider))
            .await;
        assert!(assembled.preflight_error.is_none());

        let mut messages = assembled.messages;
        let learning_state = self.voyager.before_llm(&mut messages);
        result.skill_applied = learning_state.applied_skill.as_ref().map(|s| s.name.clone());
        result.prompt = messages.clone();
        result.context_metadata = assembled.context_metadata.clone();
        result.web_search_active = assembled.web_search_active;

        let mut chunks = provider
            .stream(&messages, provider.default_model(), 0.7, None)
            .await
            .expect("scripted stream");
        while let Some(chunk) = chunks.recv().await {
            result.raw_response.push_str(&chunk.content);
            if chunk.is_done {
                break;
            }
        }

        let outcome = self
            .outlet
            .process_markers(ctx, &result.raw_response, assembled.web_search_active)
            .await;
        result.cleaned_response = outcome.cleaned_response.clone();
        result.notes_saved = outcome.notes_saved;
        result.markers_stripped = outcome.markers_stripped;

        let message_id = self
            .outlet
            .save_assistant_message(ctx, &outcome.cleaned_response)
            .expect("save assistant message");

        self.outlet
            .spawn_learning(ctx.clone(), user_message.to_string(), result.raw_response.clone())
            .await;
        self.voyager
            .after_llm(
                result.raw_response.clone(),
                learning_state,
                message_id,
                ctx.conversation_id.clone(),
                assembled.activity,
            )
            .await;

        // Tests assert on learning side-effects, so drain them here
        self.outlet.drain_learning().await;
        self.voyager.drain_learning().await;

        result
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
